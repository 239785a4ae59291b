pub mod protocol;
pub mod worker;

pub use protocol::{Form, ParsedDocument, WORKER_FLAG};

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::errors::ErrorClass;
use protocol::{ParseJob, ParseReply};

/// Stderr markers of a process that hit its address-space limit.
const MEMORY_MARKERS: &[&str] = &[
    "memory allocation of",
    "out of memory",
    "Out of memory",
    "Out of space",
    "Cannot allocate memory",
    "std::bad_alloc",
];

/// Dynamic loader failures that only an address-space limit produces.
const LOADER_MARKERS: &[&str] = &["failed to map segment", "cannot allocate memory in static TLS"];

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("parser exceeded its {budget:?} budget")]
    Timeout { budget: Duration },

    #[error("parser exceeded its memory limit")]
    Memory,

    #[error("parser process crashed: {message}")]
    Crash { message: String },

    #[error("document of {size} bytes exceeds the {limit} byte parser budget")]
    TooLarge { size: usize, limit: usize },

    #[error("parser pool is shut down")]
    Unavailable,

    #[error("failed to spawn parser worker {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parser worker protocol error: {message}")]
    Protocol { message: String },
}

impl ParserError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ParserError::Timeout { .. } | ParserError::Memory => ErrorClass::ResourceExhaustion,
            ParserError::Spawn { .. } | ParserError::Unavailable => ErrorClass::StageFatal,
            _ => ErrorClass::ItemLocal,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ParserError::Timeout { .. } => "timeout",
            ParserError::Memory => "memory",
            ParserError::Crash { .. } => "crash",
            ParserError::TooLarge { .. } => "too-large",
            ParserError::Unavailable => "unavailable",
            ParserError::Spawn { .. } => "spawn",
            ParserError::Protocol { .. } => "protocol",
        }
    }
}

/// Turns a document into links and forms.
#[async_trait]
pub trait DocumentParser: Send + Sync {
    async fn parse(
        &self,
        base_url: &str,
        document: &str,
        budget: Duration,
    ) -> Result<ParsedDocument, ParserError>;
}

/// Parses in the calling process. Only for trusted input and tests.
pub struct InlineParser {
    patterns: worker::DocumentPatterns,
}

impl InlineParser {
    pub fn new() -> Result<Self, ParserError> {
        let patterns = worker::DocumentPatterns::new().map_err(|e| ParserError::Protocol {
            message: e.to_string(),
        })?;
        Ok(Self { patterns })
    }
}

#[async_trait]
impl DocumentParser for InlineParser {
    async fn parse(
        &self,
        base_url: &str,
        document: &str,
        _budget: Duration,
    ) -> Result<ParsedDocument, ParserError> {
        Ok(worker::parse_document(&self.patterns, base_url, document))
    }
}

#[derive(Clone, Debug)]
pub struct ParserConfig {
    pub workers: usize,
    pub memory_limit_mb: u64,
    pub timeout: Duration,
    /// Extra time allowed for a killed worker to be reaped.
    pub grace: Duration,
    pub max_document_bytes: usize,
    /// Jobs a worker serves before it is recycled.
    pub max_tasks: u32,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            workers: (cpus / 2).max(1),
            memory_limit_mb: 128,
            timeout: Duration::from_secs(10),
            grace: Duration::from_millis(500),
            max_document_bytes: 2 * 1024 * 1024,
            max_tasks: 20,
            program: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("scanline")),
            args: vec![WORKER_FLAG.to_string()],
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ParserStats {
    pub jobs: u64,
    pub parsed: u64,
    pub timeouts: u64,
    pub memory: u64,
    pub crashes: u64,
    pub too_large: u64,
    pub spawned: u64,
    pub recycled: u64,
}

struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    stderr: Option<ChildStderr>,
    jobs: u32,
}

impl WorkerProcess {
    async fn kill(&mut self, grace: Duration) {
        let _ = self.child.start_kill();
        let _ = tokio::time::timeout(grace, self.child.wait()).await;
    }

    /// Exit status if the process exits on its own within `grace`.
    async fn reap(&mut self, grace: Duration) -> Option<ExitStatus> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => {
                self.kill(grace).await;
                None
            }
        }
    }

    async fn stderr_tail(&mut self, grace: Duration) -> String {
        let Some(mut stderr) = self.stderr.take() else {
            return String::new();
        };
        let mut buf = Vec::new();
        let mut limited = (&mut stderr).take(8 * 1024);
        let _ = tokio::time::timeout(grace, limited.read_to_end(&mut buf)).await;
        String::from_utf8_lossy(&buf).trim().to_string()
    }
}

/// Fixed-size pool of isolated parser processes.
///
/// Each worker runs with an address-space limit and is killed and replaced
/// after a timeout, a crash, or `max_tasks` jobs.
pub struct ParserPool {
    config: ParserConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<WorkerProcess>>,
    shut_down: AtomicBool,
    next_job: AtomicU64,
    jobs: AtomicU64,
    parsed: AtomicU64,
    timeouts: AtomicU64,
    memory: AtomicU64,
    crashes: AtomicU64,
    too_large: AtomicU64,
    spawned: AtomicU64,
    recycled: AtomicU64,
}

impl ParserPool {
    pub fn start(config: ParserConfig) -> Self {
        let workers = config.workers.max(1);
        info!(
            workers,
            memory_limit_mb = config.memory_limit_mb,
            timeout_ms = config.timeout.as_millis() as u64,
            "parser pool started"
        );
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            config,
            idle: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
            next_job: AtomicU64::new(1),
            jobs: AtomicU64::new(0),
            parsed: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            memory: AtomicU64::new(0),
            crashes: AtomicU64::new(0),
            too_large: AtomicU64::new(0),
            spawned: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    /// Parses `document` in a worker process. The call returns within
    /// `budget` plus the configured grace period.
    pub async fn parse(
        &self,
        base_url: &str,
        document: &str,
        budget: Duration,
    ) -> Result<ParsedDocument, ParserError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ParserError::Unavailable);
        }
        self.jobs.fetch_add(1, Ordering::Relaxed);
        if document.len() > self.config.max_document_bytes {
            self.too_large.fetch_add(1, Ordering::Relaxed);
            return Err(ParserError::TooLarge {
                size: document.len(),
                limit: self.config.max_document_bytes,
            });
        }

        let deadline = Instant::now() + budget;
        let _permit = match timeout_at(deadline, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ParserError::Unavailable),
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(ParserError::Timeout { budget });
            }
        };

        let mut worker = match self.take_idle() {
            Some(worker) => worker,
            None => self.spawn_worker()?,
        };

        let job = ParseJob {
            id: self.next_job.fetch_add(1, Ordering::Relaxed),
            base_url: base_url.to_string(),
            document: document.to_string(),
        };
        let mut line = serde_json::to_string(&job).map_err(|e| ParserError::Protocol {
            message: e.to_string(),
        })?;
        line.push('\n');

        let exchange = async {
            worker.stdin.write_all(line.as_bytes()).await?;
            worker.stdin.flush().await?;
            let mut reply = String::new();
            let n = worker.stdout.read_line(&mut reply).await?;
            Ok::<_, std::io::Error>((n, reply))
        };

        let outcome = timeout_at(deadline, exchange).await;
        match outcome {
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(job = job.id, budget_ms = budget.as_millis() as u64, "parser job timed out, killing worker");
                worker.kill(self.config.grace).await;
                Err(ParserError::Timeout { budget })
            }
            Ok(Ok((n, reply))) if n > 0 => {
                let reply: ParseReply = match serde_json::from_str(reply.trim()) {
                    Ok(reply) => reply,
                    Err(e) => {
                        worker.kill(self.config.grace).await;
                        return Err(ParserError::Protocol {
                            message: e.to_string(),
                        });
                    }
                };
                if reply.id != job.id {
                    warn!(job = job.id, reply = reply.id, "parser worker out of step, killing it");
                    worker.kill(self.config.grace).await;
                    return Err(ParserError::Protocol {
                        message: format!("reply for job {} while waiting for job {}", reply.id, job.id),
                    });
                }
                worker.jobs += 1;
                self.give_back(worker).await;
                match (reply.document, reply.error) {
                    (Some(doc), _) => {
                        self.parsed.fetch_add(1, Ordering::Relaxed);
                        Ok(doc)
                    }
                    (None, Some(message)) => Err(ParserError::Protocol { message }),
                    (None, None) => Err(ParserError::Protocol {
                        message: format!("empty reply for job {}", job.id),
                    }),
                }
            }
            // EOF or broken pipe: the worker died mid-job
            Ok(_) => Err(self.classify_death(worker).await),
        }
    }

    async fn classify_death(&self, mut worker: WorkerProcess) -> ParserError {
        let stderr = worker.stderr_tail(self.config.grace).await;
        let status = worker.reap(self.config.grace).await;
        let limited = self.config.memory_limit_mb > 0;
        let out_of_memory = MEMORY_MARKERS.iter().any(|m| stderr.contains(m))
            || (limited && LOADER_MARKERS.iter().any(|m| stderr.contains(m)))
            || died_of_memory(status, limited);
        if out_of_memory {
            self.memory.fetch_add(1, Ordering::Relaxed);
            warn!(stderr = %stderr, "parser worker ran out of memory");
            ParserError::Memory
        } else {
            self.crashes.fetch_add(1, Ordering::Relaxed);
            let message = match (status, stderr.is_empty()) {
                (_, false) => stderr,
                (Some(status), true) => status.to_string(),
                (None, true) => "worker exited unexpectedly".to_string(),
            };
            warn!(message = %message, "parser worker crashed");
            ParserError::Crash { message }
        }
    }

    fn take_idle(&self) -> Option<WorkerProcess> {
        self.idle.lock().ok()?.pop()
    }

    async fn give_back(&self, mut worker: WorkerProcess) {
        if worker.jobs >= self.config.max_tasks || self.shut_down.load(Ordering::Acquire) {
            self.recycled.fetch_add(1, Ordering::Relaxed);
            debug!(jobs = worker.jobs, "recycling parser worker");
            worker.kill(self.config.grace).await;
            return;
        }
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(worker);
        }
    }

    fn spawn_worker(&self) -> Result<WorkerProcess, ParserError> {
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        limit_address_space(&mut command, self.config.memory_limit_mb * 1024 * 1024);

        let spawn_error = |source| ParserError::Spawn {
            program: self.config.program.display().to_string(),
            source,
        };
        let mut child = command.spawn().map_err(spawn_error)?;
        let missing = || {
            spawn_error(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "worker stdio not captured",
            ))
        };
        let stdin = child.stdin.take().ok_or_else(missing)?;
        let stdout = child.stdout.take().ok_or_else(missing)?;
        let stderr = child.stderr.take();
        self.spawned.fetch_add(1, Ordering::Relaxed);
        debug!(pid = child.id().unwrap_or_default(), "spawned parser worker");
        Ok(WorkerProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            stderr,
            jobs: 0,
        })
    }

    /// Stops accepting jobs and kills idle workers. Busy workers are killed
    /// when their job finishes.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        self.permits.close();
        let idle: Vec<WorkerProcess> = match self.idle.lock() {
            Ok(mut idle) => idle.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for mut worker in idle {
            worker.kill(self.config.grace).await;
        }
    }

    pub fn stats(&self) -> ParserStats {
        ParserStats {
            jobs: self.jobs.load(Ordering::Relaxed),
            parsed: self.parsed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            memory: self.memory.load(Ordering::Relaxed),
            crashes: self.crashes.load(Ordering::Relaxed),
            too_large: self.too_large.load(Ordering::Relaxed),
            spawned: self.spawned.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl DocumentParser for ParserPool {
    async fn parse(
        &self,
        base_url: &str,
        document: &str,
        budget: Duration,
    ) -> Result<ParsedDocument, ParserError> {
        ParserPool::parse(self, base_url, document, budget).await
    }
}

#[cfg(unix)]
fn limit_address_space(command: &mut Command, bytes: u64) {
    if bytes == 0 {
        return;
    }
    // SAFETY: setrlimit is async-signal-safe and touches no parent state.
    unsafe {
        command.pre_exec(move || {
            let limit = libc::rlimit {
                rlim_cur: bytes as libc::rlim_t,
                rlim_max: bytes as libc::rlim_t,
            };
            if libc::setrlimit(libc::RLIMIT_AS, &limit) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn limit_address_space(_command: &mut Command, _bytes: u64) {}

/// Whether the signal a worker died of points at memory exhaustion.
///
/// Under RLIMIT_AS a failed stack growth or a refused mapping surfaces as
/// SIGSEGV or SIGBUS, not as an allocation error. SIGKILL is never sent by
/// the limit itself; a worker we did not kill got it from the kernel or
/// cgroup OOM killer.
#[cfg(unix)]
fn died_of_memory(status: Option<ExitStatus>, limited: bool) -> bool {
    use std::os::unix::process::ExitStatusExt;
    match status.and_then(|s| s.signal()) {
        Some(libc::SIGKILL) => true,
        Some(libc::SIGSEGV | libc::SIGBUS) => limited,
        _ => false,
    }
}

#[cfg(not(unix))]
fn died_of_memory(_status: Option<ExitStatus>, _limited: bool) -> bool {
    false
}
