use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::coordinator::{Coordinator, CoordinatorConfig, CoordinatorError, ScanContext, ScanSummary};
use crate::http::{
    ConnectionPool, Fetcher, FetcherConfig, PoolConfig, ReqwestTransport, Transport,
    TransportError,
};
use crate::kb::InMemoryKnowledgeBase;
use crate::model::{FetchRequest, Finding, ModelError, Stage};
use crate::not_found::{NotFoundCache, NotFoundConfig};
use crate::output::{JsonLinesSink, OutputError, OutputSink};
use crate::parser::{DocumentParser, InlineParser, ParserConfig, ParserError, ParserPool, ParserStats};
use crate::plugins::{self, PluginContext, PluginError};
use crate::utils::RetryPolicy;

/// Where documents are parsed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ParserMode {
    /// Resource-limited child processes.
    #[default]
    Isolated,
    /// In the scanner process. Only for trusted targets and tests.
    Inline,
}

#[derive(Clone, Debug)]
pub struct Options {
    pub targets: Vec<String>,
    pub input_file: Option<String>,
    pub plugins: Vec<String>,
    pub rate: u32,
    pub pool: PoolConfig,
    pub acquire_timeout: Duration,
    pub retry: RetryPolicy,
    pub max_body_bytes: usize,
    pub proxy: Option<String>,
    pub headers: Vec<(String, String)>,
    pub follow_redirects: bool,
    pub coordinator: CoordinatorConfig,
    pub parser: ParserConfig,
    pub parser_mode: ParserMode,
    pub not_found: NotFoundConfig,
    pub max_findings_per_plugin: usize,
    /// JSON-lines file receiving every output event.
    pub events_path: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            input_file: None,
            plugins: Vec::new(),
            rate: 0,
            pool: PoolConfig::default(),
            acquire_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            max_body_bytes: 2 * 1024 * 1024,
            proxy: None,
            headers: Vec::new(),
            follow_redirects: false,
            coordinator: CoordinatorConfig::default(),
            parser: ParserConfig::default(),
            parser_mode: ParserMode::Isolated,
            not_found: NotFoundConfig::default(),
            max_findings_per_plugin: 10,
            events_path: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("no targets provided (targets and input_file are both empty)")]
    NoTargets,

    #[error("invalid target URL: {source}")]
    InvalidUrl {
        #[from]
        source: ModelError,
    },

    #[error("invalid grep watermarks: low {low} must be below high {high}")]
    InvalidWatermarks { low: usize, high: usize },

    #[error("invalid {stage} workers: min {min} must be at least 1 and at most max {max}")]
    InvalidStageBounds { stage: Stage, min: usize, max: usize },

    #[error("failed to open file for {kind}: {path}: {source}")]
    FileOpen {
        kind: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read lines for {kind}: {path}: {source}")]
    FileRead {
        kind: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Parser(#[from] ParserError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

#[derive(Clone, Debug)]
pub struct ScanResult {
    pub summary: ScanSummary,
    pub findings: Vec<Finding>,
    pub parser: Option<ParserStats>,
}

/// Library entry point: builds the fetch, parse and plugin stack for one
/// scan and hands it to the coordinator.
pub struct Runner {
    options: Options,
    transport: Option<Arc<dyn Transport>>,
    sinks: Vec<Arc<dyn OutputSink>>,
}

impl Runner {
    pub fn new(options: Options) -> Result<Self, RunnerError> {
        if options.targets.iter().all(|t| t.trim().is_empty()) && options.input_file.is_none() {
            return Err(RunnerError::NoTargets);
        }
        let admission = &options.coordinator.admission;
        if admission.low_watermark >= admission.high_watermark {
            return Err(RunnerError::InvalidWatermarks {
                low: admission.low_watermark,
                high: admission.high_watermark,
            });
        }
        for stage in Stage::ALL {
            let s = options.coordinator.stage(stage);
            if s.min_workers == 0 || s.min_workers > s.max_workers {
                return Err(RunnerError::InvalidStageBounds {
                    stage,
                    min: s.min_workers,
                    max: s.max_workers,
                });
            }
        }
        Ok(Self {
            options,
            transport: None,
            sinks: Vec::new(),
        })
    }

    /// Replaces the HTTP transport, e.g. with an in-process fake.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<ScanResult, RunnerError> {
        let o = &self.options;
        let targets = load_targets(&o.targets, o.input_file.as_deref()).await?;
        if targets.is_empty() {
            return Err(RunnerError::NoTargets);
        }
        let seeds = targets
            .iter()
            .map(|t| FetchRequest::get(t))
            .collect::<Result<Vec<_>, _>>()?;

        let transport: Arc<dyn Transport> = match self.transport.clone() {
            Some(t) => t,
            None => Arc::new(ReqwestTransport::new(
                o.proxy.clone(),
                o.follow_redirects,
                o.headers.clone(),
                o.max_body_bytes,
            )?),
        };
        let pool = Arc::new(ConnectionPool::new(o.pool.clone()));
        let fetcher = Arc::new(Fetcher::new(
            pool,
            transport,
            FetcherConfig {
                rate: o.rate,
                acquire_timeout: o.acquire_timeout,
                retry: o.retry,
            },
        ));

        let parser_pool = match o.parser_mode {
            ParserMode::Isolated => Some(Arc::new(ParserPool::start(o.parser.clone()))),
            ParserMode::Inline => None,
        };
        let parser: Arc<dyn DocumentParser> = match parser_pool.clone() {
            Some(pool) => pool,
            None => Arc::new(InlineParser::new()?),
        };

        let mut sinks = self.sinks.clone();
        if let Some(path) = o.events_path.as_deref().filter(|p| !p.trim().is_empty()) {
            let path = crate::config::expand_tilde(path);
            sinks.push(Arc::new(JsonLinesSink::create(path)?));
        }

        let kb = Arc::new(InMemoryKnowledgeBase::new());
        let ctx = ScanContext {
            plugins: PluginContext {
                fetcher: fetcher.clone(),
                parser,
                parse_budget: o.parser.timeout,
                parse_retry: o.retry,
                max_findings_per_plugin: o.max_findings_per_plugin,
            },
            not_found: Arc::new(NotFoundCache::new(fetcher.clone(), o.not_found.clone())),
            kb: kb.clone(),
            sinks,
        };
        let plugins = plugins::load(&o.plugins)?;
        info!(
            targets = seeds.len(),
            plugins = ?plugins.iter().map(|p| p.name().to_string()).collect::<Vec<_>>(),
            "starting scan"
        );

        let coordinator = Coordinator::new(ctx, plugins, o.coordinator.clone());
        let outcome = coordinator.run(seeds, cancel).await;
        let parser_stats = match parser_pool {
            Some(pool) => {
                pool.shutdown().await;
                Some(pool.stats())
            }
            None => None,
        };
        let summary = outcome?;

        Ok(ScanResult {
            summary,
            findings: kb.findings(),
            parser: parser_stats,
        })
    }
}

async fn load_targets(urls: &[String], input_file: Option<&str>) -> Result<Vec<String>, RunnerError> {
    let mut out: Vec<String> = urls
        .iter()
        .map(|u| u.trim())
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .collect();

    if let Some(path) = input_file.filter(|p| !p.trim().is_empty()) {
        let path = crate::config::expand_tilde(path).to_string_lossy().to_string();
        let handle = File::open(&path).await.map_err(|e| RunnerError::FileOpen {
            kind: "input_file",
            path: path.clone(),
            source: e,
        })?;
        let mut lines = BufReader::new(handle).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    out.push(line.to_string());
                }
                Ok(None) => break,
                Err(e) => {
                    return Err(RunnerError::FileRead {
                        kind: "input_file",
                        path,
                        source: e,
                    })
                }
            }
        }
    }
    Ok(out)
}
