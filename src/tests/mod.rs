//! Whole-pipeline tests against an in-process site.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::coordinator::{Coordinator, CoordinatorConfig, ScanContext, StageSettings};
use crate::http::{ConnectionPool, ConnectionSlot, Fetcher, FetcherConfig, PoolConfig, Transport, TransportError};
use crate::kb::{InMemoryKnowledgeBase, KnowledgeBase};
use crate::model::{FetchRequest, FetchResponse, FetchResult, Finding, OutputEvent, Stage};
use crate::not_found::{NotFoundCache, NotFoundConfig};
use crate::output::{MemorySink, OutputError, OutputSink};
use crate::parser::InlineParser;
use crate::plugins::{self, Capabilities, Plugin, PluginContext, PluginError};
use crate::runner::{Options, ParserMode, Runner};
use crate::utils::RetryPolicy;

/// A small site: an index linking to a few pages, a search page that echoes
/// its query, an error page and real 404s for everything else.
struct Site {
    pages: usize,
    delay: Duration,
    requests: AtomicU64,
}

impl Site {
    fn new() -> Self {
        Self {
            pages: 0,
            delay: Duration::ZERO,
            requests: AtomicU64::new(0),
        }
    }

    fn with_pages(mut self, pages: usize) -> Self {
        self.pages = pages;
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn html(body: String) -> FetchResponse {
        FetchResponse::new(200, format!("<html><body>{body}</body></html>"))
            .with_header("Content-Type", "text/html")
    }

    fn respond(&self, request: &FetchRequest) -> FetchResponse {
        let url = request.parsed_url().expect("fake site only sees valid URLs");
        match url.path() {
            "/" => {
                let mut links = String::from(
                    r#"<a href="/about">about</a> <a href="/search?q=hello">search</a> <a href="/error">oops</a> <a href="/missing">gone</a> <a href="http://elsewhere.test/">out</a>"#,
                );
                for i in 0..self.pages {
                    links.push_str(&format!(r#" <a href="/p/{i}">page {i}</a>"#));
                }
                Self::html(links)
            }
            "/about" => Self::html("<p>about this site, nothing to see here</p>".to_string()),
            "/search" => {
                let q = url
                    .query_pairs()
                    .find(|(k, _)| k == "q")
                    .map(|(_, v)| v.to_string())
                    .unwrap_or_default();
                Self::html(format!("<p>results for {q}</p>"))
            }
            "/error" => FetchResponse::new(
                500,
                "<html><body>Exception in thread: java.lang.NullPointerException at com.app.Main</body></html>",
            )
            .with_header("Content-Type", "text/html"),
            path if path.starts_with("/p/") && path[3..].parse::<usize>().map(|i| i < self.pages).unwrap_or(false) => {
                Self::html(format!("<p>content of {path} padded with enough text to differ</p>"))
            }
            _ => FetchResponse::new(404, "<html><body>Not Found</body></html>")
                .with_header("Content-Type", "text/html"),
        }
    }
}

#[async_trait]
impl Transport for Site {
    async fn send(
        &self,
        request: &FetchRequest,
        _slot: &mut ConnectionSlot,
        _timeout: Duration,
    ) -> Result<FetchResponse, TransportError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.respond(request))
    }
}

/// Grep plugin that only burns time, to back up the grep stage.
struct SlowGrep(Duration);

#[async_trait]
impl Plugin for SlowGrep {
    fn name(&self) -> &str {
        "slow_grep"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::GREP
    }

    async fn grep(&self, _ctx: &PluginContext, _exchange: &FetchResult) -> Result<Vec<Finding>, PluginError> {
        tokio::time::sleep(self.0).await;
        Ok(Vec::new())
    }
}

struct BrokenSink;

impl OutputSink for BrokenSink {
    fn emit(&self, _event: &OutputEvent) -> Result<(), OutputError> {
        Err(OutputError::Io {
            path: "/dev/full".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "no space left on device"),
        })
    }
}

fn fast_config(spill: &std::path::Path) -> CoordinatorConfig {
    CoordinatorConfig {
        spill_dir: spill.to_path_buf(),
        resize_interval: Duration::from_millis(20),
        shutdown_grace: Duration::from_millis(200),
        plugin_timeout: Duration::from_secs(5),
        item_timeout: Duration::from_secs(15),
        ..CoordinatorConfig::default()
    }
}

fn options(spill: &std::path::Path) -> Options {
    Options {
        targets: vec!["http://site.test/".to_string()],
        parser_mode: ParserMode::Inline,
        coordinator: fast_config(spill),
        ..Options::default()
    }
}

fn context(site: Arc<Site>, sinks: Vec<Arc<dyn OutputSink>>) -> (ScanContext, Arc<InMemoryKnowledgeBase>) {
    let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
    let fetcher = Arc::new(Fetcher::new(pool, site, FetcherConfig::default()));
    let kb = Arc::new(InMemoryKnowledgeBase::new());
    let ctx = ScanContext {
        plugins: PluginContext {
            fetcher: fetcher.clone(),
            parser: Arc::new(InlineParser::new().unwrap()),
            parse_budget: Duration::from_secs(5),
            parse_retry: RetryPolicy::default(),
            max_findings_per_plugin: 10,
        },
        not_found: Arc::new(NotFoundCache::new(fetcher, NotFoundConfig::default())),
        kb: kb.clone(),
        sinks,
    };
    (ctx, kb)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runner_scans_site_and_reports_findings() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    let site = Arc::new(Site::new());
    let runner = Runner::new(options(dir.path()))
        .unwrap()
        .with_transport(site.clone())
        .with_sink(sink.clone());

    let result = runner.run(CancellationToken::new()).await.unwrap();
    let s = &result.summary;

    assert!(!s.cancelled);
    assert!(!s.is_degraded());
    assert!(result
        .findings
        .iter()
        .any(|f| f.plugin == "reflected_input" && f.url.contains("/search")));
    assert!(result
        .findings
        .iter()
        .any(|f| f.plugin == "error_pages" && f.url.ends_with("/error")));
    assert!(s.counters.not_found_skips >= 1, "linked 404 should be skipped");
    assert!(s.counters.crawl_out_of_scope >= 1, "foreign host should not be crawled");
    assert!(s.requests > 0);
    assert_eq!(s.requests, site.requests.load(Ordering::SeqCst));

    let emitted = sink
        .events()
        .into_iter()
        .filter(|e| matches!(e, OutputEvent::Finding(_)))
        .count();
    assert_eq!(emitted as u64, s.findings());
    assert_eq!(emitted, result.findings.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_run_on_one_coordinator_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, _kb) = context(Arc::new(Site::new()), Vec::new());
    let coordinator = Coordinator::new(ctx, plugins::load(&[]).unwrap(), fast_config(dir.path()));
    let seeds = vec![FetchRequest::get("http://site.test/").unwrap()];

    coordinator
        .run(seeds.clone(), CancellationToken::new())
        .await
        .unwrap();
    let again = coordinator.run(seeds, CancellationToken::new()).await;
    assert!(matches!(again, Err(crate::coordinator::CoordinatorError::FetcherInUse)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_grep_sheds_load_instead_of_growing() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, _kb) = context(Arc::new(Site::new().with_pages(60)), Vec::new());
    let mut config = fast_config(dir.path());
    config.grep = StageSettings::new(1, 1);
    config.admission.low_watermark = 1;
    config.admission.high_watermark = 3;
    let plugins: Vec<Arc<dyn Plugin>> = vec![
        plugins::builtin("web_spider").unwrap(),
        Arc::new(SlowGrep(Duration::from_millis(40))),
    ];
    let coordinator = Coordinator::new(ctx, plugins, config);

    let summary = coordinator
        .run(
            vec![FetchRequest::get("http://site.test/").unwrap()],
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(!summary.cancelled);
    assert!(summary.admission.load_shed > 0, "{:?}", summary.admission);
    assert!(summary.admission.accepted > 0);
    let grep = summary.stages.iter().find(|r| r.stage == Stage::Grep).unwrap();
    assert_eq!(grep.queue.spilled, 0, "admission should keep grep in memory");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_stops_a_slow_scan() {
    let dir = tempfile::tempdir().unwrap();
    let site = Arc::new(Site::new().with_delay(Duration::from_secs(30)));
    let (ctx, _kb) = context(site, Vec::new());
    let coordinator = Coordinator::new(ctx, plugins::load(&[]).unwrap(), fast_config(dir.path()));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let summary = coordinator
        .run(vec![FetchRequest::get("http://site.test/").unwrap()], cancel)
        .await
        .unwrap();

    assert!(summary.cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_sink_degrades_output_but_scan_completes() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, kb) = context(Arc::new(Site::new()), vec![Arc::new(BrokenSink)]);
    let mut config = fast_config(dir.path());
    config.max_consecutive_crashes = 1;
    let coordinator = Coordinator::new(ctx, plugins::load(&[]).unwrap(), config);

    let summary = coordinator
        .run(
            vec![FetchRequest::get("http://site.test/").unwrap()],
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(!summary.cancelled);
    assert!(summary.degraded.iter().any(|d| d.stage == Stage::Output));
    assert!(!summary.degraded.iter().any(|d| d.stage == Stage::Crawl));
    assert!(!kb.findings().is_empty(), "findings still reach the knowledge base");
}
