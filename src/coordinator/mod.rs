//! Wires the crawl, audit, grep and output stages together.
//!
//! Every stage is a [`StageQueue`] drained by a [`WorkerPool`]. Work only
//! flows downstream, except for discovery results which the crawl stage
//! feeds back into itself. That makes quiescence easy to detect: once each
//! queue, read in pipeline order, has nothing outstanding, nothing can
//! produce more work.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionConfig, AdmissionController, AdmissionStats, PipelineLoad};
use crate::http::fetcher::ExchangeObserver;
use crate::http::PoolStats as ConnectionStats;
use crate::kb::KnowledgeBase;
use crate::metrics::{self, Counters, MetricsSnapshot, ScanMetrics, StageGauge};
use crate::model::{FetchRequest, FetchResult, Finding, OutputEvent, Stage, WorkItem};
use crate::not_found::{NotFoundCache, NotFoundStats};
use crate::output::OutputSink;
use crate::plugins::{Plugin, PluginContext, PluginError};
use crate::pool::{
    Handler, HandlerError, PoolBounds, PoolOptions, PoolSample, PoolStats, ResizeAction,
    ResizeConfig, ResizePolicy, WorkerPool,
};
use crate::queue::{QueueError, QueueStats, StageQueue};
use crate::utils::hash_one;

#[derive(Clone, Debug)]
pub struct StageSettings {
    pub min_workers: usize,
    pub max_workers: usize,
    pub mem_capacity: usize,
    /// Queue depth above which a busy pool may grow.
    pub high_watermark: usize,
}

impl StageSettings {
    pub fn new(min_workers: usize, max_workers: usize) -> Self {
        Self {
            min_workers,
            max_workers,
            mem_capacity: 1000,
            high_watermark: 100,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub crawl: StageSettings,
    pub audit: StageSettings,
    pub grep: StageSettings,
    pub output: StageSettings,
    pub spill_dir: PathBuf,
    /// Hosts the crawl may visit. Empty means the seed hosts.
    pub scope: Vec<String>,
    pub max_depth: u32,
    pub plugin_timeout: Duration,
    /// Deadline for a whole stage item, plugins included.
    pub item_timeout: Duration,
    pub shutdown_grace: Duration,
    pub resize_interval: Duration,
    pub resize: ResizeConfig,
    pub admission: AdmissionConfig,
    pub max_consecutive_crashes: u32,
    /// Resize ticks between two `info` metric snapshots.
    pub metrics_every: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            crawl: StageSettings::new(4, 20),
            audit: StageSettings::new(4, 20),
            grep: StageSettings::new(2, 10),
            output: StageSettings::new(1, 2),
            spill_dir: std::env::temp_dir().join("scanline"),
            scope: Vec::new(),
            max_depth: 10,
            plugin_timeout: Duration::from_secs(60),
            item_timeout: Duration::from_secs(180),
            shutdown_grace: Duration::from_secs(5),
            resize_interval: Duration::from_millis(500),
            resize: ResizeConfig::default(),
            admission: AdmissionConfig::default(),
            max_consecutive_crashes: 16,
            metrics_every: 20,
        }
    }
}

impl CoordinatorConfig {
    pub fn stage(&self, stage: Stage) -> &StageSettings {
        match stage {
            Stage::Crawl => &self.crawl,
            Stage::Audit => &self.audit,
            Stage::Grep => &self.grep,
            Stage::Output => &self.output,
        }
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("no seed requests to scan")]
    NoSeeds,

    #[error("failed to create spill directory {path}: {source}")]
    SpillDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("the fetcher is already attached to another scan")]
    FetcherInUse,
}

/// Collaborators shared by every stage of one scan.
#[derive(Clone)]
pub struct ScanContext {
    pub plugins: PluginContext,
    pub not_found: Arc<NotFoundCache>,
    pub kb: Arc<dyn KnowledgeBase>,
    pub sinks: Vec<Arc<dyn OutputSink>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DegradedStage {
    pub stage: Stage,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub workers: usize,
    pub queue: QueueStats,
    pub pool: PoolStats,
}

/// What the scan did and, more importantly, what it chose not to do.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ScanSummary {
    pub elapsed_ms: u64,
    pub cancelled: bool,
    pub requests: u64,
    pub probes: u64,
    pub retries_exhausted: u64,
    pub counters: Counters,
    pub admission: AdmissionStats,
    pub not_found: NotFoundStats,
    pub connections: ConnectionStats,
    pub request_timeout_ms: u64,
    pub stages: Vec<StageReport>,
    pub degraded: Vec<DegradedStage>,
}

impl ScanSummary {
    pub fn findings(&self) -> u64 {
        self.counters.findings
    }

    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

struct Pipeline {
    crawl: Arc<StageQueue<FetchRequest>>,
    audit: Arc<StageQueue<FetchResult>>,
    grep: Arc<StageQueue<FetchResult>>,
    output: Arc<StageQueue<OutputEvent>>,
    ctx: PluginContext,
    not_found: Arc<NotFoundCache>,
    kb: Arc<dyn KnowledgeBase>,
    sinks: Vec<Arc<dyn OutputSink>>,
    discover_plugins: Vec<Arc<dyn Plugin>>,
    audit_plugins: Vec<Arc<dyn Plugin>>,
    grep_plugins: Vec<Arc<dyn Plugin>>,
    admission: AdmissionController,
    metrics: ScanMetrics,
    requested: DashSet<u64>,
    scope: Vec<String>,
    max_depth: u32,
    plugin_timeout: Duration,
    degraded: Mutex<Vec<DegradedStage>>,
}

impl Pipeline {
    fn degraded_list(&self) -> MutexGuard<'_, Vec<DegradedStage>> {
        match self.degraded.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn is_degraded(&self, stage: Stage) -> bool {
        self.degraded_list().iter().any(|d| d.stage == stage)
    }

    fn close(&self, stage: Stage) {
        match stage {
            Stage::Crawl => self.crawl.close(),
            Stage::Audit => self.audit.close(),
            Stage::Grep => self.grep.close(),
            Stage::Output => self.output.close(),
        }
    }

    fn close_all(&self) {
        for stage in Stage::ALL {
            self.close(stage);
        }
    }

    fn outstanding(&self, stage: Stage) -> usize {
        match stage {
            Stage::Crawl => self.crawl.outstanding(),
            Stage::Audit => self.audit.outstanding(),
            Stage::Grep => self.grep.outstanding(),
            Stage::Output => self.output.outstanding(),
        }
    }

    /// Halted stages never drain, so they do not hold the scan open.
    fn is_quiescent(&self) -> bool {
        Stage::ALL
            .iter()
            .all(|&stage| self.is_degraded(stage) || self.outstanding(stage) == 0)
    }

    /// Marks `stage` as halted and stops accepting work for it. Returns
    /// false if it was already degraded.
    fn halt_stage(&self, stage: Stage, reason: &str) -> bool {
        {
            let mut degraded = self.degraded_list();
            if degraded.iter().any(|d| d.stage == stage) {
                return false;
            }
            degraded.push(DegradedStage {
                stage,
                reason: reason.to_string(),
            });
        }
        error!(stage = %stage, reason = %reason, "stage halted, scan continues degraded");
        self.close(stage);
        true
    }

    async fn degrade(&self, stage: Stage, reason: String) -> bool {
        let halted = self.halt_stage(stage, &reason);
        if halted {
            self.announce(stage, reason).await;
        }
        halted
    }

    /// Reports a halted stage downstream. Pushes to the output queue
    /// directly: a failing output stage is halted but never announced.
    async fn announce(&self, stage: Stage, reason: String) {
        if stage == Stage::Output {
            return;
        }
        let event = OutputEvent::StageDegraded { stage, reason };
        if let Err(e) = self.output.push(event).await {
            self.push_failed(Stage::Output, e);
        }
    }

    /// Accounts for an item that did not make it into `stage`. Returns the
    /// halt reason when the failure took the stage down.
    fn push_failed(&self, stage: Stage, e: QueueError) -> Option<String> {
        self.metrics.dropped();
        match e {
            QueueError::Closed { .. } => {
                debug!(stage = %stage, "dropped item for closed stage");
                None
            }
            e if e.is_stage_fatal() => {
                let reason = e.to_string();
                self.halt_stage(stage, &reason).then_some(reason)
            }
            e => {
                warn!(stage = %stage, error = %e, "could not queue item");
                None
            }
        }
    }

    async fn forward<T>(&self, queue: &StageQueue<T>, item: T)
    where
        T: Serialize + DeserializeOwned + Send,
    {
        if let Err(e) = queue.push(item).await {
            let stage = queue.stage();
            if let Some(reason) = self.push_failed(stage, e) {
                self.announce(stage, reason).await;
            }
        }
    }

    async fn emit(&self, event: OutputEvent) {
        self.forward(&self.output, event).await;
    }

    fn in_scope(&self, request: &FetchRequest) -> bool {
        if self.scope.is_empty() {
            return true;
        }
        request
            .host()
            .map(|host| self.scope.contains(&host))
            .unwrap_or(false)
    }

    /// Queues a request for the crawl stage unless it is out of scope, too
    /// deep or already requested.
    async fn enqueue_crawl(&self, request: FetchRequest) -> bool {
        if !self.in_scope(&request) {
            self.metrics.crawl_out_of_scope();
            return false;
        }
        if request.depth > self.max_depth {
            self.metrics.crawl_too_deep();
            return false;
        }
        if !self.requested.insert(hash_one(&request.dedup_key(), 0)) {
            self.metrics.crawl_duplicate();
            return false;
        }
        debug!(url = %request.url, depth = request.depth, "queued for crawl");
        self.forward(&self.crawl, request).await;
        true
    }

    async fn record_findings(&self, findings: Vec<Finding>) {
        for finding in findings {
            let fresh = self.kb.record(finding.clone());
            self.metrics.finding_recorded(fresh);
            if fresh {
                info!(plugin = %finding.plugin, name = %finding.name, url = %finding.url, "finding");
                self.emit(OutputEvent::Finding(finding)).await;
            }
        }
    }

    async fn plugin_failed(&self, plugin: &str, url: &str, message: String) {
        self.metrics.plugin_failed();
        warn!(plugin, url, error = %message, "plugin error");
        self.emit(OutputEvent::PluginError {
            plugin: plugin.to_string(),
            url: url.to_string(),
            message,
        })
        .await;
    }

    /// Runs one plugin call under the plugin deadline. Failures are
    /// reported and swallowed so the worker moves on.
    async fn invoke<R, F>(&self, plugin: &str, url: &str, call: F) -> Option<R>
    where
        F: Future<Output = Result<R, PluginError>>,
    {
        match tokio::time::timeout(self.plugin_timeout, call).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                if let PluginError::Parser(parser_error) = &e {
                    self.metrics.parser_failed(parser_error);
                }
                self.plugin_failed(plugin, url, e.to_string()).await;
                None
            }
            Err(_) => {
                self.metrics.plugin_timed_out();
                self.plugin_failed(
                    plugin,
                    url,
                    format!("timed out after {:?}", self.plugin_timeout),
                )
                .await;
                None
            }
        }
    }
}

/// Routes every fetched exchange through grep admission.
struct GrepAdmission {
    pipeline: Weak<Pipeline>,
}

#[async_trait]
impl ExchangeObserver for GrepAdmission {
    async fn on_exchange(&self, result: &FetchResult) {
        let Some(p) = self.pipeline.upgrade() else {
            return;
        };
        if p.grep_plugins.is_empty() || p.grep.is_closed() {
            return;
        }
        let load = PipelineLoad {
            grep_depth: p.grep.depth(),
        };
        if p.admission.admit(result, load).admitted {
            p.forward(&p.grep, result.clone()).await;
        }
    }
}

struct CrawlHandler(Arc<Pipeline>);

#[async_trait]
impl Handler<FetchRequest> for CrawlHandler {
    async fn handle(&self, request: FetchRequest) -> Result<(), HandlerError> {
        let p = &self.0;
        let result = match p.ctx.fetcher.fetch(request).await {
            Ok(result) => result,
            Err(e) => {
                p.metrics.fetch_failed();
                return Err(HandlerError::Item(e.to_string()));
            }
        };
        let url = result.request.url.clone();
        if p
            .not_found
            .is_not_found_with_hint(&url, &result.response, result.request.linked)
            .await
        {
            p.metrics.not_found_skipped();
            debug!(url = %url, status = result.response.status, "not found, skipping");
            return Ok(());
        }

        for plugin in &p.discover_plugins {
            let Some(items) = p
                .invoke(plugin.name(), &url, plugin.discover(&p.ctx, &result))
                .await
            else {
                continue;
            };
            for item in items {
                match item {
                    WorkItem::Fetch(next) => {
                        p.enqueue_crawl(next).await;
                    }
                    WorkItem::Exchange(exchange) => p.forward(&p.audit, exchange).await,
                }
            }
        }
        if !p.audit_plugins.is_empty() {
            p.forward(&p.audit, result).await;
        }
        Ok(())
    }
}

struct AuditHandler(Arc<Pipeline>);

#[async_trait]
impl Handler<FetchResult> for AuditHandler {
    async fn handle(&self, exchange: FetchResult) -> Result<(), HandlerError> {
        let p = &self.0;
        for plugin in &p.audit_plugins {
            let call = plugin.audit(&p.ctx, &exchange);
            if let Some(findings) = p.invoke(plugin.name(), &exchange.request.url, call).await {
                p.record_findings(findings).await;
            }
        }
        Ok(())
    }
}

struct GrepHandler(Arc<Pipeline>);

#[async_trait]
impl Handler<FetchResult> for GrepHandler {
    async fn handle(&self, exchange: FetchResult) -> Result<(), HandlerError> {
        let p = &self.0;
        for plugin in &p.grep_plugins {
            let call = plugin.grep(&p.ctx, &exchange);
            if let Some(findings) = p.invoke(plugin.name(), &exchange.request.url, call).await {
                p.record_findings(findings).await;
            }
        }
        Ok(())
    }
}

struct OutputHandler(Arc<Pipeline>);

#[async_trait]
impl Handler<OutputEvent> for OutputHandler {
    async fn handle(&self, event: OutputEvent) -> Result<(), HandlerError> {
        for sink in &self.0.sinks {
            sink.emit(&event)
                .map_err(|e| HandlerError::Fatal(e.to_string()))?;
        }
        Ok(())
    }
}

/// Type-erased view of one stage's pool, so the control loop can treat the
/// four stages uniformly.
#[async_trait]
trait StageLane: Send + Sync {
    fn stage(&self) -> Stage;
    fn sample(&self) -> PoolSample;
    fn bounds(&self) -> PoolBounds;
    fn apply(&self, action: ResizeAction) -> usize;
    fn fatal_error(&self) -> Option<String>;
    fn halt(&self);
    fn gauge(&self) -> StageGauge;
    fn report(&self) -> StageReport;
    async fn join(&self);
    async fn abort(&self);
}

struct Lane<T> {
    stage: Stage,
    pool: WorkerPool<T>,
}

#[async_trait]
impl<T> StageLane for Lane<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn stage(&self) -> Stage {
        self.stage
    }

    fn sample(&self) -> PoolSample {
        self.pool.sample()
    }

    fn bounds(&self) -> PoolBounds {
        self.pool.bounds()
    }

    fn apply(&self, action: ResizeAction) -> usize {
        self.pool.apply(action)
    }

    fn fatal_error(&self) -> Option<String> {
        self.pool.fatal_error()
    }

    fn halt(&self) {
        self.pool.halt();
    }

    fn gauge(&self) -> StageGauge {
        let queue = self.pool.queue();
        StageGauge {
            stage: self.stage,
            depth: queue.depth(),
            disk_depth: queue.disk_depth(),
            workers: self.pool.live(),
            idle: self.pool.idle(),
            busy: self.pool.busy(),
        }
    }

    fn report(&self) -> StageReport {
        StageReport {
            stage: self.stage,
            workers: self.pool.size(),
            queue: self.pool.queue().stats(),
            pool: self.pool.stats(),
        }
    }

    async fn join(&self) {
        self.pool.join().await;
    }

    async fn abort(&self) {
        self.pool.abort().await;
    }
}

fn lane<T>(
    stage: Stage,
    queue: Arc<StageQueue<T>>,
    handler: Arc<dyn Handler<T>>,
    config: &CoordinatorConfig,
) -> Box<dyn StageLane>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let settings = config.stage(stage);
    let bounds = PoolBounds::new(settings.min_workers, settings.max_workers);
    let options = PoolOptions {
        initial: bounds.min,
        item_timeout: config.item_timeout,
        max_consecutive_crashes: config.max_consecutive_crashes,
    };
    let pool = WorkerPool::start(stage.as_str(), queue, handler, bounds, options);
    Box::new(Lane { stage, pool })
}

fn open_queue<T>(config: &CoordinatorConfig, stage: Stage) -> Arc<StageQueue<T>>
where
    T: Serialize + DeserializeOwned,
{
    let capacity = config.stage(stage).mem_capacity;
    Arc::new(StageQueue::open(stage, capacity, config.spill_dir.clone()))
}

/// Hosts of the seeds, lowercased and deduplicated.
fn seed_scope(seeds: &[FetchRequest]) -> Vec<String> {
    seeds
        .iter()
        .filter_map(FetchRequest::host)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub struct Coordinator {
    ctx: ScanContext,
    plugins: Vec<Arc<dyn Plugin>>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(ctx: ScanContext, plugins: Vec<Arc<dyn Plugin>>, config: CoordinatorConfig) -> Self {
        Self {
            ctx,
            plugins,
            config,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    fn pipeline(&self, seeds: &[FetchRequest]) -> Pipeline {
        let config = &self.config;
        let scope = if config.scope.is_empty() {
            seed_scope(seeds)
        } else {
            config.scope.iter().map(|h| h.trim().to_ascii_lowercase()).collect()
        };
        let mut admission = config.admission.clone();
        if admission.scope.is_empty() {
            admission.scope = scope.clone();
        }
        let with = |pick: fn(&dyn Plugin) -> bool| -> Vec<Arc<dyn Plugin>> {
            self.plugins.iter().filter(|p| pick(p.as_ref())).cloned().collect()
        };
        Pipeline {
            crawl: open_queue(config, Stage::Crawl),
            audit: open_queue(config, Stage::Audit),
            grep: open_queue(config, Stage::Grep),
            output: open_queue(config, Stage::Output),
            ctx: self.ctx.plugins.clone(),
            not_found: self.ctx.not_found.clone(),
            kb: self.ctx.kb.clone(),
            sinks: self.ctx.sinks.clone(),
            discover_plugins: with(|p| p.capabilities().discover),
            audit_plugins: with(|p| p.capabilities().audit),
            grep_plugins: with(|p| p.capabilities().grep),
            admission: AdmissionController::new(admission),
            metrics: ScanMetrics::new(),
            requested: DashSet::new(),
            scope,
            max_depth: config.max_depth,
            plugin_timeout: config.plugin_timeout,
            degraded: Mutex::new(Vec::new()),
        }
    }

    /// Crawls from `seeds` until every stage is drained or `cancel` fires.
    ///
    /// The fetcher in the scan context reports its exchanges to this scan
    /// for its whole lifetime, so each fetcher serves a single run.
    pub async fn run(
        &self,
        seeds: Vec<FetchRequest>,
        cancel: CancellationToken,
    ) -> Result<ScanSummary, CoordinatorError> {
        if seeds.is_empty() {
            return Err(CoordinatorError::NoSeeds);
        }
        tokio::fs::create_dir_all(&self.config.spill_dir)
            .await
            .map_err(|e| CoordinatorError::SpillDir {
                path: self.config.spill_dir.display().to_string(),
                source: e,
            })?;

        let started = Instant::now();
        let pipeline = Arc::new(self.pipeline(&seeds));
        let observer = Arc::new(GrepAdmission {
            pipeline: Arc::downgrade(&pipeline),
        });
        if !self.ctx.plugins.fetcher.set_observer(observer) {
            return Err(CoordinatorError::FetcherInUse);
        }
        info!(
            seeds = seeds.len(),
            scope = ?pipeline.scope,
            discover = pipeline.discover_plugins.len(),
            audit = pipeline.audit_plugins.len(),
            grep = pipeline.grep_plugins.len(),
            "scan started"
        );
        for seed in seeds {
            pipeline.enqueue_crawl(seed).await;
        }

        let lanes: Vec<Box<dyn StageLane>> = vec![
            lane(
                Stage::Crawl,
                pipeline.crawl.clone(),
                Arc::new(CrawlHandler(pipeline.clone())),
                &self.config,
            ),
            lane(
                Stage::Audit,
                pipeline.audit.clone(),
                Arc::new(AuditHandler(pipeline.clone())),
                &self.config,
            ),
            lane(
                Stage::Grep,
                pipeline.grep.clone(),
                Arc::new(GrepHandler(pipeline.clone())),
                &self.config,
            ),
            lane(
                Stage::Output,
                pipeline.output.clone(),
                Arc::new(OutputHandler(pipeline.clone())),
                &self.config,
            ),
        ];

        let cancelled = self.drive(&pipeline, &lanes, &cancel).await;
        self.shut_down(&pipeline, &lanes, cancelled).await;
        for sink in &pipeline.sinks {
            if let Err(e) = sink.flush() {
                warn!(error = %e, "output sink flush failed");
            }
        }

        let summary = self.summarize(&pipeline, &lanes, started, cancelled);
        info!(
            elapsed_ms = summary.elapsed_ms,
            requests = summary.requests,
            findings = summary.findings(),
            degraded = summary.degraded.len(),
            cancelled,
            "scan finished"
        );
        Ok(summary)
    }

    /// Resizes pools and watches for halted stages until the pipeline is
    /// quiescent. Returns true when the scan was cancelled instead.
    async fn drive(
        &self,
        pipeline: &Pipeline,
        lanes: &[Box<dyn StageLane>],
        cancel: &CancellationToken,
    ) -> bool {
        let mut policies: Vec<ResizePolicy> = lanes
            .iter()
            .map(|lane| {
                ResizePolicy::new(ResizeConfig {
                    high_watermark: self.config.stage(lane.stage()).high_watermark,
                    ..self.config.resize.clone()
                })
            })
            .collect();
        let mut ticker = tokio::time::interval(self.config.resize_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = 0u64;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("scan cancelled");
                    return true;
                }
                _ = ticker.tick() => {}
            }
            ticks += 1;

            for (lane, policy) in lanes.iter().zip(policies.iter_mut()) {
                let stage = lane.stage();
                if let Some(reason) = lane.fatal_error() {
                    pipeline.degrade(stage, reason).await;
                }
                if pipeline.is_degraded(stage) {
                    lane.halt();
                    continue;
                }
                if let Some(action) = policy.observe(&lane.sample(), lane.bounds()) {
                    let size = lane.apply(action);
                    debug!(stage = %stage, ?action, size, "pool resized");
                }
            }

            if self.config.metrics_every > 0 && ticks % self.config.metrics_every == 0 {
                metrics::log_snapshot(&self.snapshot(pipeline, lanes));
            }
            if pipeline.is_quiescent() {
                debug!(ticks, "pipeline quiescent");
                return false;
            }
        }
    }

    async fn shut_down(&self, pipeline: &Pipeline, lanes: &[Box<dyn StageLane>], cancelled: bool) {
        pipeline.close_all();
        let joined = join_all(lanes.iter().map(|lane| lane.join()));
        if !cancelled {
            joined.await;
            return;
        }
        if tokio::time::timeout(self.config.shutdown_grace, joined)
            .await
            .is_err()
        {
            warn!(
                grace_ms = self.config.shutdown_grace.as_millis() as u64,
                "workers still busy after the shutdown grace period, aborting"
            );
            for lane in lanes {
                lane.abort().await;
            }
        }
    }

    fn snapshot(&self, pipeline: &Pipeline, lanes: &[Box<dyn StageLane>]) -> MetricsSnapshot {
        let admission = pipeline.admission.stats();
        MetricsSnapshot {
            counters: pipeline.metrics.counters(),
            stages: lanes.iter().map(|l| l.gauge()).collect(),
            not_found_hit_rate: pipeline.not_found.stats().hit_rate(),
            admission_accepted: admission.accepted,
            admission_rejected: admission.rejected(),
            request_timeout_ms: self.ctx.plugins.fetcher.pool().current_timeout().as_millis() as u64,
        }
    }

    fn summarize(
        &self,
        pipeline: &Pipeline,
        lanes: &[Box<dyn StageLane>],
        started: Instant,
        cancelled: bool,
    ) -> ScanSummary {
        let fetcher = &self.ctx.plugins.fetcher;
        let fetch = fetcher.stats();
        ScanSummary {
            elapsed_ms: started.elapsed().as_millis() as u64,
            cancelled,
            requests: fetch.requests,
            probes: fetch.probes,
            retries_exhausted: fetch.retries_exhausted,
            counters: pipeline.metrics.counters(),
            admission: pipeline.admission.stats(),
            not_found: pipeline.not_found.stats(),
            connections: fetcher.pool().stats(),
            request_timeout_ms: fetcher.pool().current_timeout().as_millis() as u64,
            stages: lanes.iter().map(|l| l.report()).collect(),
            degraded: pipeline.degraded_list().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_scope_is_lowercased_and_unique() {
        let seeds = vec![
            FetchRequest::get("http://B.test/").unwrap(),
            FetchRequest::get("http://a.test/x").unwrap(),
            FetchRequest::get("https://b.test/y").unwrap(),
        ];
        assert_eq!(seed_scope(&seeds), vec!["a.test", "b.test"]);
    }

    #[test]
    fn stage_settings_follow_stage() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.stage(Stage::Output).max_workers, 2);
        assert_eq!(config.stage(Stage::Grep).max_workers, 10);
        assert!(config.item_timeout > config.plugin_timeout);
    }
}
