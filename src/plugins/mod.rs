mod error_pages;
mod reflected_input;
mod web_spider;

pub use error_pages::ErrorPages;
pub use reflected_input::ReflectedInput;
pub use web_spider::WebSpider;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::errors::ErrorClass;
use crate::http::{FetchError, Fetcher};
use crate::matcher::MatcherError;
use crate::model::{FetchResult, Finding, WorkItem};
use crate::parser::{DocumentParser, ParsedDocument, ParserError};
use crate::utils::{self, RetryPolicy};

pub const BUILTIN_PLUGINS: &[&str] = &["web_spider", "reflected_input", "error_pages"];

#[derive(Debug, Error)]
pub enum PluginError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Parser(#[from] ParserError),

    #[error(transparent)]
    Matcher(#[from] MatcherError),

    #[error("unknown plugin: {name}")]
    Unknown { name: String },

    #[error("{0}")]
    Failed(String),
}

impl PluginError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PluginError::Fetch(e) => e.class(),
            PluginError::Parser(e) => e.class(),
            _ => ErrorClass::ItemLocal,
        }
    }
}

/// Which entry points a plugin implements.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub discover: bool,
    pub audit: bool,
    pub grep: bool,
}

impl Capabilities {
    pub const DISCOVER: Self = Self {
        discover: true,
        audit: false,
        grep: false,
    };
    pub const AUDIT: Self = Self {
        discover: false,
        audit: true,
        grep: false,
    };
    pub const GREP: Self = Self {
        discover: false,
        audit: false,
        grep: true,
    };
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.discover {
            parts.push("discover");
        }
        if self.audit {
            parts.push("audit");
        }
        if self.grep {
            parts.push("grep");
        }
        f.write_str(&parts.join("+"))
    }
}

/// Shared services handed to every plugin call.
#[derive(Clone)]
pub struct PluginContext {
    pub fetcher: Arc<Fetcher>,
    pub parser: Arc<dyn DocumentParser>,
    pub parse_budget: Duration,
    pub parse_retry: RetryPolicy,
    pub max_findings_per_plugin: usize,
}

impl PluginContext {
    /// Parses the exchange body, retrying resource-exhaustion failures.
    pub async fn parse(&self, exchange: &FetchResult) -> Result<ParsedDocument, PluginError> {
        let doc = utils::retry_with_backoff(
            &self.parse_retry,
            "parse",
            || {
                self.parser
                    .parse(&exchange.request.url, &exchange.response.body, self.parse_budget)
            },
            |e: &ParserError| e.class().is_retryable(),
        )
        .await?;
        Ok(doc)
    }
}

/// A scan plugin. Each entry point is optional; the capability set says
/// which ones the coordinator should call.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    async fn discover(
        &self,
        _ctx: &PluginContext,
        _exchange: &FetchResult,
    ) -> Result<Vec<WorkItem>, PluginError> {
        Ok(Vec::new())
    }

    async fn audit(
        &self,
        _ctx: &PluginContext,
        _exchange: &FetchResult,
    ) -> Result<Vec<Finding>, PluginError> {
        Ok(Vec::new())
    }

    async fn grep(
        &self,
        _ctx: &PluginContext,
        _exchange: &FetchResult,
    ) -> Result<Vec<Finding>, PluginError> {
        Ok(Vec::new())
    }
}

pub fn builtin(name: &str) -> Result<Arc<dyn Plugin>, PluginError> {
    match name {
        "web_spider" => Ok(Arc::new(WebSpider::new())),
        "reflected_input" => Ok(Arc::new(ReflectedInput::new())),
        "error_pages" => Ok(Arc::new(ErrorPages::new()?)),
        other => Err(PluginError::Unknown {
            name: other.to_string(),
        }),
    }
}

/// Instantiates the named plugins; an empty list enables all built-ins.
pub fn load(names: &[String]) -> Result<Vec<Arc<dyn Plugin>>, PluginError> {
    if names.is_empty() {
        return BUILTIN_PLUGINS.iter().map(|n| builtin(n)).collect();
    }
    names.iter().map(|n| builtin(n.trim())).collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapDecision {
    Report,
    /// The limit was just reached; report a summary once.
    LimitReached,
    Suppress,
}

/// Per-key finding counter.
#[derive(Debug, Default)]
pub struct FindingCap {
    counts: DashMap<String, usize>,
}

impl FindingCap {
    pub fn check(&self, key: &str, limit: usize) -> CapDecision {
        let mut count = self.counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        match (*count).cmp(&(limit + 1)) {
            std::cmp::Ordering::Less => CapDecision::Report,
            std::cmp::Ordering::Equal => CapDecision::LimitReached,
            std::cmp::Ordering::Greater => CapDecision::Suppress,
        }
    }
}
