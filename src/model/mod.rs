use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Crawl,
    Audit,
    Grep,
    Output,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Crawl, Stage::Audit, Stage::Grep, Stage::Output];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Crawl => "crawl",
            Stage::Audit => "audit",
            Stage::Grep => "grep",
            Stage::Output => "output",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported URL '{url}', expected http or https with a host")]
    UnsupportedUrl { url: String },
}

/// Connection-pool key: scheme, host and effective port of a target.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Authority {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Authority {
    pub fn from_url(url: &Url) -> Option<Self> {
        let host = url.host_str()?.to_ascii_lowercase();
        let port = url.port_or_known_default()?;
        Some(Self {
            scheme: url.scheme().to_string(),
            host,
            port,
        })
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// A request the crawl stage should fetch. Immutable once queued.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Set when the URL was found as a link on the target itself.
    #[serde(default)]
    pub linked: bool,
    #[serde(default)]
    pub depth: u32,
}

impl FetchRequest {
    pub fn new(method: &str, url: &str) -> Result<Self, ModelError> {
        let parsed = Url::parse(url.trim()).map_err(|e| ModelError::InvalidUrl {
            url: url.to_string(),
            source: e,
        })?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(ModelError::UnsupportedUrl {
                url: url.to_string(),
            });
        }
        Ok(Self {
            method: method.trim().to_ascii_uppercase(),
            url: parsed.to_string(),
            headers: Vec::new(),
            body: None,
            linked: false,
            depth: 0,
        })
    }

    pub fn get(url: &str) -> Result<Self, ModelError> {
        Self::new("GET", url)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn linked_from(mut self, parent: &FetchRequest) -> Self {
        self.linked = true;
        self.depth = parent.depth.saturating_add(1);
        self
    }

    pub fn parsed_url(&self) -> Option<Url> {
        Url::parse(&self.url).ok()
    }

    pub fn authority(&self) -> Option<Authority> {
        self.parsed_url().as_ref().and_then(Authority::from_url)
    }

    pub fn host(&self) -> Option<String> {
        self.parsed_url()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
    }

    pub fn dedup_key(&self) -> String {
        match self.body.as_deref() {
            Some(body) => format!("{} {} {}", self.method, self.url, body),
            None => format!("{} {}", self.method, self.url),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: String,
    /// The transport stopped reading at the configured body cap.
    #[serde(default)]
    pub truncated: bool,
}

impl FetchResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            truncated: false,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> &str {
        self.header("content-type").unwrap_or_default()
    }

    pub fn is_html(&self) -> bool {
        let ct = self.content_type().to_ascii_lowercase();
        if ct.is_empty() {
            let head: String = self.body.chars().take(512).collect::<String>().to_lowercase();
            return head.contains("<html") || head.contains("<!doctype html");
        }
        ct.contains("text/html") || ct.contains("application/xhtml")
    }
}

/// A completed exchange: the request, its response and how long it took.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FetchResult {
    pub id: u64,
    pub request: FetchRequest,
    pub response: FetchResponse,
    pub elapsed: Duration,
}

impl FetchResult {
    pub fn new(id: u64, request: FetchRequest, response: FetchResponse, elapsed: Duration) -> Self {
        Self {
            id,
            request,
            response,
            elapsed,
        }
    }
}

/// Unit of pipeline work produced by discovery plugins.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WorkItem {
    Fetch(FetchRequest),
    Exchange(FetchResult),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Information,
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Information => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub plugin: String,
    pub name: String,
    pub severity: Severity,
    pub method: String,
    pub url: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<u64>,
}

impl Finding {
    pub fn new(
        plugin: &str,
        name: &str,
        severity: Severity,
        request: &FetchRequest,
        description: impl Into<String>,
    ) -> Self {
        Self {
            plugin: plugin.to_string(),
            name: name.to_string(),
            severity,
            method: request.method.clone(),
            url: request.url.clone(),
            description: description.into(),
            evidence: None,
            response_id: None,
        }
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>, response_id: u64) -> Self {
        self.evidence = Some(evidence.into());
        self.response_id = Some(response_id);
        self
    }
}

/// Events the output stage hands to sinks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OutputEvent {
    Finding(Finding),
    PluginError {
        plugin: String,
        url: String,
        message: String,
    },
    StageDegraded {
        stage: Stage,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_normalizes_method_and_url() {
        let req = FetchRequest::new("get", " http://Example.com ").unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.url, "http://example.com/");
        assert_eq!(req.host().as_deref(), Some("example.com"));
    }

    #[test]
    fn request_rejects_non_http() {
        assert!(matches!(
            FetchRequest::get("ftp://example.com/"),
            Err(ModelError::UnsupportedUrl { .. })
        ));
        assert!(FetchRequest::get("not a url").is_err());
    }

    #[test]
    fn authority_uses_default_ports() {
        let req = FetchRequest::get("https://example.com/a").unwrap();
        let a = req.authority().unwrap();
        assert_eq!(a.port, 443);
        assert_eq!(a.to_string(), "https://example.com:443");
    }

    #[test]
    fn linked_requests_increase_depth() {
        let parent = FetchRequest::get("http://example.com/").unwrap();
        let child = FetchRequest::get("http://example.com/a").unwrap().linked_from(&parent);
        assert!(child.linked);
        assert_eq!(child.depth, 1);
    }

    #[test]
    fn response_header_lookup_is_case_insensitive() {
        let resp = FetchResponse::new(200, "<p>x</p>").with_header("Content-Type", "text/html");
        assert_eq!(resp.header("content-type"), Some("text/html"));
        assert!(resp.is_html());
    }

    #[test]
    fn output_event_serializes_with_tag() {
        let ev = OutputEvent::StageDegraded {
            stage: Stage::Grep,
            reason: "disk".to_string(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"event\":\"stage_degraded\""));
        assert!(json.contains("\"stage\":\"grep\""));
    }
}
