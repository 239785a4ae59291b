use async_trait::async_trait;
use dashmap::DashSet;
use tracing::debug;
use url::form_urlencoded;

use super::{Capabilities, Plugin, PluginContext, PluginError};
use crate::model::{FetchRequest, FetchResult, Finding, Severity};
use crate::utils::hash_one;

const NAME: &str = "reflected_input";
const MAX_PARAMS: usize = 20;

/// Sends a marker through every query and form parameter and reports the
/// ones echoed back without HTML encoding.
pub struct ReflectedInput {
    tested: DashSet<String>,
}

impl ReflectedInput {
    pub fn new() -> Self {
        Self {
            tested: DashSet::new(),
        }
    }
}

impl Default for ReflectedInput {
    fn default() -> Self {
        Self::new()
    }
}

fn is_form_body(request: &FetchRequest) -> bool {
    request.body.is_some()
        && request
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map_or(true, |(_, v)| v.contains("application/x-www-form-urlencoded"))
}

fn encode(pairs: &[(String, String)]) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs.iter())
        .finish()
}

/// One request per parameter with that parameter replaced by `marker`.
fn mutants(request: &FetchRequest, marker: &str) -> Vec<(String, FetchRequest)> {
    let Some(url) = request.parsed_url() else {
        return Vec::new();
    };
    let mut out = Vec::new();

    let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    for i in 0..query.len().min(MAX_PARAMS) {
        let mut pairs = query.clone();
        pairs[i].1 = marker.to_string();
        let mut mutated = url.clone();
        mutated.set_query(Some(&encode(&pairs)));
        let mut req = request.clone();
        req.url = mutated.to_string();
        out.push((query[i].0.clone(), req));
    }

    if is_form_body(request) {
        let body = request.body.as_deref().unwrap_or_default();
        let form: Vec<(String, String)> = form_urlencoded::parse(body.as_bytes()).into_owned().collect();
        for i in 0..form.len().min(MAX_PARAMS.saturating_sub(out.len())) {
            let mut pairs = form.clone();
            pairs[i].1 = marker.to_string();
            out.push((form[i].0.clone(), request.clone().with_body(encode(&pairs))));
        }
    }
    out
}

#[async_trait]
impl Plugin for ReflectedInput {
    fn name(&self) -> &str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::AUDIT
    }

    async fn audit(
        &self,
        ctx: &PluginContext,
        exchange: &FetchResult,
    ) -> Result<Vec<Finding>, PluginError> {
        let request = &exchange.request;
        let token = format!("scnl{:x}", hash_one(&request.dedup_key(), 7) & 0xffff_ffff);
        let marker = format!("{token}<\"'>");
        let mut findings = Vec::new();
        let mut sent = 0usize;
        let mut failed = 0usize;
        let mut last_error = None;

        for (param, mutant) in mutants(request, &marker) {
            let key = format!("{} {} {}", request.method, url_path(request), param);
            if !self.tested.insert(key) {
                continue;
            }
            sent += 1;
            let result = match ctx.fetcher.fetch(mutant).await {
                Ok(result) => result,
                Err(e) => {
                    debug!(param = %param, url = %request.url, error = %e, "mutant fetch failed");
                    failed += 1;
                    last_error = Some(e);
                    continue;
                }
            };
            let body = &result.response.body;
            if body.contains(&marker) {
                let desc = format!(
                    "The \"{param}\" parameter of {} {} is echoed back without HTML encoding.",
                    result.request.method, request.url
                );
                findings.push(
                    Finding::new(NAME, "Reflected input", Severity::Medium, &result.request, desc)
                        .with_evidence(marker.clone(), result.id),
                );
            }
        }
        // only a run where nothing got through is an error
        match last_error {
            Some(e) if failed == sent && findings.is_empty() => Err(e.into()),
            _ => Ok(findings),
        }
    }
}

fn url_path(request: &FetchRequest) -> String {
    request
        .parsed_url()
        .map(|u| format!("{}{}", u.origin().ascii_serialization(), u.path()))
        .unwrap_or_else(|| request.url.clone())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::http::{
        ConnectionPool, ConnectionSlot, Fetcher, FetcherConfig, PoolConfig, Transport,
        TransportError,
    };
    use crate::model::FetchResponse;
    use crate::parser::InlineParser;
    use crate::utils::RetryPolicy;

    /// Echoes the query string; refuses any request whose `down` parameter
    /// carries the marker.
    struct Echo;

    #[async_trait]
    impl Transport for Echo {
        async fn send(
            &self,
            request: &FetchRequest,
            _slot: &mut ConnectionSlot,
            _timeout: Duration,
        ) -> Result<FetchResponse, TransportError> {
            let url = url::Url::parse(&request.url).unwrap();
            let mut body = String::new();
            for (k, v) in url.query_pairs() {
                if k == "down" && v.starts_with("scnl") {
                    return Err(TransportError::Connect {
                        url: request.url.clone(),
                        message: "reset".to_string(),
                    });
                }
                body.push_str(&v);
            }
            Ok(FetchResponse::new(200, body))
        }
    }

    fn ctx() -> PluginContext {
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
        let retry = RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        };
        let fetcher = Fetcher::new(
            pool,
            Arc::new(Echo),
            FetcherConfig {
                retry,
                ..FetcherConfig::default()
            },
        );
        PluginContext {
            fetcher: Arc::new(fetcher),
            parser: Arc::new(InlineParser::new().unwrap()),
            parse_budget: Duration::from_secs(1),
            parse_retry: retry,
            max_findings_per_plugin: 10,
        }
    }

    fn exchange(url: &str) -> FetchResult {
        let request = FetchRequest::get(url).unwrap();
        FetchResult::new(1, request, FetchResponse::new(200, ""), Duration::ZERO)
    }

    #[tokio::test]
    async fn one_failed_mutant_keeps_the_other_findings() {
        let plugin = ReflectedInput::new();
        let findings = plugin
            .audit(&ctx(), &exchange("http://t.test/s?down=1&q=1"))
            .await
            .unwrap();
        assert_eq!(findings.len(), 1);
        assert!(findings[0].description.contains("\"q\""), "{}", findings[0].description);
    }

    #[tokio::test]
    async fn all_mutants_failing_is_an_error() {
        let plugin = ReflectedInput::new();
        let err = plugin
            .audit(&ctx(), &exchange("http://t.test/s?down=1"))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Fetch(_)));
    }

    #[test]
    fn mutates_each_query_and_form_parameter() {
        let req = FetchRequest::new("POST", "http://t.test/s?q=1&page=2")
            .unwrap()
            .with_body("user=a&pass=b");
        let m = mutants(&req, "X<");
        let names: Vec<&str> = m.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["q", "page", "user", "pass"]);
        assert_eq!(m[0].1.url, "http://t.test/s?q=X%3C&page=2");
        assert_eq!(m[3].1.body.as_deref(), Some("user=a&pass=X%3C"));
        assert_eq!(m[3].1.url, req.url);
    }

    #[test]
    fn json_bodies_are_not_mutated() {
        let req = FetchRequest::new("POST", "http://t.test/api")
            .unwrap()
            .with_header("Content-Type", "application/json")
            .with_body("{\"a\":1}");
        assert!(mutants(&req, "X").is_empty());
    }
}
