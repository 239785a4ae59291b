use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::ConnectionSlot;
use crate::model::{FetchRequest, FetchResponse};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("connection to {url} failed: {message}")]
    Connect { url: String, message: String },

    #[error("invalid request {method} {url}: {message}")]
    InvalidRequest {
        method: String,
        url: String,
        message: String,
    },

    #[error("failed to build HTTP client: {source}")]
    ClientBuild {
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to setup proxy: {proxy}: {source}")]
    ProxySetup {
        proxy: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("reading response from {url} failed: {message}")]
    Body { url: String, message: String },
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

/// Sends one request over a leased connection. Wire encoding is entirely
/// the implementor's concern; the pool only manages the slot lifecycle.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: &FetchRequest,
        slot: &mut ConnectionSlot,
        timeout: Duration,
    ) -> Result<FetchResponse, TransportError>;
}

#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    proxy: Option<String>,
    follow_redirects: bool,
    user_agent: String,
    extra_headers: Vec<(String, String)>,
    max_body_bytes: usize,
}

impl ReqwestTransport {
    pub fn new(
        proxy: Option<String>,
        follow_redirects: bool,
        extra_headers: Vec<(String, String)>,
        max_body_bytes: usize,
    ) -> Result<Self, TransportError> {
        let transport = Self {
            proxy: proxy.filter(|p| !p.trim().is_empty()),
            follow_redirects,
            user_agent:
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:95.0) Gecko/20100101 Firefox/95.0"
                    .to_string(),
            extra_headers,
            max_body_bytes,
        };
        // surface proxy/TLS misconfiguration before the scan starts
        transport.build_client()?;
        Ok(transport)
    }

    fn build_client(&self) -> Result<reqwest::Client, TransportError> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Ok(ua) = reqwest::header::HeaderValue::from_str(&self.user_agent) {
            headers.insert(reqwest::header::USER_AGENT, ua);
        }
        for (name, value) in self.extra_headers.iter() {
            let name = reqwest::header::HeaderName::from_bytes(name.trim().as_bytes());
            let value = reqwest::header::HeaderValue::from_str(value.trim());
            if let (Ok(name), Ok(value)) = (name, value) {
                headers.insert(name, value);
            }
        }

        let redirect_policy = if self.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        };

        // one pooled socket per slot
        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .redirect(redirect_policy)
            .pool_max_idle_per_host(1)
            .danger_accept_invalid_hostnames(true)
            .danger_accept_invalid_certs(true);

        if let Some(proxy) = self.proxy.as_deref() {
            let proxy = reqwest::Proxy::all(proxy).map_err(|e| TransportError::ProxySetup {
                proxy: proxy.to_string(),
                source: e,
            })?;
            builder = builder.proxy(proxy);
        }

        builder
            .build()
            .map_err(|e| TransportError::ClientBuild { source: e })
    }

    async fn exchange(
        &self,
        client: &reqwest::Client,
        request: &FetchRequest,
    ) -> Result<FetchResponse, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|e| {
            TransportError::InvalidRequest {
                method: request.method.clone(),
                url: request.url.clone(),
                message: e.to_string(),
            }
        })?;
        let mut builder = client.request(method, request.url.as_str());
        for (name, value) in request.headers.iter() {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body.as_ref() {
            builder = builder.body(body.clone());
        }

        let mut resp = builder.send().await.map_err(|e| TransportError::Connect {
            url: request.url.clone(),
            message: e.to_string(),
        })?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).to_string(),
                )
            })
            .collect::<Vec<_>>();

        let mut body = Vec::new();
        let mut truncated = false;
        loop {
            let chunk = resp.chunk().await.map_err(|e| TransportError::Body {
                url: request.url.clone(),
                message: e.to_string(),
            })?;
            let Some(chunk) = chunk else {
                break;
            };
            let room = self.max_body_bytes.saturating_sub(body.len());
            if chunk.len() > room {
                body.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchResponse {
            status,
            headers,
            body: String::from_utf8_lossy(&body).to_string(),
            truncated,
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        request: &FetchRequest,
        slot: &mut ConnectionSlot,
        timeout: Duration,
    ) -> Result<FetchResponse, TransportError> {
        let client = match slot.client.as_ref() {
            Some(client) => client.clone(),
            None => {
                let client = self.build_client()?;
                slot.client = Some(client.clone());
                client
            }
        };
        match tokio::time::timeout(timeout, self.exchange(&client, request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                url: request.url.clone(),
                timeout,
            }),
        }
    }
}
