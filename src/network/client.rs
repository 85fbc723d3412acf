//! Outbound client for the upstream replay service

use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, USER_AGENT};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::{Scheme, UpstreamConfig};
use crate::error::BoxError;
use crate::proxy::ResponseBody;
use crate::{Result, TvError};

/// A request to upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRequest {
    /// HTTP method
    pub method: Method,
    /// Path plus raw query, forwarded unchanged
    pub path_and_query: String,
}

impl UpstreamRequest {
    /// GET request for a path (which may already carry a query)
    #[must_use]
    pub fn get(path_and_query: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path_and_query: path_and_query.into(),
        }
    }

    /// POST request for a path (which may already carry a query)
    #[must_use]
    pub fn post(path_and_query: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            path_and_query: path_and_query.into(),
        }
    }

    /// Append an encoded query parameter
    #[must_use]
    pub fn with_query(mut self, key: &str, value: &str) -> Self {
        let separator = if self.path_and_query.contains('?') { '&' } else { '?' };
        self.path_and_query.push(separator);
        self.path_and_query.push_str(&urlencoding::encode(key));
        self.path_and_query.push('=');
        self.path_and_query.push_str(&urlencoding::encode(value));
        self
    }

    /// Path without the query
    #[must_use]
    pub fn path(&self) -> &str {
        self.path_and_query
            .split_once('?')
            .map_or(self.path_and_query.as_str(), |(path, _)| path)
    }
}

/// A response from upstream whose body has not been read yet
pub struct UpstreamResponse {
    /// Status code
    pub status: StatusCode,
    /// Response headers as received
    pub headers: HeaderMap,
    /// Unread body
    pub body: ResponseBody,
}

impl UpstreamResponse {
    /// Turn a non-success status into an error
    ///
    /// # Errors
    ///
    /// `NotFound` for 404, `UpstreamUnavailable` for any other non-2xx status
    pub fn error_for_status(self, what: &str) -> Result<Self> {
        if self.status.is_success() {
            Ok(self)
        } else if self.status == StatusCode::NOT_FOUND {
            Err(TvError::NotFound(what.to_string()))
        } else {
            Err(TvError::UpstreamUnavailable(format!(
                "{what}: upstream answered {}",
                self.status
            )))
        }
    }

    /// Read the whole body
    ///
    /// # Errors
    ///
    /// Returns `UpstreamUnavailable` if the body fails mid-stream
    pub async fn bytes(self) -> Result<Bytes> {
        let collected = self
            .body
            .collect()
            .await
            .map_err(|e| TvError::UpstreamUnavailable(format!("Failed to read body: {e}")))?;
        Ok(collected.to_bytes())
    }

    /// Read the whole body, giving up after `limit`
    ///
    /// # Errors
    ///
    /// Returns `UpstreamUnavailable` if the body fails or stalls past `limit`
    pub async fn bytes_within(self, limit: Duration) -> Result<Bytes> {
        tokio::time::timeout(limit, self.bytes())
            .await
            .map_err(|_| TvError::UpstreamUnavailable(format!("body stalled for {limit:?}")))?
    }

    /// Read and parse a JSON body
    ///
    /// # Errors
    ///
    /// Returns error if the body cannot be read or parsed
    pub async fn json<T: DeserializeOwned>(self) -> Result<T> {
        let raw = self.bytes().await?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// The upstream replay service
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send a request; the response body streams lazily
    ///
    /// Transport failures and timeouts surface as `UpstreamUnavailable`.
    /// Any HTTP status, including 404, is a successful send.
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse>;
}

/// hyper-based [`Upstream`] speaking HTTP or HTTPS
pub struct HyperUpstream {
    client: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
    scheme: Scheme,
    host: String,
    port: u16,
    user_agent: Option<HeaderValue>,
    timeout: Duration,
}

impl HyperUpstream {
    /// Create a client for the configured upstream
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the user agent is not valid header text or
    /// TLS cannot be set up
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let mut http = HttpConnector::new();
        http.set_connect_timeout(Some(config.timeout()));
        http.enforce_http(false);

        if config.accept_invalid_certs && config.scheme == Scheme::Https {
            warn!("Certificate verification disabled for {}", config.host);
        }

        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(super::tls::client_config(config.accept_invalid_certs)?)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build(connector);

        let user_agent = config
            .user_agent
            .as_deref()
            .map(HeaderValue::from_str)
            .transpose()
            .map_err(|e| TvError::ConfigError(format!("Invalid user_agent: {e}")))?;

        Ok(Self {
            client,
            scheme: config.scheme,
            host: config.host.clone(),
            port: config.port(),
            user_agent,
            timeout: config.timeout(),
        })
    }
}

#[async_trait]
impl Upstream for HyperUpstream {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse> {
        let uri = build_uri(self.scheme, &self.host, self.port, &request.path_and_query)?;
        debug!("Forwarding {} to {}", request.method, uri);

        let mut builder = Request::builder().method(request.method.clone()).uri(uri);
        if let Some(user_agent) = &self.user_agent {
            builder = builder.header(USER_AGENT, user_agent.clone());
        }

        let http_request = builder
            .body(Empty::new())
            .map_err(|e| TvError::Other(format!("Failed to build request: {e}")))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(http_request))
            .await
            .map_err(|_| {
                warn!("Upstream timed out: {}", request.path_and_query);
                TvError::UpstreamUnavailable(format!(
                    "timed out after {:?}: {}",
                    self.timeout,
                    request.path()
                ))
            })?
            .map_err(|e| {
                warn!("Upstream request failed: {e}");
                TvError::UpstreamUnavailable(format!("{}: {e}", request.path()))
            })?;

        let (parts, body) = response.into_parts();
        Ok(UpstreamResponse {
            status: parts.status,
            headers: parts.headers,
            body: body.map_err(BoxError::from).boxed_unsync(),
        })
    }
}

/// Build an absolute upstream URI
fn build_uri(scheme: Scheme, host: &str, port: u16, path_and_query: &str) -> Result<Uri> {
    if !path_and_query.starts_with('/') {
        return Err(TvError::Other(format!(
            "Upstream path must be absolute: {path_and_query}"
        )));
    }

    let uri = format!("{}://{host}:{port}{path_and_query}", scheme.as_str());
    uri.parse::<Uri>()
        .map_err(|e| TvError::Other(format!("Invalid URI '{uri}': {e}")))
}
