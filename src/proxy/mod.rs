//! Responses shared by the decision engine and the router
//!
//! A [`Reply`] is either built from stored data or relays an upstream
//! response body chunk by chunk without collecting it.

mod relay;

pub use relay::{error_reply, relay};

use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::error::BoxError;
use crate::{Result, TvError};

/// Body type of every response this crate produces
pub type ResponseBody = UnsyncBoxBody<Bytes, BoxError>;

/// Wrap bytes in a response body
#[must_use]
pub fn full_body(data: impl Into<Bytes>) -> ResponseBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// An empty response body
#[must_use]
pub fn empty_body() -> ResponseBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Where a reply came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Served from the replay store or the event index
    Store,
    /// Relayed from upstream
    Upstream,
    /// Produced locally without consulting either
    Local,
}

/// A response on its way to the client
pub struct Reply {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: ResponseBody,
    /// Source of the data
    pub origin: Origin,
}

impl Reply {
    /// Reply with raw bytes
    #[must_use]
    pub fn bytes(status: StatusCode, data: impl Into<Bytes>, origin: Origin) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: full_body(data),
            origin,
        }
    }

    /// Reply with a JSON document
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized
    pub fn json<T: Serialize + ?Sized>(status: StatusCode, value: &T, origin: Origin) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        let mut reply = Self::bytes(status, body, origin);
        reply
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(reply)
    }

    /// Reply with no body
    #[must_use]
    pub fn empty(status: StatusCode, origin: Origin) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: empty_body(),
            origin,
        }
    }

    /// Convert into a hyper response
    #[must_use]
    pub fn into_response(self) -> Response<ResponseBody> {
        let mut response = Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }

    /// Collect the whole body
    ///
    /// # Errors
    ///
    /// Returns `UpstreamUnavailable` if a relayed body fails mid-stream
    pub async fn collect_body(self) -> Result<Bytes> {
        let collected = self
            .body
            .collect()
            .await
            .map_err(|e| TvError::UpstreamUnavailable(format!("Failed to read body: {e}")))?;
        Ok(collected.to_bytes())
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reply")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}
