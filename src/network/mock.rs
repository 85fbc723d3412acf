//! Scripted upstream for unit tests

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::StatusCode;

use super::client::{Upstream, UpstreamRequest, UpstreamResponse};
use crate::error::BoxError;
use crate::proxy::{full_body, ResponseBody};
use crate::Result;

#[derive(Clone)]
struct Scripted {
    status: StatusCode,
    headers: Vec<(String, String)>,
    /// `None` sends headers and then never finishes the body
    body: Option<Bytes>,
}

/// Body that never yields a frame
struct Stalled;

impl Body for Stalled {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, BoxError>>> {
        Poll::Pending
    }
}

/// Answers from per-path queues; the last answer of a queue repeats and
/// unknown paths get an empty 404
#[derive(Default)]
pub struct ScriptedUpstream {
    routes: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<UpstreamRequest>>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, path_and_query: &str, status: u16, body: impl Into<Bytes>) -> &Self {
        self.on_with_headers(path_and_query, status, &[], body)
    }

    pub fn on_with_headers(
        &self,
        path_and_query: &str,
        status: u16,
        headers: &[(&str, &str)],
        body: impl Into<Bytes>,
    ) -> &Self {
        self.push(path_and_query, status, headers, Some(body.into()))
    }

    /// Answer with headers and a body that never completes
    pub fn stall(&self, path_and_query: &str, headers: &[(&str, &str)]) -> &Self {
        self.push(path_and_query, 200, headers, None)
    }

    fn push(
        &self,
        path_and_query: &str,
        status: u16,
        headers: &[(&str, &str)],
        body: Option<Bytes>,
    ) -> &Self {
        let scripted = Scripted {
            status: StatusCode::from_u16(status).unwrap(),
            headers: headers
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            body,
        };
        self.routes
            .lock()
            .unwrap()
            .entry(path_and_query.to_string())
            .or_default()
            .push_back(scripted);
        self
    }

    pub fn json(&self, path_and_query: &str, value: &serde_json::Value) -> &Self {
        self.on(path_and_query, 200, serde_json::to_vec(value).unwrap())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.path_and_query.clone())
            .collect()
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse> {
        self.calls.lock().unwrap().push(request.clone());

        let scripted = {
            let mut routes = self.routes.lock().unwrap();
            routes.get_mut(&request.path_and_query).and_then(|queue| {
                if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                }
            })
        };

        let Some(scripted) = scripted else {
            return Ok(UpstreamResponse {
                status: StatusCode::NOT_FOUND,
                headers: HeaderMap::new(),
                body: full_body(Bytes::new()),
            });
        };

        let mut headers = HeaderMap::new();
        for (name, value) in &scripted.headers {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }

        let body: ResponseBody = match scripted.body {
            Some(data) => full_body(data),
            None => Stalled.boxed_unsync(),
        };

        Ok(UpstreamResponse {
            status: scripted.status,
            headers,
            body,
        })
    }
}
