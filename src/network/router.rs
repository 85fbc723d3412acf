//! Maps request paths onto decision engine operations

use hyper::http::uri::PathAndQuery;
use hyper::{Method, StatusCode, Uri};
use serde_json::json;
use tracing::debug;

use crate::proxy::{error_reply, Origin, Reply};
use crate::replay::DecisionEngine;
use crate::Result;

/// Path answered locally so callers can tell this proxy from upstream
pub const RELAY_PROBE_PATH: &str = "/__tvcache/relay";

/// Answer one request; errors become JSON error replies
pub async fn route(engine: &DecisionEngine, method: &Method, uri: &Uri) -> Reply {
    match dispatch(engine, method, uri).await {
        Ok(reply) => reply,
        Err(e) => error_reply(&e),
    }
}

async fn dispatch(engine: &DecisionEngine, method: &Method, uri: &Uri) -> Result<Reply> {
    let path = uri.path();
    let query = uri.query();
    let forward = uri.path_and_query().map_or(path, PathAndQuery::as_str);

    let decoded: Vec<String> = path
        .trim_start_matches('/')
        .split('/')
        .map(|segment| {
            urlencoding::decode(segment).map_or_else(|_| segment.to_string(), |s| s.into_owned())
        })
        .collect();
    let segments: Vec<&str> = decoded.iter().map(String::as_str).collect();

    debug!("{} {}", method, forward);

    match (method, segments.as_slice()) {
        (&Method::GET, ["find", "any" | ""]) => engine.list(forward, query).await,
        (&Method::GET, ["meta", id]) => engine.meta(id, forward).await,
        (&Method::GET, ["event", event_id]) => engine.event(event_id).await,
        (&Method::GET, ["replay", id, "file", name]) => engine.file(id, name, forward).await,
        (&Method::GET, ["replay", id, "event"]) => {
            let group = query_param(query, "group");
            engine.events(id, group.as_deref(), forward).await
        }
        (&Method::POST, ["replay", id, "startDownloading"]) => {
            engine.start_downloading(id, forward).await
        }
        (&Method::POST, ["replay", id, "viewer", _]) => engine.viewer(id, forward).await,
        (&Method::GET, _) if path == RELAY_PROBE_PATH => Reply::json(
            StatusCode::OK,
            &json!({ "__tvcache/relay": true }),
            Origin::Local,
        ),
        _ => Ok(Reply::bytes(StatusCode::NOT_FOUND, "Not Found", Origin::Local)),
    }
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        (key == name).then(|| {
            urlencoding::decode(value).map_or_else(|_| value.to_string(), |v| v.into_owned())
        })
    })
}
