//! Upstream pass-through and error replies

use hyper::StatusCode;
use serde_json::json;
use tracing::{debug, warn};

use super::{Origin, Reply};
use crate::network::UpstreamResponse;
use crate::TvError;

/// Relay an upstream response verbatim
///
/// Status and headers are copied as received; the body is forwarded frame
/// by frame as the client reads it. Dropping the reply drops the upstream
/// connection.
#[must_use]
pub fn relay(response: UpstreamResponse) -> Reply {
    debug!("Relaying upstream {}", response.status);
    Reply {
        status: response.status,
        headers: response.headers,
        body: response.body,
        origin: Origin::Upstream,
    }
}

/// Map an error onto a client-facing reply
#[must_use]
pub fn error_reply(error: &TvError) -> Reply {
    let status = match error {
        TvError::InvalidIdentifier(_) | TvError::InvalidGroup(_) => StatusCode::BAD_REQUEST,
        TvError::NotFound(_) => StatusCode::NOT_FOUND,
        TvError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        warn!("Request failed: {error}");
    } else {
        debug!("Request rejected: {error}");
    }

    let body = match error {
        TvError::InvalidGroup(_) => json!({"error": "Invalid group specified"}),
        other => json!({"error": other.to_string()}),
    };

    Reply::json(status, &body, Origin::Local)
        .unwrap_or_else(|_| Reply::empty(status, Origin::Local))
}
