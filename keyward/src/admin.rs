//! Administrative endpoints, routed from the health server.
//!
//! - `GET  /stats`                        pipeline counters and active key state
//! - `POST /admin/keys`                   enroll a key
//! - `GET  /admin/keys/{party}/count`     valid keys for a party
//! - `GET  /admin/keys/{party}/failing`   keys that failed validation
//! - `POST /admin/hints`                  enqueue a manual refresh hint

use std::sync::Arc;

use hyper::{Method, StatusCode};
use kwd_client::{HintStream, enqueue_hint};
use kwd_core::{ApiKey, Clock, Hint, KeywardError, SubjectId};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::credential::CredentialPool;
use crate::metrics::PipelineMetrics;
use crate::monitor::KeyHandle;

/// Source tag for hints enqueued through the admin surface.
pub const MANUAL_SOURCE: &str = "manual";

#[derive(Clone)]
pub struct AdminContext {
    pub pool: Arc<CredentialPool>,
    pub stream: Arc<dyn HintStream>,
    pub stream_name: String,
    pub provider: String,
    pub metrics: Arc<PipelineMetrics>,
    pub key_handle: KeyHandle,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Deserialize)]
struct EnrollRequest {
    #[serde(default)]
    party: Option<String>,
    key: String,
    #[serde(default)]
    owner: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HintRequest {
    subject: String,
    #[serde(default)]
    source: Option<String>,
}

type Reply = (StatusCode, String);

fn reply(status: StatusCode, body: Value) -> Reply {
    (status, body.to_string())
}

fn error_reply(status: StatusCode, message: impl std::fmt::Display) -> Reply {
    reply(status, json!({ "error": message.to_string() }))
}

fn key_view(row: &ApiKey) -> Value {
    json!({
        "id": row.id,
        "party": row.party,
        "key": row.redacted(),
        "owner": row.owner,
        "is_valid": row.is_valid,
        "use_count": row.use_count,
        "last_used": row.last_used,
        "last_server_affinity": row.last_server_affinity,
    })
}

/// Route one admin request. `None` when the path is not an admin route.
pub async fn handle(ctx: &AdminContext, method: &Method, path: &str, body: &[u8]) -> Option<Reply> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let reply = match (method, segments.as_slice()) {
        (&Method::GET, ["stats"]) => stats(ctx),
        (&Method::POST, ["admin", "keys"]) => enroll(ctx, body).await,
        (&Method::GET, ["admin", "keys", party, "count"]) => key_count(ctx, party).await,
        (&Method::GET, ["admin", "keys", party, "failing"]) => failing_keys(ctx, party).await,
        (&Method::POST, ["admin", "hints"]) => enqueue(ctx, body).await,
        _ => return None,
    };
    Some(reply)
}

fn stats(ctx: &AdminContext) -> Reply {
    reply(
        StatusCode::OK,
        json!({
            "metrics": ctx.metrics.snapshot(),
            "active_key": ctx.key_handle.current().is_some(),
        }),
    )
}

async fn enroll(ctx: &AdminContext, body: &[u8]) -> Reply {
    let request: EnrollRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return error_reply(StatusCode::BAD_REQUEST, e),
    };
    let party = request.party.unwrap_or_else(|| ctx.provider.clone());
    let owner = request.owner.unwrap_or_default();
    match ctx.pool.enroll(&party, &request.key, &owner).await {
        Ok(row) => reply(StatusCode::CREATED, key_view(&row)),
        Err(e @ KeywardError::MalformedInput(_)) => error_reply(StatusCode::BAD_REQUEST, e),
        Err(e) => {
            warn!(target: "keyward::admin", error = %e, "Enrollment failed");
            error_reply(StatusCode::INTERNAL_SERVER_ERROR, e)
        },
    }
}

async fn key_count(ctx: &AdminContext, party: &str) -> Reply {
    match ctx.pool.active_key_count(party).await {
        Ok(active) => reply(StatusCode::OK, json!({ "party": party, "active": active })),
        Err(e) => error_reply(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn failing_keys(ctx: &AdminContext, party: &str) -> Reply {
    match ctx.pool.keys(party).await {
        Ok(rows) => {
            let failing: Vec<Value> = rows.iter().filter(|k| !k.is_valid).map(key_view).collect();
            reply(StatusCode::OK, json!({ "party": party, "failing": failing }))
        },
        Err(e) => error_reply(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn enqueue(ctx: &AdminContext, body: &[u8]) -> Reply {
    let request: HintRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return error_reply(StatusCode::BAD_REQUEST, e),
    };
    if let Err(e) = SubjectId::parse(&request.subject) {
        return error_reply(StatusCode::BAD_REQUEST, e);
    }

    match ctx.pool.get_key(&ctx.provider, 0).await {
        Ok(_) => {},
        Err(e @ KeywardError::NoKeyAvailable { .. }) => {
            return error_reply(StatusCode::SERVICE_UNAVAILABLE, e);
        },
        Err(e) => return error_reply(StatusCode::INTERNAL_SERVER_ERROR, e),
    }

    let source = request
        .source
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| MANUAL_SOURCE.to_string());
    let hint = Hint::new(request.subject, source, ctx.clock.now());
    match enqueue_hint(ctx.stream.as_ref(), &ctx.stream_name, &hint).await {
        Ok(id) => {
            info!(
                target: "keyward::admin",
                subject = %hint.subject,
                source = %hint.source,
                entry_id = %id,
                "Manual hint enqueued"
            );
            reply(StatusCode::ACCEPTED, json!({ "id": id }))
        },
        Err(e) => error_reply(StatusCode::BAD_GATEWAY, e),
    }
}
