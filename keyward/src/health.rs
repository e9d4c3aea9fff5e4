//! Replica health over HTTP, plus the admin routes.
//!
//! A keyward replica moves through three conditions:
//!
//! - started: [`crate::Service::run`] has spawned the key monitor and is about
//!   to enter the ingestion loop.
//! - ready: the key monitor has published a validated key and the replica is
//!   not draining. Without a key the ingestion loop does not read the stream,
//!   so a keyless replica is alive but takes no work.
//! - alive: cleared once shutdown has drained in-flight hints and flushed key
//!   usage.
//!
//! | route             | 200 when | 503 body                         |
//! |-------------------|----------|----------------------------------|
//! | `/health/live`    | alive    | `not_alive`                      |
//! | `/health/ready`   | ready    | `awaiting_key` or `draining`     |
//! | `/health/startup` | started  | `starting`                       |
//! | `/health`         | all three| full state                       |
//!
//! Anything else is offered to [`crate::admin::handle`].

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::admin::{self, AdminContext};

/// Why a replica is or is not taking hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// No validated key has been published yet, or the last one was rejected.
    AwaitingKey,
    /// Shutdown began; in-flight hints are finishing.
    Draining,
}

impl Readiness {
    pub fn label(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::AwaitingKey => "awaiting_key",
            Self::Draining => "draining",
        }
    }
}

/// Replica conditions, written by the service and read by the HTTP server.
#[derive(Debug)]
pub struct HealthState {
    startup_complete: AtomicBool,
    key_published: AtomicBool,
    draining: AtomicBool,
    alive: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            startup_complete: AtomicBool::new(false),
            key_published: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            alive: AtomicBool::new(true),
        }
    }

    pub fn set_startup_complete(&self) {
        self.startup_complete.store(true, Ordering::Release);
        info!(target: "keyward::health", "Startup complete");
    }

    /// Track whether the key monitor currently publishes a key.
    pub fn set_key_published(&self, published: bool) {
        let was = self.key_published.swap(published, Ordering::AcqRel);
        if was != published {
            info!(
                target: "keyward::health",
                readiness = self.readiness().label(),
                "Readiness changed"
            );
        }
    }

    /// Stop reporting ready for the rest of the process lifetime.
    pub fn set_draining(&self) {
        if !self.draining.swap(true, Ordering::AcqRel) {
            info!(target: "keyward::health", "Draining");
        }
    }

    pub fn set_not_alive(&self) {
        self.alive.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_startup_complete(&self) -> bool {
        self.startup_complete.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn readiness(&self) -> Readiness {
        if self.draining.load(Ordering::Acquire) {
            Readiness::Draining
        } else if self.key_published.load(Ordering::Acquire) {
            Readiness::Ready
        } else {
            Readiness::AwaitingKey
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.readiness() == Readiness::Ready
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

type BoxBody = Full<Bytes>;

fn json_response(status: StatusCode, body: String) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| {
            let mut fallback =
                Response::new(Full::new(Bytes::from_static(b"{\"status\":\"error\"}")));
            *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        })
}

fn health_reply(state: &HealthState, method: &Method, path: &str) -> Option<(StatusCode, String)> {
    if method != Method::GET {
        return None;
    }
    let check = |ok: bool, up: &str, down: &str| {
        let status = if ok {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        (status, format!(r#"{{"status":"{}"}}"#, if ok { up } else { down }))
    };
    let readiness = state.readiness();
    let reply = match path {
        "/health/live" => check(state.is_alive(), "alive", "not_alive"),
        "/health/ready" => check(
            readiness == Readiness::Ready,
            "ready",
            readiness.label(),
        ),
        "/health/startup" => check(state.is_startup_complete(), "started", "starting"),
        "/health" => {
            let alive = state.is_alive();
            let ready = readiness == Readiness::Ready;
            let startup = state.is_startup_complete();
            let status = if alive && ready && startup {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            (
                status,
                format!(
                    r#"{{"alive":{},"ready":{},"readiness":"{}","startup_complete":{}}}"#,
                    alive,
                    ready,
                    readiness.label(),
                    startup
                ),
            )
        },
        _ => return None,
    };
    Some(reply)
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<HealthState>,
    admin: Option<AdminContext>,
) -> Result<Response<BoxBody>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let (status, body) = match health_reply(&state, &method, &path) {
        Some(reply) => reply,
        None => match admin {
            Some(ctx) => {
                let body = match req.into_body().collect().await {
                    Ok(collected) => collected.to_bytes(),
                    Err(e) => {
                        debug!(target: "keyward::health", error = %e, "Request body read failed");
                        Bytes::new()
                    },
                };
                admin::handle(&ctx, &method, &path, &body)
                    .await
                    .unwrap_or_else(not_found)
            },
            None => not_found(),
        },
    };

    // Orchestrators poll these every few seconds
    if path == "/health/live" || path == "/health/ready" {
        trace!(target: "keyward::health", method = %method, path = %path, status = %status, "Health check");
    } else {
        debug!(target: "keyward::health", method = %method, path = %path, status = %status, "Request");
    }

    Ok(json_response(status, body))
}

fn not_found() -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, r#"{"error":"not_found"}"#.to_string())
}

/// Serve health and admin routes until `cancel` fires.
pub async fn run_health_server(
    addr: SocketAddr,
    state: Arc<HealthState>,
    admin: Option<AdminContext>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(target: "keyward::health", addr = %addr, "Health server listening");

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, _peer)) => {
                        let io = TokioIo::new(stream);
                        let state = Arc::clone(&state);
                        let admin = admin.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                handle_request(req, Arc::clone(&state), admin.clone())
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                debug!(target: "keyward::health", error = %e, "Health connection error");
                            }
                        });
                    },
                    Err(e) => {
                        error!(target: "keyward::health", error = %e, "Health accept failed");
                    },
                }
            }
            _ = cancel.cancelled() => {
                info!(target: "keyward::health", "Health server shutting down");
                break;
            }
        }
    }

    Ok(())
}
