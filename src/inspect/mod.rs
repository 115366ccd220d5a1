//! Admin HTTP surface
//!
//! One HTTP/1 listener serves the Prometheus registry at /metrics, a health
//! check at /healthz, and read-only JSON debug views of the live sessions
//! and the retained store.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::error;

use crate::metrics::Metrics;
use crate::retained::RetainedStore;
use crate::session::SessionStore;

/// HTTP server for metrics, health and debug endpoints
pub struct AdminServer {
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    sessions: Arc<SessionStore>,
    retained: Arc<RetainedStore>,
}

#[derive(Serialize)]
struct SessionsData {
    sessions: Vec<SessionData>,
}

#[derive(Serialize)]
struct SessionData {
    #[serde(skip_serializing_if = "Option::is_none")]
    transport: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_name: Option<String>,
    client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    remote_addr: String,
    published: u64,
    delivered: u64,
    created_at: u64,
    subscriptions: HashMap<String, u8>,
}

#[derive(Serialize)]
struct RetainedData {
    messages: Vec<RetainedMessage>,
}

#[derive(Serialize)]
struct RetainedMessage {
    topic: String,
    qos: u8,
    retain: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    received: Option<u64>,
    payload: String,
}

impl AdminServer {
    pub fn new(
        addr: SocketAddr,
        metrics: Arc<Metrics>,
        sessions: Arc<SessionStore>,
        retained: Arc<RetainedStore>,
    ) -> Self {
        Self {
            addr,
            metrics,
            sessions,
            retained,
        }
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        let server = Arc::new(self);

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = server.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle(req).await }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!("error serving admin connection: {:?}", e);
                }
            });
        }
    }

    async fn handle(
        &self,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let response = match req.uri().path() {
            "/metrics" => self.metrics_response(),
            "/healthz" => text_response(StatusCode::OK, "OK"),
            "/debug/sessions" => json_response(&self.sessions_data()),
            "/debug/retained" => json_response(&self.retained_data()),
            _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
        };
        Ok(response)
    }

    fn metrics_response(&self) -> Response<Full<Bytes>> {
        let encoder = TextEncoder::new();
        let metric_families = self.metrics.registry.gather();
        let mut buffer = Vec::new();

        match encoder.encode(&metric_families, &mut buffer) {
            Ok(()) => Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", encoder.format_type())
                .body(Full::new(Bytes::from(buffer)))
                .unwrap(),
            Err(e) => {
                error!("failed to encode metrics: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
            }
        }
    }

    fn sessions_data(&self) -> SessionsData {
        let mut sessions: Vec<SessionData> = self
            .sessions
            .all()
            .iter()
            .map(|session| {
                let auth = session.auth_info();
                SessionData {
                    transport: auth.as_deref().map(|a| a.transport),
                    server_name: auth.as_deref().and_then(|a| a.server_name.clone()),
                    client_id: session.client_id().to_string(),
                    username: auth.as_deref().and_then(|a| a.username.clone()),
                    remote_addr: auth
                        .as_deref()
                        .map(|a| a.remote_addr.to_string())
                        .unwrap_or_default(),
                    published: session.stats().published(),
                    delivered: session.stats().delivered(),
                    created_at: unix_seconds(Some(session.created_at())).unwrap_or_default(),
                    subscriptions: session
                        .subscriptions()
                        .into_iter()
                        .map(|(filter, qos)| (filter, qos as u8))
                        .collect(),
                }
            })
            .collect();

        sessions.sort_by(|a, b| {
            (&a.server_name, &a.username, &a.client_id, &a.remote_addr)
                .cmp(&(&b.server_name, &b.username, &b.client_id, &b.remote_addr))
        });

        SessionsData { sessions }
    }

    fn retained_data(&self) -> RetainedData {
        let mut messages: Vec<RetainedMessage> = self
            .retained
            .all()
            .iter()
            .map(|pkt| RetainedMessage {
                topic: pkt.topic.clone(),
                qos: pkt.qos as u8,
                retain: pkt.retain,
                received: unix_seconds(pkt.received),
                payload: String::from_utf8_lossy(&pkt.payload).into_owned(),
            })
            .collect();

        messages.sort_by(|a, b| a.topic.cmp(&b.topic));

        RetainedData { messages }
    }
}

fn unix_seconds(time: Option<SystemTime>) -> Option<u64> {
    time.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn json_response<T: Serialize>(data: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(data) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .unwrap(),
        Err(e) => {
            error!("failed to encode debug data: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
        }
    }
}
