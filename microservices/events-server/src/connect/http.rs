//! HTTP query surface over persisted events

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use events_core::{Component, ConnectionState, EventsError, HealthStatus, Result};
use events_storage::{Record, Storage, StorageError};

use super::ConnectionStatus;
use crate::pipeline::PipelineMetrics;
use crate::query::parse_query;

pub const SERVICE_NAME: &str = "events";

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// State shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub metrics: PipelineMetrics,
    pub connection: ConnectionStatus,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(storage: Arc<dyn Storage>, metrics: PipelineMetrics, connection: ConnectionStatus) -> Self {
        Self {
            storage,
            metrics,
            connection,
            started_at: Instant::now(),
        }
    }
}

/// Error body returned by every failing route
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
}

pub struct ApiError(EventsError);

impl From<EventsError> for ApiError {
    fn from(err: EventsError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            error!(error = %self.0, code = self.0.error_code(), "Request failed");
        }

        let body = ErrorBody {
            code: status.as_u16(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub q: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub connection: ConnectionState,
    pub received: u64,
    pub persisted: u64,
    pub reconnects: u64,
    pub decode_failures: u64,
    pub queue_depth: u64,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/events/", get(query_events))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(state)
}

async fn query_events(
    State(state): State<AppState>,
    Query(params): Query<EventsQuery>,
) -> std::result::Result<Json<Vec<Record>>, ApiError> {
    debug!(q = %params.q, "Query events");

    let range = parse_query(&params.q)?;
    let records = state
        .storage
        .read(range.since, range.until)
        .await
        .map_err(|e| match e {
            StorageError::InvalidRange { .. } => EventsError::QueryParse(e.to_string()),
            other => EventsError::from(other),
        })?;

    Ok(Json(records))
}

async fn health(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        healthy: true,
        service_id: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let metrics = &state.metrics;
    Json(StatsResponse {
        connection: state.connection.get(),
        received: metrics.received.get(),
        persisted: metrics.persisted.get(),
        reconnects: metrics.reconnects.get(),
        decode_failures: metrics.decode_failures.get(),
        queue_depth: metrics.queue_depth.get(),
    })
}

struct Server {
    addr: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Listener for the query API; serving starts in `init`
pub struct HttpSurface {
    port: u16,
    state: AppState,
    server: Mutex<Option<Server>>,
}

impl HttpSurface {
    pub fn new(port: u16, state: AppState) -> Self {
        Self {
            port,
            state,
            server: Mutex::new(None),
        }
    }

    /// Bound address once initialized
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().as_ref().map(|s| s.addr)
    }
}

#[async_trait]
impl Component for HttpSurface {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn init(&self) -> Result<()> {
        debug!(port = self.port, "http: init");

        if self.server.lock().is_some() {
            return Ok(());
        }

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.port))
            .await
            .map_err(|e| EventsError::Connection(format!("failed to listen on {}: {}", self.port, e)))?;
        let addr = listener.local_addr()?;

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let app = create_router(self.state.clone());

        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "HTTP server failed");
            }
        });

        info!(%addr, "Query API listening");
        *self.server.lock() = Some(Server {
            addr,
            cancel,
            handle,
        });
        Ok(())
    }

    async fn deinit(&self) -> Result<()> {
        debug!("http: deinit");

        let server = self.server.lock().take();
        if let Some(server) = server {
            server.cancel.cancel();
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, server.handle).await.is_err() {
                warn!("HTTP server did not stop in time");
            }
        }
        Ok(())
    }
}
