//! Auxiliary HTTP status endpoint
//!
//! Serves `GET /status` (JSON summary of the gateway) and `GET /healthz`
//! (200 once the gateway is registered, 503 before that and again once
//! shutdown has begun, in step with the gRPC health status).

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use refcol_gateway::ReflectionGateway;
use refcol_server::{AuxiliaryEndpoint, Lifetime};
use serde::Serialize;
use tokio::net::TcpListener;
use tower::BoxError;
use tracing::info;

/// Gateway published by the registrar once the main endpoint is wired
pub type GatewaySlot = Arc<OnceLock<Arc<ReflectionGateway>>>;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BackendStatus {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub name: String,
    pub ready: bool,
    pub backends: Vec<BackendStatus>,
    pub ignores: Vec<String>,
    pub cache_entries: Option<usize>,
}

#[derive(Clone)]
struct StatusState {
    name: Arc<str>,
    backends: Arc<Vec<BackendStatus>>,
    gateway: GatewaySlot,
    stop: Lifetime,
    /// Lifetime of the whole server, known once `run` starts
    server: Option<Lifetime>,
}

impl StatusState {
    fn ready(&self) -> bool {
        let stopping = self.stop.is_cancelled()
            || self.server.as_ref().is_some_and(Lifetime::is_cancelled);
        self.gateway.get().is_some() && !stopping
    }
}

/// HTTP status endpoint run as the server's auxiliary task
pub struct StatusEndpoint {
    addr: String,
    state: StatusState,
    stop: Lifetime,
}

impl StatusEndpoint {
    pub fn new(
        addr: &str,
        name: &str,
        services: &BTreeMap<String, String>,
        gateway: GatewaySlot,
    ) -> Self {
        let backends = services
            .iter()
            .map(|(name, address)| BackendStatus {
                name: name.clone(),
                address: address.clone(),
            })
            .collect();

        let stop = Lifetime::new();
        Self {
            addr: addr.to_string(),
            state: StatusState {
                name: name.into(),
                backends: Arc::new(backends),
                gateway,
                stop: stop.clone(),
                server: None,
            },
            stop,
        }
    }

    fn router(&self, server: Option<Lifetime>) -> Router {
        create_router(StatusState {
            server,
            ..self.state.clone()
        })
    }
}

fn create_router(state: StatusState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn status(State(state): State<StatusState>) -> Json<StatusReport> {
    let gateway = state.gateway.get();
    Json(StatusReport {
        name: state.name.to_string(),
        ready: state.ready(),
        backends: state.backends.as_ref().clone(),
        ignores: gateway.map(|g| g.ignores()).unwrap_or_default(),
        cache_entries: gateway.and_then(|g| g.cache()).map(|cache| cache.len()),
    })
}

async fn healthz(State(state): State<StatusState>) -> (StatusCode, &'static str) {
    if state.ready() {
        (StatusCode::OK, "ok")
    } else if state.gateway.get().is_some() {
        (StatusCode::SERVICE_UNAVAILABLE, "stopping")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}

#[async_trait]
impl AuxiliaryEndpoint for StatusEndpoint {
    async fn run(&self, lifetime: Lifetime) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!(addr = %self.addr, "Status endpoint serving");

        let stop = self.stop.clone();
        let router = self.router(Some(lifetime.clone()));
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = stop.cancelled() => {}
                    _ = lifetime.cancelled() => {}
                }
            })
            .await?;

        info!("Status endpoint stopped");
        Ok(())
    }

    async fn graceful_stop(&self) {
        self.stop.cancel();
    }
}
