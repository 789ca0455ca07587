//! Server orchestration.
//!
//! A run owns up to three tasks: the main gRPC endpoint, the health
//! endpoint and an auxiliary endpoint supplied by the embedding binary.
//! They share one `Lifetime`. Whichever comes first of the shutdown
//! future and any task returning triggers the same teardown: cancel the
//! lifetime, report not serving, gracefully stop every endpoint and wait
//! for all tasks up to the shutdown timeout.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use refcol_core::Lifetime;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::service::RoutesBuilder;
use tower::BoxError;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::ServerError;
use crate::health::HealthState;
use crate::interceptor::CallGuardLayer;
use crate::signal::shutdown_signal;

/// Callback run when the main endpoint task finishes
pub type CloseHook = Box<dyn FnOnce() + Send + 'static>;

/// Wires services into the main endpoint before it starts serving.
///
/// Failure is fatal to the run.
#[async_trait]
pub trait ServiceRegistrar: Send + Sync + 'static {
    async fn register(
        &self,
        lifetime: &Lifetime,
        routes: &mut RoutesBuilder,
    ) -> Result<Option<CloseHook>, BoxError>;
}

/// Extra endpoint run alongside the gRPC endpoints
#[async_trait]
pub trait AuxiliaryEndpoint: Send + Sync + 'static {
    /// Serve until stopped. Returning ends the whole run.
    async fn run(&self, lifetime: Lifetime) -> Result<(), BoxError>;

    /// Ask `run` to finish its in-flight work and return
    async fn graceful_stop(&self);
}

/// Server settings
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Identity used for the health service name
    pub name: String,
    pub health_enabled: bool,
    pub health_addr: String,
    /// Bound on waiting for tasks after shutdown is triggered
    pub shutdown_timeout: Duration,
}

impl ServerOptions {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            health_enabled: true,
            health_addr: "localhost:9000".to_string(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Listening sockets for one run
#[derive(Debug)]
pub struct Bindings {
    pub main: TcpListener,
    /// `None` disables the health endpoint
    pub health: Option<TcpListener>,
}

impl Bindings {
    pub fn main_addr(&self) -> Option<SocketAddr> {
        self.main.local_addr().ok()
    }

    pub fn health_addr(&self) -> Option<SocketAddr> {
        self.health.as_ref().and_then(|l| l.local_addr().ok())
    }
}

type TaskOutcome = (&'static str, Result<(), ServerError>);

/// Lifecycle orchestrator for the gateway endpoints
pub struct Server {
    options: ServerOptions,
    auxiliary: Option<Arc<dyn AuxiliaryEndpoint>>,
    lifetime: Lifetime,
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            options,
            auxiliary: None,
            lifetime: Lifetime::new(),
        }
    }

    /// Run `endpoint` as the auxiliary task
    pub fn with_auxiliary(mut self, endpoint: Arc<dyn AuxiliaryEndpoint>) -> Self {
        self.auxiliary = Some(endpoint);
        self
    }

    /// The lifetime shared by every task of this server
    pub fn lifetime(&self) -> Lifetime {
        self.lifetime.clone()
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Bind the main endpoint on `addr` and, if enabled, the health endpoint
    pub async fn bind(&self, addr: &str) -> Result<Bindings, ServerError> {
        let main = bind_endpoint("main", addr).await?;
        let health = if self.options.health_enabled {
            Some(bind_endpoint("health", &self.options.health_addr).await?)
        } else {
            None
        };
        Ok(Bindings { main, health })
    }

    /// Bind and serve until a termination signal or a task finishes
    pub async fn run<R>(self, addr: &str, registrar: R) -> Result<(), ServerError>
    where
        R: ServiceRegistrar,
    {
        let bindings = self.bind(addr).await?;
        self.serve(bindings, registrar, shutdown_signal()).await
    }

    /// Serve on pre-bound sockets until `shutdown` resolves or a task finishes
    pub async fn serve<R, F>(
        self,
        bindings: Bindings,
        registrar: R,
        shutdown: F,
    ) -> Result<(), ServerError>
    where
        R: ServiceRegistrar,
        F: Future<Output = ()>,
    {
        let lifetime = self.lifetime.clone();
        let (reporter, health_service) = tonic_health::server::health_reporter();
        let health = HealthState::new(reporter, &self.options.name);
        health.set_not_serving().await;

        let main_stop = Lifetime::new();
        let health_stop = Lifetime::new();
        let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();

        // Main endpoint
        {
            let lifetime = lifetime.clone();
            let health = health.clone();
            let stop = main_stop.clone();
            let listener = bindings.main;
            spawn_task(&mut tasks, "main", lifetime.clone(), async move {
                serve_main(listener, registrar, lifetime, health, stop).await
            });
        }

        // Health endpoint
        if let Some(listener) = bindings.health {
            let stop = health_stop.clone();
            info!(addr = ?listener.local_addr().ok(), service = %health.service(), "Health endpoint serving");
            spawn_task(&mut tasks, "health", lifetime.clone(), async move {
                tonic::transport::Server::builder()
                    .add_service(health_service)
                    .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                        stop.cancelled().await
                    })
                    .await
                    .map_err(ServerError::Transport)
            });
        }

        // Auxiliary endpoint
        if let Some(endpoint) = self.auxiliary.clone() {
            let run_lifetime = lifetime.clone();
            spawn_task(&mut tasks, "auxiliary", lifetime.clone(), async move {
                endpoint
                    .run(run_lifetime)
                    .await
                    .map_err(ServerError::Auxiliary)
            });
        }

        tokio::select! {
            _ = shutdown => info!("Shutdown requested"),
            _ = lifetime.cancelled() => info!("Server task finished, shutting down"),
        }

        lifetime.cancel();
        health.set_not_serving().await;
        main_stop.cancel();
        health_stop.cancel();
        if let Some(endpoint) = &self.auxiliary {
            endpoint.graceful_stop().await;
        }

        let mut failures = drain(tasks, self.options.shutdown_timeout).await;
        if failures.is_empty() {
            info!("Server stopped");
            Ok(())
        } else {
            Err(failures.remove(0))
        }
    }
}

async fn bind_endpoint(endpoint: &'static str, addr: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            endpoint,
            addr: addr.to_string(),
            source,
        })
}

/// Spawn a task that cancels `lifetime` when it returns, whatever the outcome
fn spawn_task<Fut>(tasks: &mut JoinSet<TaskOutcome>, name: &'static str, lifetime: Lifetime, task: Fut)
where
    Fut: Future<Output = Result<(), ServerError>> + Send + 'static,
{
    tasks.spawn(
        async move {
            let result = task.await;
            lifetime.cancel();
            (name, result)
        }
        .instrument(info_span!("task", name)),
    );
}

async fn serve_main<R>(
    listener: TcpListener,
    registrar: R,
    lifetime: Lifetime,
    health: HealthState,
    stop: Lifetime,
) -> Result<(), ServerError>
where
    R: ServiceRegistrar,
{
    let mut routes = RoutesBuilder::default();
    let close = registrar
        .register(&lifetime, &mut routes)
        .await
        .map_err(ServerError::Register)?;

    info!(addr = ?listener.local_addr().ok(), "Main endpoint serving");
    health.set_serving().await;

    let result = tonic::transport::Server::builder()
        .layer(CallGuardLayer::new())
        .add_routes(routes.routes())
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            stop.cancelled().await
        })
        .await;

    if let Some(close) = close {
        close();
    }
    result.map_err(ServerError::Transport)
}

/// Wait for every task, up to `timeout`. Returns the failures.
async fn drain(mut tasks: JoinSet<TaskOutcome>, timeout: Duration) -> Vec<ServerError> {
    let mut failures = Vec::new();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            joined = tasks.join_next() => match joined {
                None => break,
                Some(Ok((task, Ok(())))) => debug!(task, "Server task finished"),
                Some(Ok((task, Err(e)))) => {
                    error!(task, error = %e, "Server task failed");
                    failures.push(e);
                }
                Some(Err(e)) => {
                    error!(error = %e, "Server task did not complete");
                    failures.push(ServerError::Task {
                        task: "unknown",
                        reason: e.to_string(),
                    });
                }
            },
            _ = &mut deadline => {
                warn!(remaining = tasks.len(), "Graceful stop timed out, aborting remaining tasks");
                tasks.abort_all();
                break;
            }
        }
    }

    failures
}
