//! Integration tests for the reflection gateway
//!
//! This crate contains end-to-end tests that exercise the full stack over
//! real gRPC transport on loopback:
//! - Mock reflection backends with fixed service lists and descriptors
//! - The backend connector, including path prefixes and shared connections
//! - The gateway endpoint with health reporting and graceful shutdown
//!
//! # Test Structure
//!
//! - `gateway_e2e_test.rs` - aggregation against live backends
//! - `lifecycle_test.rs` - server startup, health and shutdown behaviour
//!
//! The library half holds the harness shared by both suites.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use refcol_core::reflection::{
    ErrorResponse, FileDescriptorResponse, ListServiceResponse, MessageRequest, MessageResponse,
    ServerReflection, ServerReflectionClient, ServerReflectionRequest, ServerReflectionResponse,
    ServerReflectionServer, ServiceResponse, NOT_FOUND,
};
use refcol_gateway::{GatewayOptions, ReflectionGateway, ReflectionService};
use refcol_server::{
    Bindings, CloseHook, Lifetime, RoutesBuilder, Server, ServerError, ServerOptions,
    ServiceRegistrar,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_stream::StreamExt;
use tonic::transport::Channel;
use tonic::{Request, Response, Status, Streaming};
use tower::{BoxError, Layer, Service};

/// Bound used by helpers waiting on network events
pub const WAIT: Duration = Duration::from_secs(5);

/// In-memory reflection service answering from fixed tables
#[derive(Clone, Default)]
pub struct MockReflection {
    services: Vec<String>,
    /// Symbol or file name -> serialized descriptor
    files: HashMap<String, Vec<u8>>,
    requests: Arc<AtomicUsize>,
}

impl MockReflection {
    pub fn new(services: &[&str]) -> Self {
        Self {
            services: services.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Answer lookups of `name` (symbol or file name) with `descriptor`
    pub fn with_file(mut self, name: &str, descriptor: &[u8]) -> Self {
        self.files.insert(name.to_string(), descriptor.to_vec());
        self
    }

    fn answer(&self, request: &ServerReflectionRequest) -> ServerReflectionResponse {
        let message = match &request.message_request {
            Some(MessageRequest::ListServices(_)) => {
                MessageResponse::ListServicesResponse(ListServiceResponse {
                    service: self
                        .services
                        .iter()
                        .map(|name| ServiceResponse { name: name.clone() })
                        .collect(),
                })
            }
            Some(MessageRequest::FileContainingSymbol(name))
            | Some(MessageRequest::FileByFilename(name)) => match self.files.get(name) {
                Some(descriptor) => {
                    MessageResponse::FileDescriptorResponse(FileDescriptorResponse {
                        file_descriptor_proto: vec![descriptor.clone()],
                    })
                }
                None => not_found(name),
            },
            _ => MessageResponse::ErrorResponse(ErrorResponse {
                error_code: tonic::Code::Unimplemented as i32,
                error_message: "not supported by mock".to_string(),
            }),
        };

        ServerReflectionResponse {
            valid_host: request.host.clone(),
            original_request: Some(request.clone()),
            message_response: Some(message),
        }
    }
}

fn not_found(name: &str) -> MessageResponse {
    MessageResponse::ErrorResponse(ErrorResponse {
        error_code: NOT_FOUND,
        error_message: format!("{} not found", name),
    })
}

#[tonic::async_trait]
impl ServerReflection for MockReflection {
    type ServerReflectionInfoStream = ReceiverStream<Result<ServerReflectionResponse, Status>>;

    async fn server_reflection_info(
        &self,
        request: Request<Streaming<ServerReflectionRequest>>,
    ) -> Result<Response<Self::ServerReflectionInfoStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(4);
        let mock = self.clone();

        tokio::spawn(async move {
            while let Ok(Some(request)) = inbound.message().await {
                mock.requests.fetch_add(1, Ordering::SeqCst);
                if tx.send(Ok(mock.answer(&request))).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

#[derive(Clone)]
struct StripPrefixLayer {
    seen: Arc<Mutex<Vec<String>>>,
}

impl<S> Layer<S> for StripPrefixLayer {
    type Service = StripPrefix<S>;

    fn layer(&self, inner: S) -> Self::Service {
        StripPrefix {
            inner,
            seen: self.seen.clone(),
        }
    }
}

/// Strips any path prefix in front of the `/grpc.` package and records it
#[derive(Clone)]
struct StripPrefix<S> {
    inner: S,
    seen: Arc<Mutex<Vec<String>>>,
}

impl<S, B> Service<http::Request<B>> for StripPrefix<S>
where
    S: Service<http::Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: http::Request<B>) -> Self::Future {
        let path = request.uri().path().to_string();
        if let Some(index) = path.find("/grpc.").filter(|index| *index > 0) {
            if let Ok(uri) = path[index..].parse::<http::Uri>() {
                if let Ok(mut seen) = self.seen.lock() {
                    seen.push(path[..index].to_string());
                }
                *request.uri_mut() = uri;
            }
        }
        self.inner.call(request)
    }
}

/// A `MockReflection` served on an ephemeral loopback port
pub struct MockBackend {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    prefixes: Arc<Mutex<Vec<String>>>,
    requests: Arc<AtomicUsize>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl MockBackend {
    pub async fn start(reflection: MockReflection) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accepted = Arc::new(AtomicUsize::new(0));
        let prefixes = Arc::new(Mutex::new(Vec::new()));
        let requests = reflection.requests.clone();
        let (shutdown, stopped) = oneshot::channel::<()>();

        let counter = accepted.clone();
        let incoming = TcpListenerStream::new(listener).map(move |conn| {
            counter.fetch_add(1, Ordering::SeqCst);
            conn
        });

        let seen = prefixes.clone();
        let handle = tokio::spawn(async move {
            let _ = tonic::transport::Server::builder()
                .layer(StripPrefixLayer { seen })
                .add_service(ServerReflectionServer::new(reflection))
                .serve_with_incoming_shutdown(incoming, async {
                    let _ = stopped.await;
                })
                .await;
        });

        Self {
            addr,
            accepted,
            prefixes,
            requests,
            shutdown: Some(shutdown),
            handle,
        }
    }

    /// Backend address for the gateway configuration
    pub fn address(&self, prefix: &str) -> String {
        format!("grpc://{}{}", self.addr, prefix)
    }

    /// TCP connections accepted so far
    pub fn accepted_connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Reflection requests answered so far
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Path prefixes seen on incoming calls, in arrival order
    pub fn seen_prefixes(&self) -> Vec<String> {
        self.prefixes.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Stop serving; later calls to this backend fail to connect
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if tokio::time::timeout(WAIT, &mut self.handle).await.is_err() {
            self.handle.abort();
        }
    }
}

/// Path of the reflection stream method
pub const REFLECTION_METHOD: &str =
    "/grpc.reflection.v1alpha.ServerReflection/ServerReflectionInfo";

/// Bare HTTP/2 backend that answers the reflection method with gRPC headers
/// and then ends the stream without a trailing frame, the way some
/// intermediaries terminate calls.
pub struct TrailerlessBackend {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TrailerlessBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, stopped) = oneshot::channel::<()>();

        let router = axum::Router::new().route(
            REFLECTION_METHOD,
            axum::routing::post(|| async {
                (
                    [(http::header::CONTENT_TYPE, "application/grpc")],
                    axum::body::Body::empty(),
                )
            }),
        );

        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = stopped.await;
                })
                .await;
        });

        Self {
            addr,
            shutdown: Some(shutdown),
            handle,
        }
    }

    pub fn address(&self) -> String {
        format!("grpc://{}", self.addr)
    }

    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if tokio::time::timeout(WAIT, &mut self.handle).await.is_err() {
            self.handle.abort();
        }
    }
}

/// Registrar that builds a gateway from a service map
pub struct ConnectingRegistrar {
    pub services: BTreeMap<String, String>,
    pub ignores: Vec<String>,
    pub options: GatewayOptions,
}

impl ConnectingRegistrar {
    pub fn new(services: &[(&str, String)]) -> Self {
        Self {
            services: services
                .iter()
                .map(|(name, address)| (name.to_string(), address.clone()))
                .collect(),
            ignores: Vec::new(),
            options: GatewayOptions::default(),
        }
    }
}

#[async_trait]
impl ServiceRegistrar for ConnectingRegistrar {
    async fn register(
        &self,
        lifetime: &Lifetime,
        routes: &mut RoutesBuilder,
    ) -> Result<Option<CloseHook>, BoxError> {
        let gateway =
            ReflectionGateway::connect(&self.services, &self.ignores, self.options.clone()).await?;
        routes.add_service(ReflectionService::new(Arc::new(gateway), lifetime.clone()).into_server());
        Ok(None)
    }
}

/// Registrar serving an already built gateway
pub struct PrebuiltRegistrar(pub Arc<ReflectionGateway>);

#[async_trait]
impl ServiceRegistrar for PrebuiltRegistrar {
    async fn register(
        &self,
        lifetime: &Lifetime,
        routes: &mut RoutesBuilder,
    ) -> Result<Option<CloseHook>, BoxError> {
        routes.add_service(ReflectionService::new(self.0.clone(), lifetime.clone()).into_server());
        Ok(None)
    }
}

/// The gateway server running on ephemeral loopback ports
pub struct GatewayHarness {
    pub addr: SocketAddr,
    pub health_addr: Option<SocketAddr>,
    pub lifetime: Lifetime,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<(), ServerError>>,
}

impl GatewayHarness {
    pub async fn start<R: ServiceRegistrar>(name: &str, registrar: R) -> Self {
        let main = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let health = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bindings = Bindings {
            main,
            health: Some(health),
        };
        let addr = bindings.main_addr().unwrap();
        let health_addr = bindings.health_addr();

        let server = Server::new(ServerOptions {
            shutdown_timeout: WAIT,
            ..ServerOptions::new(name)
        });
        let lifetime = server.lifetime();
        let (shutdown, requested) = oneshot::channel::<()>();

        let handle = tokio::spawn(server.serve(bindings, registrar, async move {
            let _ = requested.await;
        }));

        Self {
            addr,
            health_addr,
            lifetime,
            shutdown: Some(shutdown),
            handle,
        }
    }

    /// Open a reflection client on the gateway endpoint
    pub async fn client(&self) -> ServerReflectionClient<Channel> {
        let endpoint = format!("http://{}", self.addr);
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            match async {
                let channel = tonic::transport::Endpoint::new(endpoint.clone())?
                    .connect()
                    .await?;
                Ok::<_, tonic::transport::Error>(ServerReflectionClient::new(channel))
            }
            .await
            {
                Ok(client) => return client,
                Err(e) if tokio::time::Instant::now() >= deadline => {
                    panic!("gateway did not accept connections: {}", e)
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    }

    /// Whether the server task has already returned
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Trigger shutdown as a termination signal would and wait for the result
    pub async fn shutdown(mut self) -> Result<(), ServerError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.join().await
    }

    /// Wait for the server to stop on its own
    pub async fn join(self) -> Result<(), ServerError> {
        tokio::time::timeout(WAIT * 2, self.handle)
            .await
            .expect("server did not stop in time")
            .expect("server task panicked")
    }
}

/// One client-held reflection stream
pub struct ReflectionSession {
    outbound: mpsc::Sender<ServerReflectionRequest>,
    inbound: Streaming<ServerReflectionResponse>,
}

impl ReflectionSession {
    pub async fn open(client: &mut ServerReflectionClient<Channel>) -> Self {
        let (outbound, rx) = mpsc::channel(4);
        let inbound = client
            .server_reflection_info(ReceiverStream::new(rx))
            .await
            .unwrap()
            .into_inner();
        Self { outbound, inbound }
    }

    pub async fn send(&self, message: MessageRequest) {
        self.outbound
            .send(ServerReflectionRequest {
                host: String::new(),
                message_request: Some(message),
            })
            .await
            .unwrap();
    }

    /// Next response, `Ok(None)` when the stream ended cleanly
    pub async fn recv(&mut self) -> Result<Option<ServerReflectionResponse>, Status> {
        tokio::time::timeout(WAIT, self.inbound.message())
            .await
            .expect("no response from gateway")
    }

    /// Send `message` and wait for its answer
    pub async fn ask(&mut self, message: MessageRequest) -> ServerReflectionResponse {
        self.send(message).await;
        self.recv().await.unwrap().expect("stream ended early")
    }

    /// Close the sending side
    pub fn close(self) -> Streaming<ServerReflectionResponse> {
        self.inbound
    }
}

/// Service names from a list response
pub fn service_names(response: &ServerReflectionResponse) -> Vec<String> {
    refcol_core::reflection::listed_services(response)
        .iter()
        .map(|s| s.name.clone())
        .collect()
}

/// Wildcard `ListServices` request message
pub fn list_all() -> MessageRequest {
    MessageRequest::ListServices("*".to_string())
}
