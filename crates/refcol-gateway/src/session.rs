//! Reflection session handling.
//!
//! Each client stream is served by its own task that reads one request,
//! resolves it through the gateway and writes the answer before reading the
//! next, so responses keep request order. Every wait in the loop also
//! watches the server lifetime and the client's receive side.

use std::sync::Arc;

use refcol_core::panic::panic_message;
use refcol_core::reflection::{
    ServerReflection, ServerReflectionRequest, ServerReflectionResponse, ServerReflectionServer,
};
use refcol_core::Lifetime;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, trace, warn, Instrument};

use crate::gateway::ReflectionGateway;

/// Responses buffered toward a client before the session waits
const SESSION_BUFFER: usize = 4;

type Outbound = mpsc::Sender<Result<ServerReflectionResponse, Status>>;

/// How a session loop finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed its send side
    ClientClosed,
    /// The server lifetime was cancelled
    Cancelled,
    /// The client stopped receiving
    Disconnected,
}

/// `grpc.reflection.v1alpha.ServerReflection` backed by a `ReflectionGateway`
#[derive(Clone)]
pub struct ReflectionService {
    gateway: Arc<ReflectionGateway>,
    lifetime: Lifetime,
}

impl ReflectionService {
    pub fn new(gateway: Arc<ReflectionGateway>, lifetime: Lifetime) -> Self {
        Self { gateway, lifetime }
    }

    /// Wrap in the generated tonic server
    pub fn into_server(self) -> ServerReflectionServer<Self> {
        ServerReflectionServer::new(self)
    }
}

#[tonic::async_trait]
impl ServerReflection for ReflectionService {
    type ServerReflectionInfoStream = ReceiverStream<Result<ServerReflectionResponse, Status>>;

    async fn server_reflection_info(
        &self,
        request: Request<Streaming<ServerReflectionRequest>>,
    ) -> Result<Response<Self::ServerReflectionInfoStream>, Status> {
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);

        let session = Session {
            gateway: self.gateway.clone(),
            lifetime: self.lifetime.clone(),
            outbound: tx.clone(),
        };
        spawn_supervised(session, inbound, tx);

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Run `session` on its own task and report a panic to the client as
/// `Internal` instead of dropping the stream.
fn spawn_supervised<S>(session: Session, inbound: S, outbound: Outbound)
where
    S: Stream<Item = Result<ServerReflectionRequest, Status>> + Send + 'static,
{
    let span = tracing::Span::current();
    let task = tokio::spawn(session.run(inbound).instrument(span.clone()));

    tokio::spawn(
        async move {
            match task.await {
                Ok(end) => debug!(?end, "Reflection session finished"),
                Err(e) if e.is_panic() => {
                    let message = panic_message(e.into_panic().as_ref());
                    error!(panic = %message, "Reflection session panicked");
                    // Waits behind answers still buffered for the client.
                    if outbound
                        .send(Err(Status::internal("Internal Error")))
                        .await
                        .is_err()
                    {
                        debug!("Client gone before the panic could be reported");
                    }
                }
                Err(e) => debug!(error = %e, "Reflection session aborted"),
            }
        }
        .instrument(span),
    );
}

struct Session {
    gateway: Arc<ReflectionGateway>,
    lifetime: Lifetime,
    outbound: Outbound,
}

impl Session {
    async fn run<S>(self, inbound: S) -> SessionEnd
    where
        S: Stream<Item = Result<ServerReflectionRequest, Status>>,
    {
        let mut inbound = Box::pin(inbound);

        loop {
            if self.lifetime.is_cancelled() {
                return self.cancel();
            }

            let next = tokio::select! {
                biased;
                _ = self.lifetime.cancelled() => return self.cancel(),
                _ = self.outbound.closed() => return SessionEnd::Disconnected,
                next = inbound.next() => next,
            };

            let request = match next {
                None => {
                    debug!("Client closed the reflection stream");
                    return SessionEnd::ClientClosed;
                }
                Some(Err(status)) => {
                    error!(error = %status, "Failed to receive reflection request");
                    continue;
                }
                Some(Ok(request)) => request,
            };
            trace!(request = ?request.message_request, "Reflection request received");

            let response = tokio::select! {
                biased;
                _ = self.lifetime.cancelled() => return self.cancel(),
                _ = self.outbound.closed() => return SessionEnd::Disconnected,
                response = self.gateway.resolve(&request) => response,
            };

            let Some(response) = response else {
                warn!(request = ?request.message_request, "Response is empty, no backend answered");
                continue;
            };

            let sent = tokio::select! {
                biased;
                _ = self.lifetime.cancelled() => return self.cancel(),
                sent = self.outbound.send(Ok(response)) => sent,
            };
            if sent.is_err() {
                error!("Failed to send reflection response");
            }
        }
    }

    /// Tell the client the stream ends because the server is stopping
    fn cancel(&self) -> SessionEnd {
        let _ = self
            .outbound
            .try_send(Err(Status::cancelled("server is shutting down")));
        SessionEnd::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use refcol_core::reflection::{
        ListServiceResponse, MessageRequest, MessageResponse, ServiceResponse,
    };
    use refcol_core::{BackendResult, ReflectionBackend};
    use tonic::Code;

    /// Answers filename lookups with the filename as host, nothing else
    struct EchoBackend;

    #[async_trait]
    impl ReflectionBackend for EchoBackend {
        fn describe(&self) -> String {
            "echo".to_string()
        }

        async fn exchange(
            &self,
            request: &ServerReflectionRequest,
        ) -> BackendResult<Option<ServerReflectionResponse>> {
            match &request.message_request {
                Some(MessageRequest::FileByFilename(name)) => Ok(Some(ServerReflectionResponse {
                    valid_host: name.clone(),
                    original_request: Some(request.clone()),
                    message_response: Some(MessageResponse::ListServicesResponse(
                        ListServiceResponse {
                            service: vec![ServiceResponse { name: name.clone() }],
                        },
                    )),
                })),
                _ => Ok(None),
            }
        }
    }

    /// Echoes like `EchoBackend` but panics on the file named "boom"
    struct FragileBackend;

    #[async_trait]
    impl ReflectionBackend for FragileBackend {
        fn describe(&self) -> String {
            "fragile".to_string()
        }

        async fn exchange(
            &self,
            request: &ServerReflectionRequest,
        ) -> BackendResult<Option<ServerReflectionResponse>> {
            if let Some(MessageRequest::FileByFilename(name)) = &request.message_request {
                if name == "boom" {
                    panic!("descriptor table corrupted");
                }
            }
            EchoBackend.exchange(request).await
        }
    }

    /// Never answers
    struct StuckBackend;

    #[async_trait]
    impl ReflectionBackend for StuckBackend {
        fn describe(&self) -> String {
            "stuck".to_string()
        }

        async fn exchange(
            &self,
            _request: &ServerReflectionRequest,
        ) -> BackendResult<Option<ServerReflectionResponse>> {
            std::future::pending().await
        }
    }

    type Inbound = Result<ServerReflectionRequest, Status>;

    fn session(
        backend: Arc<dyn ReflectionBackend>,
    ) -> (
        Session,
        Lifetime,
        mpsc::Receiver<Result<ServerReflectionResponse, Status>>,
    ) {
        let mut gateway = ReflectionGateway::new(Vec::<String>::new());
        gateway.register_backend("echo", backend);
        let lifetime = Lifetime::new();
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        let session = Session {
            gateway: Arc::new(gateway),
            lifetime: lifetime.clone(),
            outbound: tx,
        };
        (session, lifetime, rx)
    }

    fn by_filename(name: &str) -> Inbound {
        Ok(ServerReflectionRequest {
            host: String::new(),
            message_request: Some(MessageRequest::FileByFilename(name.to_string())),
        })
    }

    #[tokio::test]
    async fn answers_in_request_order() {
        let (session, _lifetime, mut rx) = session(Arc::new(EchoBackend));
        let inbound = tokio_stream::iter(vec![by_filename("a"), by_filename("b"), by_filename("c")]);

        assert_eq!(session.run(inbound).await, SessionEnd::ClientClosed);

        let mut hosts = Vec::new();
        while let Some(Ok(response)) = rx.recv().await {
            hosts.push(response.valid_host);
        }
        assert_eq!(hosts, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn read_errors_and_empty_answers_do_not_end_the_session() {
        let (session, _lifetime, mut rx) = session(Arc::new(EchoBackend));
        let inbound = tokio_stream::iter(vec![
            Err(Status::data_loss("garbled frame")),
            Ok(ServerReflectionRequest {
                host: String::new(),
                message_request: Some(MessageRequest::ListServices("*".to_string())),
            }),
            by_filename("after"),
        ]);

        assert_eq!(session.run(inbound).await, SessionEnd::ClientClosed);

        let response = rx.recv().await.unwrap().unwrap();
        assert_eq!(response.valid_host, "after");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancelled_lifetime_ends_session_with_cancelled_status() {
        let (session, lifetime, mut rx) = session(Arc::new(EchoBackend));
        lifetime.cancel();

        let end = session.run(tokio_stream::pending::<Inbound>()).await;
        assert_eq!(end, SessionEnd::Cancelled);

        let status = rx.recv().await.unwrap().unwrap_err();
        assert_eq!(status.code(), Code::Cancelled);
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_pending_resolve() {
        let (session, lifetime, mut rx) = session(Arc::new(StuckBackend));
        let inbound = tokio_stream::iter(vec![by_filename("a")]).chain(tokio_stream::pending::<Inbound>());

        let task = tokio::spawn(session.run(inbound));
        tokio::time::sleep(Duration::from_millis(50)).await;
        lifetime.cancel();

        let end = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end, SessionEnd::Cancelled);
        assert_eq!(rx.recv().await.unwrap().unwrap_err().code(), Code::Cancelled);
    }

    #[tokio::test]
    async fn dropped_receiver_ends_the_session() {
        let (session, _lifetime, rx) = session(Arc::new(EchoBackend));
        drop(rx);

        let end = session.run(tokio_stream::pending::<Inbound>()).await;
        assert_eq!(end, SessionEnd::Disconnected);
    }

    #[tokio::test]
    async fn panic_is_reported_behind_a_full_buffer() {
        let (session, _lifetime, mut rx) = session(Arc::new(FragileBackend));
        let outbound = session.outbound.clone();
        let mut requests: Vec<Inbound> = (0..SESSION_BUFFER)
            .map(|i| by_filename(&format!("f{}", i)))
            .collect();
        requests.push(by_filename("boom"));

        spawn_supervised(session, tokio_stream::iter(requests), outbound);
        // Nothing is read until the session has filled the buffer and panicked.
        tokio::time::sleep(Duration::from_millis(50)).await;

        for _ in 0..SESSION_BUFFER {
            assert!(rx.recv().await.unwrap().is_ok());
        }
        let status = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "Internal Error");
    }
}
