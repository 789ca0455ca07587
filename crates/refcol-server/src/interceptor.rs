//! Call interception for the main endpoint.
//!
//! `CallGuardLayer` wraps every inbound call, unary or streaming. Each call
//! runs inside an `rpc` span carrying its method so handler logs keep their
//! own file and line while still naming the call. A panicking handler turns
//! into a generic `Internal` status; a handler that returns an error status
//! is logged at warn and passed through untouched. Streaming calls carry
//! their status in trailers, so the response body is wrapped in `CallBody`
//! which checks the trailers frame as it goes by.

use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use http_body::{Body, Frame, SizeHint};
use refcol_core::panic::panic_message;
use tonic::{Code, Status};
use tower::{Layer, Service};
use tracing::{error, info_span, warn, Instrument, Span};

/// Message returned to callers whose handler panicked
const INTERNAL_ERROR: &str = "Internal Error";

/// Layer applying `CallGuard` to a service
#[derive(Debug, Clone, Copy, Default)]
pub struct CallGuardLayer;

impl CallGuardLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for CallGuardLayer {
    type Service = CallGuard<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CallGuard { inner }
    }
}

/// Service wrapper that contains handler panics and logs error statuses
#[derive(Debug, Clone)]
pub struct CallGuard<S> {
    inner: S,
}

fn internal_error<B: Default>() -> http::Response<B> {
    Status::internal(INTERNAL_ERROR).into_http()
}

fn report_panic(span: &Span, payload: &(dyn std::any::Any + Send)) {
    span.in_scope(|| {
        error!(panic = %panic_message(payload), "Call handler panicked");
    });
}

fn report_status(span: &Span, status: &Status) {
    if status.code() == Code::Ok {
        return;
    }
    span.in_scope(|| {
        warn!(
            code = ?status.code(),
            message = %status.message(),
            "Call returned an error"
        );
    });
}

/// Response body of a guarded call.
///
/// Passes frames through unchanged and logs a non-OK `grpc-status` found in
/// the trailers inside the call's span.
pub struct CallBody<B> {
    inner: Pin<Box<B>>,
    span: Span,
}

impl<B> CallBody<B> {
    fn new(inner: B, span: Span) -> Self {
        Self {
            inner: Box::pin(inner),
            span,
        }
    }

    /// The wrapped body
    pub fn get_ref(&self) -> &B {
        &self.inner
    }
}

impl<B: Default> Default for CallBody<B> {
    fn default() -> Self {
        Self::new(B::default(), Span::none())
    }
}

impl<B: Body> Body for CallBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let polled = self.inner.as_mut().poll_frame(cx);
        if let Poll::Ready(Some(Ok(frame))) = &polled {
            if let Some(status) = frame.trailers_ref().and_then(Status::from_header_map) {
                report_status(&self.span, &status);
            }
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for CallGuard<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = http::Response<CallBody<ResBody>>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: http::Request<ReqBody>) -> Self::Future {
        let span = info_span!("rpc", method = %request.uri().path());

        let inner = &mut self.inner;
        let call = span.in_scope(|| std::panic::catch_unwind(AssertUnwindSafe(|| inner.call(request))));
        let future = match call {
            Ok(future) => future,
            Err(payload) => {
                report_panic(&span, payload.as_ref());
                return Box::pin(futures::future::ready(Ok(internal_error())));
            }
        };

        let call_span = span.clone();
        Box::pin(
            async move {
                match AssertUnwindSafe(future).catch_unwind().await {
                    Ok(Ok(response)) => {
                        if let Some(status) = Status::from_header_map(response.headers()) {
                            report_status(&call_span, &status);
                        }
                        Ok(response.map(|body| CallBody::new(body, call_span)))
                    }
                    Ok(Err(e)) => Err(e),
                    Err(payload) => {
                        report_panic(&call_span, payload.as_ref());
                        Ok(internal_error())
                    }
                }
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http_body_util::BodyExt;
    use std::collections::VecDeque;
    use std::convert::Infallible;
    use tower::ServiceExt;
    use tracing_test::traced_test;

    const METHOD: &str = "/grpc.reflection.v1alpha.ServerReflection/ServerReflectionInfo";

    fn request() -> http::Request<()> {
        http::Request::builder()
            .uri(format!("http://gateway{}", METHOD))
            .body(())
            .unwrap()
    }

    fn status_of<B>(response: &http::Response<B>) -> Option<Status> {
        Status::from_header_map(response.headers())
    }

    /// Body yielding a fixed sequence of frames
    #[derive(Default)]
    struct ScriptedBody {
        frames: VecDeque<Frame<Bytes>>,
    }

    impl Body for ScriptedBody {
        type Data = Bytes;
        type Error = Infallible;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
            Poll::Ready(self.frames.pop_front().map(Ok))
        }
    }

    fn streamed_response(code: &'static str) -> http::Response<ScriptedBody> {
        let mut trailers = http::HeaderMap::new();
        trailers.insert("grpc-status", http::HeaderValue::from_static(code));
        trailers.insert(
            "grpc-message",
            http::HeaderValue::from_static("server is shutting down"),
        );
        http::Response::new(ScriptedBody {
            frames: VecDeque::from([
                Frame::data(Bytes::from_static(b"\0\0\0\0\0")),
                Frame::trailers(trailers),
            ]),
        })
    }

    async fn panicking_handler(_request: http::Request<()>) -> Result<http::Response<String>, Infallible> {
        panic!("handler exploded")
    }

    #[tokio::test]
    #[traced_test]
    async fn panic_becomes_internal_error() {
        let svc = CallGuardLayer::new().layer(tower::service_fn(panicking_handler));

        let response = svc.oneshot(request()).await.unwrap();
        let status = status_of(&response).unwrap();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), INTERNAL_ERROR);
        assert!(logs_contain("Call handler panicked"));
        assert!(logs_contain("handler exploded"));
    }

    #[tokio::test]
    #[traced_test]
    async fn synchronous_panic_is_contained() {
        let svc = CallGuardLayer::new().layer(tower::service_fn(
            |_request: http::Request<()>| -> futures::future::Ready<Result<http::Response<String>, Infallible>> {
                panic!("panicked before returning a future")
            },
        ));

        let response = svc.oneshot(request()).await.unwrap();
        assert_eq!(status_of(&response).unwrap().code(), Code::Internal);
        assert!(logs_contain("panicked before returning a future"));
    }

    #[tokio::test]
    #[traced_test]
    async fn error_status_passes_through_with_warning() {
        let svc = CallGuardLayer::new().layer(tower::service_fn(|_request: http::Request<()>| async {
            Ok::<_, Infallible>(Status::not_found("no such symbol").into_http::<String>())
        }));

        let response = svc.oneshot(request()).await.unwrap();
        let status = status_of(&response).unwrap();
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), "no such symbol");
        assert!(logs_contain("Call returned an error"));
        assert!(logs_contain(METHOD));
    }

    #[tokio::test]
    #[traced_test]
    async fn successful_call_is_untouched() {
        let svc = CallGuardLayer::new().layer(tower::service_fn(|_request: http::Request<()>| async {
            Ok::<_, Infallible>(http::Response::new("payload".to_string()))
        }));

        let response = svc.oneshot(request()).await.unwrap();
        assert_eq!(response.body().get_ref(), "payload");
        assert!(status_of(&response).is_none());
        assert!(!logs_contain("Call returned an error"));
    }

    #[tokio::test]
    #[traced_test]
    async fn error_in_stream_trailers_is_logged_at_warn() {
        let svc = CallGuardLayer::new().layer(tower::service_fn(|_request: http::Request<()>| async {
            Ok::<_, Infallible>(streamed_response("1"))
        }));

        let response = svc.oneshot(request()).await.unwrap();
        assert!(status_of(&response).is_none());
        assert!(!logs_contain("Call returned an error"));

        let collected = response.into_body().collect().await.unwrap();
        let trailers = collected.trailers().cloned().unwrap();
        assert_eq!(Status::from_header_map(&trailers).unwrap().code(), Code::Cancelled);
        assert!(logs_contain("Call returned an error"));
        assert!(logs_contain("Cancelled"));
        assert!(logs_contain(METHOD));
    }

    #[tokio::test]
    #[traced_test]
    async fn ok_stream_trailers_are_quiet() {
        let svc = CallGuardLayer::new().layer(tower::service_fn(|_request: http::Request<()>| async {
            Ok::<_, Infallible>(streamed_response("0"))
        }));

        let response = svc.oneshot(request()).await.unwrap();
        let collected = response.into_body().collect().await.unwrap();
        assert!(collected.trailers().is_some());
        assert!(!logs_contain("Call returned an error"));
    }
}
