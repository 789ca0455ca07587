//! Method-path prefixing for multiplexed backends.
//!
//! `PathPrefix` wraps a gRPC channel and rewrites the `:path` of every
//! outgoing call from `/pkg.Service/Method` to `<prefix>/pkg.Service/Method`,
//! letting several logical services sit behind one physical endpoint.

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::uri::PathAndQuery;
use http::{Request, Uri};
use tower::{BoxError, Service};

/// Channel wrapper that prepends a fixed path to each call
#[derive(Debug, Clone)]
pub struct PathPrefix<S> {
    inner: S,
    prefix: Arc<str>,
}

impl<S> PathPrefix<S> {
    /// Wrap `inner`; an empty prefix leaves requests untouched
    pub fn new(inner: S, prefix: impl Into<Arc<str>>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    /// The prefix baked into this channel
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Prepend `prefix` to the path of `uri`
pub(crate) fn prefixed_uri(uri: &Uri, prefix: &str) -> Result<Uri, http::Error> {
    let rewritten = match uri.path_and_query() {
        Some(pq) => format!("{}{}", prefix, pq.as_str()),
        None => prefix.to_string(),
    };

    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(PathAndQuery::try_from(rewritten)?);
    Ok(Uri::from_parts(parts)?)
}

impl<S, B> Service<Request<B>> for PathPrefix<S>
where
    S: Service<Request<B>>,
    S::Error: Into<BoxError>,
    S::Response: Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<S::Response, BoxError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, mut request: Request<B>) -> Self::Future {
        if !self.prefix.is_empty() {
            match prefixed_uri(request.uri(), &self.prefix) {
                Ok(uri) => *request.uri_mut() = uri,
                Err(e) => return Box::pin(futures::future::ready(Err(e.into()))),
            }
        }

        let future = self.inner.call(request);
        Box::pin(async move { future.await.map_err(Into::into) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use tower::ServiceExt;

    const METHOD: &str = "/grpc.reflection.v1alpha.ServerReflection/ServerReflectionInfo";

    fn echo_path(
    ) -> impl Service<Request<()>, Response = String, Error = Infallible, Future: Send + 'static> + Clone
    {
        tower::service_fn(|req: Request<()>| async move { Ok::<_, Infallible>(req.uri().to_string()) })
    }

    #[test]
    fn prefix_is_prepended() {
        let uri: Uri = format!("http://edge:443{}", METHOD).parse().unwrap();
        let rewritten = prefixed_uri(&uri, "/billing").unwrap();
        assert_eq!(rewritten.path(), format!("/billing{}", METHOD));
        assert_eq!(rewritten.authority().unwrap().as_str(), "edge:443");
    }

    #[tokio::test]
    async fn service_rewrites_outgoing_path() {
        let svc = PathPrefix::new(echo_path(), "/orders");
        let req = Request::builder()
            .uri(format!("http://edge{}", METHOD))
            .body(())
            .unwrap();
        let seen = svc.oneshot(req).await.unwrap();
        assert_eq!(seen, format!("http://edge/orders{}", METHOD));
    }

    #[tokio::test]
    async fn empty_prefix_passes_through() {
        let svc = PathPrefix::new(echo_path(), "");
        assert_eq!(svc.prefix(), "");
        let req = Request::builder()
            .uri(format!("http://edge{}", METHOD))
            .body(())
            .unwrap();
        let seen = svc.oneshot(req).await.unwrap();
        assert_eq!(seen, format!("http://edge{}", METHOD));
    }
}
