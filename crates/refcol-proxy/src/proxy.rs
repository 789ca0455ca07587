//! ReflectionProxyBackend - ReflectionBackend that forwards to a remote service

use std::time::Duration;

use async_trait::async_trait;
use refcol_core::reflection::{
    ServerReflectionClient, ServerReflectionRequest, ServerReflectionResponse,
};
use refcol_core::{BackendError, BackendResult, ReflectionBackend, TargetDescriptor};
use tonic::transport::Channel;
use tonic::{Code, Status};

use crate::prefix::PathPrefix;

/// Returns true for the error text some transports report when an
/// intermediary ends a stream without a trailing frame.
///
/// On tonic that termination usually surfaces as a clean end of stream, which
/// `round_trip` also treats as a close with no answer.
pub fn is_close_without_trailers(status: &Status) -> bool {
    if !matches!(status.code(), Code::Internal | Code::Unknown) {
        return false;
    }
    let message = status.message().to_ascii_lowercase();
    message.contains("without sending trailers") || message.contains("missing trailers")
}

/// A `ReflectionBackend` that opens one reflection stream per request on a
/// long-lived, possibly shared, channel.
#[derive(Debug)]
pub struct ReflectionProxyBackend {
    name: String,
    target: TargetDescriptor,
    channel: PathPrefix<Channel>,
    call_timeout: Option<Duration>,
}

impl ReflectionProxyBackend {
    pub(crate) fn new(
        name: &str,
        target: TargetDescriptor,
        channel: PathPrefix<Channel>,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            name: name.to_string(),
            target,
            channel,
            call_timeout,
        }
    }

    /// Logical name this backend is registered under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parsed address of the backend
    pub fn target(&self) -> &TargetDescriptor {
        &self.target
    }

    async fn round_trip(
        &self,
        request: &ServerReflectionRequest,
    ) -> BackendResult<Option<ServerReflectionResponse>> {
        let mut client = ServerReflectionClient::new(self.channel.clone());
        let outbound = tokio_stream::once(request.clone());

        let mut inbound = match client.server_reflection_info(outbound).await {
            Ok(response) => response.into_inner(),
            Err(status) if is_close_without_trailers(&status) => {
                tracing::debug!(backend = %self.name, "Stream closed without trailers on open");
                return Ok(None);
            }
            Err(status) => return Err(BackendError::Transport(status)),
        };

        match inbound.message().await {
            Ok(Some(response)) => Ok(Some(response)),
            Ok(None) => {
                tracing::debug!(backend = %self.name, "Stream ended without a response");
                Ok(None)
            }
            Err(status) if is_close_without_trailers(&status) => {
                tracing::debug!(backend = %self.name, "Stream closed without trailers");
                Ok(None)
            }
            Err(status) => Err(BackendError::Transport(status)),
        }
    }
}

#[async_trait]
impl ReflectionBackend for ReflectionProxyBackend {
    fn describe(&self) -> String {
        format!("{} ({})", self.name, self.target)
    }

    async fn exchange(
        &self,
        request: &ServerReflectionRequest,
    ) -> BackendResult<Option<ServerReflectionResponse>> {
        match self.call_timeout {
            Some(limit) => tokio::time::timeout(limit, self.round_trip(request))
                .await
                .map_err(|_| BackendError::Timeout)?,
            None => self.round_trip(request).await,
        }
    }
}
