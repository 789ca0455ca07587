//! ReflectionBackend trait - the core abstraction over one downstream service

use async_trait::async_trait;

use crate::error::BackendResult;
use crate::reflection::{ServerReflectionRequest, ServerReflectionResponse};

/// A downstream service that answers reflection requests.
///
/// Each call is a single request/response exchange, not a pass-through of
/// the whole client session.
#[async_trait]
pub trait ReflectionBackend: Send + Sync {
    /// Human-readable description of where this backend lives
    fn describe(&self) -> String;

    /// Forward one request and wait for exactly one answer.
    ///
    /// `Ok(None)` means the backend closed the exchange cleanly without
    /// producing a message.
    async fn exchange(
        &self,
        request: &ServerReflectionRequest,
    ) -> BackendResult<Option<ServerReflectionResponse>>;
}
