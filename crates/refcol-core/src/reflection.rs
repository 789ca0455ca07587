//! Reflection wire types and request inspection helpers.
//!
//! The message schema is the standard `grpc.reflection.v1alpha` protocol as
//! generated by `tonic-reflection`; nothing here changes it. The helpers
//! only look at the two request kinds the gateway routes on.

pub use tonic_reflection::pb::v1alpha::server_reflection_client::ServerReflectionClient;
pub use tonic_reflection::pb::v1alpha::server_reflection_request::MessageRequest;
pub use tonic_reflection::pb::v1alpha::server_reflection_response::MessageResponse;
pub use tonic_reflection::pb::v1alpha::server_reflection_server::{
    ServerReflection, ServerReflectionServer,
};
pub use tonic_reflection::pb::v1alpha::{
    ErrorResponse, ExtensionNumberResponse, ExtensionRequest, FileDescriptorResponse,
    ListServiceResponse, ServerReflectionRequest, ServerReflectionResponse, ServiceResponse,
};

/// Fully-qualified name of the reflection service the gateway serves
pub const REFLECTION_SERVICE_NAME: &str = "grpc.reflection.v1alpha.ServerReflection";

/// Newer reflection revision, hidden because the gateway does not serve it
pub const REFLECTION_V1_SERVICE_NAME: &str = "grpc.reflection.v1.ServerReflection";

/// `ListServices` pattern that asks for every service
pub const WILDCARD: &str = "*";

/// Error code backends use for "symbol/file not here"
pub const NOT_FOUND: i32 = tonic::Code::NotFound as i32;

/// The symbol of a `FileContainingSymbol` request, if non-empty
pub fn requested_symbol(request: &ServerReflectionRequest) -> Option<&str> {
    match &request.message_request {
        Some(MessageRequest::FileContainingSymbol(symbol)) if !symbol.is_empty() => {
            Some(symbol.as_str())
        }
        _ => None,
    }
}

/// True for `ListServices("*")`
pub fn is_wildcard_list(request: &ServerReflectionRequest) -> bool {
    matches!(
        &request.message_request,
        Some(MessageRequest::ListServices(pattern)) if pattern == WILDCARD
    )
}

/// Stable textual encoding of a request, used as a cache key
pub fn cache_key(request: &ServerReflectionRequest) -> String {
    format!("{:?}", request)
}

/// The error payload of a response, if it is one
pub fn error_of(response: &ServerReflectionResponse) -> Option<&ErrorResponse> {
    match &response.message_response {
        Some(MessageResponse::ErrorResponse(err)) => Some(err),
        _ => None,
    }
}

/// Service names carried by a list response; empty for any other kind
pub fn listed_services(response: &ServerReflectionResponse) -> &[ServiceResponse] {
    match &response.message_response {
        Some(MessageResponse::ListServicesResponse(list)) => &list.service,
        _ => &[],
    }
}

/// Build a list response answering `request`
pub fn list_services_response(
    request: &ServerReflectionRequest,
    service: Vec<ServiceResponse>,
) -> ServerReflectionResponse {
    ServerReflectionResponse {
        valid_host: request.host.clone(),
        original_request: Some(request.clone()),
        message_response: Some(MessageResponse::ListServicesResponse(ListServiceResponse {
            service,
        })),
    }
}
