//! refcol-proxy - Reflection proxy backend
//!
//! Implements `ReflectionBackend` by forwarding each request over gRPC to a
//! remote reflection service. Several logical backends can share one
//! physical connection: each backend's channel carries its own method path
//! prefix, and connections are pooled by `(host:port, secure)`.

mod connector;
mod prefix;
mod proxy;
mod tls;

pub use connector::{Connector, ConnectorOptions};
pub use prefix::PathPrefix;
pub use proxy::{is_close_without_trailers, ReflectionProxyBackend};
