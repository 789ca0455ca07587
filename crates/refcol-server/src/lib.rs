//! refcol-server - Server lifecycle for the reflection gateway
//!
//! Runs the main gRPC endpoint, an optional health endpoint and an optional
//! auxiliary endpoint under one shared `Lifetime`, and tears them all down
//! together when a termination signal arrives or any of them returns.
//!
//! ```rust,ignore
//! use refcol_server::{Server, ServerOptions};
//!
//! let server = Server::new(ServerOptions::new("reflection"));
//! server.run("0.0.0.0:8080", registrar).await?;
//! ```

pub mod error;
pub mod health;
pub mod interceptor;
pub mod server;
pub mod signal;

pub use error::ServerError;
pub use health::HealthState;
pub use interceptor::{CallBody, CallGuard, CallGuardLayer};
pub use server::{
    AuxiliaryEndpoint, Bindings, CloseHook, Server, ServerOptions, ServiceRegistrar,
};
pub use signal::shutdown_signal;

// Re-export for registrars
pub use refcol_core::Lifetime;
pub use tonic::service::RoutesBuilder;
