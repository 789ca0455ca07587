//! refcol-gateway - Reflection aggregation
//!
//! This crate provides the `ReflectionGateway` that fans reflection
//! requests out to a set of named backends and merges their answers, and
//! the `ReflectionService` that serves it to clients as the standard
//! `grpc.reflection.v1alpha.ServerReflection` bidirectional stream.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       Reflection Gateway                         │
//! │                                                                  │
//! │  client stream ──► ReflectionService (one task per session)      │
//! │                              │                                   │
//! │                              ▼                                   │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │                  ReflectionGateway                        │   │
//! │  │  - Routes symbol lookups to the owning backend            │   │
//! │  │  - Merges ListServices("*") across every backend          │   │
//! │  │  - Optionally caches answers per request                  │   │
//! │  └───────────────────────────┬──────────────────────────────┘   │
//! │              ┌───────────────┼───────────────┐                   │
//! │              ▼               ▼               ▼                   │
//! │     ┌──────────────┐ ┌──────────────┐ ┌──────────────┐          │
//! │     │   billing    │ │    orders    │ │   shipping   │          │
//! │     │ (edge:443)   │ │ (edge:443)   │ │ (ship:50051) │          │
//! │     └──────────────┘ └──────────────┘ └──────────────┘          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use refcol_gateway::{GatewayOptions, ReflectionGateway, ReflectionService};
//!
//! let gateway = ReflectionGateway::connect(&services, &ignores, GatewayOptions::default()).await?;
//! let service = ReflectionService::new(Arc::new(gateway), lifetime.clone());
//! routes.add_service(service.into_server());
//! ```

mod cache;
mod gateway;
mod session;

pub use cache::ResponseCache;
pub use gateway::{GatewayOptions, ReflectionGateway};
pub use session::{ReflectionService, SessionEnd};

// Re-export core types for convenience
pub use refcol_core::{BackendError, BackendResult, Lifetime, ReflectionBackend};
pub use refcol_proxy::ConnectorOptions;
