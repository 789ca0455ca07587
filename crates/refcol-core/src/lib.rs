//! refcol-core - Core traits and types for the reflection collector
//!
//! This crate provides the abstractions shared by the backend connector,
//! the aggregation engine and the server lifecycle: the backend trait,
//! error types, target address parsing, symbol routing and the shared
//! cancellable lifetime.

pub mod backend;
pub mod error;
pub mod lifetime;
pub mod panic;
pub mod reflection;
pub mod routing;
pub mod target;

pub use backend::ReflectionBackend;
pub use error::{BackendError, BackendResult};
pub use lifetime::Lifetime;
pub use target::TargetDescriptor;
