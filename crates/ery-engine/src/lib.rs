//! Expression evaluation capability for the Ery flow engine.
//!
//! Provides the `EngineClient` trait, the `DynEngineClient` wrapper, a middleware
//! chain, the `Engine` facade used by conditions and actions, and two clients:
//! `HttpEngineClient` for a remote evaluation service and `LocalEngineClient`
//! for in-process evaluation.

mod client;
mod http;
mod local;
mod types;

pub use client::*;
pub use http::{HttpEngineClient, DEFAULT_TIMEOUT_MS};
pub use local::LocalEngineClient;
pub use types::*;
