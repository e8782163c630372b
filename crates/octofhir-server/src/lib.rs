//! HTTP façade for the subscription engine: REST CRUD over the in-memory
//! store, `Subscription/$status`, `$validate-code` and the `/websocket`
//! binding endpoint.

pub mod config;
pub mod error;
pub mod handlers;
pub mod observability;
pub mod server;
pub mod websocket;

pub use config::{AppConfig, LoggingConfig, ServerConfig};
pub use error::ApiError;
pub use observability::init_tracing;
pub use server::{AppServices, AppState, OctofhirServer, ServerBuilder, build_router};
