//! HTTP server crate: wires `cellrun_core`'s execution components into a
//! runnable axum service.

pub mod app;
pub mod config;
pub mod error;
pub mod routes;

pub use app::{AppFactory, AppState};
pub use config::{Config, Profile};
pub use error::ServerError;
pub use routes::build_router;
