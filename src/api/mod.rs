//! HTTP boundary: axum router, handlers and error mapping.

pub mod error;
pub mod routes;
pub mod server;
