//! Axum HTTP/HTTPS server, routing, and middleware.
//!
//! # Responsibilities
//! - Load TLS material and build the rustls server configuration.
//! - Bind the plain and encrypted listeners behind a common close handle.
//! - Define the business routes and the shared middleware stack.
//! - Inject shared application state (`AppState`) into handlers.

pub mod handlers;
pub mod listener;
pub mod middleware;
pub mod router;
pub mod state;
pub mod tls;
