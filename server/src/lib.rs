//! The groupchat server: HTTP handlers, auth token, pagination, and the
//! orchestration around the consensus core (bootstrap, applier, linearizable
//! reads, secret-key initialization).

pub mod auth;
pub mod errors;
pub mod handlers;
pub mod logging;
pub mod middleware;
pub mod pagination;
pub mod server;

pub use errors::ApiError;
pub use server::{ChatServer, ServerConfig};
