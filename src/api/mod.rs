//! Status API
//!
//! Small axum server exposing liveness and gateway statistics.

pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;

pub use server::{ApiServer, AppState};
