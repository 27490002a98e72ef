//! Gateway front-end and upstream connection handling
//!
//! - hyper front-end with per-client rate limiting
//! - request orchestration through the handler pipeline
//! - pooled upstream transport with retry, backoff and challenge delegation

pub mod challenge;
pub mod context;
pub mod handler;
pub mod manager;
pub mod metrics;
pub mod middleware;
pub mod server;
pub mod transport;

pub use challenge::{ChallengeDetector, ChallengeSolver, HttpSolver};
pub use context::{GatewayContext, StreamingPolicy};
pub use handler::GatewayHandler;
pub use manager::ConnectionManager;
pub use metrics::{GatewayMetrics, MetricsSnapshot};
pub use server::GatewayServer;
pub use transport::{HyperTransport, Transport};
