//! SiteGate - full-site rewriting reverse-proxy gateway
//!
//! Serves an upstream site (or any site, through encoded global paths) under
//! the gateway's own origin.
//!
//! ## Features
//!
//! - Fixed-upstream and global-proxy addressing with SSRF validation
//! - HTML, CSS, JavaScript and generic text rewriting with configurable rules
//! - Cookie re-scoping and a server-side cookie jar per upstream origin
//! - Pooled upstream connections with retry, backoff and challenge delegation
//! - Streaming bypass for media and large files
//! - Status API with live metrics

pub mod api;
pub mod codec;
pub mod config;
pub mod cookies;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod proxy;
pub mod rewrite;

pub use codec::UrlCodec;
pub use config::Config;
pub use error::{GatewayError, Result};
pub use proxy::{GatewayContext, GatewayServer};
