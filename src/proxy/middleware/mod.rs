//! Front-end middleware

mod rate_limit;

pub use rate_limit::RateLimiter;
