//! Request admission control for the HTTP API.

pub mod per_client;
pub mod token_bucket;

pub use per_client::PerClientRateLimiter;
pub use per_client::RateLimiterConfig;
pub use token_bucket::TokenBucket;
