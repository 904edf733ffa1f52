//! Application module
//!
//! Wires the cluster manager, rate limiter and HTTP API together and
//! supervises their tasks until shutdown.

pub mod builder;
pub mod core;
pub mod services;
pub mod tasks;

// Re-export main types
pub use builder::ApplicationBuilder;
pub use core::Application;
pub use services::ApplicationServices;
