pub mod api;
pub mod app;
pub mod config;
pub mod controller;
pub mod informer;
pub mod limiter;
pub mod manager;
pub mod metrics;
