//! HTTP API over the cluster registry and deployment caches
//!
//! # API Endpoints
//!
//! - `GET /health` - liveness, version and registered cluster count
//! - `GET /clusters` - registered clusters keyed by id
//! - `POST /clusters` - register a cluster from a JSON [`ClusterConfig`](api_types::ClusterConfig)
//! - `DELETE /clusters?id=<id>` - deregister a cluster and stop its controller
//! - `GET /deployments?namespace=&format=simple|detailed&label_selector=&cluster=` -
//!   deployments from a cluster's cache
//! - `GET /deployments/:namespace/:name?cluster=` - one cached deployment
//!
//! Reads are served from the informer caches only. Every response carries an
//! `X-Request-ID` header; non-2xx bodies are `{"error": "<message>"}`.

pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod server;

pub use errors::ApiError;
pub use handlers::ApiState;
pub use server::build_app;
pub use server::ApiServer;
