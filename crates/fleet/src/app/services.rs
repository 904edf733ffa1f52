use std::sync::Arc;

use crate::limiter::PerClientRateLimiter;
use crate::manager::MultiClusterManager;

/// Application dependencies - simple struct with Arc-wrapped services
pub struct ApplicationServices {
    pub manager: Arc<MultiClusterManager>,
    /// `None` when rate limiting is disabled
    pub rate_limiter: Option<Arc<PerClientRateLimiter>>,
}
