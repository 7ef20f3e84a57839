//! Gateway state shared by every client connection

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use ops_core::config::GatewayConfig;
use ops_core::traits::Dialer;

/// Global state for the gateway
pub struct GatewayState<D: Dialer> {
    /// Configuration
    pub config: GatewayConfig,
    /// Dials agents for new client connections
    pub dialer: Arc<D>,
    /// Cancelled on shutdown
    pub cancel: CancellationToken,
    /// Client connection tasks
    pub tracker: TaskTracker,
    next_client: AtomicU64,
}

impl<D: Dialer> GatewayState<D> {
    /// Create gateway state
    pub fn new(config: GatewayConfig, dialer: Arc<D>, cancel: CancellationToken) -> Self {
        Self {
            config,
            dialer,
            cancel,
            tracker: TaskTracker::new(),
            next_client: AtomicU64::new(1),
        }
    }

    /// Identifier for the next client connection
    pub fn next_client_id(&self) -> u64 {
        self.next_client.fetch_add(1, Ordering::Relaxed)
    }
}
