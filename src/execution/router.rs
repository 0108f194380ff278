use std::sync::Arc;

use tracing::info;

use super::{ChainKind, LedgerBackend};
use crate::dispatch::RetryPolicy;

/// A ledger backend together with the retry policy its chain needs
#[derive(Clone)]
pub struct Route {
    pub backend: Arc<dyn LedgerBackend>,
    pub retry: RetryPolicy,
}

/// BackendRouter - picks the ledger backend for a recipient address
///
/// Address formats are disjoint between chain families, so the first backend that
/// recognises an address is the only one that can.
#[derive(Clone, Default)]
pub struct BackendRouter {
    routes: Vec<Route>,
}

impl BackendRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend. Only call this during startup.
    pub fn register(&mut self, backend: Arc<dyn LedgerBackend>, retry: RetryPolicy) {
        info!(
            "Registering {} backend for sender {} (retry limit {})",
            backend.chain(),
            backend.sender_address(),
            retry.retry_limit
        );
        self.routes.push(Route { backend, retry });
    }

    /// Route for `address`, or `None` when no backend understands it.
    pub fn route(&self, address: &str) -> Option<&Route> {
        self.routes
            .iter()
            .find(|r| r.backend.is_address_of_this_kind(address))
    }

    pub fn registered_chains(&self) -> Vec<ChainKind> {
        self.routes.iter().map(|r| r.backend.chain()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
