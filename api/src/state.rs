use std::sync::Arc;

use common::rbac::PolicySnapshot;

/// Application state shared across all handlers
#[derive(Clone, Debug)]
pub struct AppState {
    /// Immutable policy; evaluations share it without locking
    pub policy: Arc<PolicySnapshot>,
}

impl AppState {
    pub fn new(policy: PolicySnapshot) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }
}
