//! Shared application state for request handlers.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::probe::{DependencyTarget, ProbeExecutor};

/// Shared application state, cloneable across handlers via Arc-wrapped fields.
///
/// Contains the application configuration, the SQL dependency target resolved
/// at startup, and the probe executor that owns the token cache.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub target: Arc<DependencyTarget>,
    pub probe: ProbeExecutor,
}

impl AppState {
    /// Creates a new application state from the given configuration, target and probe.
    pub fn new(config: AppConfig, target: DependencyTarget, probe: ProbeExecutor) -> Self {
        Self {
            config: Arc::new(config),
            target: Arc::new(target),
            probe,
        }
    }
}
