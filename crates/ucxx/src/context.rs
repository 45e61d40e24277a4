//! Binds a transport with the facade configuration.

use std::sync::Arc;

use crate::config::UcxxConfig;
use crate::error::Result;
use crate::transport::Transport;
use crate::worker::Worker;

/// Transport instance plus configuration shared by its workers.
pub struct Context {
    transport: Arc<dyn Transport>,
    config: UcxxConfig,
}

impl Context {
    /// Creates a context over `transport` with the given configuration.
    pub fn new(transport: Arc<dyn Transport>, config: UcxxConfig) -> Arc<Self> {
        Arc::new(Self { transport, config })
    }

    /// Creates a context with `UcxxConfig::default()`.
    pub fn with_defaults(transport: Arc<dyn Transport>) -> Arc<Self> {
        Self::new(transport, UcxxConfig::default())
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Configuration applied to workers and their endpoints.
    pub fn config(&self) -> &UcxxConfig {
        &self.config
    }

    /// Creates a worker bound to this context.
    pub fn create_worker(self: &Arc<Self>) -> Result<Arc<Worker>> {
        Worker::new(self)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimFabric;

    #[test]
    fn test_create_worker() {
        let context = Context::with_defaults(Arc::new(SimFabric::default()));
        assert!(context.config().endpoint_error_handling);
        let worker = context.create_worker().unwrap();
        assert!(worker.handle().is_some());
        assert!(Arc::ptr_eq(worker.context(), &context));
    }
}
