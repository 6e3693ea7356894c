//! Process-wide context handed to every component at startup.

use std::sync::Arc;

use anyhow::{Context, Result};
use realm_core::{Executor, TickRegistry};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;

/// Shared state of one Realm process.
pub struct Realm {
    pub config: Arc<Config>,
    pub executor: Arc<Executor>,
    /// Live persistent ticks by identifier.
    pub ticks: Arc<TickRegistry>,
    /// Cancelled once when the process starts shutting down.
    pub shutdown: CancellationToken,
}

impl Realm {
    /// Build the context and its executor lanes.
    ///
    /// # Errors
    ///
    /// Returns an error if a lane runtime cannot be created.
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let executor = Executor::new(config.executor_config()).context("Failed to start executor lanes")?;
        Ok(Self::assemble(config, executor))
    }

    /// Build the context with every lane on an existing runtime.
    #[cfg(test)]
    pub fn on_runtime(handle: tokio::runtime::Handle, config: Config) -> Arc<Self> {
        let executor = Executor::with_handle(handle, config.executor_config());
        Self::assemble(config, executor)
    }

    fn assemble(config: Config, executor: Executor) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            executor: Arc::new(executor),
            ticks: Arc::new(TickRegistry::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Signal shutdown to every component.
    pub fn begin_shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Shutting down");
            self.shutdown.cancel();
        }
    }

    /// Stop the executor lanes. Call after the roles have wound down.
    pub fn finish_shutdown(&self) {
        self.shutdown.cancel();
        self.executor.shutdown();
    }
}
