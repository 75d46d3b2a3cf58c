//! Tracing subscriber setup.

use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{KernelError, Result};

/// Installs a global `tracing` subscriber filtered by `filter`
/// (e.g. `"info"` or `"graphkern::txn=debug"`).
pub fn init_logging(filter: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(filter)
                .map_err(|e| KernelError::Config(format!("invalid log filter: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| KernelError::Config("logging already initialized".into()))
}
