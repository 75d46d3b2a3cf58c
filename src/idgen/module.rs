#![forbid(unsafe_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{IdAllocator, PersistenceSource};
use crate::types::{KernelError, Result};

/// Lifecycle wrapper that owns the allocator's configuration.
///
/// The persistence source must be bound before [`IdAllocatorModule::start`];
/// once bound it can not be swapped, and the allocator does not support
/// reloading while running.
pub struct IdAllocatorModule {
    allocator: Arc<IdAllocator>,
    source: Mutex<Option<Arc<dyn PersistenceSource>>>,
}

impl IdAllocatorModule {
    /// Name reported by the module.
    pub const MODULE_NAME: &'static str = "IdAllocatorModule";

    /// Wraps `allocator`.
    pub fn new(allocator: Arc<IdAllocator>) -> Self {
        Self {
            allocator,
            source: Mutex::new(None),
        }
    }

    /// Module name.
    pub fn module_name(&self) -> &'static str {
        Self::MODULE_NAME
    }

    /// No-op initialisation hook.
    pub fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Binds the persistence source. Rejected once a source is bound.
    pub fn set_persistence_source(&self, source: Arc<dyn PersistenceSource>) -> Result<()> {
        let mut slot = self.source.lock();
        if slot.is_some() {
            return Err(KernelError::AllocatorMisuse(
                "persistence source can not be changed during operations",
            ));
        }
        debug!(module = Self::MODULE_NAME, source = source.name(), "idgen.module.bind");
        *slot = Some(source);
        Ok(())
    }

    /// Configures the allocator from the bound source.
    pub fn start(&self) -> Result<()> {
        let source = self.source.lock().clone().ok_or(KernelError::AllocatorMisuse(
            "no persistence source bound before start",
        ))?;
        self.allocator.configure(source)
    }

    /// Always fails: the allocator can not be reconfigured while running.
    pub fn reload(&self) -> Result<()> {
        warn!(module = Self::MODULE_NAME, "idgen.module.reload_rejected");
        Err(KernelError::AllocatorMisuse(
            "identifier allocator does not support reload",
        ))
    }

    /// Persists the high-water marks if the allocator is running.
    pub fn stop(&self) -> Result<()> {
        if self.allocator.is_configured() {
            self.allocator.persist()?;
        }
        Ok(())
    }

    /// No-op teardown hook.
    pub fn destroy(&self) -> Result<()> {
        Ok(())
    }

    /// The managed allocator.
    pub fn allocator(&self) -> &Arc<IdAllocator> {
        &self.allocator
    }
}
