#![forbid(unsafe_code)]

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::primitives::window::{Synchronous, WindowOptions};
use crate::types::{KernelError, Result};

/// Configuration for opening a [`crate::Store`].
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreOptions {
    /// Records covered by one persistence window.
    pub records_per_window: usize,
    /// Windows kept resident before unpinned ones are evicted.
    pub cache_windows: usize,
    /// Durability mode for window flushes.
    pub synchronous: Synchronous,
    /// Create the store directory and files when they are missing.
    pub create_if_missing: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        let window = WindowOptions::default();
        Self {
            records_per_window: window.records_per_window,
            cache_windows: window.cache_windows,
            synchronous: window.synchronous,
            create_if_missing: true,
        }
    }
}

impl StoreOptions {
    /// Parses options from TOML. Missing keys take their defaults.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let opts: StoreOptions =
            toml::from_str(input).map_err(|err| KernelError::Config(err.to_string()))?;
        opts.validate()?;
        Ok(opts)
    }

    /// Reads and parses a TOML options file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| {
            KernelError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Rejects values the store can not run with.
    pub fn validate(&self) -> Result<()> {
        if self.records_per_window == 0 {
            return Err(KernelError::Config(
                "records_per_window must be at least 1".into(),
            ));
        }
        if self.cache_windows == 0 {
            return Err(KernelError::Config("cache_windows must be at least 1".into()));
        }
        Ok(())
    }

    /// Window pool configuration derived from these options.
    pub fn window_options(&self) -> WindowOptions {
        WindowOptions {
            records_per_window: self.records_per_window,
            cache_windows: self.cache_windows,
            synchronous: self.synchronous,
        }
    }
}
