//! Engine tuning, loadable from a TOML file.
//!
//! ```toml
//! burst_limit = 10
//! burst_window_ms = 100
//! binding_mode = "whole-scope"
//! max_steps = 1000000
//! max_call_depth = 100
//! max_flush_iterations = 10000
//! ```

use crate::binding::BindingMode;
use crate::error::EngineError;
use crate::formula::Limits;
use crate::formula::interpreter::{DEFAULT_MAX_CALL_DEPTH, DEFAULT_MAX_STEPS};
use crate::ledger::{DEFAULT_BURST_LIMIT, DEFAULT_BURST_WINDOW_MS};
use crate::reactive::DEFAULT_MAX_FLUSH_ITERATIONS;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Ledger mutations allowed inside one burst window.
    pub burst_limit: usize,
    pub burst_window_ms: u64,
    pub binding_mode: BindingMode,
    /// Step budget of one formula evaluation.
    pub max_steps: u64,
    pub max_call_depth: u32,
    /// Effect runs allowed in one flush before the queue is dropped.
    pub max_flush_iterations: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            burst_limit: DEFAULT_BURST_LIMIT,
            burst_window_ms: DEFAULT_BURST_WINDOW_MS,
            binding_mode: BindingMode::default(),
            max_steps: DEFAULT_MAX_STEPS,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            max_flush_iterations: DEFAULT_MAX_FLUSH_ITERATIONS,
        }
    }
}

impl EngineConfig {
    pub fn from_toml(content: &str) -> Result<Self, EngineError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_steps: self.max_steps,
            max_call_depth: self.max_call_depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_keep_their_defaults() {
        let config = EngineConfig::from_toml("burst_limit = 3\nbinding_mode = \"fine-grained\"").unwrap();
        assert_eq!(config.burst_limit, 3);
        assert_eq!(config.binding_mode, BindingMode::FineGrained);
        assert_eq!(config.burst_window_ms, 100);
        assert_eq!(config.limits(), Limits::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let error = EngineConfig::from_toml("burst_limt = 3").unwrap_err();
        assert!(matches!(error, EngineError::Config(_)), "{error}");
    }
}
