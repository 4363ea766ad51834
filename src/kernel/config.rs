//! Runtime configuration
//!
//! Tunables that may differ per run. Table capacity and the priority range
//! are compile-time constants and live in [`crate::kernel`].

use super::error::{Result, ThreadError};
use serde::{Deserialize, Serialize};

/// Default stack size for each thread (256 KiB)
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Default number of trace events kept
pub const DEFAULT_TRACE_CAPACITY: usize = 1000;

/// What the reaper does once only it is left
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPolicy {
    /// Print the farewell and exit the process with status 0
    #[default]
    ExitProcess,
    /// Hand control back to the OS thread that called `Runtime::run`
    ReturnToHost,
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Stack size for threads that don't ask for one
    pub stack_size: usize,
    /// Total stack bytes the pool may hand out (unbounded if None)
    pub stack_budget: Option<usize>,
    /// Preemption quantum in milliseconds (no ticker if None)
    pub quantum_ms: Option<u64>,
    /// Shutdown behavior on quiescence
    pub shutdown: ShutdownPolicy,
    /// Trace ring buffer size
    pub trace_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            stack_budget: None,
            quantum_ms: None,
            shutdown: ShutdownPolicy::ExitProcess,
            trace_capacity: DEFAULT_TRACE_CAPACITY,
        }
    }
}

impl RuntimeConfig {
    /// Load from a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ThreadError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.stack_size == 0 {
            return Err(ThreadError::InvalidConfig("stack_size is zero".into()));
        }
        if self.quantum_ms == Some(0) {
            return Err(ThreadError::InvalidConfig("quantum_ms is zero".into()));
        }
        if let Some(budget) = self.stack_budget
            && budget < self.stack_size.saturating_mul(2)
        {
            // main thread and reaper must both fit
            return Err(ThreadError::InvalidConfig(format!(
                "stack_budget {} cannot hold the boot threads",
                budget
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.stack_size, DEFAULT_STACK_SIZE);
        assert_eq!(config.shutdown, ShutdownPolicy::ExitProcess);
        assert!(config.quantum_ms.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            RuntimeConfig::from_json(r#"{ "quantum_ms": 10, "shutdown": "return_to_host" }"#)
                .unwrap();
        assert_eq!(config.quantum_ms, Some(10));
        assert_eq!(config.shutdown, ShutdownPolicy::ReturnToHost);
        assert_eq!(config.stack_size, DEFAULT_STACK_SIZE);
    }

    #[test]
    fn test_from_json_rejects_zero_stack() {
        let err = RuntimeConfig::from_json(r#"{ "stack_size": 0 }"#).unwrap_err();
        assert!(matches!(err, ThreadError::InvalidConfig(_)));
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(RuntimeConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_budget_must_fit_boot_threads() {
        let config = RuntimeConfig {
            stack_budget: Some(DEFAULT_STACK_SIZE),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
