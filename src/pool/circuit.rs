//! Memory circuit breaker
//!
//! Admission control for the transport: when the process is already using
//! more than `max_percentage` of its memory ceiling, requests fail fast with
//! a `RequestAborted` error instead of being sent. The same budget bounds how
//! large a response body may be accepted.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default cap on a single response body: 512 MiB
pub const DEFAULT_MAX_RESPONSE_SIZE: u64 = 512 * 1024 * 1024;

/// Configuration for the memory circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryCircuitBreakerConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Fraction of the memory ceiling, in `(0, 1]`
    #[serde(default = "default_max_percentage")]
    pub max_percentage: f64,
}

fn default_max_percentage() -> f64 {
    1.0
}

impl Default for MemoryCircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_percentage: default_max_percentage(),
        }
    }
}

/// Source of memory figures
pub trait MemoryGauge: Send + Sync {
    /// Bytes currently used by the process
    fn used_bytes(&self) -> u64;

    /// Ceiling the usage is measured against
    fn limit_bytes(&self) -> u64;
}

/// Reads resident set size and total memory from procfs.
///
/// Where procfs is unavailable usage reads as 0 and the ceiling as
/// `u64::MAX`, so the breaker never trips.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessMemory;

impl ProcessMemory {
    fn read_kib(path: &str, key: &str) -> Option<u64> {
        let content = std::fs::read_to_string(path).ok()?;
        content
            .lines()
            .find(|line| line.starts_with(key))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|value| value.parse::<u64>().ok())
            .map(|kib| kib.saturating_mul(1024))
    }
}

impl MemoryGauge for ProcessMemory {
    fn used_bytes(&self) -> u64 {
        Self::read_kib("/proc/self/status", "VmRSS:").unwrap_or(0)
    }

    fn limit_bytes(&self) -> u64 {
        Self::read_kib("/proc/meminfo", "MemTotal:").unwrap_or(u64::MAX)
    }
}

/// Statistics of the breaker
#[derive(Debug, Clone, Default)]
pub struct CircuitStats {
    pub total_checks: u64,
    pub total_rejections: u64,
}

pub struct MemoryCircuitBreaker {
    config: MemoryCircuitBreakerConfig,
    gauge: Arc<dyn MemoryGauge>,
    total_checks: AtomicU64,
    total_rejections: AtomicU64,
}

impl MemoryCircuitBreaker {
    pub fn new(config: MemoryCircuitBreakerConfig) -> Result<Self> {
        Self::with_gauge(config, Arc::new(ProcessMemory))
    }

    pub fn with_gauge(config: MemoryCircuitBreakerConfig, gauge: Arc<dyn MemoryGauge>) -> Result<Self> {
        if !(config.max_percentage > 0.0 && config.max_percentage <= 1.0) {
            return Err(Error::Configuration(format!(
                "The memory circuit breaker max percentage must be in (0, 1], got {}",
                config.max_percentage
            )));
        }

        debug!(
            enabled = config.enabled,
            max_percentage = config.max_percentage,
            "Memory circuit breaker configured"
        );

        Ok(Self {
            config,
            gauge,
            total_checks: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn threshold(&self) -> u64 {
        let limit = self.gauge.limit_bytes() as f64 * self.config.max_percentage;
        if limit >= u64::MAX as f64 {
            u64::MAX
        } else {
            limit as u64
        }
    }

    /// Admission check before a request is dispatched
    pub fn check(&self) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        self.total_checks.fetch_add(1, Ordering::Relaxed);

        let used = self.gauge.used_bytes();
        let threshold = self.threshold();
        if used > threshold {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            warn!(
                used_bytes = used,
                threshold_bytes = threshold,
                "Memory circuit breaker tripped, shedding request"
            );
            return Err(Error::RequestAborted(format!(
                "Memory usage ({} bytes) is above the circuit breaker threshold ({} bytes)",
                used, threshold
            )));
        }
        Ok(())
    }

    /// Largest response body that may still be accepted, never above `max_response_size`
    pub fn response_budget(&self, max_response_size: u64) -> u64 {
        if !self.config.enabled {
            return max_response_size;
        }
        let headroom = self.threshold().saturating_sub(self.gauge.used_bytes());
        headroom.min(max_response_size)
    }

    pub fn stats(&self) -> CircuitStats {
        CircuitStats {
            total_checks: self.total_checks.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for MemoryCircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCircuitBreaker")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
