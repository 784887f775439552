//! Concurrency planning module
//!
//! Derives how many tier encodes may run at once, and how many encoder threads
//! each one gets, from the CPU core count and configuration.

use crate::config::Config;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of tier encodes in flight
    pub max_concurrent_tiers: u32,
    /// Encoder threads given to each tier encode
    pub threads_per_encode: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// Uses the following rules:
    /// - Detects CPU cores via num_cpus if not specified in config
    /// - Derives max_concurrent_tiers: 3 for 16+ cores, 2 for 8+ cores, 1 otherwise
    ///   (unless explicit)
    /// - Splits the cores evenly between concurrent tiers, at least one thread each
    pub fn derive(cfg: &Config) -> Self {
        let total_cores = cfg
            .concurrency
            .logical_cores
            .unwrap_or_else(|| num_cpus::get() as u32)
            .max(1);

        let max_concurrent_tiers = if cfg.concurrency.max_concurrent_tiers > 0 {
            cfg.concurrency.max_concurrent_tiers
        } else {
            derive_max_tiers(total_cores)
        };

        Self {
            total_cores,
            max_concurrent_tiers,
            threads_per_encode: (total_cores / max_concurrent_tiers).max(1),
        }
    }
}

/// Derive max concurrent tiers based on core count
/// - 3 tiers for 16+ cores
/// - 2 tiers for 8+ cores
/// - 1 tier otherwise
fn derive_max_tiers(cores: u32) -> u32 {
    if cores >= 16 {
        3
    } else if cores >= 8 {
        2
    } else {
        1
    }
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}
