use std::fmt;
use std::str::FromStr;

use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};

use crate::error::TrainingError;
use crate::model::Placement;

/// How per-replica gradients are combined before the optimizer step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeStrategy {
    /// Sequential fold on the control thread; weights live in host memory
    Host,
    /// Parallel reduction on the replica pool
    Device,
}

impl FromStr for MergeStrategy {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "host" | "cpu" => Ok(Self::Host),
            "device" | "gpu" => Ok(Self::Device),
            other => Err(TrainingError::ConfigError(format!(
                "Unknown merge strategy '{}' (expected one of: host, device)",
                other
            ))),
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Device => write!(f, "device"),
        }
    }
}

/// Compute resources of a training run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of data-parallel replicas
    pub devices: usize,
    pub merge: MergeStrategy,
    /// Blocking workers assembling batches
    pub read_workers: usize,
    /// Capacity of the prefetch queue, in batches
    pub queue_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            devices: 1,
            merge: MergeStrategy::Host,
            read_workers: 8,
            queue_size: 100,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), TrainingError> {
        if self.devices == 0 {
            return Err(TrainingError::ConfigError("At least one device is required".into()));
        }
        if self.read_workers == 0 {
            return Err(TrainingError::ConfigError("At least one read worker is required".into()));
        }
        if self.queue_size == 0 {
            return Err(TrainingError::ConfigError("Queue size must be positive".into()));
        }
        Ok(())
    }

    /// Weights go to host memory when several replicas merge on the host.
    pub fn placement(&self) -> Placement {
        if self.devices > 1 && self.merge == MergeStrategy::Host {
            Placement::Host
        } else {
            Placement::Device(0)
        }
    }

    /// Pool running one replica per thread.
    pub fn replica_pool(&self) -> Result<ThreadPool, TrainingError> {
        ThreadPoolBuilder::new()
            .num_threads(self.devices.max(1))
            .thread_name(|i| format!("replica-{}", i))
            .build()
            .map_err(|e| TrainingError::ConfigError(format!("Failed to start replica pool: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placement() {
        let mut config = RuntimeConfig::default();
        assert_eq!(config.placement(), Placement::Device(0));

        config.devices = 4;
        assert_eq!(config.placement(), Placement::Host);

        config.merge = MergeStrategy::Device;
        assert_eq!(config.placement(), Placement::Device(0));
    }

    #[test]
    fn test_validation() {
        let config = RuntimeConfig { devices: 0, ..RuntimeConfig::default() };
        assert!(config.validate().is_err());
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_replica_pool_size() {
        let config = RuntimeConfig { devices: 3, ..RuntimeConfig::default() };
        assert_eq!(config.replica_pool().unwrap().current_num_threads(), 3);
    }
}
