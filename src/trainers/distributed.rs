//! Boundary to the data-parallel runtime
//!
//! The trainer only needs three signals from whatever coordinates the processes:
//! which process is the coordinator, a barrier, and gradient averaging at sync
//! boundaries. Everything else about the collective backend stays outside.

use anyhow::{Context, Result};
use candle_core::Tensor;
use log::warn;
use std::collections::HashMap;

/// Shape of the process group this process belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorldInfo {
    pub num_processes: usize,
    pub process_index: usize,
    pub local_process_index: usize,
}

impl WorldInfo {
    pub fn single() -> Self {
        Self {
            num_processes: 1,
            process_index: 0,
            local_process_index: 0,
        }
    }

    /// Read `WORLD_SIZE` and `RANK` from the environment, using the resolved local rank
    pub fn from_env(local_rank: i64) -> Result<Self> {
        let num_processes = read_env_usize("WORLD_SIZE")?.unwrap_or(1).max(1);
        let local_process_index = if local_rank < 0 { 0 } else { local_rank as usize };
        let process_index = read_env_usize("RANK")?.unwrap_or(local_process_index);

        if process_index >= num_processes {
            anyhow::bail!(
                "process index {} is outside a world of {} processes",
                process_index,
                num_processes
            );
        }

        Ok(Self {
            num_processes,
            process_index,
            local_process_index,
        })
    }

    pub fn is_main_process(&self) -> bool {
        self.process_index == 0
    }

    pub fn is_local_main_process(&self) -> bool {
        self.local_process_index == 0
    }
}

fn read_env_usize(key: &str) -> Result<Option<usize>> {
    match std::env::var(key) {
        Ok(value) => {
            let parsed = value
                .trim()
                .parse::<usize>()
                .with_context(|| format!("{} must be a non-negative integer, got {:?}", key, value))?;
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}

pub trait DistributedRuntime {
    fn world(&self) -> WorldInfo;

    fn is_main_process(&self) -> bool {
        self.world().is_main_process()
    }

    fn is_local_main_process(&self) -> bool {
        self.world().is_local_main_process()
    }

    /// Block until every process reaches this point
    fn wait_for_everyone(&self) -> Result<()>;

    /// Average accumulated gradients across processes before an optimizer update
    fn reduce_gradients(&self, grads: &mut HashMap<String, Tensor>) -> Result<()>;
}

/// Runtime for a process that has no collective backend attached
pub struct LocalRuntime {
    world: WorldInfo,
}

impl LocalRuntime {
    pub fn new(world: WorldInfo) -> Self {
        if world.num_processes > 1 {
            warn!(
                "WORLD_SIZE={} but no collective backend is attached; rank {} trains on its shard without gradient exchange",
                world.num_processes, world.process_index
            );
        }
        Self { world }
    }

    pub fn single() -> Self {
        Self::new(WorldInfo::single())
    }
}

impl DistributedRuntime for LocalRuntime {
    fn world(&self) -> WorldInfo {
        self.world
    }

    fn wait_for_everyone(&self) -> Result<()> {
        Ok(())
    }

    fn reduce_gradients(&self, _grads: &mut HashMap<String, Tensor>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_world_is_main() {
        let world = WorldInfo::single();
        assert!(world.is_main_process());
        assert!(world.is_local_main_process());
        assert_eq!(world.num_processes, 1);
    }

    #[test]
    fn test_secondary_rank_is_not_main() {
        let world = WorldInfo {
            num_processes: 4,
            process_index: 2,
            local_process_index: 0,
        };
        assert!(!world.is_main_process());
        assert!(world.is_local_main_process());
    }
}
