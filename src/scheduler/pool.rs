//! Bounded worker pools, one per work stage.

use crate::config::StageConcurrency;
use crate::task::Stage;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Per-stage concurrency limits.
///
/// A slot is an owned semaphore permit carried by the worker; it frees when
/// the worker finishes. Acquisition never waits, so a saturated stage simply
/// leaves its tasks in the store.
#[derive(Debug, Clone)]
pub struct WorkerPools {
    pools: BTreeMap<Stage, (usize, Arc<Semaphore>)>,
}

impl WorkerPools {
    pub fn new(concurrency: &StageConcurrency) -> Self {
        let pools = Stage::WORK_STAGES
            .into_iter()
            .map(|stage| {
                let size = concurrency.get(stage).unwrap_or(1).max(1);
                (stage, (size, Arc::new(Semaphore::new(size))))
            })
            .collect();
        Self { pools }
    }

    /// Take a slot in the stage's pool if one is free.
    pub fn try_acquire(&self, stage: Stage) -> Option<OwnedSemaphorePermit> {
        let (_, semaphore) = self.pools.get(&stage)?;
        semaphore.clone().try_acquire_owned().ok()
    }

    /// Free slots in the stage's pool.
    pub fn available(&self, stage: Stage) -> usize {
        self.pools
            .get(&stage)
            .map(|(_, semaphore)| semaphore.available_permits())
            .unwrap_or(0)
    }

    /// Occupied slots in the stage's pool.
    pub fn active(&self, stage: Stage) -> usize {
        self.pools
            .get(&stage)
            .map(|(size, semaphore)| size - semaphore.available_permits())
            .unwrap_or(0)
    }

    pub fn capacity(&self, stage: Stage) -> usize {
        self.pools.get(&stage).map(|(size, _)| *size).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_saturation_and_release() {
        let concurrency = StageConcurrency {
            downloading: 2,
            ..StageConcurrency::default()
        };
        let pools = WorkerPools::new(&concurrency);

        let a = pools.try_acquire(Stage::Downloading).unwrap();
        let _b = pools.try_acquire(Stage::Downloading).unwrap();
        assert!(pools.try_acquire(Stage::Downloading).is_none());
        assert_eq!(pools.active(Stage::Downloading), 2);

        drop(a);
        assert_eq!(pools.available(Stage::Downloading), 1);
    }

    #[test]
    fn test_no_pool_for_bookkeeping_stages() {
        let pools = WorkerPools::new(&StageConcurrency::default());
        assert!(pools.try_acquire(Stage::Discovered).is_none());
        assert!(pools.try_acquire(Stage::Completed).is_none());
        assert_eq!(pools.capacity(Stage::Completed), 0);
    }
}
