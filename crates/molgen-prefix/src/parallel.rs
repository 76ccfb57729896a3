//! A fixed-size worker pool for per-row CPU work.

use anyhow::{Context, Result};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

/// Maps a function over a slice on a dedicated rayon pool. Output order
/// always matches input order.
pub struct ParallelMap {
    pool: ThreadPool,
    workers: usize,
}

impl ParallelMap {
    pub fn new(workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("molgen-worker-{}", i))
            .build()
            .context("failed to build worker pool")?;
        log::debug!("parallel map with {} workers", workers);
        Ok(Self { pool, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn map<T, R, F>(&self, items: &[T], f: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync + Send,
    {
        self.pool.install(|| items.par_iter().map(f).collect())
    }
}

impl std::fmt::Debug for ParallelMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelMap").field("workers", &self.workers).finish()
    }
}
