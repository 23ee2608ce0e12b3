//! Ordered parallel processing.
//!
//! Grains of one grain table are independent once their payloads have been
//! read, so they can be inflated on a rayon thread pool. Results always come
//! back in input order.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::warn;

use crate::error::Result;

/// Configuration for the processing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Worker threads; 0 picks one per core, 1 runs inline on the caller.
    pub threads: usize,
}

impl PipelineConfig {
    /// Creates a configuration with the given thread count.
    pub fn new(threads: usize) -> Self {
        Self { threads }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { threads: 1 }
    }
}

/// Maps a function over items, sequentially or on a private thread pool.
pub struct Pipeline {
    config: PipelineConfig,
    pool: Option<ThreadPool>,
}

impl Pipeline {
    /// Creates a pipeline.
    ///
    /// If the thread pool cannot be built the pipeline runs sequentially.
    pub fn new(config: PipelineConfig) -> Self {
        let pool = if config.threads == 1 {
            None
        } else {
            match ThreadPoolBuilder::new()
                .num_threads(config.threads)
                .thread_name(|i| format!("vmdkraw-inflate-{}", i))
                .build()
            {
                Ok(pool) => Some(pool),
                Err(e) => {
                    warn!(error = %e, "failed to build thread pool; running sequentially");
                    None
                }
            }
        };
        Self { config, pool }
    }

    /// Returns the configured thread count.
    pub fn threads(&self) -> usize {
        self.config.threads
    }

    /// Returns true if work runs on a thread pool.
    pub fn is_parallel(&self) -> bool {
        self.pool.is_some()
    }

    /// Applies `f` to every item and collects the results in input order.
    ///
    /// `f` receives the item's index. The first error (in input order) is
    /// returned.
    pub fn process<T, R, F>(&self, items: Vec<T>, f: F) -> Result<Vec<R>>
    where
        T: Send,
        R: Send,
        F: Fn(usize, T) -> Result<R> + Sync + Send,
    {
        match &self.pool {
            None => items
                .into_iter()
                .enumerate()
                .map(|(index, item)| f(index, item))
                .collect(),
            Some(pool) => {
                let results: Vec<Result<R>> = pool.install(|| {
                    items
                        .into_par_iter()
                        .enumerate()
                        .map(|(index, item)| f(index, item))
                        .collect()
                });
                results.into_iter().collect()
            }
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}
