use std::path::{Path, PathBuf};

use bucketsort::SortConfig;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tempfile::TempDir;
use tracing::debug;

use crate::config::PlotConfig;
use crate::error::{PlotError, Result};
use crate::params::PlotParams;

/// Everything a phase needs, passed explicitly from phase to phase.
///
/// Owns the worker pool and the scratch directory. Scratch files are removed
/// when the context is dropped, whether the run succeeded or not.
pub struct PlotContext {
    config: PlotConfig,
    k: u8,
    plot_id: [u8; 32],
    public_key: [u8; 32],
    pool: ThreadPool,
    scratch: TempDir,
}

impl PlotContext {
    pub fn new(config: &PlotConfig, params: &PlotParams) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .thread_name(|i| format!("plotter-{i}"))
            .build()
            .map_err(|e| PlotError::ThreadPool(e.to_string()))?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{}-", params.plot_name))
            .tempdir_in(&config.tmp_dir)?;
        debug!(scratch = %scratch.path().display(), threads = config.threads, "plot context ready");

        Ok(Self {
            config: config.clone(),
            k: params.k,
            plot_id: params.plot_id(),
            public_key: params.keys.public_key,
            pool,
            scratch,
        })
    }

    pub fn k(&self) -> u8 {
        self.k
    }

    pub fn plot_id(&self) -> &[u8; 32] {
        &self.plot_id
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub fn config(&self) -> &PlotConfig {
        &self.config
    }

    pub fn threads(&self) -> usize {
        self.config.threads
    }

    pub fn io_retries(&self) -> u32 {
        self.config.io_retries
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    pub fn scratch_path(&self, name: &str) -> PathBuf {
        self.scratch.path().join(name)
    }

    pub fn sort_config(&self, key_bits: u32) -> SortConfig {
        self.config.sort_config(key_bits)
    }

    /// Runs `op` on the worker pool; rayon calls inside it use this pool.
    pub fn install<T, F>(&self, op: F) -> T
    where
        F: FnOnce() -> T + Send,
        T: Send,
    {
        self.pool.install(op)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::params::PlotKeys;

    /// Small single-purpose context rooted in `dir`.
    pub(crate) fn test_context(dir: &Path, k: u8, bucket_bits: u32) -> PlotContext {
        let config = PlotConfig::new(dir, dir)
            .with_threads(2)
            .with_bucket_bits(bucket_bits)
            .with_memory_budget(64 << 20);
        let params = PlotParams::new(k, PlotKeys::new([3u8; 32], [4u8; 32]), "test");
        PlotContext::new(&config, &params).unwrap()
    }

    #[test]
    fn scratch_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), 12, 4);
        let scratch = ctx.scratch_dir().to_path_buf();
        assert!(scratch.starts_with(dir.path()));
        std::fs::write(ctx.scratch_path("leftover"), b"x").unwrap();
        assert_eq!(ctx.install(rayon::current_num_threads), 2);
        drop(ctx);
        assert!(!scratch.exists());
    }
}
