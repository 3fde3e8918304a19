use std::time::Instant;

use tracing::{info, info_span};

use crate::config::PlotConfig;
use crate::context::PlotContext;
use crate::error::Result;
use crate::params::{PlotOutput, PlotParams};
use crate::{phase1, phase2, phase3, phase4};

/// Builds plot files.
///
/// # Pipeline
///
/// 1. Forward propagation: `f1` over every `x`, then six rounds of sorting
///    and matching into tables 2..=7.
/// 2. Backward compaction: drop entries the root does not reach.
/// 3. Compression: line points sorted into parks, root values and positions.
/// 4. Serialization: one checksummed file, committed by rename.
///
/// Phases run one after another on the plotter's worker pool; each phase's
/// tables are durable before the next starts. Scratch files live in a private
/// directory under `tmp_dir` that is removed when the run ends, successful or
/// not. The plot file only appears once it is complete.
pub struct Plotter {
    config: PlotConfig,
}

impl Plotter {
    pub fn new(config: PlotConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PlotConfig {
        &self.config
    }

    pub fn create_plot(&self, params: &PlotParams) -> Result<PlotOutput> {
        params.validate()?;
        let span = info_span!("plot", name = %params.plot_name, k = params.k);
        let _guard = span.enter();

        let ctx = PlotContext::new(&self.config, params)?;
        info!(
            threads = self.config.threads,
            memory_budget = self.config.memory_budget,
            bucket_bits = self.config.bucket_bits,
            "starting plot"
        );
        let started = Instant::now();

        let output = ctx.install(|| -> Result<PlotOutput> {
            let phase = Instant::now();
            let forward = phase1::run(&ctx)?;
            let sizes: Vec<u64> = forward.tables.iter().map(|t| t.len()).collect();
            info!(?sizes, elapsed_ms = phase.elapsed().as_millis() as u64, "phase 1 done");

            let phase = Instant::now();
            let compacted = phase2::run(&ctx, forward)?;
            info!(
                table1 = compacted.x_values.len(),
                root = compacted.root.len(),
                elapsed_ms = phase.elapsed().as_millis() as u64,
                "phase 2 done"
            );

            let phase = Instant::now();
            let collated = phase3::run(&ctx, compacted)?;
            let parks: u64 = collated.tables.iter().map(|t| t.summary.park_count()).sum();
            info!(parks, elapsed_ms = phase.elapsed().as_millis() as u64, "phase 3 done");

            let phase = Instant::now();
            let output = phase4::run(&ctx, collated, params)?;
            info!(
                plot_size = output.plot_size,
                elapsed_ms = phase.elapsed().as_millis() as u64,
                "phase 4 done"
            );
            Ok(output)
        })?;

        info!(
            path = %output.plot_file.display(),
            plot_size = output.plot_size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "plot complete"
        );
        Ok(output)
    }
}
