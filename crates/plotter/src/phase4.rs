//! Phase 4: serialization of the finished tables into the plot file.

use plotfile::{PlotContents, PlotWriter};
use tracing::debug;

use crate::context::PlotContext;
use crate::error::Result;
use crate::params::{PlotOutput, PlotParams};
use crate::phase3::Phase3Output;

pub fn run(ctx: &PlotContext, phase3: Phase3Output, params: &PlotParams) -> Result<PlotOutput> {
    let plot_file = ctx.config().out_dir.join(params.file_name());
    let contents = PlotContents {
        k: ctx.k(),
        plot_id: *ctx.plot_id(),
        public_key: *ctx.public_key(),
        tables: phase3.tables,
        positions: phase3.positions,
    };
    let plot_size = PlotWriter::write_plot(&plot_file, &contents, ctx.config().verify_after_write)?;
    debug!(path = %plot_file.display(), plot_size, "plot serialized");

    Ok(PlotOutput {
        params: params.clone(),
        plot_size,
        plot_file,
    })
}
