//! # Plotter: proof-of-space plot builder
//!
//! Builds an immutable plot file from a key pair and a size parameter `k`,
//! and answers challenges against it.
//!
//! ```text
//!  keys, k
//!     │
//!     ▼
//!  phase 1  f1 → sort → match → fx ... tables 1..=7   (bucketsort)
//!     │
//!  phase 2  backward liveness, dense back-references
//!     │
//!  phase 3  line points → parks, root values, positions
//!     │
//!  phase 4  <name>.plot.tmp → fsync → rename           (plotfile)
//!     ▼
//!  PlotOutput { params, plot_size, plot_file }
//! ```
//!
//! Every intermediate table lives on disk in a scratch directory and is
//! processed through bucketed external sorts under
//! [`PlotConfig::memory_budget`]. Output is bit-exact for a given key pair
//! and `k`, independent of thread count and bucket layout.
//!
//! [`Prover`] walks a finished plot from a challenge down to the 64 `x`
//! values of each proof; [`verify_proof`] checks such a proof using only the
//! plot id.

mod config;
mod context;
mod entry;
mod error;
mod f1;
mod fx;
mod matcher;
mod params;
mod phase1;
mod phase2;
mod phase3;
mod phase4;
mod plotter;
mod prover;
mod verifier;

pub use config::{PlotConfig, DEFAULT_BUCKET_BITS, DEFAULT_IO_RETRIES, DEFAULT_MEMORY_BUDGET};
pub use context::PlotContext;
pub use entry::{BackRef, Entry, JoinRecord};
pub use error::{PlotError, Result};
pub use f1::F1Calculator;
pub use fx::FxCalculator;
pub use matcher::{is_match, Matcher, PARAM_B, PARAM_BC, PARAM_C, PARAM_EXT, PARAM_M};
pub use params::{PlotKeys, PlotOutput, PlotParams, MAX_K, MIN_K};
pub use plotter::Plotter;
pub use prover::{Prover, PROOF_LEN};
pub use verifier::verify_proof;
