//! VRT daemon
//!
//! Test run lifecycle, baseline resolution, auto-approval, build numbering
//! and the periodic sweep, on top of the shared store and comparator.

pub mod auto_approve;
pub mod builds;
pub mod config;
pub mod resolver;
pub mod state;
pub mod sweeper;
pub mod test_runs;
pub mod variations;

pub use auto_approve::AutoApproveEngine;
pub use builds::BuildCounter;
pub use config::DaemonConfig;
pub use resolver::BaselineResolver;
pub use state::AppState;
pub use sweeper::{SweepReport, Sweeper};
pub use test_runs::{TestRunRequest, TestRunService};
pub use variations::VariationService;
