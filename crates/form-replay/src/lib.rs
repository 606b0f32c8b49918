//! form-replay library: journal loading and replay, exposed for testing.
//!
//! The binary replays an operation journal through a headless `Session` and
//! prints the resulting document tree.

pub mod journal;
pub mod replay;

pub use journal::{load_journal, parse_journal, save_journal};
pub use replay::{base_tree, check_convergence, replay, ConvergenceReport, ReplayOptions, ReplayReport};
