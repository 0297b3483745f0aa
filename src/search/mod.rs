//! Search over tile graph merges.
//!
//! The scheduler solves one fixed tile graph at a time; which producers get
//! fused into which consumers is decided here by Monte-Carlo tree search,
//! scoring every candidate graph with the tree solver.

pub mod config;
pub mod mcts;

pub use config::{ScheduleConfig, SearchConfig};
pub use mcts::{replay, IterationStats, MonteCarloSearch, SearchOutcome};
