//! # tilesched - Tiling and Fusion Scheduler for Tensor Dataflow Graphs
//!
//! Given a dataflow graph of tensor operators with affine memory accesses and
//! a target memory hierarchy, the scheduler decides:
//! - how every operator's iteration domain is tiled at each memory level
//! - which buffers are materialized at which level, and where
//! - which producers are fused into their consumers
//!
//! and emits the result as a nested-loop program.
//!
//! ## Architecture
//!
//! ```text
//! GridGraph → TileGraphBuilder → TileGraph ⇄ GraphMerger (MCTS)
//!                                    ↓
//!            TreeSolver: Initializer → WritesInitializer → solve → pack
//!                                    ↓
//!                       ResultConstructor → PrimFunction
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use tilesched::prelude::*;
//!
//! let mut grid = GridGraph::new();
//! let a = grid.add_input("a", TensorType::new(DataType::F32, vec![64, 64]));
//! let b = grid.add_input("b", TensorType::new(DataType::F32, vec![64, 64]));
//! let c = grid.matmul("c", a, b)?;
//! let d = grid.unary("d", UnaryOp::Relu, c)?;
//!
//! let call = tilesched::schedule(&grid, d, &TargetOptions::cpu())?;
//! println!("{}", call);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod polyhedral;
pub mod utils;
pub mod solver;
pub mod ir;
pub mod target;
pub mod tile;
pub mod bufferize;
pub mod schedule;
pub mod search;
pub mod codegen;
pub mod pipeline;

// Re-export commonly used types
pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    pub use crate::ir::{
        DataType, ExprId, GridGraph, OpKind, PrimFunction, ScheduledCall, Stmt, TensorType,
        BinaryOp, ReduceOp, UnaryOp,
    };
    pub use crate::target::{KernelOverride, TargetOptions};
    pub use crate::tile::{GraphMerger, MergePoint, MergePointCollector, TileGraph, TileGraphBuilder};
    pub use crate::bufferize::BufferGraph;
    pub use crate::schedule::{SchedulerSession, SolvedSchedule, TreeSolver};
    pub use crate::search::{MonteCarloSearch, ScheduleConfig, SearchConfig};
    pub use crate::solver::{BranchAndBoundSolver, SolveOptions, SolverBackend};
    pub use crate::pipeline::{Pipeline, ScheduledRegion};
    pub use crate::codegen::Emit;
    pub use crate::utils::errors::*;
}

pub use pipeline::schedule;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
