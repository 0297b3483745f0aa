//! Textual outputs of a scheduled region.

pub mod python;

pub use python::emit_python;

use crate::bufferize::BufferGraph;
use crate::ir::prim::ScheduledCall;
use crate::schedule::SolvedSchedule;
use crate::tile::dot::to_dot;
use crate::tile::graph::TileGraph;
use std::fmt::Write;

/// What to print for a scheduled region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Emit {
    /// The scheduled program and the call binding its arguments
    #[default]
    Program,
    /// A Python script replaying the program's trace
    Python,
    /// Graphviz dump of the chosen tile graph
    Dot,
    /// Buffer dependencies and the memory layout of every level
    Buffers,
}

/// Render one output kind.
pub fn emit(kind: Emit, call: &ScheduledCall, graph: &TileGraph, schedule: &SolvedSchedule) -> String {
    match kind {
        Emit::Program => format!("{}\n", call),
        Emit::Python => emit_python(&call.function, graph.top_level()),
        Emit::Dot => to_dot(graph),
        Emit::Buffers => buffer_listing(graph, schedule),
    }
}

fn buffer_listing(graph: &TileGraph, schedule: &SolvedSchedule) -> String {
    let mut out = String::new();
    let buffers = BufferGraph::build(graph);
    let _ = writeln!(out, "# {} buffers", buffers.num_buffers());
    let _ = write!(out, "{}", buffers);
    for level in (0..graph.top_level()).rev() {
        let _ = writeln!(out, "# level {}", level);
        let mut placed: Vec<_> = schedule.placements_at_level(level).collect();
        placed.sort_by_key(|p| (p.offset, p.lifetime));
        for p in placed {
            let _ = writeln!(out, "{}", p);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::grid::{GridGraph, UnaryOp};
    use crate::ir::tensor::{DataType, TensorType};
    use crate::pipeline::Pipeline;
    use crate::search::ScheduleConfig;
    use crate::target::TargetOptions;

    #[test]
    fn test_emit_kinds() {
        let mut grid = GridGraph::new();
        let x = grid.add_input("x", TensorType::new(DataType::F32, vec![16]));
        let y = grid.unary("y", UnaryOp::Relu, x).unwrap();
        let target = TargetOptions::cpu().with_unified_memory(false);
        let region = Pipeline::new(target, ScheduleConfig::default()).run(&grid, y).unwrap();
        let render = |kind| emit(kind, &region.call, &region.graph, &region.schedule);

        assert!(render(Emit::Program).contains("call y(%0)"));
        assert!(render(Emit::Python).contains("def y():"));
        assert!(render(Emit::Dot).starts_with("digraph tiles {"));
        let buffers = render(Emit::Buffers);
        assert!(buffers.contains("# level 0"));
        assert!(buffers.contains("x_l0_"));
        assert_eq!(Emit::default(), Emit::Program);
    }
}
