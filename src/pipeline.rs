//! The scheduling pass: grid expression in, scheduled call out.

use crate::ir::grid::{ExprId, GridGraph};
use crate::ir::prim::ScheduledCall;
use crate::schedule::{SchedulerSession, SolvedSchedule};
use crate::search::{IterationStats, MonteCarloSearch, ScheduleConfig};
use crate::target::TargetOptions;
use crate::tile::graph::TileGraph;
use crate::tile::merge::MergePoint;
use crate::utils::errors::ScheduleResult;
use log::info;
use std::rc::Rc;

/// Everything the pass decided for one region.
#[derive(Debug, Clone)]
pub struct ScheduledRegion {
    /// The program bound to the original graph's expressions
    pub call: ScheduledCall,
    /// The tile graph that was scheduled
    pub graph: TileGraph,
    /// Its solution
    pub schedule: Rc<SolvedSchedule>,
    /// Merges applied to the unfused graph
    pub actions: Vec<MergePoint>,
    /// Search statistics, empty when search is off
    pub history: Vec<IterationStats>,
}

/// Scheduling pass bound to one target.
pub struct Pipeline {
    session: SchedulerSession,
    config: ScheduleConfig,
}

impl Pipeline {
    /// Create a pass.
    pub fn new(target: TargetOptions, config: ScheduleConfig) -> Self {
        let session = SchedulerSession::new(target).with_solve_options(config.solve.clone());
        Self { session, config }
    }

    /// The session holding the caches.
    pub fn session(&self) -> &SchedulerSession {
        &self.session
    }

    /// Schedule the region ending in `root`.
    pub fn run(&mut self, grid: &GridGraph, root: ExprId) -> ScheduleResult<ScheduledRegion> {
        let built = self.session.build(grid, root)?;
        info!(
            "built tile graph: {} ops, {} inputs, {} levels",
            built.graph.num_ops(),
            built.graph.inputs().len(),
            built.graph.top_level() + 1
        );

        let (graph, schedule, actions, history) = if self.config.search {
            let outcome = MonteCarloSearch::new(&mut self.session, self.config.search_config.clone())
                .run(&built.graph)?;
            (outcome.graph, outcome.schedule, outcome.actions, outcome.history)
        } else {
            let schedule = self.session.schedule(&built.graph)?;
            (built.graph, schedule, Vec::new(), Vec::new())
        };

        let call = ScheduledCall {
            function: schedule.program.clone(),
            arguments: graph.inputs().iter().map(|i| i.expr).collect(),
        };
        info!("scheduled {}: objective {} cycles", call.function.name, schedule.objective);
        Ok(ScheduledRegion { call, graph, schedule, actions, history })
    }
}

/// Schedule a region with the default configuration.
pub fn schedule(grid: &GridGraph, root: ExprId, target: &TargetOptions) -> ScheduleResult<ScheduledCall> {
    Pipeline::new(target.clone(), ScheduleConfig::default())
        .run(grid, root)
        .map(|region| region.call)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::grid::UnaryOp;
    use crate::ir::tensor::{DataType, TensorType};
    use crate::search::SearchConfig;
    use crate::utils::errors::ScheduleError;

    fn exp_relu() -> (GridGraph, ExprId) {
        let mut grid = GridGraph::new();
        let x = grid.add_input("x", TensorType::new(DataType::F32, vec![64]));
        let e = grid.unary("e", UnaryOp::Exp, x).unwrap();
        let r = grid.unary("r", UnaryOp::Relu, e).unwrap();
        (grid, r)
    }

    #[test]
    fn test_schedule_binds_inputs() {
        let (grid, root) = exp_relu();
        let call = schedule(&grid, root, &TargetOptions::cpu()).unwrap();
        assert_eq!(call.arguments, vec![ExprId(0)]);
        assert_eq!(call.function.name, "r");
        assert_eq!(call.function.inputs().count(), 1);
        assert_eq!(call.function.outputs().count(), 1);
    }

    #[test]
    fn test_search_never_worse_than_unfused() {
        let (grid, root) = exp_relu();
        let target = TargetOptions::cpu().with_unified_memory(false);
        let plain = Pipeline::new(target.clone(), ScheduleConfig::default()).run(&grid, root).unwrap();
        let config = ScheduleConfig::new()
            .with_search(true)
            .search_config(SearchConfig::new().iterations(4));
        let searched = Pipeline::new(target, config).run(&grid, root).unwrap();

        assert!(searched.schedule.objective <= plain.schedule.objective);
        assert_eq!(searched.history.len(), 4);
        assert!(plain.actions.is_empty());
    }

    #[test]
    fn test_invalid_target() {
        let (grid, root) = exp_relu();
        let target = TargetOptions::cpu().with_levels(Vec::new(), Vec::new());
        let err = schedule(&grid, root, &target).unwrap_err();
        assert!(matches!(err, ScheduleError::Unsupported(_)));
    }
}
