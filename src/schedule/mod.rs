//! Tree solver: tiling, buffer placement and program construction for one
//! fixed tile graph.
//!
//! Solving runs in stages:
//! 1. [`Initializer`] creates trip count variables and bound equalities
//! 2. [`WritesInitializer`] adds placement booleans, memory constraints and
//!    the cost objective
//! 3. a [`SolverBackend`] minimizes the objective
//! 4. [`BufferScheduler`] lays out each free memory level
//! 5. [`ResultConstructor`] emits the nested-loop program
//!
//! [`SchedulerSession`] wraps the stages with the caches that live across
//! many solves of related graphs.

pub mod info;
pub mod initializer;
pub mod writes;
pub mod buffer_scheduler;
pub mod result;

pub use info::{BufferRole, LoopMask, NodeBufferInfo, OpNodeInfo, TileNodeInfo};
pub use initializer::{Initialized, Initializer};
pub use writes::{CostModel, WritesInitializer};
pub use buffer_scheduler::{BufferScheduler, PackItem};
pub use result::{Placement, ResultConstructor};

use crate::bufferize::BufferGraph;
use crate::ir::grid::{ExprId, GridGraph};
use crate::ir::prim::PrimFunction;
use crate::solver::{BranchAndBoundSolver, Model, SolveOptions, SolverBackend};
use crate::target::TargetOptions;
use crate::tile::builder::{BuiltGraph, DomainBoundsCache, TileGraphBuilder};
use crate::tile::graph::TileGraph;
use crate::tile::node::{OpId, TileNodeId};
use crate::utils::errors::{ScheduleError, ScheduleResult};
use log::{debug, info};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Outcome of solving one tile graph.
#[derive(Debug, Clone)]
pub struct SolvedSchedule {
    /// Minimized cost in cycles
    pub objective: i64,
    /// Whether the backend proved the objective optimal
    pub proven_optimal: bool,
    /// Micro-kernel cycles
    pub compute_cycles: i64,
    /// Transfer cycles per memory level
    pub memory_cycles: Vec<i64>,
    /// Trip counts of every non-root node
    pub trips: BTreeMap<TileNodeId, Vec<i64>>,
    /// Leaf tile per operator
    pub tiles: BTreeMap<OpId, Vec<i64>>,
    /// Chosen placements with their offsets
    pub placements: Vec<Placement>,
    /// The scheduled program
    pub program: PrimFunction,
    /// Search nodes the backend visited
    pub solver_nodes: u64,
}

impl SolvedSchedule {
    /// Leaf tile of an operator.
    pub fn accumulated_tile(&self, op: OpId) -> Option<&[i64]> {
        self.tiles.get(&op).map(Vec::as_slice)
    }

    /// Placements in one memory level.
    pub fn placements_at_level(&self, level: usize) -> impl Iterator<Item = &Placement> {
        self.placements.iter().filter(move |p| p.level == level)
    }
}

impl fmt::Display for SolvedSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "objective {} ({}), compute {}, memory {:?}",
            self.objective,
            if self.proven_optimal { "optimal" } else { "best found" },
            self.compute_cycles,
            self.memory_cycles
        )?;
        for (op, tile) in &self.tiles {
            writeln!(f, "tile {} = {:?}", op, tile)?;
        }
        for p in &self.placements {
            writeln!(f, "{}", p)?;
        }
        Ok(())
    }
}

/// Solves a fixed tile graph against a target.
pub struct TreeSolver<'a> {
    target: &'a TargetOptions,
    backend: &'a dyn SolverBackend,
    options: SolveOptions,
}

impl<'a> TreeSolver<'a> {
    /// Create a solver.
    pub fn new(target: &'a TargetOptions, backend: &'a dyn SolverBackend) -> Self {
        Self { target, backend, options: SolveOptions::default() }
    }

    /// Set the backend limits.
    pub fn with_options(mut self, options: SolveOptions) -> Self {
        self.options = options;
        self
    }

    /// Tile, place, lay out and emit.
    pub fn solve(&self, graph: &TileGraph) -> ScheduleResult<SolvedSchedule> {
        if graph.top_level() + 1 != self.target.num_levels() {
            return Err(ScheduleError::Internal(format!(
                "graph built for {} levels, target {} has {}",
                graph.top_level() + 1,
                self.target.name,
                self.target.num_levels()
            )));
        }
        let buffers = BufferGraph::build(graph);
        let mut model = Model::new();
        let mut init = Initializer::new(graph).run(&mut model)?;
        let cost = WritesInitializer::new(graph, &buffers, self.target).run(&mut model, &mut init)?;

        let solution = self.backend.solve(&model, &self.options)?;
        let objective = solution.objective.unwrap_or_else(|| solution.eval(&cost.objective));
        debug!(
            "{} solved: objective {} after {} nodes{}",
            self.backend.name(),
            objective,
            solution.nodes,
            if solution.proven_optimal { "" } else { " (not proven)" }
        );

        let mut placements = Vec::new();
        for (node, buffer, position, level) in writes::chosen_placements(&init, |v| solution.is_true(v)) {
            let info = &init.nodes[&node];
            let b = info.buffer(buffer)
                .ok_or_else(|| ScheduleError::Internal(format!("{} lost buffer {}", node, buffer)))?;
            placements.push(Placement {
                node,
                buffer,
                role: b.role,
                position,
                level,
                bytes: solution.eval(&b.bytes[position]),
                shape: b.shapes[position].iter().map(|e| solution.eval(e)).collect(),
                dtype: graph.op_node(b.accessor).dtypes[b.index],
                offset: 0,
                lifetime: info.lifetime,
                name: format!("{}_l{}_{}", result::base_name(graph, buffer), level, node),
            });
        }

        for level in 0..graph.top_level() {
            let at_level: Vec<usize> = (0..placements.len()).filter(|&i| placements[i].level == level).collect();
            let items: Vec<PackItem> = at_level.iter()
                .map(|&i| PackItem::new(placements[i].bytes, placements[i].lifetime))
                .collect();
            let offsets = BufferScheduler::new(level, self.target.memory_capacities[level]).pack(&items)?;
            for (&i, offset) in at_level.iter().zip(offsets) {
                placements[i].offset = offset;
            }
        }

        let program = ResultConstructor::new(graph, &buffers, &init, &placements, &solution, self.target.unified_memory)
            .build()?;

        Ok(SolvedSchedule {
            objective,
            proven_optimal: solution.proven_optimal,
            compute_cycles: cost.compute_cycles,
            memory_cycles: cost.memory_cycles.iter().map(|e| solution.eval(e)).collect(),
            trips: init.nodes.iter()
                .map(|(&id, n)| (id, n.trips.iter().map(|&t| solution.value(t)).collect()))
                .collect(),
            tiles: writes::leaf_tiles(&init, |e| solution.eval(e)),
            placements,
            program,
            solver_nodes: solution.nodes,
        })
    }
}

/// Caches shared by every solve against one target.
///
/// A session is single-threaded and bound to its target: cached schedules
/// are only valid for the memory hierarchy they were solved against.
pub struct SchedulerSession {
    target: TargetOptions,
    backend: Box<dyn SolverBackend>,
    options: SolveOptions,
    bounds: DomainBoundsCache,
    schedules: FxHashMap<u64, Rc<SolvedSchedule>>,
    hits: usize,
}

impl SchedulerSession {
    /// Create a session with the bundled branch-and-bound backend.
    pub fn new(target: TargetOptions) -> Self {
        Self {
            target,
            backend: Box::new(BranchAndBoundSolver::new()),
            options: SolveOptions::default(),
            bounds: DomainBoundsCache::new(),
            schedules: FxHashMap::default(),
            hits: 0,
        }
    }

    /// Use another backend.
    pub fn with_backend(mut self, backend: Box<dyn SolverBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Set the backend limits.
    pub fn with_solve_options(mut self, options: SolveOptions) -> Self {
        self.options = options;
        self
    }

    /// The target.
    pub fn target(&self) -> &TargetOptions {
        &self.target
    }

    /// Build the tile graph of a grid expression, reusing inferred bounds.
    pub fn build(&mut self, grid: &GridGraph, root: ExprId) -> ScheduleResult<BuiltGraph> {
        self.target.validate()?;
        TileGraphBuilder::new(grid, &self.target, self.target.top_level())
            .with_solve_options(self.options.clone())
            .build(root, &mut self.bounds)
    }

    /// Solve a tile graph, reusing the result of a structurally equal graph.
    pub fn schedule(&mut self, graph: &TileGraph) -> ScheduleResult<Rc<SolvedSchedule>> {
        let key = graph.signature();
        if let Some(hit) = self.schedules.get(&key) {
            self.hits += 1;
            return Ok(Rc::clone(hit));
        }
        let solved = TreeSolver::new(&self.target, self.backend.as_ref())
            .with_options(self.options.clone())
            .solve(graph)?;
        info!("scheduled {} ops: objective {}", graph.num_ops(), solved.objective);
        let solved = Rc::new(solved);
        self.schedules.insert(key, Rc::clone(&solved));
        Ok(solved)
    }

    /// Number of distinct schedules held.
    pub fn cached_schedules(&self) -> usize {
        self.schedules.len()
    }

    /// Schedule lookups answered from the cache.
    pub fn cache_hits(&self) -> usize {
        self.hits
    }

    /// The domain bounds cache.
    pub fn bounds_cache(&self) -> &DomainBoundsCache {
        &self.bounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::grid::UnaryOp;
    use crate::ir::prim::{CopyDirection, Stmt};
    use crate::ir::tensor::{DataType, TensorType};
    use crate::tile::merge::{GraphMerger, MergePoint};

    fn matmul_relu(n: i64) -> (GridGraph, ExprId) {
        let mut grid = GridGraph::new();
        let a = grid.add_input("a", TensorType::new(DataType::F32, vec![n, n]));
        let b = grid.add_input("b", TensorType::new(DataType::F32, vec![n, n]));
        let c = grid.matmul("c", a, b).unwrap();
        let d = grid.unary("d", UnaryOp::Relu, c).unwrap();
        (grid, d)
    }

    fn count(program: &PrimFunction, pred: impl Fn(&Stmt) -> bool) -> usize {
        let mut n = 0;
        program.walk(&mut |s| {
            if pred(s) {
                n += 1;
            }
        });
        n
    }

    #[test]
    fn test_solve_unified_cpu() {
        let (grid, root) = matmul_relu(32);
        let mut session = SchedulerSession::new(TargetOptions::cpu());
        let built = session.build(&grid, root).unwrap();
        let solved = session.schedule(&built.graph).unwrap();

        assert_eq!(solved.objective, solved.compute_cycles);
        assert!(solved.proven_optimal);
        assert_eq!(solved.accumulated_tile(OpId(0)), Some(&[32, 32, 32][..]));
        assert_eq!(solved.program.name, "d");
        assert_eq!(solved.program.params.len(), 3);
        // unified memory: views and no copies
        assert_eq!(count(&solved.program, |s| matches!(s, Stmt::Copy { .. })), 0);
        assert!(count(&solved.program, |s| matches!(s, Stmt::SubView { .. })) > 0);
        assert_eq!(solved.program.dynamic_compute_count(), 2);
        // the matmul result crosses top-level clusters
        assert!(solved.program.to_string().contains("c_l1 = alloc<f32>(level=1"));
    }

    #[test]
    fn test_solve_with_copies() {
        let target = TargetOptions::cpu().with_unified_memory(false);
        let (grid, root) = matmul_relu(16);
        let mut session = SchedulerSession::new(target);
        let mut graph = session.build(&grid, root).unwrap().graph;
        assert!(GraphMerger::new().merge(&mut graph, &MergePoint::new(OpId(1), OpId(0), 1)));
        let solved = session.schedule(&graph).unwrap();

        let copies_in = count(&solved.program, |s| matches!(s, Stmt::Copy { direction: CopyDirection::In, .. }));
        let copies_out = count(&solved.program, |s| matches!(s, Stmt::Copy { direction: CopyDirection::Out, .. }));
        assert_eq!(copies_in, 2);
        assert_eq!(copies_out, 1);
        // fused: the intermediate never reaches the top level
        assert!(!solved.program.to_string().contains("c_l1"));
        for p in solved.placements_at_level(0) {
            assert!(p.offset + p.bytes <= 256 * 1024);
        }
    }

    #[test]
    fn test_solve_npu_three_levels() {
        let mut grid = GridGraph::new();
        let a = grid.add_input("a", TensorType::new(DataType::F32, vec![64, 128]));
        let b = grid.add_input("b", TensorType::new(DataType::F32, vec![128, 64]));
        let c = grid.matmul("c", a, b).unwrap();
        let d = grid.unary("d", UnaryOp::Relu, c).unwrap();
        let mut session = SchedulerSession::new(TargetOptions::npu());
        let graph = session.build(&grid, d).unwrap().graph;
        let solved = session.schedule(&graph).unwrap();

        // 128 matmul calls at 16 cycles plus 4096 scalar relus
        assert_eq!(solved.compute_cycles, 128 * 16 + 64 * 64);
        // a, b, d and both sides of c cross the top link once: 112 KiB at 16 B/cycle
        assert_eq!(solved.objective, 112 * 1024 / 16);
        assert!(solved.proven_optimal);
        assert!(solved.solver_nodes < SolveOptions::default().max_nodes);

        // the full 64x64x128 tile does not fit the 64 KiB scratchpad
        let tile = solved.accumulated_tile(OpId(0)).unwrap();
        assert_ne!(tile, &[64, 64, 128][..]);
        assert!(tile.iter().all(|t| t % 16 == 0));
        let copies_in = count(&solved.program, |s| matches!(s, Stmt::Copy { direction: CopyDirection::In, .. }));
        assert!(copies_in >= 6);
    }

    #[test]
    fn test_session_cache() {
        let (grid, root) = matmul_relu(16);
        let mut session = SchedulerSession::new(TargetOptions::cpu());
        let g1 = session.build(&grid, root).unwrap().graph;
        let g2 = session.build(&grid, root).unwrap().graph;
        let first = session.schedule(&g1).unwrap();
        let second = session.schedule(&g2).unwrap();
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(session.cache_hits(), 1);
        assert_eq!(session.cached_schedules(), 1);
        assert_eq!(session.bounds_cache().hits(), 2);
    }

    #[test]
    fn test_custom_backend() {
        let (grid, root) = matmul_relu(16);
        let mut session = SchedulerSession::new(TargetOptions::cpu())
            .with_backend(Box::new(BranchAndBoundSolver::new()))
            .with_solve_options(SolveOptions::default().max_nodes(100_000));
        let graph = session.build(&grid, root).unwrap().graph;
        let solved = session.schedule(&graph).unwrap();
        assert_eq!(solved.objective, solved.compute_cycles);
    }

    #[test]
    fn test_level_mismatch() {
        let (grid, root) = matmul_relu(16);
        let npu = TargetOptions::npu();
        let built = SchedulerSession::new(TargetOptions::cpu()).build(&grid, root).unwrap();
        let backend = BranchAndBoundSolver::new();
        let err = TreeSolver::new(&npu, &backend).solve(&built.graph).unwrap_err();
        assert!(matches!(err, ScheduleError::Internal(_)));
    }
}
