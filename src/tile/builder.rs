//! Builds a tiered tile graph from a grid dataflow graph.
//!
//! Operators are visited in post-order from the root expression so that
//! producers always precede consumers in the tile graph. Each operator's
//! iteration domain bounds are inferred by solving, for every buffer and
//! every buffer dimension, `access extent == buffer shape` over one integer
//! variable per domain dimension.

use crate::ir::grid::{ExprId, GridCall, GridExpr, GridGraph};
use crate::polyhedral::AffineMap;
use crate::solver::{BranchAndBoundSolver, IntExpr, Model, Relation, SolveOptions, SolverBackend};
use crate::target::TargetCapabilities;
use crate::tile::graph::TileGraph;
use crate::tile::node::{BufferIdentity, GraphInput, OpEdge, OpId, OpNode, TileNodeId};
use crate::utils::errors::{
    BoundInferenceError, BoundInferenceErrorKind, ScheduleResult, SolveErrorKind, UnsupportedError,
    UnsupportedErrorKind,
};
use crate::utils::fingerprint;
use log::{debug, trace};
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, HashMap};

/// Memoized domain bounds keyed by operator signature.
#[derive(Debug, Clone, Default)]
pub struct DomainBoundsCache {
    entries: FxHashMap<u64, Vec<i64>>,
    hits: usize,
}

impl DomainBoundsCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct operator signatures solved.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was cached yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lookups answered from the cache.
    pub fn hits(&self) -> usize {
        self.hits
    }
}

/// A freshly built tile graph.
#[derive(Debug, Clone)]
pub struct BuiltGraph {
    /// The unfused graph
    pub graph: TileGraph,
    /// Each operator's outermost cluster
    pub clusters: BTreeMap<OpId, TileNodeId>,
    /// Grid expression of each operator
    pub exprs: Vec<ExprId>,
}

/// Converts grid expressions into a tiered tile graph.
pub struct TileGraphBuilder<'a> {
    grid: &'a GridGraph,
    target: &'a dyn TargetCapabilities,
    top_level: usize,
    solve_options: SolveOptions,
}

impl<'a> TileGraphBuilder<'a> {
    /// Create a builder for a hierarchy whose outermost level is `top_level`.
    pub fn new(grid: &'a GridGraph, target: &'a dyn TargetCapabilities, top_level: usize) -> Self {
        Self {
            grid,
            target,
            top_level,
            solve_options: SolveOptions::default(),
        }
    }

    /// Limits for the bound inference problems.
    pub fn with_solve_options(mut self, options: SolveOptions) -> Self {
        self.solve_options = options;
        self
    }

    /// Build the graph of every operator the root depends on.
    pub fn build(&self, root: ExprId, cache: &mut DomainBoundsCache) -> ScheduleResult<BuiltGraph> {
        if !matches!(self.grid.expr(root), GridExpr::Grid(_)) {
            return Err(UnsupportedError::new(
                UnsupportedErrorKind::Operator,
                format!("root {} is a graph input, not an operator", root),
            ).into());
        }

        let mut state = BuildState {
            graph: TileGraph::new(self.top_level),
            built: HashMap::new(),
            clusters: BTreeMap::new(),
            exprs: Vec::new(),
        };
        self.visit(root, &mut state, cache)?;

        debug!(
            "built tile graph: {} ops, {} edges, {} inputs",
            state.graph.num_ops(),
            state.graph.edges().len(),
            state.graph.inputs().len()
        );
        Ok(BuiltGraph {
            graph: state.graph,
            clusters: state.clusters,
            exprs: state.exprs,
        })
    }

    fn visit(&self, id: ExprId, state: &mut BuildState, cache: &mut DomainBoundsCache) -> ScheduleResult<Option<OpId>> {
        let call = match self.grid.expr(id) {
            GridExpr::Input { .. } => return Ok(None),
            GridExpr::Grid(call) => call,
        };
        if let Some(&op) = state.built.get(&id) {
            return Ok(Some(op));
        }

        let mut producers = Vec::with_capacity(call.operands.len());
        for &operand in &call.operands {
            producers.push(self.visit(operand, state, cache)?);
        }

        let op = OpId(state.exprs.len());
        let node = self.make_op(op, call, cache)?;
        trace!("op {} = {} {:?}", op, call.kind, node.bounds);
        let cluster = state.graph.add_op(node);

        for (arg, (&operand, producer)) in call.operands.iter().zip(producers).enumerate() {
            match producer {
                Some(producer) => state.graph.add_edge(OpEdge { producer, consumer: op, arg }),
                None => {
                    let expr = self.grid.expr(operand);
                    let input = GraphInput {
                        expr: operand,
                        name: expr.name().to_string(),
                        ty: expr.ty().clone(),
                    };
                    state.graph.bind_input(input, BufferIdentity::new(op, arg));
                }
            }
        }

        state.built.insert(id, op);
        state.clusters.insert(op, cluster);
        state.exprs.push(id);
        Ok(Some(op))
    }

    fn make_op(&self, id: OpId, call: &GridCall, cache: &mut DomainBoundsCache) -> ScheduleResult<OpNode> {
        let mut shapes = Vec::with_capacity(call.access_maps.len());
        let mut dtypes = Vec::with_capacity(call.access_maps.len());
        for &operand in &call.operands {
            let ty = self.grid.expr(operand).ty();
            shapes.push(ty.divided_shape()?);
            dtypes.push(ty.dtype);
        }
        shapes.push(call.output.divided_shape()?);
        dtypes.push(call.output.dtype);

        let rank = call.access_maps.first().map_or(0, AffineMap::n_in);
        for (map, shape) in call.access_maps.iter().zip(&shapes) {
            if map.n_in() != rank || map.n_out() != shape.len() {
                return Err(UnsupportedError::new(
                    UnsupportedErrorKind::RankMismatch,
                    format!("{}: access map {} does not fit a rank-{} domain and shape {:?}", call.name, map, rank, shape),
                ).into());
            }
        }

        let key = fingerprint(&(&call.kind, &shapes, &call.access_maps));
        let bounds = match cache.entries.get(&key) {
            Some(bounds) => {
                cache.hits += 1;
                bounds.clone()
            }
            None => {
                let bounds = self.infer_bounds(call, rank, &shapes)?;
                cache.entries.insert(key, bounds.clone());
                bounds
            }
        };

        let mut kernel = self.target.micro_kernel(&call.kind, rank);
        for (d, prim) in kernel.primitives.iter_mut().enumerate() {
            if *prim <= 0 || bounds[d] % *prim != 0 {
                debug!("{}: primitive {} does not divide bound {} of dim {}, using 1", call.name, prim, bounds[d], d);
                *prim = 1;
            }
        }

        let num_reads = call.operands.len();
        Ok(OpNode {
            id,
            name: call.name.clone(),
            kind: call.kind,
            bounds,
            reads: call.access_maps[..num_reads].to_vec(),
            write: call.write_map().clone(),
            buffer_shapes: shapes,
            dtypes,
            kernel,
        })
    }

    fn infer_bounds(&self, call: &GridCall, rank: usize, shapes: &[Vec<i64>]) -> ScheduleResult<Vec<i64>> {
        let upper = shapes.iter().flatten().copied().max().unwrap_or(1).max(1);
        let mut model = Model::new();
        let dims: Vec<_> = (0..rank).map(|d| model.add_int_var(1, upper, format!("d{}", d))).collect();

        for (map, shape) in call.access_maps.iter().zip(shapes) {
            for (expr, &extent) in map.outputs.iter().zip(shape) {
                // extent of an access is 1 + sum |c| * (d - 1)
                let mut offset = 1;
                let mut terms = Vec::new();
                for (d, &c) in expr.coeffs.iter().enumerate() {
                    if c != 0 {
                        offset -= c.abs();
                        terms.push(IntExpr::var(dims[d]).scale(c.abs()));
                    }
                }
                terms.push(IntExpr::constant(offset));
                model.add_constraint(IntExpr::sum(terms), Relation::Eq, extent);
            }
        }

        let assignment = BranchAndBoundSolver::new()
            .solve(&model, &self.solve_options)
            .map_err(|e| BoundInferenceError {
                message: format!("cannot infer domain bounds: {}", e),
                op: call.name.clone(),
                kind: match e.kind {
                    SolveErrorKind::LimitReached => BoundInferenceErrorKind::Exhausted,
                    _ => BoundInferenceErrorKind::Inconsistent,
                },
            })?;
        Ok(dims.iter().map(|&d| assignment.value(d)).collect())
    }
}

struct BuildState {
    graph: TileGraph,
    built: HashMap<ExprId, OpId>,
    clusters: BTreeMap<OpId, TileNodeId>,
    exprs: Vec<ExprId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::grid::{BinaryOp, OpKind, UnaryOp};
    use crate::ir::tensor::{DataType, TensorType, DYNAMIC_DIM};
    use crate::target::TargetOptions;
    use crate::utils::errors::ScheduleError;

    fn build(grid: &GridGraph, root: ExprId, target: &TargetOptions) -> ScheduleResult<BuiltGraph> {
        TileGraphBuilder::new(grid, target, target.top_level()).build(root, &mut DomainBoundsCache::new())
    }

    #[test]
    fn test_matmul_relu_bounds() {
        let mut grid = GridGraph::new();
        let a = grid.add_input("a", TensorType::new(DataType::F32, vec![64, 128]));
        let b = grid.add_input("b", TensorType::new(DataType::F32, vec![128, 64]));
        let c = grid.matmul("c", a, b).unwrap();
        let d = grid.unary("d", UnaryOp::Relu, c).unwrap();

        let built = build(&grid, d, &TargetOptions::cpu()).unwrap();
        let g = &built.graph;
        assert_eq!(g.num_ops(), 2);
        assert_eq!(g.op_node(OpId(0)).bounds, vec![64, 64, 128]);
        assert_eq!(g.op_node(OpId(1)).bounds, vec![64, 64]);
        assert_eq!(g.edges(), &[OpEdge { producer: OpId(0), consumer: OpId(1), arg: 0 }]);
        assert_eq!(g.inputs().len(), 2);
        assert_eq!(g.input_binding(BufferIdentity::new(OpId(0), 1)).map(|i| i.name.as_str()), Some("b"));
        assert_eq!(built.exprs, vec![c, d]);
        assert_eq!(g.node(built.clusters[&OpId(1)]).level, 1);
    }

    #[test]
    fn test_diamond_built_once() {
        let mut grid = GridGraph::new();
        let x = grid.add_input("x", TensorType::new(DataType::F32, vec![16]));
        let e = grid.unary("e", UnaryOp::Relu, x).unwrap();
        let l = grid.unary("l", UnaryOp::Relu, e).unwrap();
        let r = grid.unary("r", UnaryOp::Relu, e).unwrap();
        let s = grid.binary("s", BinaryOp::Add, l, r).unwrap();

        let mut cache = DomainBoundsCache::new();
        let target = TargetOptions::cpu();
        let built = TileGraphBuilder::new(&grid, &target, 1).build(s, &mut cache).unwrap();
        assert_eq!(built.graph.num_ops(), 4);
        assert_eq!(built.graph.edges().len(), 4);
        assert_eq!(built.graph.op_node(OpId(3)).kind, OpKind::Binary(BinaryOp::Add));
        // the three unary ops share one signature
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.hits(), 2);
    }

    #[test]
    fn test_divided_shapes() {
        let mut grid = GridGraph::new();
        let sharded = TensorType::new(DataType::F32, vec![64, 32]).with_split(vec![4, 1]);
        let x = grid.add_input("x", sharded.clone());
        let y = grid.add_grid(GridCall {
            name: "y".to_string(),
            kind: OpKind::Unary(UnaryOp::Relu),
            operands: vec![x],
            access_maps: vec![AffineMap::identity(2), AffineMap::identity(2)],
            output: sharded,
        }).unwrap();
        let built = build(&grid, y, &TargetOptions::cpu()).unwrap();
        assert_eq!(built.graph.op_node(OpId(0)).bounds, vec![16, 32]);
        assert_eq!(built.graph.op_node(OpId(0)).buffer_shapes[0], vec![16, 32]);
    }

    #[test]
    fn test_dynamic_shape_rejected() {
        let mut grid = GridGraph::new();
        let x = grid.add_input("x", TensorType::new(DataType::F32, vec![DYNAMIC_DIM, 4]));
        let y = grid.unary("y", UnaryOp::Relu, x).unwrap();
        let err = build(&grid, y, &TargetOptions::cpu()).unwrap_err();
        assert!(matches!(err, ScheduleError::Unsupported(_)));
    }

    #[test]
    fn test_inconsistent_bounds() {
        let mut grid = GridGraph::new();
        let x = grid.add_input("x", TensorType::new(DataType::F32, vec![8]));
        let y = grid.add_grid(GridCall {
            name: "y".to_string(),
            kind: OpKind::Unary(UnaryOp::Copy),
            operands: vec![x],
            access_maps: vec![AffineMap::identity(1), AffineMap::identity(1)],
            output: TensorType::new(DataType::F32, vec![6]),
        }).unwrap();
        let err = build(&grid, y, &TargetOptions::cpu()).unwrap_err();
        assert!(matches!(err, ScheduleError::BoundInference(ref e) if e.kind == BoundInferenceErrorKind::Inconsistent));
    }

    #[test]
    fn test_npu_primitives() {
        let mut grid = GridGraph::new();
        let a = grid.add_input("a", TensorType::new(DataType::F32, vec![32, 24]));
        let b = grid.add_input("b", TensorType::new(DataType::F32, vec![24, 32]));
        let c = grid.matmul("c", a, b).unwrap();
        let built = build(&grid, c, &TargetOptions::npu()).unwrap();
        // 24 is not a multiple of 16
        assert_eq!(built.graph.op_node(OpId(0)).kernel.primitives, vec![16, 16, 1]);
        assert_eq!(built.graph.ancestors(built.graph.leaf(OpId(0))).len(), 3);
    }
}
