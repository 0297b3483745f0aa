//! Turning a solved model into a nested-loop program.

use crate::bufferize::{BufferGraph, LogicalBuffer};
use crate::ir::prim::{CopyDirection, ForLoop, ParamRole, PrimFunction, PrimParam, Stmt};
use crate::ir::tensor::DataType;
use crate::schedule::info::BufferRole;
use crate::schedule::initializer::Initialized;
use crate::solver::Assignment;
use crate::tile::graph::{TileGraph, TileNodeKind};
use crate::tile::node::{BufferIdentity, OpId, TileNodeId};
use crate::utils::errors::{ScheduleError, ScheduleResult};
use std::fmt;

/// A buffer materialized by a cluster at one loop position and level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Cluster holding the buffer
    pub node: TileNodeId,
    /// The tensor
    pub buffer: LogicalBuffer,
    /// Role of the tensor relative to the cluster
    pub role: BufferRole,
    /// Loop position within the cluster
    pub position: usize,
    /// Memory level
    pub level: usize,
    /// Region size
    pub bytes: i64,
    /// Region shape
    pub shape: Vec<i64>,
    /// Element type
    pub dtype: DataType,
    /// Byte offset from the level's layout
    pub offset: i64,
    /// Leaf timestamps during which the region is held
    pub lifetime: (usize, usize),
    /// Name in the emitted program
    pub name: String,
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}@{} L{} [{}, {}) t{}..{} {:?} {:?}",
            self.name,
            self.node,
            self.position,
            self.level,
            self.offset,
            self.offset + self.bytes,
            self.lifetime.0,
            self.lifetime.1,
            self.role,
            self.shape
        )
    }
}

/// Name of a tensor in the program.
pub fn base_name(graph: &TileGraph, buffer: LogicalBuffer) -> String {
    match buffer {
        LogicalBuffer::Input(i) => graph.inputs()[i].name.clone(),
        LogicalBuffer::Produced(op) => graph.op_node(op).name.clone(),
    }
}

/// Emits the program of a solved tile graph.
pub struct ResultConstructor<'a> {
    graph: &'a TileGraph,
    buffers: &'a BufferGraph,
    init: &'a Initialized,
    placements: &'a [Placement],
    solution: &'a Assignment,
    unified_memory: bool,
}

impl<'a> ResultConstructor<'a> {
    /// Create a constructor.
    pub fn new(
        graph: &'a TileGraph,
        buffers: &'a BufferGraph,
        init: &'a Initialized,
        placements: &'a [Placement],
        solution: &'a Assignment,
        unified_memory: bool,
    ) -> Self {
        Self { graph, buffers, init, placements, solution, unified_memory }
    }

    /// Build the function.
    pub fn build(&self) -> ScheduleResult<PrimFunction> {
        let graph = self.graph;
        let top = graph.top_level();
        let output = graph.op_node(graph.output_op());

        let mut params = Vec::new();
        for input in graph.inputs() {
            params.push(PrimParam {
                name: input.name.clone(),
                dtype: input.ty.dtype,
                shape: input.ty.divided_shape()?,
                role: ParamRole::Input,
            });
        }
        params.push(PrimParam {
            name: output.name.clone(),
            dtype: output.dtypes[output.num_reads()],
            shape: output.buffer_shapes[output.num_reads()].clone(),
            role: ParamRole::Output,
        });

        let mut body = Vec::new();
        for op in (0..graph.num_ops()).map(OpId) {
            let buffer = LogicalBuffer::Produced(op);
            if op != graph.output_op() && self.is_top_resident(buffer) {
                let node = graph.op_node(op);
                let shape = node.buffer_shapes[node.num_reads()].clone();
                body.push(Stmt::Alloc {
                    buffer: format!("{}_l{}", node.name, top),
                    level: top,
                    offset: 0,
                    bytes: shape.iter().product::<i64>() * node.elem_bytes(node.num_reads()),
                    dtype: node.dtypes[node.num_reads()],
                    shape,
                });
            }
        }
        for &child in graph.children(graph.root()) {
            body.extend(self.emit_node(child)?);
        }

        Ok(PrimFunction { name: output.name.clone(), params, body })
    }

    fn is_top_resident(&self, buffer: LogicalBuffer) -> bool {
        self.init.nodes.values().any(|n| n.buffer(buffer).is_some_and(|b| b.top_resident))
    }

    fn top_name(&self, buffer: LogicalBuffer) -> String {
        match buffer {
            LogicalBuffer::Produced(op) if op != self.graph.output_op() => {
                format!("{}_l{}", base_name(self.graph, buffer), self.graph.top_level())
            }
            _ => base_name(self.graph, buffer),
        }
    }

    fn find(&self, node: TileNodeId, buffer: LogicalBuffer, level: usize) -> Option<&Placement> {
        self.placements.iter().find(|p| p.node == node && p.buffer == buffer && p.level == level)
    }

    /// Where a placement is filled from or drained to.
    fn source(&self, p: &Placement) -> ScheduleResult<String> {
        for a in self.init.ancestors(self.graph, p.node) {
            if let Some(outer) = self.find(a, p.buffer, p.level + 1) {
                return Ok(outer.name.clone());
            }
        }
        if self.is_top_resident(p.buffer) {
            return Ok(self.top_name(p.buffer));
        }
        Err(ScheduleError::Internal(format!("placement {} has no source", p.name)))
    }

    fn level0_name(&self, leaf: TileNodeId, id: BufferIdentity) -> ScheduleResult<String> {
        let buffer = self.buffers
            .logical(id)
            .ok_or_else(|| ScheduleError::Internal(format!("buffer {} has no tensor", id)))?;
        self.init.ancestors(self.graph, leaf)
            .into_iter()
            .find_map(|a| self.find(a, buffer, 0))
            .map(|p| p.name.clone())
            .ok_or_else(|| ScheduleError::Internal(format!("access {} has no level-0 copy", id)))
    }

    fn emit_node(&self, id: TileNodeId) -> ScheduleResult<Vec<Stmt>> {
        match &self.graph.node(id).kind {
            TileNodeKind::Leaf(op) => {
                let inputs = (0..op.num_reads())
                    .map(|i| self.level0_name(id, BufferIdentity::new(op.id, i)))
                    .collect::<ScheduleResult<Vec<_>>>()?;
                let tile = self.init.nodes[&id].extents.iter().map(|e| self.solution.eval(e)).collect();
                Ok(vec![Stmt::Compute {
                    op: op.id.0,
                    kind: op.kind,
                    inputs,
                    output: self.level0_name(id, op.output())?,
                    tile,
                }])
            }
            TileNodeKind::Cluster(_) => self.emit_position(id, 0),
        }
    }

    fn emit_position(&self, id: TileNodeId, position: usize) -> ScheduleResult<Vec<Stmt>> {
        let info = &self.init.nodes[&id];
        let mut here: Vec<&Placement> = self.placements.iter()
            .filter(|p| p.node == id && p.position == position)
            .collect();
        here.sort_by_key(|p| (std::cmp::Reverse(p.level), p.buffer));

        let mut stmts = Vec::new();
        for p in &here {
            let view = self.unified_memory && p.role != BufferRole::Internal;
            if view {
                stmts.push(Stmt::SubView {
                    buffer: p.name.clone(),
                    source: self.source(p)?,
                    level: p.level,
                    offset: p.offset,
                    shape: p.shape.clone(),
                });
                continue;
            }
            stmts.push(Stmt::Alloc {
                buffer: p.name.clone(),
                level: p.level,
                offset: p.offset,
                bytes: p.bytes,
                dtype: p.dtype,
                shape: p.shape.clone(),
            });
            if p.role == BufferRole::Input {
                stmts.push(Stmt::Copy {
                    src: self.source(p)?,
                    dst: p.name.clone(),
                    shape: p.shape.clone(),
                    direction: CopyDirection::In,
                });
            }
        }

        if let Some(&dim) = info.loop_order.get(position) {
            stmts.push(Stmt::For(ForLoop {
                var: format!("{}_d{}", id, dim),
                start: 0,
                stop: self.solution.eval(&info.extents[dim]),
                step: self.solution.eval(&info.inner[dim]),
                body: self.emit_position(id, position + 1)?,
            }));
        } else {
            for &child in self.graph.children(id) {
                stmts.extend(self.emit_node(child)?);
            }
        }

        for p in here.iter().rev() {
            if !self.unified_memory && p.role == BufferRole::Output {
                stmts.push(Stmt::Copy {
                    src: p.name.clone(),
                    dst: self.source(p)?,
                    shape: p.shape.clone(),
                    direction: CopyDirection::Out,
                });
            }
        }
        Ok(stmts)
    }
}
