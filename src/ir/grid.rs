//! Dataflow graphs of grid operators.
//!
//! A grid expression is one operator call over an iteration domain: each
//! operand is read through an affine access map and the result is written
//! through one more map. Graphs are arenas indexed by [`ExprId`]; operands
//! always precede their users, so the arena order is a topological order.

use crate::ir::tensor::TensorType;
use crate::polyhedral::AffineMap;
use crate::utils::errors::{UnsupportedError, UnsupportedErrorKind};
use serde::{Serialize, Deserialize};
use std::fmt;

/// Index of an expression in a [`GridGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExprId(pub usize);

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Elementwise unary functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum UnaryOp {
    Relu,
    Exp,
    Neg,
    Sqrt,
    Tanh,
    Sigmoid,
    Copy,
}

/// Elementwise binary functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
}

/// Reductions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum ReduceOp {
    Sum,
    Max,
    Mean,
}

/// The function a grid applies at each point of its domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    /// `C[m, n] += A[m, k] * B[k, n]` over `(m, n, k)`
    MatMul,
    /// Elementwise unary function
    Unary(UnaryOp),
    /// Elementwise binary function
    Binary(BinaryOp),
    /// Reduction along one domain dimension
    Reduce(ReduceOp, usize),
}

impl OpKind {
    /// Short lowercase name, also the key for target overrides.
    pub fn name(&self) -> String {
        match self {
            OpKind::MatMul => "matmul".to_string(),
            OpKind::Unary(op) => format!("{:?}", op).to_lowercase(),
            OpKind::Binary(op) => format!("{:?}", op).to_lowercase(),
            OpKind::Reduce(op, _) => format!("reduce_{:?}", op).to_lowercase(),
        }
    }

    /// Domain dimension that is accumulated over, if any.
    pub fn reduction_dim(&self) -> Option<usize> {
        match self {
            OpKind::MatMul => Some(2),
            OpKind::Reduce(_, axis) => Some(*axis),
            _ => None,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One operator call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridCall {
    /// Name of the result
    pub name: String,
    /// Operator
    pub kind: OpKind,
    /// Operand expressions
    pub operands: Vec<ExprId>,
    /// Read maps for each operand followed by the write map
    pub access_maps: Vec<AffineMap>,
    /// Result type
    pub output: TensorType,
}

impl GridCall {
    /// Read map of an operand.
    pub fn read_map(&self, arg: usize) -> &AffineMap {
        &self.access_maps[arg]
    }

    /// Write map of the result.
    pub fn write_map(&self) -> &AffineMap {
        &self.access_maps[self.operands.len()]
    }
}

/// A node of the dataflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "expr", rename_all = "snake_case")]
pub enum GridExpr {
    /// A graph input
    Input {
        /// Name of the input
        name: String,
        /// Type of the input
        ty: TensorType,
    },
    /// An operator call
    Grid(GridCall),
}

impl GridExpr {
    /// Name of the value the expression produces.
    pub fn name(&self) -> &str {
        match self {
            GridExpr::Input { name, .. } => name,
            GridExpr::Grid(call) => &call.name,
        }
    }

    /// Type of the value the expression produces.
    pub fn ty(&self) -> &TensorType {
        match self {
            GridExpr::Input { ty, .. } => ty,
            GridExpr::Grid(call) => &call.output,
        }
    }
}

/// A dataflow graph of grid expressions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridGraph {
    exprs: Vec<GridExpr>,
}

impl GridGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a graph from JSON.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Serialize the graph to JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Number of expressions.
    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    /// Whether the graph has no expressions.
    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }

    /// Look up an expression.
    pub fn expr(&self, id: ExprId) -> &GridExpr {
        &self.exprs[id.0]
    }

    /// Id of the last expression, the natural root of a chain.
    pub fn last(&self) -> Option<ExprId> {
        self.exprs.len().checked_sub(1).map(ExprId)
    }

    /// Add a graph input.
    pub fn add_input(&mut self, name: impl Into<String>, ty: TensorType) -> ExprId {
        self.exprs.push(GridExpr::Input { name: name.into(), ty });
        ExprId(self.exprs.len() - 1)
    }

    /// Add an operator call after checking its arity.
    pub fn add_grid(&mut self, call: GridCall) -> Result<ExprId, UnsupportedError> {
        let next = self.exprs.len();
        if let Some(bad) = call.operands.iter().find(|id| id.0 >= next) {
            return Err(UnsupportedError::new(
                UnsupportedErrorKind::Operator,
                format!("{} uses {} before it is defined", call.name, bad),
            ));
        }
        if call.access_maps.len() != call.operands.len() + 1 {
            return Err(UnsupportedError::new(
                UnsupportedErrorKind::Operator,
                format!(
                    "{} has {} access maps for {} operands",
                    call.name,
                    call.access_maps.len(),
                    call.operands.len()
                ),
            ));
        }
        self.exprs.push(GridExpr::Grid(call));
        Ok(ExprId(next))
    }

    /// `out[m, n] = sum_k a[m, k] * b[k, n]`
    pub fn matmul(&mut self, name: &str, a: ExprId, b: ExprId) -> Result<ExprId, UnsupportedError> {
        let (ta, tb) = (self.expr(a).ty().clone(), self.expr(b).ty().clone());
        if ta.rank() != 2 || tb.rank() != 2 || ta.shape[1] != tb.shape[0] {
            return Err(UnsupportedError::new(
                UnsupportedErrorKind::RankMismatch,
                format!("matmul {} of {} and {}", name, ta, tb),
            ));
        }
        let output = TensorType::new(ta.dtype, vec![ta.shape[0], tb.shape[1]]);
        self.add_grid(GridCall {
            name: name.to_string(),
            kind: OpKind::MatMul,
            operands: vec![a, b],
            access_maps: vec![
                AffineMap::select(3, &[0, 2]),
                AffineMap::select(3, &[2, 1]),
                AffineMap::select(3, &[0, 1]),
            ],
            output,
        })
    }

    /// Elementwise unary operator.
    pub fn unary(&mut self, name: &str, op: UnaryOp, x: ExprId) -> Result<ExprId, UnsupportedError> {
        let ty = self.expr(x).ty().clone();
        let rank = ty.rank();
        self.add_grid(GridCall {
            name: name.to_string(),
            kind: OpKind::Unary(op),
            operands: vec![x],
            access_maps: vec![AffineMap::identity(rank), AffineMap::identity(rank)],
            output: TensorType::new(ty.dtype, ty.shape),
        })
    }

    /// Elementwise binary operator over equally shaped operands.
    pub fn binary(&mut self, name: &str, op: BinaryOp, a: ExprId, b: ExprId) -> Result<ExprId, UnsupportedError> {
        let (ta, tb) = (self.expr(a).ty().clone(), self.expr(b).ty().clone());
        if ta.shape != tb.shape {
            return Err(UnsupportedError::new(
                UnsupportedErrorKind::RankMismatch,
                format!("{} {} of {} and {}", OpKind::Binary(op), name, ta, tb),
            ));
        }
        let rank = ta.rank();
        self.add_grid(GridCall {
            name: name.to_string(),
            kind: OpKind::Binary(op),
            operands: vec![a, b],
            access_maps: vec![AffineMap::identity(rank); 3],
            output: TensorType::new(ta.dtype, ta.shape),
        })
    }

    /// Reduction of one axis, dropping it from the result.
    pub fn reduce(&mut self, name: &str, op: ReduceOp, x: ExprId, axis: usize) -> Result<ExprId, UnsupportedError> {
        let ty = self.expr(x).ty().clone();
        let rank = ty.rank();
        if axis >= rank {
            return Err(UnsupportedError::new(
                UnsupportedErrorKind::RankMismatch,
                format!("reduce {} over axis {} of {}", name, axis, ty),
            ));
        }
        let kept: Vec<usize> = (0..rank).filter(|&d| d != axis).collect();
        let shape = kept.iter().map(|&d| ty.shape[d]).collect();
        self.add_grid(GridCall {
            name: name.to_string(),
            kind: OpKind::Reduce(op, axis),
            operands: vec![x],
            access_maps: vec![AffineMap::identity(rank), AffineMap::select(rank, &kept)],
            output: TensorType::new(ty.dtype, shape),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::tensor::DataType;

    fn matmul_relu() -> (GridGraph, ExprId) {
        let mut g = GridGraph::new();
        let a = g.add_input("a", TensorType::new(DataType::F32, vec![64, 128]));
        let b = g.add_input("b", TensorType::new(DataType::F32, vec![128, 64]));
        let c = g.matmul("c", a, b).unwrap();
        let d = g.unary("d", UnaryOp::Relu, c).unwrap();
        (g, d)
    }

    #[test]
    fn test_builders() {
        let (g, d) = matmul_relu();
        assert_eq!(g.len(), 4);
        assert_eq!(g.last(), Some(d));
        match g.expr(ExprId(2)) {
            GridExpr::Grid(call) => {
                assert_eq!(call.kind, OpKind::MatMul);
                assert_eq!(call.output.shape, vec![64, 64]);
                assert_eq!(call.write_map().to_string(), "(d0, d1, d2) -> (d0, d1)");
                assert_eq!(call.read_map(1).to_string(), "(d0, d1, d2) -> (d2, d1)");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reduce_shape() {
        let mut g = GridGraph::new();
        let x = g.add_input("x", TensorType::new(DataType::F16, vec![8, 32]));
        let r = g.reduce("r", ReduceOp::Sum, x, 1).unwrap();
        assert_eq!(g.expr(r).ty().shape, vec![8]);
        assert_eq!(OpKind::Reduce(ReduceOp::Sum, 1).name(), "reduce_sum");
        assert_eq!(OpKind::Reduce(ReduceOp::Sum, 1).reduction_dim(), Some(1));
    }

    #[test]
    fn test_rejects_bad_shapes() {
        let mut g = GridGraph::new();
        let a = g.add_input("a", TensorType::new(DataType::F32, vec![4, 8]));
        let b = g.add_input("b", TensorType::new(DataType::F32, vec![4, 8]));
        assert!(g.matmul("c", a, b).is_err());
        assert!(g.binary("s", BinaryOp::Add, a, b).is_ok());
    }

    #[test]
    fn test_json_roundtrip() {
        let (g, _) = matmul_relu();
        let text = g.to_json().unwrap();
        assert_eq!(GridGraph::from_json(&text).unwrap(), g);
    }
}
