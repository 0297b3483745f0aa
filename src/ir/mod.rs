//! Intermediate representations.
//!
//! - `tensor`: element and tensor types
//! - `grid`: the dataflow graph the scheduler consumes
//! - `prim`: the nested-loop program the scheduler produces

pub mod tensor;
pub mod grid;
pub mod prim;

pub use tensor::{DataType, TensorType, DYNAMIC_DIM};
pub use grid::{BinaryOp, ExprId, GridCall, GridExpr, GridGraph, OpKind, ReduceOp, UnaryOp};
pub use prim::{CopyDirection, ForLoop, ParamRole, PrimFunction, PrimParam, ScheduledCall, Stmt};
