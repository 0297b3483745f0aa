//! Scheduled nested-loop programs.
//!
//! A [`PrimFunction`] is the output of scheduling: loops over tiles,
//! buffers placed in memory levels at fixed byte offsets, copies between
//! levels and leaf compute statements on tiles.

use crate::ir::grid::{ExprId, OpKind};
use crate::ir::tensor::DataType;
use crate::utils::pretty::PrettyPrint;
use pretty::RcDoc;
use serde::{Serialize, Deserialize};
use std::fmt;

/// Whether a parameter is read or written by the function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamRole {
    /// Read-only input
    Input,
    /// Result
    Output,
}

/// A function parameter; parameters live in the top memory level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimParam {
    /// Parameter name
    pub name: String,
    /// Element type
    pub dtype: DataType,
    /// Shape
    pub shape: Vec<i64>,
    /// Input or output
    pub role: ParamRole,
}

/// Direction of a copy between adjacent memory levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyDirection {
    /// From the outer level into the allocated buffer
    In,
    /// From the allocated buffer back to the outer level
    Out,
}

/// A counted loop `for var in start..stop step step`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForLoop {
    /// Induction variable
    pub var: String,
    /// First value
    pub start: i64,
    /// Exclusive end
    pub stop: i64,
    /// Increment, the tile extent of the loop's dimension
    pub step: i64,
    /// Loop body
    pub body: Vec<Stmt>,
}

impl ForLoop {
    /// Number of iterations.
    pub fn trip_count(&self) -> i64 {
        if self.step <= 0 || self.stop <= self.start {
            0
        } else {
            (self.stop - self.start + self.step - 1) / self.step
        }
    }
}

/// A statement of a scheduled program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stmt {
    /// Loop over tiles
    For(ForLoop),
    /// A buffer placed in a memory level
    Alloc {
        /// Buffer name
        buffer: String,
        /// Memory level
        level: usize,
        /// Byte offset within the level
        offset: i64,
        /// Size in bytes
        bytes: i64,
        /// Element type
        dtype: DataType,
        /// Tile shape
        shape: Vec<i64>,
    },
    /// A window onto an outer buffer, used on unified-address targets
    SubView {
        /// Buffer name
        buffer: String,
        /// Buffer the view points into
        source: String,
        /// Memory level the view is accounted to
        level: usize,
        /// Byte offset reserved for the view
        offset: i64,
        /// Tile shape
        shape: Vec<i64>,
    },
    /// Copy a tile between memory levels
    Copy {
        /// Source buffer
        src: String,
        /// Destination buffer
        dst: String,
        /// Tile shape
        shape: Vec<i64>,
        /// Direction relative to the allocated buffer
        direction: CopyDirection,
    },
    /// Run an operator on one tile
    Compute {
        /// Operator index within the scheduled region
        op: usize,
        /// Operator
        kind: OpKind,
        /// Input tiles
        inputs: Vec<String>,
        /// Output tile
        output: String,
        /// Tile extent per domain dimension
        tile: Vec<i64>,
    },
}

/// A scheduled function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimFunction {
    /// Function name
    pub name: String,
    /// Inputs followed by outputs
    pub params: Vec<PrimParam>,
    /// Function body
    pub body: Vec<Stmt>,
}

impl PrimFunction {
    /// Visit every statement in program order.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Stmt)) {
        fn visit<'a>(stmts: &'a [Stmt], f: &mut impl FnMut(&'a Stmt)) {
            for stmt in stmts {
                f(stmt);
                if let Stmt::For(l) = stmt {
                    visit(&l.body, f);
                }
            }
        }
        visit(&self.body, f);
    }

    /// Input parameters.
    pub fn inputs(&self) -> impl Iterator<Item = &PrimParam> {
        self.params.iter().filter(|p| p.role == ParamRole::Input)
    }

    /// Output parameters.
    pub fn outputs(&self) -> impl Iterator<Item = &PrimParam> {
        self.params.iter().filter(|p| p.role == ParamRole::Output)
    }

    /// Number of compute statements executed, counting loop trips.
    pub fn dynamic_compute_count(&self) -> i64 {
        fn count(stmts: &[Stmt]) -> i64 {
            stmts.iter().map(|s| match s {
                Stmt::For(l) => l.trip_count() * count(&l.body),
                Stmt::Compute { .. } => 1,
                _ => 0,
            }).sum()
        }
        count(&self.body)
    }
}

fn shape_doc<'a>(shape: &[i64]) -> RcDoc<'a, ()> {
    let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    RcDoc::text(format!("[{}]", dims.join(", ")))
}

fn stmts_doc(stmts: &[Stmt]) -> RcDoc<'_, ()> {
    RcDoc::intersperse(stmts.iter().map(Stmt::to_doc), RcDoc::hardline())
}

impl PrettyPrint for Stmt {
    fn to_doc(&self) -> RcDoc<'_, ()> {
        match self {
            Stmt::For(l) => RcDoc::text(format!(
                "for {} in range({}, {}, {}):",
                l.var, l.start, l.stop, l.step
            ))
            .append(RcDoc::hardline().append(stmts_doc(&l.body)).nest(2)),
            Stmt::Alloc { buffer, level, offset, bytes, dtype, shape } => RcDoc::text(format!(
                "{} = alloc<{}>(level={}, offset={}, bytes={}, shape=",
                buffer, dtype, level, offset, bytes
            ))
            .append(shape_doc(shape))
            .append(RcDoc::text(")")),
            Stmt::SubView { buffer, source, level, offset, shape } => RcDoc::text(format!(
                "{} = subview({}, level={}, offset={}, shape=",
                buffer, source, level, offset
            ))
            .append(shape_doc(shape))
            .append(RcDoc::text(")")),
            Stmt::Copy { src, dst, shape, direction } => {
                let tag = match direction {
                    CopyDirection::In => "copy_in",
                    CopyDirection::Out => "copy_out",
                };
                RcDoc::text(format!("{}({} -> {}, ", tag, src, dst))
                    .append(shape_doc(shape))
                    .append(RcDoc::text(")"))
            }
            Stmt::Compute { op, kind, inputs, output, tile } => RcDoc::text(format!(
                "{} = {}#{}({})",
                output,
                kind,
                op,
                inputs.join(", ")
            ))
            .append(RcDoc::text(" tile="))
            .append(shape_doc(tile)),
        }
    }
}

impl PrettyPrint for PrimFunction {
    fn to_doc(&self) -> RcDoc<'_, ()> {
        let params = RcDoc::intersperse(
            self.params.iter().map(|p| {
                let role = match p.role {
                    ParamRole::Input => "in",
                    ParamRole::Output => "out",
                };
                RcDoc::text(format!("{} {}: {}", role, p.name, p.dtype)).append(shape_doc(&p.shape))
            }),
            RcDoc::text(",").append(RcDoc::line()),
        );
        RcDoc::text(format!("def {}(", self.name))
            .append(RcDoc::line_().append(params).nest(4).group())
            .append(RcDoc::text("):"))
            .append(RcDoc::hardline().append(stmts_doc(&self.body)).nest(2))
    }
}

impl fmt::Display for PrimFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pretty())
    }
}

/// A scheduled function applied to the arguments of the original graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledCall {
    /// The scheduled function
    pub function: PrimFunction,
    /// Graph expressions bound to the function's input parameters
    pub arguments: Vec<ExprId>,
}

impl fmt::Display for ScheduledCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self.arguments.iter().map(|a| a.to_string()).collect();
        writeln!(f, "{}", self.function)?;
        write!(f, "call {}({})", self.function.name, args.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::grid::UnaryOp;

    fn sample() -> PrimFunction {
        PrimFunction {
            name: "relu".to_string(),
            params: vec![
                PrimParam { name: "x".into(), dtype: DataType::F32, shape: vec![8], role: ParamRole::Input },
                PrimParam { name: "y".into(), dtype: DataType::F32, shape: vec![8], role: ParamRole::Output },
            ],
            body: vec![Stmt::For(ForLoop {
                var: "i".into(),
                start: 0,
                stop: 8,
                step: 4,
                body: vec![
                    Stmt::Alloc {
                        buffer: "x_l0".into(),
                        level: 0,
                        offset: 0,
                        bytes: 16,
                        dtype: DataType::F32,
                        shape: vec![4],
                    },
                    Stmt::Copy {
                        src: "x".into(),
                        dst: "x_l0".into(),
                        shape: vec![4],
                        direction: CopyDirection::In,
                    },
                    Stmt::Compute {
                        op: 0,
                        kind: OpKind::Unary(UnaryOp::Relu),
                        inputs: vec!["x_l0".into()],
                        output: "y_l0".into(),
                        tile: vec![4],
                    },
                ],
            })],
        }
    }

    #[test]
    fn test_walk_and_counts() {
        let f = sample();
        let mut n = 0;
        f.walk(&mut |_| n += 1);
        assert_eq!(n, 4);
        assert_eq!(f.dynamic_compute_count(), 2);
        assert_eq!(f.inputs().count(), 1);
        assert_eq!(f.outputs().next().map(|p| p.name.as_str()), Some("y"));
    }

    #[test]
    fn test_printing() {
        let text = sample().to_string();
        assert!(text.starts_with("def relu(in x: f32[8], out y: f32[8]):"));
        assert!(text.contains("\n  for i in range(0, 8, 4):\n    x_l0 = alloc<f32>(level=0"));
        assert!(text.contains("copy_in(x -> x_l0, [4])"));
        assert!(text.contains("y_l0 = relu#0(x_l0) tile=[4]"));
    }
}
