//! Simulated Python trace of a scheduled program.
//!
//! The emitted script replays the loop nest without doing arithmetic: every
//! allocation, view, copy and compute call is recorded by a small runtime
//! at the top of the script, which prints per-level traffic and the number
//! of compute calls when run.

use crate::ir::prim::{CopyDirection, ParamRole, PrimFunction, Stmt};
use crate::utils::pretty::CodeFormatter;

const RUNTIME: &str = r#"import math
from collections import Counter

TRACE = []
TRAFFIC = Counter()
LIVE = {}


def alloc(name, level, offset, nbytes, dtype, shape):
    LIVE[name] = (level, nbytes)
    TRACE.append(("alloc", name, level, offset, nbytes))


def subview(name, source, level, offset, shape):
    LIVE[name] = (level, 0)
    TRACE.append(("subview", name, source, level, offset))


def copy(src, dst, shape, direction):
    level, nbytes = LIVE[dst] if direction == "in" else LIVE[src]
    TRAFFIC[level + 1] += nbytes
    TRACE.append(("copy_" + direction, src, dst))


def compute(op, kind, inputs, output, tile):
    for name in inputs + [output]:
        level, nbytes = LIVE.get(name, (0, 0))
        TRAFFIC[level] += nbytes
    TRACE.append(("compute", op, kind, output, math.prod(tile)))
"#;

fn py_list(values: &[i64]) -> String {
    let items: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    format!("[{}]", items.join(", "))
}

fn py_names(names: &[String]) -> String {
    let items: Vec<String> = names.iter().map(|n| format!("{:?}", n)).collect();
    format!("[{}]", items.join(", "))
}

/// Emit a runnable trace script for `function`, whose parameters live in
/// memory level `top_level`.
pub fn emit_python(function: &PrimFunction, top_level: usize) -> String {
    let mut f = CodeFormatter::new("    ");
    f.writeln(RUNTIME);
    f.writeln(&format!("TOP = {}", top_level));
    f.writeln("");
    f.writeln("");

    let params: Vec<&str> = function.params.iter().map(|p| p.name.as_str()).collect();
    f.suite(&format!("def {}():", function.name), |f| {
        for p in &function.params {
            let role = match p.role {
                ParamRole::Input => "input",
                ParamRole::Output => "output",
            };
            f.writeln(&format!("# {} {}: {}{}", role, p.name, p.dtype, py_list(&p.shape)));
            let bytes = p.shape.iter().product::<i64>() * p.dtype.size_in_bytes();
            f.writeln(&format!("LIVE[{:?}] = (TOP, {})", p.name, bytes));
        }
        if function.body.is_empty() {
            f.writeln("pass");
        }
        emit_stmts(f, &function.body);
    });
    f.writeln("");
    f.writeln("");
    f.suite("if __name__ == \"__main__\":", |f| {
        f.writeln(&format!("{}()", function.name));
        f.writeln("computes = sum(1 for event in TRACE if event[0] == \"compute\")");
        f.writeln(&format!(
            "print(\"{}({}): %d compute calls\" % computes)",
            function.name,
            params.join(", ")
        ));
        f.suite("for level in sorted(TRAFFIC):", |f| {
            f.writeln("print(\"level %d: %d bytes\" % (level, TRAFFIC[level]))");
        });
    });

    f.finish()
}

fn emit_stmts(f: &mut CodeFormatter, stmts: &[Stmt]) {
    for stmt in stmts {
        match stmt {
            Stmt::For(l) => {
                let header = format!("for {} in range({}, {}, {}):", l.var, l.start, l.stop, l.step);
                f.suite(&header, |f| {
                    if l.body.is_empty() {
                        f.writeln("pass");
                    }
                    emit_stmts(f, &l.body);
                });
            }
            Stmt::Alloc { buffer, level, offset, bytes, dtype, shape } => {
                f.writeln(&format!(
                    "alloc({:?}, {}, {}, {}, {:?}, {})",
                    buffer, level, offset, bytes, dtype.to_string(), py_list(shape)
                ));
            }
            Stmt::SubView { buffer, source, level, offset, shape } => {
                f.writeln(&format!(
                    "subview({:?}, {:?}, {}, {}, {})",
                    buffer, source, level, offset, py_list(shape)
                ));
            }
            Stmt::Copy { src, dst, shape, direction } => {
                let dir = match direction {
                    CopyDirection::In => "in",
                    CopyDirection::Out => "out",
                };
                f.writeln(&format!("copy({:?}, {:?}, {}, {:?})", src, dst, py_list(shape), dir));
            }
            Stmt::Compute { op, kind, inputs, output, tile } => {
                f.writeln(&format!(
                    "compute({}, {:?}, {}, {:?}, {})",
                    op, kind.to_string(), py_names(inputs), output, py_list(tile)
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::grid::{OpKind, UnaryOp};
    use crate::ir::prim::{ForLoop, PrimParam};
    use crate::ir::tensor::DataType;

    fn relu() -> PrimFunction {
        PrimFunction {
            name: "y".to_string(),
            params: vec![
                PrimParam { name: "x".into(), dtype: DataType::F32, shape: vec![8], role: ParamRole::Input },
                PrimParam { name: "y".into(), dtype: DataType::F32, shape: vec![8], role: ParamRole::Output },
            ],
            body: vec![Stmt::For(ForLoop {
                var: "n1_d0".into(),
                start: 0,
                stop: 8,
                step: 4,
                body: vec![
                    Stmt::Alloc {
                        buffer: "x_l0_n1".into(),
                        level: 0,
                        offset: 0,
                        bytes: 16,
                        dtype: DataType::F32,
                        shape: vec![4],
                    },
                    Stmt::Copy {
                        src: "x".into(),
                        dst: "x_l0_n1".into(),
                        shape: vec![4],
                        direction: CopyDirection::In,
                    },
                    Stmt::Compute {
                        op: 0,
                        kind: OpKind::Unary(UnaryOp::Relu),
                        inputs: vec!["x_l0_n1".into()],
                        output: "y_l0_n1".into(),
                        tile: vec![4],
                    },
                ],
            })],
        }
    }

    #[test]
    fn test_emit_python() {
        let script = emit_python(&relu(), 1);
        assert!(script.contains("TOP = 1\n"));
        assert!(script.contains("def y():\n"));
        assert!(script.contains("    LIVE[\"x\"] = (TOP, 32)\n"));
        assert!(script.contains("    for n1_d0 in range(0, 8, 4):\n"));
        assert!(script.contains("        copy(\"x\", \"x_l0_n1\", [4], \"in\")\n"));
        assert!(script.contains("        compute(0, \"relu\", [\"x_l0_n1\"], \"y_l0_n1\", [4])\n"));
        assert!(script.contains("if __name__ == \"__main__\":\n    y()\n"));
    }

    #[test]
    fn test_empty_body() {
        let mut f = relu();
        f.body.clear();
        assert!(emit_python(&f, 1).contains("    pass\n"));
    }
}
