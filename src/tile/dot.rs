//! Graphviz dump of a tile graph, one subgraph per cluster.

use crate::tile::graph::{TileGraph, TileNodeKind};
use crate::tile::node::TileNodeId;
use crate::utils::pretty::CodeFormatter;

/// Render the graph in DOT syntax.
pub fn to_dot(graph: &TileGraph) -> String {
    let mut out = CodeFormatter::default_indent();
    out.block("digraph tiles", |f| {
        f.writeln("compound=true;");
        f.writeln("node [shape=box];");
        write_node(graph, graph.root(), f);
        for edge in graph.edges() {
            f.writeln(&format!(
                "{} -> {} [label=\"arg{}\"];",
                graph.leaf(edge.producer),
                graph.leaf(edge.consumer),
                edge.arg
            ));
        }
    });
    out.finish()
}

fn write_node(graph: &TileGraph, id: TileNodeId, f: &mut CodeFormatter) {
    let node = graph.node(id);
    match &node.kind {
        TileNodeKind::Leaf(op) => {
            f.writeln(&format!("{} [label=\"{} {}\\n{:?}\"];", id, op.name, op.kind, op.bounds));
        }
        TileNodeKind::Cluster(children) => {
            f.block(&format!("subgraph cluster_{}", id), |f| {
                if id == graph.root() {
                    f.writeln("label=\"root\";");
                } else {
                    f.writeln(&format!("label=\"L{} {}: {}\";", node.level, node.op, node.relation.map));
                }
                for &child in children {
                    write_node(graph, child, f);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::grid::{GridGraph, UnaryOp};
    use crate::ir::tensor::{DataType, TensorType};
    use crate::target::TargetOptions;
    use crate::tile::builder::{DomainBoundsCache, TileGraphBuilder};

    #[test]
    fn test_dot() {
        let mut grid = GridGraph::new();
        let x = grid.add_input("x", TensorType::new(DataType::F32, vec![8]));
        let y = grid.unary("y", UnaryOp::Exp, x).unwrap();
        let z = grid.unary("z", UnaryOp::Relu, y).unwrap();
        let target = TargetOptions::cpu();
        let built = TileGraphBuilder::new(&grid, &target, 1)
            .build(z, &mut DomainBoundsCache::new())
            .unwrap();

        let dot = to_dot(&built.graph);
        assert!(dot.starts_with("digraph tiles {"));
        assert!(dot.contains("subgraph cluster_n0 {"));
        assert!(dot.contains("label=\"z relu\\n[8]\""));
        assert!(dot.contains("arg0"));
        assert_eq!(dot.matches("subgraph").count(), 3);
    }
}
