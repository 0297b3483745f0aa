//! Tiered tile graphs.
//!
//! This module provides:
//! - Operator leaves, buffer identities and domain relations
//! - The clustered tile graph arena
//! - Construction from grid expressions with domain-bound inference
//! - Merge point discovery and graph merging
//! - DOT output for inspection

pub mod node;
pub mod graph;
pub mod builder;
pub mod merge;
pub mod dot;

pub use node::{BufferIdentity, DomainRelation, GraphInput, OpEdge, OpId, OpNode, TileNodeId};
pub use graph::{TileGraph, TileNode, TileNodeKind};
pub use builder::{BuiltGraph, DomainBoundsCache, TileGraphBuilder};
pub use merge::{GraphMerger, MergePoint, MergePointCollector};
pub use dot::to_dot;
