//! Target description: memory hierarchy and micro-kernel capabilities.
//!
//! Memory levels are numbered from the innermost (level 0, closest to the
//! compute units) outward. The last level is main memory; graph inputs and
//! outputs live there and it is never capacity-checked.

use crate::ir::grid::OpKind;
use crate::utils::errors::{UnsupportedError, UnsupportedErrorKind};
use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;

/// Shape constraints of the micro-kernel that executes a leaf tile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MicroKernelInfo {
    /// Leaf tile extents must be multiples of these, one per domain dimension
    pub primitives: Vec<i64>,
    /// Domain dimension accumulated over, scheduled innermost
    pub reduction_dim: Option<usize>,
    /// Cycles to execute one primitive
    pub cycles_per_primitive: i64,
}

impl MicroKernelInfo {
    /// A kernel accepting any tile, one cycle per point.
    pub fn scalar(rank: usize, reduction_dim: Option<usize>) -> Self {
        Self {
            primitives: vec![1; rank],
            reduction_dim,
            cycles_per_primitive: 1,
        }
    }
}

/// Per-operator override of the default micro-kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelOverride {
    /// Primitive multiples per domain dimension
    #[serde(default)]
    pub primitives: Vec<i64>,
    /// Cycles per primitive
    #[serde(default)]
    pub cycles_per_primitive: Option<i64>,
}

/// Queries the scheduler makes about the target.
pub trait TargetCapabilities {
    /// Micro-kernel used for an operator of the given domain rank.
    fn micro_kernel(&self, kind: &OpKind, rank: usize) -> MicroKernelInfo;
}

/// Memory hierarchy and cost parameters of a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetOptions {
    /// Target name
    pub name: String,
    /// Capacity of each memory level in bytes, innermost first
    pub memory_capacities: Vec<i64>,
    /// Bandwidth of each memory level in bytes per cycle
    pub memory_bandwidths: Vec<i64>,
    /// Inner levels are windows of one address space; no copies are needed
    #[serde(default)]
    pub unified_memory: bool,
    /// Cycles per primitive when no override applies
    #[serde(default = "default_cycles")]
    pub default_cycles_per_primitive: i64,
    /// Overrides keyed by operator name (`matmul`, `relu`, ...)
    #[serde(default)]
    pub kernels: BTreeMap<String, KernelOverride>,
}

fn default_cycles() -> i64 {
    1
}

impl Default for TargetOptions {
    fn default() -> Self {
        Self::cpu()
    }
}

impl TargetOptions {
    /// A cache-based CPU: 256 KiB L2, then main memory.
    pub fn cpu() -> Self {
        Self {
            name: "cpu".to_string(),
            memory_capacities: vec![256 * 1024, i64::MAX],
            memory_bandwidths: vec![64, 16],
            unified_memory: true,
            default_cycles_per_primitive: 1,
            kernels: BTreeMap::new(),
        }
    }

    /// An accelerator with two scratchpads and 16x16 matmul tiles.
    pub fn npu() -> Self {
        let mut kernels = BTreeMap::new();
        kernels.insert("matmul".to_string(), KernelOverride {
            primitives: vec![16, 16, 16],
            cycles_per_primitive: Some(16),
        });
        Self {
            name: "npu".to_string(),
            memory_capacities: vec![64 * 1024, 1024 * 1024, i64::MAX],
            memory_bandwidths: vec![256, 64, 16],
            unified_memory: false,
            default_cycles_per_primitive: 1,
            kernels,
        }
    }

    /// Load a target from JSON.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Set the capacities and bandwidths of the hierarchy.
    pub fn with_levels(mut self, capacities: Vec<i64>, bandwidths: Vec<i64>) -> Self {
        self.memory_capacities = capacities;
        self.memory_bandwidths = bandwidths;
        self
    }

    /// Choose between copying and sub-viewing buffers.
    pub fn with_unified_memory(mut self, unified: bool) -> Self {
        self.unified_memory = unified;
        self
    }

    /// Override the micro-kernel of one operator.
    pub fn with_kernel(mut self, op: &str, kernel: KernelOverride) -> Self {
        self.kernels.insert(op.to_string(), kernel);
        self
    }

    /// Number of memory levels.
    pub fn num_levels(&self) -> usize {
        self.memory_capacities.len()
    }

    /// Index of the outermost level.
    pub fn top_level(&self) -> usize {
        self.num_levels().saturating_sub(1)
    }

    /// Check that the description is usable.
    pub fn validate(&self) -> Result<(), UnsupportedError> {
        let bad = |message: String| Err(UnsupportedError::new(UnsupportedErrorKind::Target, message));
        if self.num_levels() < 2 {
            return bad(format!("target {} needs at least two memory levels", self.name));
        }
        if self.memory_bandwidths.len() != self.num_levels() {
            return bad(format!(
                "target {} has {} capacities but {} bandwidths",
                self.name,
                self.num_levels(),
                self.memory_bandwidths.len()
            ));
        }
        if self.memory_capacities.iter().chain(&self.memory_bandwidths).any(|&v| v <= 0) {
            return bad(format!("target {} has a non-positive capacity or bandwidth", self.name));
        }
        Ok(())
    }
}

impl TargetCapabilities for TargetOptions {
    fn micro_kernel(&self, kind: &OpKind, rank: usize) -> MicroKernelInfo {
        let mut info = MicroKernelInfo::scalar(rank, kind.reduction_dim());
        info.cycles_per_primitive = self.default_cycles_per_primitive;
        if let Some(o) = self.kernels.get(&kind.name()) {
            if o.primitives.len() == rank {
                info.primitives = o.primitives.clone();
            }
            if let Some(c) = o.cycles_per_primitive {
                info.cycles_per_primitive = c;
            }
        }
        info
    }
}
