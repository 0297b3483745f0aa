//! Dimensionality of affine maps.

use serde::{Serialize, Deserialize};
use std::fmt;

/// Input and output dimension counts of an affine map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Space {
    /// Number of output dimensions
    pub n_dim: usize,
    /// Number of input dimensions
    pub n_in: usize,
    /// Names of input dimensions, used when printing
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dim_names: Vec<String>,
}

impl Space {
    /// Create a map space.
    pub fn map(n_in: usize, n_out: usize) -> Self {
        Self {
            n_dim: n_out,
            n_in,
            dim_names: Vec::new(),
        }
    }

    /// Input dimension names, `d0, d1, ...` where unnamed.
    pub fn input_names(&self) -> Vec<String> {
        (0..self.n_in)
            .map(|i| {
                self.dim_names.get(i)
                    .cloned()
                    .unwrap_or_else(|| format!("d{}", i))
            })
            .collect()
    }
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] -> [{}]", self.n_in, self.n_dim)
    }
}
