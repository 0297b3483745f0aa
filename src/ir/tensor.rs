//! Element and tensor types.

use crate::utils::errors::{UnsupportedError, UnsupportedErrorKind};
use crate::utils::matrix::ceil_div;
use serde::{Serialize, Deserialize};
use std::fmt;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// 32-bit float
    F32,
    /// 16-bit float
    F16,
    /// bfloat16
    Bf16,
    /// 32-bit signed integer
    I32,
    /// 8-bit signed integer
    I8,
    /// 8-bit unsigned integer
    U8,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(self) -> i64 {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F16 | DataType::Bf16 => 2,
            DataType::I8 | DataType::U8 => 1,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::F32 => "f32",
            DataType::F16 => "f16",
            DataType::Bf16 => "bf16",
            DataType::I32 => "i32",
            DataType::I8 => "i8",
            DataType::U8 => "u8",
        };
        write!(f, "{}", s)
    }
}

/// Marker for a dimension whose size is only known at run time.
pub const DYNAMIC_DIM: i64 = -1;

/// A tensor type, optionally split across devices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorType {
    /// Element type
    pub dtype: DataType,
    /// Full logical shape; `DYNAMIC_DIM` marks a dynamic dimension
    pub shape: Vec<i64>,
    /// Number of shards along each dimension; empty means unsplit
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub split: Vec<i64>,
}

impl TensorType {
    /// Create an unsplit tensor type.
    pub fn new(dtype: DataType, shape: Vec<i64>) -> Self {
        Self { dtype, shape, split: Vec::new() }
    }

    /// Split the tensor into shards along each dimension.
    pub fn with_split(mut self, split: Vec<i64>) -> Self {
        self.split = split;
        self
    }

    /// Rank of the tensor.
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Whether every dimension has a static size.
    pub fn is_static(&self) -> bool {
        self.shape.iter().all(|&d| d >= 0)
    }

    /// Shape of one shard, the shape the scheduler tiles.
    pub fn divided_shape(&self) -> Result<Vec<i64>, UnsupportedError> {
        if !self.is_static() {
            return Err(UnsupportedError::new(
                UnsupportedErrorKind::DynamicShape,
                format!("tensor {} has a dynamic dimension", self),
            ));
        }
        if !self.split.is_empty() && self.split.len() != self.shape.len() {
            return Err(UnsupportedError::new(
                UnsupportedErrorKind::RankMismatch,
                format!("split {:?} does not match rank of {}", self.split, self),
            ));
        }
        Ok(self.shape.iter()
            .enumerate()
            .map(|(d, &n)| match self.split.get(d) {
                Some(&parts) if parts > 1 => ceil_div(n, parts),
                _ => n,
            })
            .collect())
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.dtype)?;
        for (i, d) in self.shape.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if *d == DYNAMIC_DIM {
                write!(f, "?")?;
            } else {
                write!(f, "{}", d)?;
            }
        }
        write!(f, "]")?;
        if !self.split.is_empty() {
            write!(f, " split {:?}", self.split)?;
        }
        Ok(())
    }
}
