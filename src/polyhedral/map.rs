//! Affine maps for buffer accesses and domain relations.

use crate::polyhedral::space::Space;
use crate::polyhedral::expr::AffineExpr;
use crate::utils::matrix::RationalMatrix;
use num_rational::Rational64;
use serde::{Serialize, Deserialize};
use std::fmt;

/// An affine map from one space to another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AffineMap {
    /// Input and output arity
    pub space: Space,
    /// Output expressions (one per output dimension)
    pub outputs: Vec<AffineExpr>,
}

impl AffineMap {
    /// Create an identity map of given dimension.
    pub fn identity(n_dim: usize) -> Self {
        let space = Space::map(n_dim, n_dim);
        let outputs = (0..n_dim)
            .map(|i| AffineExpr::var(i, n_dim))
            .collect();
        Self { space, outputs }
    }

    /// Create from output expressions.
    pub fn from_outputs(n_in: usize, outputs: Vec<AffineExpr>) -> Self {
        let n_out = outputs.len();
        Self {
            space: Space::map(n_in, n_out),
            outputs,
        }
    }

    /// Create a map whose outputs each select one input dimension,
    /// e.g. `(i, j, k) -> (i, k)` is `select(3, &[0, 2])`.
    pub fn select(n_in: usize, dims: &[usize]) -> Self {
        let outputs = dims.iter()
            .map(|&d| AffineExpr::var(d, n_in))
            .collect();
        Self::from_outputs(n_in, outputs)
    }

    /// Create a permutation map.
    pub fn permutation(perm: &[usize]) -> Self {
        Self::select(perm.len(), perm)
    }

    /// Get input dimensions.
    pub fn n_in(&self) -> usize { self.space.n_in }

    /// Get output dimensions.
    pub fn n_out(&self) -> usize { self.space.n_dim }

    /// Apply the map to a point.
    pub fn apply(&self, input: &[i64]) -> Vec<i64> {
        self.outputs.iter()
            .map(|expr| expr.evaluate(input))
            .collect()
    }

    /// Extent of the accessed region per output dimension when the inputs
    /// range over a box with the given extents.
    pub fn range_extents(&self, extents: &[i64]) -> Vec<i64> {
        self.outputs.iter()
            .map(|expr| expr.range_extent(extents))
            .collect()
    }

    /// Compose two maps: self after other.
    pub fn compose(&self, other: &AffineMap) -> AffineMap {
        assert_eq!(self.n_in(), other.n_out());
        let n_in = other.n_in();

        let outputs = self.outputs.iter().map(|out_expr| {
            let mut result = AffineExpr::constant(out_expr.constant, n_in);
            for (i, &coeff) in out_expr.coeffs.iter().enumerate() {
                if coeff != 0 {
                    result = result + other.outputs[i].scale(coeff);
                }
            }
            result
        }).collect();

        AffineMap::from_outputs(n_in, outputs)
    }

    /// For each output, the input dimension it forwards unchanged, if any.
    pub fn dim_mapping(&self) -> Vec<Option<usize>> {
        self.outputs.iter().map(AffineExpr::as_single_var).collect()
    }

    /// Input dimensions read by at least one output.
    pub fn used_inputs(&self) -> Vec<bool> {
        let mut used = vec![false; self.n_in()];
        for expr in &self.outputs {
            for d in expr.used_dims() {
                used[d] = true;
            }
        }
        used
    }

    /// Check if this is an identity map.
    pub fn is_identity(&self) -> bool {
        self.n_in() == self.n_out()
            && self.dim_mapping().iter().enumerate().all(|(i, m)| *m == Some(i))
    }

    /// Every output either forwards a distinct input dimension or is the
    /// constant zero (an unmapped dimension).
    pub fn is_projected_permutation(&self) -> bool {
        let mut used = vec![false; self.n_in()];
        for expr in &self.outputs {
            if let Some(d) = expr.as_single_var() {
                if used[d] {
                    return false;
                }
                used[d] = true;
            } else if expr.as_constant() != Some(0) {
                return false;
            }
        }
        true
    }

    /// Invert the map.
    ///
    /// Projected permutations invert to the projection that sends each
    /// forwarded dimension back and leaves the others at zero. Square maps
    /// are inverted exactly when the inverse is integral.
    pub fn inverse(&self) -> Option<AffineMap> {
        if self.is_projected_permutation() {
            let n = self.n_out();
            let mut outputs = vec![AffineExpr::zero(n); self.n_in()];
            for (o, m) in self.dim_mapping().into_iter().enumerate() {
                if let Some(i) = m {
                    outputs[i] = AffineExpr::var(o, n);
                }
            }
            return Some(AffineMap::from_outputs(n, outputs));
        }

        if self.n_in() != self.n_out() {
            return None;
        }
        let n = self.n_in();
        let matrix = RationalMatrix::from_vec(
            self.outputs.iter().map(|e| e.coeffs.clone()).collect(),
        );
        let inv = matrix.inverse()?;
        let constants: Vec<Rational64> = self.outputs.iter()
            .map(|e| Rational64::from_integer(e.constant))
            .collect();
        let shift = inv.mul_vec(&constants)?;
        let coeffs = inv.to_integer_matrix()?;
        if !shift.iter().all(|r| r.is_integer()) {
            return None;
        }
        let outputs = coeffs.into_iter()
            .zip(shift)
            .map(|(row, s)| AffineExpr { constant: -*s.numer(), coeffs: row })
            .collect();
        Some(AffineMap::from_outputs(n, outputs))
    }
}

impl fmt::Display for AffineMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dim_names = self.space.input_names();
        write!(f, "({}) -> (", dim_names.join(", "))?;
        for (i, expr) in self.outputs.iter().enumerate() {
            if i > 0 { write!(f, ", ")?; }
            write!(f, "{}", expr.to_string_with_names(&dim_names))?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let map = AffineMap::identity(3);
        assert_eq!(map.apply(&[1, 2, 3]), vec![1, 2, 3]);
        assert!(map.is_identity());
        assert!(map.is_projected_permutation());
    }

    #[test]
    fn test_compose() {
        // (i, j, k) -> (i, k) after (a, b, c) -> (c, a, b)
        let access = AffineMap::select(3, &[0, 2]);
        let rotate = AffineMap::permutation(&[2, 0, 1]);
        let composed = access.compose(&rotate);
        assert_eq!(composed.apply(&[5, 7, 9]), vec![9, 7]);
    }

    #[test]
    fn test_projected_permutation() {
        let write = AffineMap::select(3, &[0, 1]);
        assert!(write.is_projected_permutation());
        assert!(!write.is_identity());

        let mut sum = AffineMap::select(2, &[0, 1]);
        sum.outputs[0] = AffineExpr::var(0, 2) + AffineExpr::var(1, 2);
        assert!(!sum.is_projected_permutation());

        let repeated = AffineMap::select(2, &[0, 0]);
        assert!(!repeated.is_projected_permutation());
    }

    #[test]
    fn test_inverse_of_projection() {
        // matmul output (m, n, k) -> (m, n)
        let write = AffineMap::select(3, &[0, 1]);
        let inv = write.inverse().unwrap();
        assert_eq!(inv.n_in(), 2);
        assert_eq!(inv.n_out(), 3);
        assert_eq!(inv.apply(&[4, 6]), vec![4, 6, 0]);
        assert_eq!(inv.dim_mapping(), vec![Some(0), Some(1), None]);
    }

    #[test]
    fn test_inverse_of_square_map() {
        // (i, j) -> (i + j, j + 1)
        let map = AffineMap::from_outputs(2, vec![
            AffineExpr { constant: 0, coeffs: vec![1, 1] },
            AffineExpr { constant: 1, coeffs: vec![0, 1] },
        ]);
        let inv = map.inverse().unwrap();
        let point = map.apply(&[3, 5]);
        assert_eq!(inv.apply(&point), vec![3, 5]);
    }

    #[test]
    fn test_inverse_with_offset_round_trips() {
        // (i, j, k) -> (k + 2, i - 3, j + k)
        let map = AffineMap::from_outputs(3, vec![
            AffineExpr { constant: 2, coeffs: vec![0, 0, 1] },
            AffineExpr { constant: -3, coeffs: vec![1, 0, 0] },
            AffineExpr { constant: 0, coeffs: vec![0, 1, 1] },
        ]);
        let inv = map.inverse().unwrap();
        assert!(map.compose(&inv).is_identity());
        assert!(inv.compose(&map).is_identity());
        assert_eq!(inv.apply(&map.apply(&[4, 1, 7])), vec![4, 1, 7]);

        // 2i has no integral inverse
        let doubled = AffineMap::from_outputs(1, vec![AffineExpr { constant: 1, coeffs: vec![2] }]);
        assert!(doubled.inverse().is_none());
    }

    #[test]
    fn test_range_extents() {
        let access = AffineMap::select(3, &[2, 0]);
        assert_eq!(access.range_extents(&[4, 8, 16]), vec![16, 4]);
    }

    #[test]
    fn test_display() {
        let access = AffineMap::select(3, &[0, 2]);
        assert_eq!(access.to_string(), "(d0, d1, d2) -> (d0, d2)");
    }
}
