//! Affine expressions over iteration-domain dimensions.
//!
//! `aff(d) = k + c0*d0 + c1*d1 + ...`, stored as a dense coefficient row.

use serde::{Serialize, Deserialize};
use std::fmt;
use std::ops::Add;

/// Dense affine expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AffineExpr {
    /// Constant term
    pub constant: i64,
    /// Coefficient per input dimension
    pub coeffs: Vec<i64>,
}

impl AffineExpr {
    /// The expression `0` over `n_dim` inputs.
    pub fn zero(n_dim: usize) -> Self {
        Self::constant(0, n_dim)
    }

    /// The expression `value` over `n_dim` inputs.
    pub fn constant(value: i64, n_dim: usize) -> Self {
        Self { constant: value, coeffs: vec![0; n_dim] }
    }

    /// The expression `d{dim}`. Out-of-range dimensions give `0`.
    pub fn var(dim: usize, n_dim: usize) -> Self {
        let coeffs = (0..n_dim).map(|d| i64::from(d == dim)).collect();
        Self { constant: 0, coeffs }
    }

    /// The constant value when no dimension contributes.
    pub fn as_constant(&self) -> Option<i64> {
        self.coeffs.iter().all(|&c| c == 0).then_some(self.constant)
    }

    /// `Some(d)` when the expression is exactly `d{d}`.
    pub fn as_single_var(&self) -> Option<usize> {
        if self.constant != 0 {
            return None;
        }
        let mut dims = self.used_dims();
        match (dims.next(), dims.next()) {
            (Some(d), None) if self.coeffs[d] == 1 => Some(d),
            _ => None,
        }
    }

    /// Number of input dimensions.
    pub fn n_dim(&self) -> usize {
        self.coeffs.len()
    }

    /// Dimensions with a non-zero coefficient.
    pub fn used_dims(&self) -> impl Iterator<Item = usize> + '_ {
        self.coeffs.iter().enumerate().filter(|(_, c)| **c != 0).map(|(d, _)| d)
    }

    /// Value at the point `point`; missing coordinates count as zero.
    pub fn evaluate(&self, point: &[i64]) -> i64 {
        self.constant + self.coeffs.iter().zip(point).map(|(c, v)| c * v).sum::<i64>()
    }

    /// Number of distinct values taken over a box whose dimensions have the
    /// given extents: `1 + sum(|c_i| * (extent_i - 1))`.
    pub fn range_extent(&self, extents: &[i64]) -> i64 {
        1 + self.coeffs.iter()
            .zip(extents)
            .map(|(&c, &e)| c.abs() * (e - 1))
            .sum::<i64>()
    }

    /// Multiply every term by `factor`.
    pub fn scale(&self, factor: i64) -> Self {
        Self {
            constant: self.constant * factor,
            coeffs: self.coeffs.iter().map(|c| c * factor).collect(),
        }
    }

    /// Render with `names` for the dimensions, `d{i}` where a name is missing.
    pub fn to_string_with_names(&self, names: &[String]) -> String {
        let mut out = String::new();
        for d in self.used_dims() {
            let c = self.coeffs[d];
            let name = names.get(d).cloned().unwrap_or_else(|| format!("d{}", d));
            let sign = match (out.is_empty(), c < 0) {
                (true, true) => "-",
                (true, false) => "",
                (false, true) => " - ",
                (false, false) => " + ",
            };
            out.push_str(sign);
            if c.abs() != 1 {
                out.push_str(&format!("{}*", c.abs()));
            }
            out.push_str(&name);
        }
        match (out.is_empty(), self.constant) {
            (true, k) => out = k.to_string(),
            (false, 0) => {}
            (false, k) if k < 0 => out.push_str(&format!(" - {}", -k)),
            (false, k) => out.push_str(&format!(" + {}", k)),
        }
        out
    }
}

impl Add for AffineExpr {
    type Output = Self;

    fn add(mut self, other: Self) -> Self {
        if self.coeffs.len() < other.coeffs.len() {
            self.coeffs.resize(other.coeffs.len(), 0);
        }
        for (a, b) in self.coeffs.iter_mut().zip(&other.coeffs) {
            *a += b;
        }
        self.constant += other.constant;
        self
    }
}

impl fmt::Display for AffineExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_with_names(&[]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant() {
        let expr = AffineExpr::constant(5, 2);
        assert_eq!(expr.as_constant(), Some(5));
        assert_eq!(expr.evaluate(&[1, 2]), 5);
        assert_eq!(expr.as_single_var(), None);
        assert_eq!(expr.to_string(), "5");
    }

    #[test]
    fn test_var() {
        let expr = AffineExpr::var(0, 2);
        assert_eq!(expr.as_constant(), None);
        assert_eq!(expr.evaluate(&[7, 3]), 7);
        assert_eq!(expr.as_single_var(), Some(0));
        assert_eq!(expr.scale(2).as_single_var(), None);
    }

    #[test]
    fn test_add_and_extent() {
        let sum = AffineExpr::var(0, 2) + AffineExpr::var(1, 2);
        assert_eq!(sum.evaluate(&[3, 4]), 7);
        assert_eq!(sum.as_single_var(), None);
        // i + j over 4 x 3 covers 0..=5
        assert_eq!(sum.range_extent(&[4, 3]), 6);
        assert_eq!(sum.scale(2).range_extent(&[4, 3]), 11);
    }

    #[test]
    fn test_display() {
        let expr = AffineExpr { constant: 5, coeffs: vec![2, -1] };
        let s = expr.to_string_with_names(&["i".to_string(), "j".to_string()]);
        assert_eq!(s, "2*i - j + 5");
        let neg = AffineExpr { constant: -1, coeffs: vec![-1, 0] };
        assert_eq!(neg.to_string(), "-d0 - 1");
    }
}
