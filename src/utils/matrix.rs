//! Exact rational matrices and small integer helpers.
//!
//! The matrix type backs exact inversion of square affine maps; the integer
//! helpers enumerate the tile-size domains used by the scheduler.

use num_rational::Rational64;
use num_integer::Integer;
use num_traits::{One, Signed, Zero};
use std::fmt;

/// A square or rectangular matrix with rational entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RationalMatrix {
    rows: Vec<Vec<Rational64>>,
}

impl RationalMatrix {
    /// Create a matrix from integer rows.
    pub fn from_vec(data: Vec<Vec<i64>>) -> Self {
        Self {
            rows: data
                .into_iter()
                .map(|row| row.into_iter().map(Rational64::from_integer).collect())
                .collect(),
        }
    }

    fn is_square(&self) -> bool {
        self.rows.iter().all(|row| row.len() == self.rows.len())
    }

    /// Gauss-Jordan inverse; `None` for singular or non-square matrices.
    pub fn inverse(&self) -> Option<Self> {
        if !self.is_square() {
            return None;
        }
        let n = self.rows.len();
        let mut aug: Vec<Vec<Rational64>> = self.rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let mut r = row.clone();
                r.extend((0..n).map(|j| if i == j { Rational64::one() } else { Rational64::zero() }));
                r
            })
            .collect();

        for k in 0..n {
            let pivot_row = (k..n).max_by_key(|&i| aug[i][k].abs())?;
            aug.swap(k, pivot_row);
            let pivot = aug[k][k];
            if pivot.is_zero() {
                return None;
            }
            for v in aug[k].iter_mut() {
                *v /= pivot;
            }
            let row_k = aug[k].clone();
            for (i, row) in aug.iter_mut().enumerate() {
                if i == k || row[k].is_zero() {
                    continue;
                }
                let factor = row[k];
                for (v, pk) in row.iter_mut().zip(&row_k) {
                    *v -= factor * pk;
                }
            }
        }

        Some(Self {
            rows: aug.into_iter().map(|row| row[n..].to_vec()).collect(),
        })
    }

    /// Matrix-vector product; `None` when a row length differs from `v`.
    pub fn mul_vec(&self, v: &[Rational64]) -> Option<Vec<Rational64>> {
        self.rows
            .iter()
            .map(|row| {
                (row.len() == v.len())
                    .then(|| row.iter().zip(v).fold(Rational64::zero(), |acc, (a, b)| acc + a * b))
            })
            .collect()
    }

    /// Integer entries, if every entry is integral.
    pub fn to_integer_matrix(&self) -> Option<Vec<Vec<i64>>> {
        self.rows
            .iter()
            .map(|row| row.iter().map(|r| r.is_integer().then(|| r.to_integer())).collect())
            .collect()
    }
}

impl fmt::Display for RationalMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in &self.rows {
            let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            writeln!(f, "[{}]", cells.join(", "))?;
        }
        Ok(())
    }
}

/// All positive divisors of `n` in ascending order.
pub fn divisors(n: i64) -> Vec<i64> {
    if n <= 0 {
        return Vec::new();
    }
    let mut small = Vec::new();
    let mut large = Vec::new();
    let mut d = 1;
    while d * d <= n {
        if n % d == 0 {
            small.push(d);
            if d != n / d {
                large.push(n / d);
            }
        }
        d += 1;
    }
    small.extend(large.into_iter().rev());
    small
}

/// Ceiling division for non-negative numerators and positive divisors.
pub fn ceil_div(a: i64, b: i64) -> i64 {
    Integer::div_ceil(&a, &b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inverse() {
        let m = RationalMatrix::from_vec(vec![vec![0, 1, 0], vec![0, 0, 1], vec![1, 0, 0]]);
        let inv = m.inverse().unwrap();
        assert_eq!(inv.to_integer_matrix(), Some(vec![vec![0, 0, 1], vec![1, 0, 0], vec![0, 1, 0]]));
    }

    #[test]
    fn test_fractional_inverse() {
        let m = RationalMatrix::from_vec(vec![vec![1, 2], vec![3, 4]]);
        let inv = m.inverse().unwrap();
        assert!(inv.to_integer_matrix().is_none());
        assert_eq!(inv.to_string(), "[-2, 1]\n[3/2, -1/2]\n");
    }

    #[test]
    fn test_singular() {
        assert!(RationalMatrix::from_vec(vec![vec![1, 2], vec![2, 4]]).inverse().is_none());
        assert!(RationalMatrix::from_vec(vec![vec![1, 2]]).inverse().is_none());
    }

    #[test]
    fn test_mul_vec() {
        let m = RationalMatrix::from_vec(vec![vec![1, 2], vec![3, 4]]);
        let v = [Rational64::from_integer(1), Rational64::new(1, 2)];
        assert_eq!(m.mul_vec(&v), Some(vec![Rational64::from_integer(2), Rational64::from_integer(5)]));
        assert_eq!(m.mul_vec(&v[..1]), None);
    }

    #[test]
    fn test_divisors() {
        assert_eq!(divisors(12), vec![1, 2, 3, 4, 6, 12]);
        assert_eq!(divisors(1), vec![1]);
        assert_eq!(divisors(49), vec![1, 7, 49]);
        assert!(divisors(0).is_empty());
    }

    #[test]
    fn test_ceil_div() {
        assert_eq!(ceil_div(7, 2), 4);
        assert_eq!(ceil_div(8, 2), 4);
        assert_eq!(ceil_div(0, 3), 0);
    }
}
