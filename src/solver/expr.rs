//! Integer expressions over solver variables and their interval bounds.

use super::VarId;
use std::fmt;
use std::ops::{Add, Mul};

/// A closed integer interval `[lo, hi]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    /// Lower bound
    pub lo: i64,
    /// Upper bound
    pub hi: i64,
}

impl Interval {
    /// Create an interval.
    pub fn new(lo: i64, hi: i64) -> Self {
        Self { lo, hi }
    }

    /// The interval holding exactly one value.
    pub fn point(v: i64) -> Self {
        Self { lo: v, hi: v }
    }

    fn add(self, other: Interval) -> Interval {
        Interval::new(self.lo.saturating_add(other.lo), self.hi.saturating_add(other.hi))
    }

    fn mul(self, other: Interval) -> Interval {
        let candidates = [
            self.lo.saturating_mul(other.lo),
            self.lo.saturating_mul(other.hi),
            self.hi.saturating_mul(other.lo),
            self.hi.saturating_mul(other.hi),
        ];
        Interval::new(
            candidates.iter().copied().min().unwrap_or(0),
            candidates.iter().copied().max().unwrap_or(0),
        )
    }

    fn scale(self, k: i64) -> Interval {
        let a = self.lo.saturating_mul(k);
        let b = self.hi.saturating_mul(k);
        Interval::new(a.min(b), a.max(b))
    }

    fn max(self, other: Interval) -> Interval {
        Interval::new(self.lo.max(other.lo), self.hi.max(other.hi))
    }
}

fn ceil_div_signed(a: i64, d: i64) -> i64 {
    -((-a).div_euclid(d))
}

/// An integer-valued expression.
///
/// Constructors fold constants and flatten nested sums and products, so
/// trees built from mostly-constant pieces stay small.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntExpr {
    /// A constant
    Const(i64),
    /// A model variable
    Var(VarId),
    /// Sum of terms
    Sum(Vec<IntExpr>),
    /// Constant multiple of a term
    Scale(i64, Box<IntExpr>),
    /// Product of factors
    Product(Vec<IntExpr>),
    /// Maximum of terms
    Max(Vec<IntExpr>),
    /// Ceiling division by a positive constant
    CeilDiv(Box<IntExpr>, i64),
}

impl IntExpr {
    /// A constant expression.
    pub fn constant(v: i64) -> Self {
        IntExpr::Const(v)
    }

    /// A variable reference.
    pub fn var(v: VarId) -> Self {
        IntExpr::Var(v)
    }

    /// Sum of terms.
    pub fn sum<I: IntoIterator<Item = IntExpr>>(terms: I) -> Self {
        let mut constant = 0i64;
        let mut rest = Vec::new();
        for term in terms {
            match term {
                IntExpr::Const(v) => constant = constant.saturating_add(v),
                IntExpr::Sum(inner) => {
                    for t in inner {
                        match t {
                            IntExpr::Const(v) => constant = constant.saturating_add(v),
                            other => rest.push(other),
                        }
                    }
                }
                other => rest.push(other),
            }
        }
        if constant != 0 {
            rest.push(IntExpr::Const(constant));
        }
        match rest.len() {
            0 => IntExpr::Const(0),
            1 => rest.pop().unwrap_or(IntExpr::Const(0)),
            _ => IntExpr::Sum(rest),
        }
    }

    /// Product of factors.
    pub fn product<I: IntoIterator<Item = IntExpr>>(factors: I) -> Self {
        let mut constant = 1i64;
        let mut rest = Vec::new();
        for factor in factors {
            match factor {
                IntExpr::Const(v) => constant = constant.saturating_mul(v),
                IntExpr::Product(inner) => {
                    for f in inner {
                        match f {
                            IntExpr::Const(v) => constant = constant.saturating_mul(v),
                            other => rest.push(other),
                        }
                    }
                }
                other => rest.push(other),
            }
        }
        if constant == 0 {
            return IntExpr::Const(0);
        }
        let body = match rest.len() {
            0 => return IntExpr::Const(constant),
            1 => rest.pop().unwrap_or(IntExpr::Const(1)),
            _ => IntExpr::Product(rest),
        };
        body.scale(constant)
    }

    /// Maximum of terms.
    pub fn max<I: IntoIterator<Item = IntExpr>>(terms: I) -> Self {
        let mut constant: Option<i64> = None;
        let mut rest = Vec::new();
        for term in terms {
            match term {
                IntExpr::Const(v) => constant = Some(constant.map_or(v, |c| c.max(v))),
                other => rest.push(other),
            }
        }
        if let Some(c) = constant {
            if rest.is_empty() {
                return IntExpr::Const(c);
            }
            rest.push(IntExpr::Const(c));
        }
        match rest.len() {
            0 => IntExpr::Const(0),
            1 => rest.pop().unwrap_or(IntExpr::Const(0)),
            _ => IntExpr::Max(rest),
        }
    }

    /// Ceiling division by a positive constant.
    pub fn ceil_div(self, divisor: i64) -> Self {
        debug_assert!(divisor > 0);
        match self {
            _ if divisor == 1 => self,
            IntExpr::Const(v) => IntExpr::Const(ceil_div_signed(v, divisor)),
            other => IntExpr::CeilDiv(Box::new(other), divisor),
        }
    }

    /// Multiply by a constant.
    pub fn scale(self, k: i64) -> Self {
        match (k, self) {
            (0, _) => IntExpr::Const(0),
            (1, e) => e,
            (k, IntExpr::Const(v)) => IntExpr::Const(v.saturating_mul(k)),
            (k, IntExpr::Scale(j, inner)) => IntExpr::Scale(k.saturating_mul(j), inner),
            (k, e) => IntExpr::Scale(k, Box::new(e)),
        }
    }

    /// Collect the variables the expression mentions.
    pub fn collect_vars(&self, out: &mut Vec<VarId>) {
        match self {
            IntExpr::Const(_) => {}
            IntExpr::Var(v) => out.push(*v),
            IntExpr::Sum(ts) | IntExpr::Product(ts) | IntExpr::Max(ts) => {
                for t in ts {
                    t.collect_vars(out);
                }
            }
            IntExpr::Scale(_, e) | IntExpr::CeilDiv(e, _) => e.collect_vars(out),
        }
    }

    /// Evaluate with every variable assigned.
    pub fn eval(&self, values: &[i64]) -> i64 {
        match self {
            IntExpr::Const(v) => *v,
            IntExpr::Var(v) => values[v.0],
            IntExpr::Sum(ts) => ts.iter().fold(0i64, |acc, t| acc.saturating_add(t.eval(values))),
            IntExpr::Product(ts) => ts.iter().fold(1i64, |acc, t| acc.saturating_mul(t.eval(values))),
            IntExpr::Max(ts) => ts.iter().map(|t| t.eval(values)).max().unwrap_or(0),
            IntExpr::Scale(k, e) => e.eval(values).saturating_mul(*k),
            IntExpr::CeilDiv(e, d) => ceil_div_signed(e.eval(values), *d),
        }
    }

    /// Bounds of the expression given bounds of each variable.
    pub fn bounds(&self, domains: &[Interval]) -> Interval {
        match self {
            IntExpr::Const(v) => Interval::point(*v),
            IntExpr::Var(v) => domains[v.0],
            IntExpr::Sum(ts) => ts.iter()
                .fold(Interval::point(0), |acc, t| acc.add(t.bounds(domains))),
            IntExpr::Product(ts) => ts.iter()
                .fold(Interval::point(1), |acc, t| acc.mul(t.bounds(domains))),
            IntExpr::Max(ts) => {
                let mut iter = ts.iter().map(|t| t.bounds(domains));
                match iter.next() {
                    Some(first) => iter.fold(first, Interval::max),
                    None => Interval::point(0),
                }
            }
            IntExpr::Scale(k, e) => e.bounds(domains).scale(*k),
            IntExpr::CeilDiv(e, d) => {
                let b = e.bounds(domains);
                Interval::new(ceil_div_signed(b.lo, *d), ceil_div_signed(b.hi, *d))
            }
        }
    }
}

impl From<i64> for IntExpr {
    fn from(v: i64) -> Self {
        IntExpr::Const(v)
    }
}

impl From<VarId> for IntExpr {
    fn from(v: VarId) -> Self {
        IntExpr::Var(v)
    }
}

impl Add for IntExpr {
    type Output = IntExpr;

    fn add(self, other: IntExpr) -> IntExpr {
        IntExpr::sum([self, other])
    }
}

impl Mul for IntExpr {
    type Output = IntExpr;

    fn mul(self, other: IntExpr) -> IntExpr {
        IntExpr::product([self, other])
    }
}

impl fmt::Display for IntExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(f: &mut fmt::Formatter<'_>, ts: &[IntExpr], sep: &str) -> fmt::Result {
            for (i, t) in ts.iter().enumerate() {
                if i > 0 {
                    write!(f, "{}", sep)?;
                }
                write!(f, "{}", t)?;
            }
            Ok(())
        }
        match self {
            IntExpr::Const(v) => write!(f, "{}", v),
            IntExpr::Var(v) => write!(f, "{}", v),
            IntExpr::Sum(ts) => {
                write!(f, "(")?;
                join(f, ts, " + ")?;
                write!(f, ")")
            }
            IntExpr::Product(ts) => join(f, ts, "*"),
            IntExpr::Max(ts) => {
                write!(f, "max(")?;
                join(f, ts, ", ")?;
                write!(f, ")")
            }
            IntExpr::Scale(k, e) => write!(f, "{}*{}", k, e),
            IntExpr::CeilDiv(e, d) => write!(f, "ceil({} / {})", e, d),
        }
    }
}
