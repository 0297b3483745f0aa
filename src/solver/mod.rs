//! Abstract integer constraint model and a reference branch-and-bound backend.
//!
//! A [`Model`] holds integer and boolean variables with finite domains,
//! constraints of the form `expr REL bound`, and an optional objective to
//! minimize. Models are built once per schedulable region and thrown away
//! after solving. Backends implement [`SolverBackend`]; the bundled
//! [`BranchAndBoundSolver`] is deterministic and complete within its budget.

pub mod expr;
pub mod search;

pub use expr::{IntExpr, Interval};
pub use search::BranchAndBoundSolver;

use crate::utils::errors::SolveError;
use serde::{Serialize, Deserialize};
use std::fmt;
use std::time::Duration;

/// Handle of a model variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarId(pub usize);

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Finite domain of a variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Domain {
    /// Every integer in `[lo, hi]`
    Range(i64, i64),
    /// An explicit ascending set of values
    Values(Vec<i64>),
}

impl Domain {
    /// Smallest and largest value.
    pub fn hull(&self) -> Option<Interval> {
        match self {
            Domain::Range(lo, hi) if lo <= hi => Some(Interval::new(*lo, *hi)),
            Domain::Range(..) => None,
            Domain::Values(vs) => match (vs.first(), vs.last()) {
                (Some(&lo), Some(&hi)) => Some(Interval::new(lo, hi)),
                _ => None,
            },
        }
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        match self {
            Domain::Range(lo, hi) if lo <= hi => (hi - lo + 1) as usize,
            Domain::Range(..) => 0,
            Domain::Values(vs) => vs.len(),
        }
    }

    /// Whether the domain has no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `i`-th value in ascending order.
    pub fn nth(&self, i: usize) -> Option<i64> {
        match self {
            Domain::Range(lo, hi) => {
                let v = lo.checked_add(i as i64)?;
                (v <= *hi).then_some(v)
            }
            Domain::Values(vs) => vs.get(i).copied(),
        }
    }
}

/// A model variable.
#[derive(Debug, Clone)]
pub struct Variable {
    /// Name used in diagnostics
    pub name: String,
    /// Values the variable may take
    pub domain: Domain,
}

/// Comparison of a constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relation {
    /// `expr == bound`
    Eq,
    /// `expr <= bound`
    Le,
    /// `expr >= bound`
    Ge,
}

impl Relation {
    /// Whether a value satisfies the relation.
    pub fn holds(self, value: i64, bound: i64) -> bool {
        match self {
            Relation::Eq => value == bound,
            Relation::Le => value <= bound,
            Relation::Ge => value >= bound,
        }
    }

    /// Whether some value in the interval could satisfy the relation.
    pub fn satisfiable(self, range: Interval, bound: i64) -> bool {
        match self {
            Relation::Eq => range.lo <= bound && bound <= range.hi,
            Relation::Le => range.lo <= bound,
            Relation::Ge => range.hi >= bound,
        }
    }

    /// Whether every value in the interval satisfies the relation.
    pub fn entailed(self, range: Interval, bound: i64) -> bool {
        match self {
            Relation::Eq => range.lo == bound && range.hi == bound,
            Relation::Le => range.hi <= bound,
            Relation::Ge => range.lo >= bound,
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Relation::Eq => write!(f, "=="),
            Relation::Le => write!(f, "<="),
            Relation::Ge => write!(f, ">="),
        }
    }
}

/// A constraint `expr REL bound`.
#[derive(Debug, Clone)]
pub struct Constraint {
    /// Left-hand side
    pub expr: IntExpr,
    /// Comparison
    pub relation: Relation,
    /// Right-hand side
    pub bound: i64,
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.expr, self.relation, self.bound)
    }
}

/// A constraint model.
#[derive(Debug, Clone, Default)]
pub struct Model {
    vars: Vec<Variable>,
    constraints: Vec<Constraint>,
    objective: Option<IntExpr>,
    branch_order: Vec<VarId>,
}

impl Model {
    /// Create an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an integer variable ranging over `[lb, ub]`.
    pub fn add_int_var(&mut self, lb: i64, ub: i64, name: impl Into<String>) -> VarId {
        self.push_var(name.into(), Domain::Range(lb, ub))
    }

    /// Add an integer variable restricted to the given values.
    pub fn add_int_var_with_values(&mut self, mut values: Vec<i64>, name: impl Into<String>) -> VarId {
        values.sort_unstable();
        values.dedup();
        self.push_var(name.into(), Domain::Values(values))
    }

    /// Add a 0/1 variable.
    pub fn add_bool_var(&mut self, name: impl Into<String>) -> VarId {
        self.push_var(name.into(), Domain::Range(0, 1))
    }

    fn push_var(&mut self, name: String, domain: Domain) -> VarId {
        let id = VarId(self.vars.len());
        self.vars.push(Variable { name, domain });
        id
    }

    /// Add the constraint `expr REL bound`.
    pub fn add_constraint(&mut self, expr: IntExpr, relation: Relation, bound: i64) {
        self.constraints.push(Constraint { expr, relation, bound });
    }

    /// Minimize the given expression.
    pub fn minimize(&mut self, objective: IntExpr) {
        self.objective = Some(objective);
    }

    /// Branch on these variables first, in this order. Variables left out
    /// follow in creation order.
    pub fn set_branch_order(&mut self, order: Vec<VarId>) {
        self.branch_order = order;
    }

    /// The preferred branching order.
    pub fn branch_order(&self) -> &[VarId] {
        &self.branch_order
    }

    /// The variables in creation order.
    pub fn vars(&self) -> &[Variable] {
        &self.vars
    }

    /// The constraints in insertion order.
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// The objective, if any.
    pub fn objective(&self) -> Option<&IntExpr> {
        self.objective.as_ref()
    }

    /// Name of a variable.
    pub fn var_name(&self, var: VarId) -> &str {
        &self.vars[var.0].name
    }
}

/// A complete assignment found by a backend.
#[derive(Debug, Clone)]
pub struct Assignment {
    values: Vec<i64>,
    /// Objective value, when the model has one
    pub objective: Option<i64>,
    /// Whether the search proved no better assignment exists
    pub proven_optimal: bool,
    /// Search nodes visited
    pub nodes: u64,
}

impl Assignment {
    /// Value of a variable.
    pub fn value(&self, var: VarId) -> i64 {
        self.values[var.0]
    }

    /// Whether a boolean variable is set.
    pub fn is_true(&self, var: VarId) -> bool {
        self.values[var.0] != 0
    }

    /// Evaluate an expression under the assignment.
    pub fn eval(&self, expr: &IntExpr) -> i64 {
        expr.eval(&self.values)
    }
}

/// Limits for one solve call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolveOptions {
    /// Maximum number of search nodes
    pub max_nodes: u64,
    /// Wall-clock limit in milliseconds
    pub time_limit_ms: Option<u64>,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            max_nodes: 500_000,
            time_limit_ms: None,
        }
    }
}

impl SolveOptions {
    /// Set the node budget.
    pub fn max_nodes(mut self, nodes: u64) -> Self {
        self.max_nodes = nodes;
        self
    }

    /// Set the time limit.
    pub fn time_limit(mut self, limit: Duration) -> Self {
        self.time_limit_ms = Some(limit.as_millis() as u64);
        self
    }
}

/// A constraint solver.
pub trait SolverBackend {
    /// Find an assignment satisfying every constraint, minimizing the
    /// objective if the model has one.
    fn solve(&self, model: &Model, options: &SolveOptions) -> Result<Assignment, SolveError>;

    /// Get the backend name.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain() {
        let range = Domain::Range(2, 5);
        assert_eq!(range.len(), 4);
        assert_eq!(range.nth(3), Some(5));
        assert_eq!(range.nth(4), None);
        assert_eq!(range.hull(), Some(Interval::new(2, 5)));

        let values = Domain::Values(vec![1, 2, 4, 8]);
        assert_eq!(values.nth(2), Some(4));
        assert!(Domain::Values(Vec::new()).is_empty());
        assert!(Domain::Range(3, 1).hull().is_none());
    }

    #[test]
    fn test_relation() {
        assert!(Relation::Le.holds(3, 4));
        assert!(!Relation::Eq.satisfiable(Interval::new(5, 9), 4));
        assert!(Relation::Ge.satisfiable(Interval::new(0, 4), 4));
        assert!(Relation::Le.entailed(Interval::new(0, 4), 4));
        assert!(!Relation::Eq.entailed(Interval::new(4, 5), 4));
        assert!(Relation::Eq.entailed(Interval::point(4), 4));
    }

    #[test]
    fn test_model_building() {
        let mut model = Model::new();
        let x = model.add_int_var_with_values(vec![4, 1, 2, 2], "x");
        let b = model.add_bool_var("b");
        model.add_constraint(IntExpr::var(x) + IntExpr::var(b), Relation::Le, 3);
        assert_eq!(model.vars()[x.0].domain, Domain::Values(vec![1, 2, 4]));
        assert_eq!(model.var_name(b), "b");
        assert_eq!(model.constraints()[0].to_string(), "(v0 + v1) <= 3");
    }
}
