//! Depth-first branch and bound over finite domains.
//!
//! Small domains are kept as explicit value sets and filtered to a fixpoint
//! after every decision: a value survives only if each constraint on its
//! variable stays satisfiable, in interval arithmetic, with the value fixed.
//! Large ranges are only bounds-checked. Variables are branched in the
//! model's branch order, values in ascending order. Before the exhaustive
//! search, a greedy dive that picks the value with the lowest objective
//! bound at each step seeds the incumbent; a branch is cut once the
//! objective's lower bound cannot beat it.

use super::{Assignment, Domain, Interval, Model, SolveOptions, SolverBackend, VarId};
use crate::utils::errors::{SolveError, SolveErrorKind};
use log::{debug, trace};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Domains up to this size are filtered value by value.
const MAX_FILTERED_VALUES: usize = 64;

/// The reference backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct BranchAndBoundSolver;

impl BranchAndBoundSolver {
    /// Create the solver.
    pub fn new() -> Self {
        Self
    }
}

impl SolverBackend for BranchAndBoundSolver {
    fn solve(&self, model: &Model, options: &SolveOptions) -> Result<Assignment, SolveError> {
        let mut search = Search::new(model, options)?;
        search.run()
    }

    fn name(&self) -> &'static str {
        "branch-and-bound"
    }
}

/// Current domains of every variable.
#[derive(Debug, Clone)]
struct State {
    bounds: Vec<Interval>,
    /// Remaining values of small domains, `None` for large ranges
    sets: Vec<Option<Vec<i64>>>,
}

impl State {
    fn is_fixed(&self, var: usize) -> bool {
        self.bounds[var].lo == self.bounds[var].hi
    }

    fn values(&self, var: usize) -> Vec<i64> {
        match &self.sets[var] {
            Some(set) => set.clone(),
            None => (self.bounds[var].lo..=self.bounds[var].hi).collect(),
        }
    }

    fn fix(&mut self, var: usize, value: i64) {
        self.bounds[var] = Interval::point(value);
        if let Some(set) = &mut self.sets[var] {
            *set = vec![value];
        }
    }
}

struct Search<'m> {
    model: &'m Model,
    /// Constraints mentioning each variable
    watchers: Vec<Vec<usize>>,
    /// Variables of each constraint
    scopes: Vec<Vec<usize>>,
    order: Vec<usize>,
    best: Option<(Vec<i64>, i64)>,
    nodes: u64,
    max_nodes: u64,
    deadline: Option<Instant>,
    stopped: bool,
}

impl<'m> Search<'m> {
    fn new(model: &'m Model, options: &SolveOptions) -> Result<Self, SolveError> {
        let num_vars = model.vars().len();
        for var in model.vars() {
            if var.domain.hull().is_none() {
                return Err(SolveError {
                    message: format!("variable {} has an empty domain", var.name),
                    kind: SolveErrorKind::InvalidModel,
                });
            }
        }

        let mut watchers = vec![Vec::new(); num_vars];
        let mut scopes = Vec::with_capacity(model.constraints().len());
        for (ci, constraint) in model.constraints().iter().enumerate() {
            let mut vars = Vec::new();
            constraint.expr.collect_vars(&mut vars);
            vars.sort();
            vars.dedup();
            let mut scope = Vec::with_capacity(vars.len());
            for VarId(v) in vars {
                if v >= num_vars {
                    return Err(SolveError {
                        message: format!("constraint {} references unknown variable v{}", ci, v),
                        kind: SolveErrorKind::InvalidModel,
                    });
                }
                watchers[v].push(ci);
                scope.push(v);
            }
            scopes.push(scope);
        }

        let mut listed = vec![false; num_vars];
        let mut order = Vec::with_capacity(num_vars);
        for &VarId(v) in model.branch_order() {
            if v >= num_vars {
                return Err(SolveError {
                    message: format!("branch order references unknown variable v{}", v),
                    kind: SolveErrorKind::InvalidModel,
                });
            }
            if !listed[v] {
                listed[v] = true;
                order.push(v);
            }
        }
        order.extend((0..num_vars).filter(|&v| !listed[v]));

        Ok(Self {
            model,
            watchers,
            scopes,
            order,
            best: None,
            nodes: 0,
            max_nodes: options.max_nodes,
            deadline: options.time_limit_ms.map(|ms| Instant::now() + Duration::from_millis(ms)),
            stopped: false,
        })
    }

    fn initial_state(&self) -> State {
        let mut bounds = Vec::with_capacity(self.model.vars().len());
        let mut sets = Vec::with_capacity(self.model.vars().len());
        for var in self.model.vars() {
            let hull = var.domain.hull().unwrap_or(Interval::point(0));
            bounds.push(hull);
            sets.push(match &var.domain {
                Domain::Values(vs) => Some(vs.clone()),
                d if d.len() <= MAX_FILTERED_VALUES => Some((hull.lo..=hull.hi).collect()),
                _ => None,
            });
        }
        State { bounds, sets }
    }

    fn run(&mut self) -> Result<Assignment, SolveError> {
        let model = self.model;
        debug!(
            "solving model: {} vars, {} constraints",
            model.vars().len(),
            model.constraints().len()
        );

        let mut root = self.initial_state();
        let all: Vec<usize> = (0..model.constraints().len()).collect();
        if self.propagate(&mut root, &all) {
            self.dive(root.clone());
            if let Some((_, objective)) = &self.best {
                debug!("dive found incumbent {} after {} nodes", objective, self.nodes);
            }
            if model.objective().is_some() || self.best.is_none() {
                self.dfs(root);
            }
        }

        match self.best.take() {
            Some((values, objective)) => Ok(Assignment {
                values,
                objective: model.objective().map(|_| objective),
                proven_optimal: !self.stopped,
                nodes: self.nodes,
            }),
            None if self.stopped => Err(SolveError {
                message: format!(
                    "search budget exhausted after {} nodes without a solution; raise --max-nodes or the time limit",
                    self.nodes
                ),
                kind: SolveErrorKind::LimitReached,
            }),
            None => Err(SolveError {
                message: "model is infeasible".to_string(),
                kind: SolveErrorKind::Infeasible,
            }),
        }
    }

    fn budget_exhausted(&mut self) -> bool {
        if self.stopped {
            return true;
        }
        self.nodes += 1;
        if self.nodes > self.max_nodes {
            self.stopped = true;
        } else if self.nodes % 1024 == 0 {
            if let Some(deadline) = self.deadline {
                if Instant::now() >= deadline {
                    self.stopped = true;
                }
            }
        }
        self.stopped
    }

    /// Filter domains until no constraint removes a value. Returns `false`
    /// when some constraint can no longer be satisfied.
    fn propagate(&self, state: &mut State, seed: &[usize]) -> bool {
        let constraints = self.model.constraints();
        let mut queued = vec![false; constraints.len()];
        let mut queue = VecDeque::with_capacity(seed.len());
        for &ci in seed {
            if !queued[ci] {
                queued[ci] = true;
                queue.push_back(ci);
            }
        }

        let State { bounds, sets } = state;
        while let Some(ci) = queue.pop_front() {
            queued[ci] = false;
            let c = &constraints[ci];
            let range = c.expr.bounds(&bounds[..]);
            if !c.relation.satisfiable(range, c.bound) {
                return false;
            }
            if c.relation.entailed(range, c.bound) {
                continue;
            }
            for &v in &self.scopes[ci] {
                let Some(set) = &mut sets[v] else { continue };
                if set.len() < 2 {
                    continue;
                }
                let saved = bounds[v];
                let before = set.len();
                set.retain(|&x| {
                    bounds[v] = Interval::point(x);
                    c.relation.satisfiable(c.expr.bounds(&bounds[..]), c.bound)
                });
                bounds[v] = saved;
                if set.len() == before {
                    continue;
                }
                let (Some(&lo), Some(&hi)) = (set.first(), set.last()) else {
                    return false;
                };
                bounds[v] = Interval::new(lo, hi);
                for &w in &self.watchers[v] {
                    if !queued[w] {
                        queued[w] = true;
                        queue.push_back(w);
                    }
                }
            }
        }
        true
    }

    fn next_var(&self, state: &State) -> Option<usize> {
        self.order.iter().copied().find(|&v| !state.is_fixed(v))
    }

    fn objective_floor(&self, state: &State) -> i64 {
        self.model.objective().map_or(0, |o| o.bounds(&state.bounds).lo)
    }

    fn dominated(&self, state: &State) -> bool {
        match (self.model.objective(), &self.best) {
            (Some(_), Some((_, best))) => self.objective_floor(state) >= *best,
            _ => false,
        }
    }

    /// Branch on `var = value` and filter.
    fn child(&self, state: &State, var: usize, value: i64) -> Option<State> {
        let mut child = state.clone();
        child.fix(var, value);
        self.propagate(&mut child, &self.watchers[var]).then_some(child)
    }

    /// One pass without backtracking, taking at each variable the value whose
    /// filtered state has the smallest objective bound.
    fn dive(&mut self, mut state: State) {
        while let Some(var) = self.next_var(&state) {
            if self.budget_exhausted() {
                return;
            }
            let greedy = self.model.objective().is_some() && state.sets[var].is_some();
            let mut pick: Option<(i64, State)> = None;
            for value in state.values(var) {
                let Some(child) = self.child(&state, var, value) else { continue };
                let floor = self.objective_floor(&child);
                if pick.as_ref().map_or(true, |(f, _)| floor < *f) {
                    pick = Some((floor, child));
                }
                if !greedy {
                    break;
                }
            }
            match pick {
                Some((_, child)) => state = child,
                None => {
                    trace!("dive failed at {} after {} nodes", self.model.var_name(VarId(var)), self.nodes);
                    return;
                }
            }
        }
        self.record(&state);
    }

    fn dfs(&mut self, state: State) {
        if self.budget_exhausted() || self.dominated(&state) {
            return;
        }
        let Some(var) = self.next_var(&state) else {
            self.record(&state);
            return;
        };

        for value in state.values(var) {
            let Some(child) = self.child(&state, var, value) else { continue };
            if self.dominated(&child) {
                continue;
            }
            self.dfs(child);
            if self.stopped || (self.model.objective().is_none() && self.best.is_some()) {
                break;
            }
        }
    }

    fn record(&mut self, state: &State) {
        let values: Vec<i64> = state.bounds.iter().map(|b| b.lo).collect();
        let satisfied = self.model.constraints()
            .iter()
            .all(|c| c.relation.holds(c.expr.eval(&values), c.bound));
        if !satisfied {
            return;
        }
        let objective = self.model.objective().map_or(0, |o| o.eval(&values));
        let improves = self.best.as_ref().map_or(true, |(_, best)| objective < *best);
        if improves {
            trace!("incumbent {} after {} nodes", objective, self.nodes);
            self.best = Some((values, objective));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::{IntExpr, Relation};

    #[test]
    fn test_satisfaction() {
        let mut model = Model::new();
        let x = model.add_int_var(1, 10, "x");
        let y = model.add_int_var(1, 10, "y");
        model.add_constraint(IntExpr::var(x) * IntExpr::var(y), Relation::Eq, 12);
        model.add_constraint(IntExpr::var(x), Relation::Ge, 3);

        let a = BranchAndBoundSolver::new().solve(&model, &SolveOptions::default()).unwrap();
        assert_eq!(a.value(x), 3);
        assert_eq!(a.value(y), 4);
        assert!(a.objective.is_none());
    }

    #[test]
    fn test_minimization() {
        // minimize max(x, 24 / x) over divisors of 24
        let mut model = Model::new();
        let x = model.add_int_var_with_values(vec![1, 2, 3, 4, 6, 8, 12, 24], "x");
        let y = model.add_int_var_with_values(vec![1, 2, 3, 4, 6, 8, 12, 24], "y");
        model.add_constraint(IntExpr::var(x) * IntExpr::var(y), Relation::Eq, 24);
        model.minimize(IntExpr::max([IntExpr::var(x), IntExpr::var(y)]));

        let a = BranchAndBoundSolver::new().solve(&model, &SolveOptions::default()).unwrap();
        assert_eq!(a.objective, Some(6));
        assert!(a.proven_optimal);
        assert_eq!(a.value(x) * a.value(y), 24);
    }

    #[test]
    fn test_product_filters_divisors() {
        let mut model = Model::new();
        let x = model.add_int_var_with_values(vec![1, 2, 4, 8, 16], "x");
        let y = model.add_int_var_with_values(vec![1, 2, 4, 8, 16], "y");
        model.add_constraint(IntExpr::var(x) * IntExpr::var(y), Relation::Eq, 16);
        model.add_constraint(IntExpr::var(y), Relation::Le, 2);

        let search = Search::new(&model, &SolveOptions::default()).unwrap();
        let mut state = search.initial_state();
        assert!(search.propagate(&mut state, &[0, 1]));
        assert_eq!(state.sets[y.0], Some(vec![1, 2]));
        assert_eq!(state.sets[x.0], Some(vec![8, 16]));
        assert_eq!(state.bounds[x.0], Interval::new(8, 16));

        state.fix(y.0, 2);
        assert!(search.propagate(&mut state, &search.watchers[y.0]));
        assert!(state.is_fixed(x.0));
        assert_eq!(state.bounds[x.0].lo, 8);
    }

    #[test]
    fn test_branch_order() {
        // the first satisfying assignment follows the branch order
        let mut model = Model::new();
        let a = model.add_bool_var("a");
        let b = model.add_bool_var("b");
        model.add_constraint(IntExpr::var(a) + IntExpr::var(b), Relation::Eq, 1);

        let first = BranchAndBoundSolver::new().solve(&model, &SolveOptions::default()).unwrap();
        assert_eq!((first.value(a), first.value(b)), (0, 1));

        model.set_branch_order(vec![b]);
        let second = BranchAndBoundSolver::new().solve(&model, &SolveOptions::default()).unwrap();
        assert_eq!((second.value(a), second.value(b)), (1, 0));
    }

    #[test]
    fn test_dive_seeds_incumbent() {
        // the cheapest value is last in ascending order
        let mut model = Model::new();
        let xs: Vec<_> = (0..8).map(|i| model.add_int_var_with_values(vec![1, 2, 3, 4], format!("x{}", i))).collect();
        model.minimize(IntExpr::sum(xs.iter().map(|&x| IntExpr::var(x).scale(-1))));

        let a = BranchAndBoundSolver::new().solve(&model, &SolveOptions::default()).unwrap();
        assert_eq!(a.objective, Some(-32));
        assert!(a.proven_optimal);
        // the dive walks straight down and the root is then dominated
        assert_eq!(a.nodes, 9);
    }

    #[test]
    fn test_large_range_is_bounds_checked() {
        let mut model = Model::new();
        let x = model.add_int_var(1, 10_000, "x");
        model.add_constraint(IntExpr::var(x).scale(3), Relation::Ge, 3_000);
        let a = BranchAndBoundSolver::new().solve(&model, &SolveOptions::default()).unwrap();
        assert_eq!(a.value(x), 1_000);
    }

    #[test]
    fn test_time_limit() {
        let options = SolveOptions::default().time_limit(Duration::from_secs(10));
        assert_eq!(options.time_limit_ms, Some(10_000));

        let mut model = Model::new();
        let x = model.add_int_var(1, 6, "x");
        model.minimize(IntExpr::var(x));
        let a = BranchAndBoundSolver::new().solve(&model, &options).unwrap();
        assert_eq!(a.value(x), 1);
        assert!(a.proven_optimal);
    }

    #[test]
    fn test_infeasible() {
        let mut model = Model::new();
        let b = model.add_bool_var("b");
        model.add_constraint(IntExpr::var(b), Relation::Ge, 2);
        let err = BranchAndBoundSolver::new().solve(&model, &SolveOptions::default()).unwrap_err();
        assert_eq!(err.kind, SolveErrorKind::Infeasible);
    }

    #[test]
    fn test_node_limit() {
        let mut model = Model::new();
        let vars: Vec<_> = (0..12).map(|i| model.add_bool_var(format!("b{}", i))).collect();
        // thirteen ones cannot come from twelve booleans
        model.add_constraint(
            IntExpr::sum(vars.iter().map(|&v| IntExpr::var(v))),
            Relation::Eq,
            13,
        );
        let err = BranchAndBoundSolver::new()
            .solve(&model, &SolveOptions::default().max_nodes(5))
            .unwrap_err();
        assert_eq!(err.kind, SolveErrorKind::Infeasible);

        let mut hard = Model::new();
        let xs: Vec<_> = (0..6).map(|i| hard.add_int_var(0, 9, format!("x{}", i))).collect();
        hard.add_constraint(
            IntExpr::product(xs.iter().map(|&v| IntExpr::var(v))),
            Relation::Eq,
            7 * 7 * 7 * 7 * 7 * 7,
        );
        hard.minimize(IntExpr::var(xs[0]));
        let err = BranchAndBoundSolver::new()
            .solve(&hard, &SolveOptions::default().max_nodes(10))
            .unwrap_err();
        assert_eq!(err.kind, SolveErrorKind::LimitReached);
        assert!(err.message.contains("--max-nodes"));
    }

    #[test]
    fn test_empty_domain() {
        let mut model = Model::new();
        model.add_int_var(5, 1, "x");
        let err = BranchAndBoundSolver::new().solve(&model, &SolveOptions::default()).unwrap_err();
        assert_eq!(err.kind, SolveErrorKind::InvalidModel);
    }
}
