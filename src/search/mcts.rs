//! Monte-Carlo tree search over merge points.
//!
//! Every search node owns a snapshot of the tile graph and the merge points
//! not yet tried from it. Expanding a node applies one of those points to a
//! clone of its graph; simulating a node solves the graph once and uses the
//! objective as the reward. Lower rewards are better and a graph without a
//! valid schedule scores infinity.

use super::config::SearchConfig;
use crate::schedule::{SchedulerSession, SolvedSchedule};
use crate::tile::graph::TileGraph;
use crate::tile::merge::{GraphMerger, MergePoint, MergePointCollector};
use crate::utils::errors::{ScheduleError, ScheduleResult, SolveError, SolveErrorKind};
use log::{debug, info, trace};
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;
use std::collections::BTreeSet;
use std::rc::Rc;

/// Statistics of one search iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationStats {
    /// Iteration number
    pub iteration: usize,
    /// Reward of the simulated node
    pub reward: f64,
    /// Best reward so far
    pub best: f64,
    /// Number of merges applied on the path to the simulated node
    pub depth: usize,
    /// Nodes in the search tree
    pub tree_size: usize,
}

/// Result of a search.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    /// The best merged graph
    pub graph: TileGraph,
    /// Its objective
    pub objective: i64,
    /// Its schedule
    pub schedule: Rc<SolvedSchedule>,
    /// Merge points applied to the input graph, in order
    pub actions: Vec<MergePoint>,
    /// One entry per iteration
    pub history: Vec<IterationStats>,
    /// Nodes in the final search tree
    pub tree_size: usize,
}

struct SearchNode {
    graph: TileGraph,
    remaining: Vec<MergePoint>,
    consumed: BTreeSet<MergePoint>,
    action: Option<MergePoint>,
    parent: Option<usize>,
    children: Vec<usize>,
    visits: u32,
    quality: f64,
    reward: Option<f64>,
}

impl SearchNode {
    fn new(graph: TileGraph, consumed: BTreeSet<MergePoint>, action: Option<MergePoint>, parent: Option<usize>) -> Self {
        let remaining = MergePointCollector::new(&graph)
            .collect_all()
            .into_iter()
            .filter(|p| !consumed.contains(p))
            .collect();
        Self {
            graph,
            remaining,
            consumed,
            action,
            parent,
            children: Vec::new(),
            visits: 0,
            quality: f64::INFINITY,
            reward: None,
        }
    }
}

/// Monte-Carlo tree search driving a scheduler session.
pub struct MonteCarloSearch<'s, R: Rng = StdRng> {
    session: &'s mut SchedulerSession,
    config: SearchConfig,
    rng: R,
    merger: GraphMerger,
    nodes: Vec<SearchNode>,
    best: Option<(usize, Rc<SolvedSchedule>)>,
}

impl<'s> MonteCarloSearch<'s, StdRng> {
    /// Create a search seeded from the config.
    pub fn new(session: &'s mut SchedulerSession, config: SearchConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self::with_rng(session, config, rng)
    }
}

impl<'s, R: Rng> MonteCarloSearch<'s, R> {
    /// Create a search drawing from `rng`.
    pub fn with_rng(session: &'s mut SchedulerSession, config: SearchConfig, rng: R) -> Self {
        Self {
            session,
            config,
            rng,
            merger: GraphMerger::new(),
            nodes: Vec::new(),
            best: None,
        }
    }

    /// Search merges of `graph`. The graph itself is left untouched.
    pub fn run(mut self, graph: &TileGraph) -> ScheduleResult<SearchOutcome> {
        self.nodes.push(SearchNode::new(graph.clone(), BTreeSet::new(), None, None));
        debug!(
            "search over {} ops: {} initial merge points, {} iterations",
            graph.num_ops(),
            self.nodes[0].remaining.len(),
            self.config.iterations
        );

        let mut history = Vec::with_capacity(self.config.iterations.max(1));
        for iteration in 0..self.config.iterations.max(1) {
            let id = self.select();
            let reward = self.simulate(id)?;
            self.backpropagate(id, reward);

            let stats = IterationStats {
                iteration,
                reward,
                best: self.best_reward(),
                depth: self.depth(id),
                tree_size: self.nodes.len(),
            };
            trace!("iteration {}: {:?}", iteration, stats);
            history.push(stats);
        }

        let Some((best, schedule)) = self.best.take() else {
            return Err(SolveError {
                message: format!("none of the {} explored graphs has a feasible schedule", self.nodes.len()),
                kind: SolveErrorKind::Infeasible,
            }
            .into());
        };
        let actions = self.path(best);
        info!(
            "search finished: objective {} after {} merges ({} nodes)",
            schedule.objective,
            actions.len(),
            self.nodes.len()
        );
        Ok(SearchOutcome {
            graph: self.nodes[best].graph.clone(),
            objective: schedule.objective,
            schedule,
            actions,
            history,
            tree_size: self.nodes.len(),
        })
    }

    fn select(&mut self) -> usize {
        let mut id = 0;
        loop {
            if self.nodes[id].visits == 0 {
                return id;
            }
            if let Some(child) = self.expand(id) {
                return child;
            }
            match self.sample_child(id) {
                Some(child) => id = child,
                None => return id,
            }
        }
    }

    fn expand(&mut self, id: usize) -> Option<usize> {
        while !self.nodes[id].remaining.is_empty() {
            let k = self.rng.gen_range(0..self.nodes[id].remaining.len());
            let action = self.nodes[id].remaining.swap_remove(k);

            let mut graph = self.nodes[id].graph.clone();
            if !self.merger.merge(&mut graph, &action) {
                continue;
            }
            let mut consumed = self.nodes[id].consumed.clone();
            consumed.insert(action);
            let child = self.nodes.len();
            self.nodes.push(SearchNode::new(graph, consumed, Some(action), Some(id)));
            self.nodes[id].children.push(child);
            trace!("expanded node {} with {} into node {}", id, action, child);
            return Some(child);
        }
        None
    }

    fn sample_child(&mut self, id: usize) -> Option<usize> {
        let node = &self.nodes[id];
        if node.children.is_empty() {
            return None;
        }
        if let Some(&fresh) = node.children.iter().find(|&&c| self.nodes[c].visits == 0) {
            return Some(fresh);
        }

        let best = self.best_reward();
        let scale = if best.is_finite() { best.max(1.0) } else { 1.0 };
        let parent_visits = f64::from(node.visits.max(1));
        let scores: Vec<Option<f64>> = node.children
            .iter()
            .map(|&c| {
                let child = &self.nodes[c];
                child.quality.is_finite().then(|| {
                    -child.quality / scale
                        + self.config.exploration * (parent_visits.ln() / f64::from(child.visits)).sqrt()
                })
            })
            .collect();

        let top = scores.iter().flatten().copied().fold(f64::NEG_INFINITY, f64::max);
        let temperature = self.config.temperature.max(f64::EPSILON);
        let weights: Vec<f64> = scores
            .iter()
            .map(|s| s.map_or(0.0, |s| ((s - top) / temperature).exp()))
            .collect();

        let k = match WeightedIndex::new(&weights) {
            Ok(dist) => dist.sample(&mut self.rng),
            Err(_) => self.rng.gen_range(0..weights.len()),
        };
        Some(self.nodes[id].children[k])
    }

    fn simulate(&mut self, id: usize) -> ScheduleResult<f64> {
        if let Some(reward) = self.nodes[id].reward {
            return Ok(reward);
        }
        let reward = match self.session.schedule(&self.nodes[id].graph) {
            Ok(solved) => {
                let reward = solved.objective as f64;
                if reward < self.best_reward() {
                    debug!("new best objective {} at node {}", solved.objective, id);
                    self.best = Some((id, solved));
                }
                reward
            }
            Err(err) if err.is_infeasible() => {
                debug!("node {} has no schedule: {}", id, err);
                f64::INFINITY
            }
            Err(err) => return Err(err),
        };
        self.nodes[id].reward = Some(reward);
        Ok(reward)
    }

    fn backpropagate(&mut self, id: usize, reward: f64) {
        let mut cursor = Some(id);
        while let Some(i) = cursor {
            let node = &mut self.nodes[i];
            node.visits += 1;
            node.quality = node.quality.min(reward);
            cursor = node.parent;
        }
    }

    fn best_reward(&self) -> f64 {
        self.best.as_ref().map_or(f64::INFINITY, |(_, s)| s.objective as f64)
    }

    fn depth(&self, id: usize) -> usize {
        self.nodes[id].consumed.len()
    }

    fn path(&self, id: usize) -> Vec<MergePoint> {
        let mut actions = Vec::new();
        let mut cursor = Some(id);
        while let Some(i) = cursor {
            actions.extend(self.nodes[i].action);
            cursor = self.nodes[i].parent;
        }
        actions.reverse();
        actions
    }
}

/// Re-apply a recorded action sequence to `graph`.
pub fn replay(graph: &TileGraph, actions: &[MergePoint]) -> ScheduleResult<TileGraph> {
    let merger = GraphMerger::new();
    let mut graph = graph.clone();
    for point in actions {
        if !merger.merge(&mut graph, point) {
            return Err(ScheduleError::Internal(format!("merge {} could not be replayed", point)));
        }
    }
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::grid::{ExprId, GridGraph, UnaryOp};
    use crate::ir::tensor::{DataType, TensorType};
    use crate::solver::SolveOptions;
    use crate::target::TargetOptions;
    use crate::tile::node::OpId;

    fn matmul_relu(n: i64) -> (GridGraph, ExprId) {
        let mut grid = GridGraph::new();
        let a = grid.add_input("a", TensorType::new(DataType::F32, vec![n, n]));
        let b = grid.add_input("b", TensorType::new(DataType::F32, vec![n, n]));
        let c = grid.matmul("c", a, b).unwrap();
        let d = grid.unary("d", UnaryOp::Relu, c).unwrap();
        (grid, d)
    }

    fn search(target: TargetOptions, n: i64, config: SearchConfig) -> (TileGraph, ScheduleResult<SearchOutcome>) {
        let (grid, root) = matmul_relu(n);
        let mut session = SchedulerSession::new(target);
        let graph = session.build(&grid, root).unwrap().graph;
        let outcome = MonteCarloSearch::new(&mut session, config).run(&graph);
        (graph, outcome)
    }

    #[test]
    fn test_search_finds_schedule() {
        let target = TargetOptions::cpu().with_unified_memory(false);
        let (graph, outcome) = search(target, 16, SearchConfig::new().iterations(4).seed(3));
        let outcome = outcome.unwrap();

        assert_eq!(outcome.history.len(), 4);
        assert_eq!(outcome.objective, outcome.schedule.objective);
        assert!(outcome.history.iter().all(|s| s.best >= outcome.objective as f64));
        // the input graph is never touched
        assert!(MergePointCollector::new(&graph).collect_all().contains(&MergePoint::new(OpId(1), OpId(0), 1)));

        let replayed = replay(&graph, &outcome.actions).unwrap();
        assert_eq!(replayed.signature(), outcome.graph.signature());
    }

    #[test]
    fn test_search_is_deterministic() {
        let config = SearchConfig::new().iterations(3).seed(11);
        let (_, first) = search(TargetOptions::cpu(), 8, config.clone());
        let (_, second) = search(TargetOptions::cpu(), 8, config);
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first.objective, second.objective);
        assert_eq!(first.actions, second.actions);
        assert_eq!(first.history, second.history);
    }

    #[test]
    fn test_search_out_of_budget() {
        let (grid, root) = matmul_relu(16);
        let graph = SchedulerSession::new(TargetOptions::cpu()).build(&grid, root).unwrap().graph;
        let mut session = SchedulerSession::new(TargetOptions::cpu())
            .with_solve_options(SolveOptions::default().max_nodes(1));
        let outcome = MonteCarloSearch::new(&mut session, SearchConfig::new().iterations(3)).run(&graph);
        match outcome {
            Err(ScheduleError::Solve(err)) => {
                assert_eq!(err.kind, SolveErrorKind::LimitReached);
                assert!(err.message.contains("--max-nodes"));
            }
            other => panic!("expected an exhausted budget, got {:?}", other.map(|o| o.objective)),
        }
    }

    #[test]
    fn test_search_without_feasible_graph() {
        let target = TargetOptions::cpu().with_levels(vec![8, i64::MAX], vec![64, 16]);
        let (_, outcome) = search(target, 2, SearchConfig::new().iterations(3));
        match outcome {
            Err(ScheduleError::Solve(err)) => assert_eq!(err.kind, SolveErrorKind::Infeasible),
            other => panic!("expected infeasible search, got {:?}", other.map(|o| o.objective)),
        }
    }
}
