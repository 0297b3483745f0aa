//! Search and scheduling configuration

use crate::solver::SolveOptions;
use serde::{Serialize, Deserialize};

/// Configuration of the Monte-Carlo merge search
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Number of select-expand-simulate-backpropagate rounds
    pub iterations: usize,

    /// Weight of the exploration term of the confidence bound
    pub exploration: f64,

    /// Softmax temperature when sampling children; lower is greedier
    pub temperature: f64,

    /// Random seed for reproducibility
    pub seed: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            iterations: 32,
            exploration: std::f64::consts::SQRT_2,
            temperature: 0.1,
            seed: 42,
        }
    }
}

impl SearchConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the iteration budget
    pub fn iterations(mut self, n: usize) -> Self {
        self.iterations = n;
        self
    }

    /// Set the exploration weight
    pub fn exploration(mut self, c: f64) -> Self {
        self.exploration = c;
        self
    }

    /// Set the sampling temperature
    pub fn temperature(mut self, t: f64) -> Self {
        self.temperature = t;
        self
    }

    /// Set the random seed
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Configuration of the whole scheduling pass
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Search over merges; when off, the unmerged graph is scheduled
    pub search: bool,

    /// Merge search settings
    pub search_config: SearchConfig,

    /// Limits of every constraint solve
    pub solve: SolveOptions,
}

impl ScheduleConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable/disable merge search
    pub fn with_search(mut self, on: bool) -> Self {
        self.search = on;
        self
    }

    /// Set the search settings
    pub fn search_config(mut self, config: SearchConfig) -> Self {
        self.search_config = config;
        self
    }

    /// Set the solver limits
    pub fn solve_options(mut self, options: SolveOptions) -> Self {
        self.solve = options;
        self
    }

    /// Quick preset (few iterations, small solver budget)
    pub fn quick() -> Self {
        Self {
            search: true,
            search_config: SearchConfig { iterations: 8, ..Default::default() },
            solve: SolveOptions::default().max_nodes(50_000),
        }
    }

    /// Thorough preset (many iterations, large solver budget)
    pub fn thorough() -> Self {
        Self {
            search: true,
            search_config: SearchConfig {
                iterations: 256,
                temperature: 0.5,
                ..Default::default()
            },
            solve: SolveOptions::default().max_nodes(5_000_000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        assert!(!ScheduleConfig::default().search);
        assert!(ScheduleConfig::quick().search_config.iterations < ScheduleConfig::thorough().search_config.iterations);
        assert_eq!(ScheduleConfig::quick().solve.max_nodes, 50_000);
    }

    #[test]
    fn test_from_json() {
        let config: ScheduleConfig = serde_json::from_str(r#"{
            "search": true,
            "search_config": { "iterations": 4, "seed": 7 }
        }"#).unwrap();
        assert_eq!(config.search_config.iterations, 4);
        assert_eq!(config.search_config.seed, 7);
        assert_eq!(config.search_config.temperature, SearchConfig::default().temperature);
        assert_eq!(config.solve.max_nodes, SolveOptions::default().max_nodes);
    }
}
