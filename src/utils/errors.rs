//! Error types for the scheduler.
//!
//! This module defines all error types used throughout the crate,
//! organized by the phase that produces them.

use thiserror::Error;
use std::fmt;

/// Top-level error type for the scheduler.
#[derive(Error, Debug)]
pub enum ScheduleError {
    /// Error while inferring operator domain bounds
    #[error("Bound inference error: {0}")]
    BoundInference(#[from] BoundInferenceError),

    /// The constraint model could not be solved
    #[error("Solver error: {0}")]
    Solve(#[from] SolveError),

    /// Buffers could not be laid out in a memory level
    #[error("Buffer packing error: {0}")]
    Packing(#[from] PackingError),

    /// The input uses something the scheduler cannot express
    #[error("Unsupported: {0}")]
    Unsupported(#[from] UnsupportedError),

    /// Internal scheduler error
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScheduleError {
    /// Whether the error only says that this particular graph has no valid
    /// schedule. Search treats such graphs as infinitely expensive instead of
    /// aborting. A solver that ran out of budget proved nothing, so
    /// [`SolveErrorKind::LimitReached`] is not infeasibility.
    pub fn is_infeasible(&self) -> bool {
        match self {
            ScheduleError::Solve(e) => e.kind != SolveErrorKind::LimitReached,
            ScheduleError::Packing(_) => true,
            _ => false,
        }
    }

    /// Whether a solver gave up on its node or time budget.
    pub fn is_limit_reached(&self) -> bool {
        matches!(self, ScheduleError::Solve(e) if e.kind == SolveErrorKind::LimitReached)
    }
}

/// Error during domain bound inference.
#[derive(Error, Debug, Clone)]
pub struct BoundInferenceError {
    /// The error message
    pub message: String,
    /// The operator whose bounds were being inferred
    pub op: String,
    /// The kind of inference error
    pub kind: BoundInferenceErrorKind,
}

impl fmt::Display for BoundInferenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} for {}", self.message, self.op)
    }
}

/// Kind of bound inference failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundInferenceErrorKind {
    /// No assignment makes every access cover its buffer
    Inconsistent,
    /// The inference problem hit the search budget
    Exhausted,
}

/// Error raised by the constraint solver.
#[derive(Error, Debug, Clone)]
pub struct SolveError {
    /// The error message
    pub message: String,
    /// The kind of solver error
    pub kind: SolveErrorKind,
}

impl fmt::Display for SolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Kind of solver failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveErrorKind {
    /// The model has no solution
    Infeasible,
    /// The node or time budget ran out before any solution was found
    LimitReached,
    /// The model is malformed (empty domain, unknown variable)
    InvalidModel,
}

/// Error during the two-dimensional buffer layout.
#[derive(Error, Debug, Clone)]
pub struct PackingError {
    /// The error message
    pub message: String,
    /// Memory level that overflowed
    pub level: usize,
    /// The kind of packing error
    pub kind: PackingErrorKind,
}

impl fmt::Display for PackingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at memory level {}", self.message, self.level)
    }
}

/// Kind of packing failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackingErrorKind {
    /// A single buffer is larger than the level's capacity
    BufferTooLarge,
    /// No overlap-free placement exists within the capacity
    NoFit,
}

/// Input the scheduler cannot handle.
#[derive(Error, Debug, Clone)]
pub struct UnsupportedError {
    /// The error message
    pub message: String,
    /// The kind of unsupported construct
    pub kind: UnsupportedErrorKind,
}

impl fmt::Display for UnsupportedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Kind of unsupported input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedErrorKind {
    /// A dimension has no static size
    DynamicShape,
    /// Access maps of one operator disagree on the domain rank
    RankMismatch,
    /// The operator has no tileable access pattern
    Operator,
    /// The target description is unusable
    Target,
}

impl UnsupportedError {
    /// Shorthand constructor.
    pub fn new(kind: UnsupportedErrorKind, message: impl Into<String>) -> Self {
        Self { message: message.into(), kind }
    }
}

/// Why a merge point was not applied.
///
/// Merging is a speculative search step, so rejections are reported as
/// values and logged rather than propagated as errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeRejection {
    /// One of the named operators has no cluster at the merge level
    #[error("no level-{level} cluster headed by op {op}")]
    MissingCluster {
        /// Operator that was looked up
        op: usize,
        /// Merge level
        level: usize,
    },
    /// The two clusters are already one
    #[error("ops {consumer} and {producer} already share a cluster")]
    AlreadyMerged {
        /// Consumer operator
        consumer: usize,
        /// Producer operator
        producer: usize,
    },
    /// The clusters are not children of the same parent
    #[error("clusters of ops {consumer} and {producer} are not siblings")]
    NotSiblings {
        /// Consumer operator
        consumer: usize,
        /// Producer operator
        producer: usize,
    },
    /// Nothing flows from the producer cluster into the consumer cluster
    #[error("no dependence from op {producer} to op {consumer}")]
    NoDependence {
        /// Consumer operator
        consumer: usize,
        /// Producer operator
        producer: usize,
    },
    /// Contracting the two clusters would close a cycle through a sibling
    #[error("merging op {producer} into op {consumer} creates a cycle")]
    Cycle {
        /// Consumer operator
        consumer: usize,
        /// Producer operator
        producer: usize,
    },
    /// The derived domain relation is not a projected permutation
    #[error("relation from op {consumer} to op {producer} is not a projected permutation")]
    NonPermutation {
        /// Consumer operator
        consumer: usize,
        /// Producer operator
        producer: usize,
    },
}

/// Result type using ScheduleError.
pub type ScheduleResult<T> = Result<T, ScheduleError>;
