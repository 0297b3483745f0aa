//! Utility modules for the scheduler.
//!
//! This module contains common utilities used throughout the codebase:
//! - Error types
//! - Exact matrix arithmetic and integer helpers
//! - Code formatting and pretty printing
//! - Structural hashing

pub mod errors;
pub mod matrix;
pub mod pretty;

// Re-exports
pub use errors::*;

use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};

/// Stable structural fingerprint of a value, used as a cache key.
pub fn fingerprint<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = FxHasher::default();
    value.hash(&mut hasher);
    hasher.finish()
}
