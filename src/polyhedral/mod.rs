//! Affine algebra for iteration domains and buffer accesses.
//!
//! This module provides the mathematical foundation for the scheduler:
//! - Affine expressions
//! - Affine maps (access functions and domain relations)

pub mod space;
pub mod expr;
pub mod map;

pub use space::Space;
pub use expr::AffineExpr;
pub use map::AffineMap;
