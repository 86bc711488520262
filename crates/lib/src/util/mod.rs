//! Shared utilities.
//!
//! Filesystem staging helpers and test fixtures used across the crate.

pub mod fs;

#[cfg(test)]
pub mod testutil;
