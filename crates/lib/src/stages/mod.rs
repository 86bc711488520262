//! Built-in stages for the build-out and disposal phases.
//!
//! One module per build-out phase, with the matching disposal stages
//! kept beside their counterparts. Topology code composes these (and
//! its own stages) into the model's per-phase binder lists.

pub mod activation;
pub mod configuration;
pub mod distribution;
pub mod infrastructure;
pub mod kitting;
