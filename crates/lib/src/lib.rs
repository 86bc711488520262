//! fleetlab-lib: core types and logic for fleetlab.
//!
//! A testbed is described once as a [`model::Model`] (regions, hosts,
//! components, scoped variables), bound through a [`model::Registry`],
//! and then driven through the seven-phase [`pipeline`]: infrastructure,
//! configuration, kitting, distribution, activation, operation, and
//! disposal. The [`remote`] boundary is the only code that touches live
//! hosts, so everything above it can be exercised against fakes.

pub mod consts;
pub mod instance;
pub mod metrics;
pub mod model;
pub mod operation;
pub mod parallel;
pub mod paths;
pub mod pipeline;
pub mod provision;
pub mod remote;
pub mod stages;
pub mod util;
