//! Async runtime for the operation phase.
//!
//! While phases 1-5 are plain sequential stage lists, the operation phase
//! coordinates concurrent background tasks against live hosts. The pieces:
//!
//! - [`signal`]: the close broadcast and join registration primitives
//! - [`runner`]: stages that launch remote commands as background tasks
//! - [`stages`]: the standard join / close / persist / metrics stages

pub mod runner;
pub mod signal;
pub mod stages;

pub use runner::{Capture, Poller, RemoteRunner};
pub use signal::{CloseSignal, Closer, Joiner, OperationSignals, PendingJoin};
pub use stages::{CloserStage, JoinerStage, MetricsListener, Persist};
