//! Kubernetes controllers
//!
//! The Lab reconciler and the context it shares with its passes.

mod context;
mod lab;

pub use context::Context;
pub use lab::{cleanup_lab, converge_lab, next_status, LabController, ReconcileError};
