//! Bookstore controller
//!
//! [`reconcile`] converges a single Bookstore; [`Controller`] runs the worker
//! pool that feeds it keys from the work queue.

mod bookstore;
mod runner;

pub use bookstore::{reconcile, Context, ContextBuilder, ReconcileOutcome};
pub use runner::{process_key, Controller};
