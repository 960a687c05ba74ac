//! Bookstore Operator - keeps a Deployment and a Service in line with each Bookstore
//!
//! A Bookstore custom resource declares an image, a replica count and how the
//! application is exposed. The operator watches Bookstores and the objects
//! they own, and drives the cluster toward what every Bookstore declares.
//!
//! # Architecture
//!
//! Change notifications flow one way:
//!
//! - the [`store`] caches Bookstores, Deployments and Services and announces changes
//! - the [`router`] turns each change into the key of the Bookstore it concerns
//! - the [`queue`] deduplicates keys and backs off failing ones
//! - the [`controller`] workers run one convergence pass per key, writing
//!   through the [`client`]
//!
//! # Modules
//!
//! - [`crd`] - Bookstore Custom Resource Definition
//! - [`workload`] - Deployment and Service derived from a Bookstore
//! - [`owner`] - Owner reference lookups
//! - [`events`] - Kubernetes Event publishing
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod key;
pub mod owner;
pub mod queue;
pub mod registry;
pub mod router;
pub mod store;
pub mod telemetry;
pub mod workload;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Name reported as the source of Kubernetes Events
pub const CONTROLLER_NAME: &str = "bookstore-controller";
