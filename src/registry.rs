//! Resource kind registry
//!
//! Describes the primary kind the controller reconciles and the secondary
//! kinds it manages. Built once at startup and handed to the components that
//! need to recognise owner references or stamp them onto new objects.

use std::fmt;

use kube::Resource;
use serde::{Deserialize, Serialize};

use crate::crd::Bookstore;

/// Kinds of resources observed by the controller
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    /// The Bookstore custom resource
    Bookstore,
    /// apps/v1 Deployment
    Deployment,
    /// core/v1 Service
    Service,
}

impl ResourceKind {
    /// Kubernetes `kind` string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bookstore => "Bookstore",
            Self::Deployment => "Deployment",
            Self::Service => "Service",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Group/version/kind of the primary resource plus the kinds it owns
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceRegistry {
    primary_kind: String,
    primary_api_version: String,
    secondaries: Vec<ResourceKind>,
}

impl ResourceRegistry {
    /// Registry for the Bookstore controller: Bookstore owns a Deployment and a Service
    pub fn bookstore() -> Self {
        Self {
            primary_kind: Bookstore::kind(&()).into_owned(),
            primary_api_version: Bookstore::api_version(&()).into_owned(),
            secondaries: vec![ResourceKind::Deployment, ResourceKind::Service],
        }
    }

    /// Kind string recorded in owner references of managed objects
    pub fn primary_kind(&self) -> &str {
        &self.primary_kind
    }

    /// apiVersion recorded in owner references of managed objects
    pub fn primary_api_version(&self) -> &str {
        &self.primary_api_version
    }

    /// Secondary kinds, in the order a reconcile pass converges them
    pub fn secondaries(&self) -> &[ResourceKind] {
        &self.secondaries
    }

    /// Every kind the controller subscribes to
    pub fn watched(&self) -> Vec<ResourceKind> {
        std::iter::once(ResourceKind::Bookstore)
            .chain(self.secondaries.iter().copied())
            .collect()
    }

    /// True if `kind` names the primary resource
    pub fn is_primary_kind(&self, kind: &str) -> bool {
        self.primary_kind == kind
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::bookstore()
    }
}
