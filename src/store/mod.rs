//! Read-side view of the cluster
//!
//! The controller never reads the API server directly. It reads immutable
//! `Arc` snapshots out of a [`StateStore`] and learns about changes through
//! [`Notification`]s. Anything that needs to modify an object clones it
//! first; snapshots handed out by the store are shared with every worker.

mod cache;
mod informer;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::sync::{mpsc, watch};

#[cfg(test)]
use mockall::automock;

use crate::crd::Bookstore;
use crate::registry::ResourceKind;
use crate::Error;

pub use cache::Cached;
pub use informer::KubeStateStore;
pub use memory::MemoryStore;

/// What happened to a cached object
#[derive(Clone, Debug)]
pub enum Change<T> {
    /// Object appeared in the cache
    Added(T),
    /// Object was replaced; `old` and `new` share a resourceVersion on resync
    Updated {
        /// Previous snapshot
        old: T,
        /// Current snapshot
        new: T,
    },
    /// Object was removed after a delete event
    Deleted(T),
}

impl<T> Change<T> {
    /// The most recent snapshot carried by this change
    pub fn latest(&self) -> &T {
        match self {
            Change::Added(obj) | Change::Deleted(obj) => obj,
            Change::Updated { new, .. } => new,
        }
    }

    /// Convert the payload, keeping the change type
    pub fn map<U>(self, f: impl Fn(T) -> U) -> Change<U> {
        match self {
            Change::Added(obj) => Change::Added(f(obj)),
            Change::Updated { old, new } => Change::Updated {
                old: f(old),
                new: f(new),
            },
            Change::Deleted(obj) => Change::Deleted(f(obj)),
        }
    }
}

/// A managed object of one of the secondary kinds
#[derive(Clone, Debug, PartialEq)]
pub enum SecondaryObject {
    /// Managed Deployment
    Deployment(Arc<Deployment>),
    /// Managed Service
    Service(Arc<Service>),
}

impl SecondaryObject {
    /// Kind of the wrapped object
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Deployment(_) => ResourceKind::Deployment,
            Self::Service(_) => ResourceKind::Service,
        }
    }

    /// Metadata of the wrapped object
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::Deployment(d) => &d.metadata,
            Self::Service(s) => &s.metadata,
        }
    }
}

/// Final state of an object whose delete was missed by the watch
///
/// Only the last-known identity survives. A tombstone without it is
/// malformed and is dropped by the router.
#[derive(Clone, Debug)]
pub struct Tombstone {
    /// Kind of the deleted object
    pub kind: ResourceKind,
    /// `namespace/name` of the deleted object
    pub key: String,
    /// Metadata as last seen in the cache
    pub last_known: Option<Arc<ObjectMeta>>,
}

/// Change notification emitted by a [`StateStore`]
#[derive(Clone, Debug)]
pub enum Notification {
    /// A Bookstore changed
    Primary(Change<Arc<Bookstore>>),
    /// A Deployment or Service changed
    Secondary(Change<SecondaryObject>),
    /// An object vanished without a delete event
    Tombstone(Tombstone),
}

impl Notification {
    /// Kind of the object the notification is about
    pub fn kind(&self) -> ResourceKind {
        match self {
            Notification::Primary(_) => ResourceKind::Bookstore,
            Notification::Secondary(change) => change.latest().kind(),
            Notification::Tombstone(tombstone) => tombstone.kind,
        }
    }
}

/// Eventually consistent, read-only cache of Bookstores and their managed objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Look up a Bookstore; `Ok(None)` when it is not cached
    fn get_bookstore(&self, namespace: &str, name: &str) -> Result<Option<Arc<Bookstore>>, Error>;

    /// Look up a Deployment; `Ok(None)` when it is not cached
    fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Option<Arc<Deployment>>, Error>;

    /// Look up a Service; `Ok(None)` when it is not cached
    fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Arc<Service>>, Error>;

    /// Receive notifications for one kind
    ///
    /// Objects already cached are replayed as `Added` before any live change.
    fn subscribe(&self, kind: ResourceKind) -> mpsc::UnboundedReceiver<Notification>;

    /// Resolve once every watched kind has completed its initial list
    async fn wait_for_sync(&self) -> Result<(), Error>;
}

/// Resolve once `synced` reads true
async fn wait_synced(synced: &watch::Sender<bool>) -> Result<(), watch::error::RecvError> {
    let mut rx = synced.subscribe();
    loop {
        let done = *rx.borrow_and_update();
        if done {
            return Ok(());
        }
        rx.changed().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_latest_and_map() {
        let change = Change::Updated { old: 1, new: 2 };
        assert_eq!(*change.latest(), 2);
        match change.map(|v| v * 10) {
            Change::Updated { old, new } => assert_eq!((old, new), (10, 20)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_notification_kind() {
        let deployment = SecondaryObject::Deployment(Arc::new(Deployment::default()));
        let n = Notification::Secondary(Change::Deleted(deployment));
        assert_eq!(n.kind(), ResourceKind::Deployment);

        let n = Notification::Tombstone(Tombstone {
            kind: ResourceKind::Service,
            key: "ns/s1".to_string(),
            last_known: None,
        });
        assert_eq!(n.kind(), ResourceKind::Service);
    }
}
