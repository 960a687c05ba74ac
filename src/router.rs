//! Event routing
//!
//! Turns store notifications into reconcile keys. Bookstore changes enqueue
//! the Bookstore itself; changes to managed objects enqueue the Bookstore
//! that controls them. Each kind has one handler in the router's table and
//! one task draining its subscription.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::crd::Bookstore;
use crate::key::ReconcileKey;
use crate::owner::owner_key;
use crate::queue::WorkQueue;
use crate::registry::{ResourceKind, ResourceRegistry};
use crate::store::{Change, Notification, StateStore};

/// Decides which key, if any, a notification should enqueue
pub trait NotificationHandler: Send + Sync {
    /// Key to enqueue for `notification`, or `None` to drop it
    fn route(&self, notification: &Notification, store: &dyn StateStore) -> Option<ReconcileKey>;
}

fn same_version(old: Option<&String>, new: Option<&String>) -> bool {
    old.is_some() && old == new
}

fn primary_key(bookstore: &Bookstore) -> Option<ReconcileKey> {
    let key = ReconcileKey::for_object(bookstore);
    if key.is_none() {
        warn!(
            namespace = ?bookstore.metadata.namespace,
            "Bookstore notification without a name dropped"
        );
    }
    key
}

/// Handler for Bookstore notifications
pub struct PrimaryHandler;

impl NotificationHandler for PrimaryHandler {
    fn route(&self, notification: &Notification, _store: &dyn StateStore) -> Option<ReconcileKey> {
        match notification {
            Notification::Primary(Change::Added(obj)) => primary_key(obj),
            Notification::Primary(Change::Updated { old, new }) => {
                if same_version(
                    old.metadata.resource_version.as_ref(),
                    new.metadata.resource_version.as_ref(),
                ) {
                    trace!(name = ?new.metadata.name, "resync of unchanged Bookstore dropped");
                    return None;
                }
                primary_key(new)
            }
            // a queued key for a deleted Bookstore is dropped by the reconcile pass
            Notification::Primary(Change::Deleted(_)) | Notification::Tombstone(_) => None,
            Notification::Secondary(change) => {
                warn!(kind = %change.latest().kind(), "secondary notification on Bookstore handler");
                None
            }
        }
    }
}

/// Handler for managed objects: enqueues the controlling Bookstore
pub struct OwnerHandler {
    registry: ResourceRegistry,
}

impl OwnerHandler {
    /// Handler resolving owners of the registry's primary kind
    pub fn new(registry: ResourceRegistry) -> Self {
        Self { registry }
    }
}

impl NotificationHandler for OwnerHandler {
    fn route(&self, notification: &Notification, store: &dyn StateStore) -> Option<ReconcileKey> {
        let meta = match notification {
            Notification::Secondary(Change::Updated { old, new }) => {
                if same_version(
                    old.metadata().resource_version.as_ref(),
                    new.metadata().resource_version.as_ref(),
                ) {
                    trace!(kind = %new.kind(), name = ?new.metadata().name, "resync dropped");
                    return None;
                }
                new.metadata()
            }
            Notification::Secondary(Change::Added(obj) | Change::Deleted(obj)) => obj.metadata(),
            Notification::Tombstone(tombstone) => match &tombstone.last_known {
                Some(meta) => meta.as_ref(),
                None => {
                    warn!(
                        kind = %tombstone.kind,
                        key = %tombstone.key,
                        "tombstone without last known state dropped"
                    );
                    return None;
                }
            },
            Notification::Primary(_) => {
                warn!("Bookstore notification on managed object handler");
                return None;
            }
        };

        let owner = owner_key(meta, &self.registry)?;
        match store.get_bookstore(owner.namespace(), owner.name()) {
            Ok(Some(_)) => Some(owner),
            Ok(None) => {
                debug!(
                    object = ?meta.name,
                    owner = %owner,
                    "ignoring orphaned object"
                );
                None
            }
            Err(e) => {
                warn!(owner = %owner, error = %e, "owner lookup failed, notification dropped");
                None
            }
        }
    }
}

/// Dispatches notifications to per-kind handlers and feeds the work queue
pub struct EventRouter {
    store: Arc<dyn StateStore>,
    queue: Arc<WorkQueue>,
    handlers: HashMap<ResourceKind, Arc<dyn NotificationHandler>>,
}

impl EventRouter {
    /// Router with the primary handler plus an owner handler per secondary kind
    pub fn new(
        store: Arc<dyn StateStore>,
        queue: Arc<WorkQueue>,
        registry: &ResourceRegistry,
    ) -> Self {
        let mut handlers: HashMap<ResourceKind, Arc<dyn NotificationHandler>> = HashMap::new();
        handlers.insert(ResourceKind::Bookstore, Arc::new(PrimaryHandler));
        let owners: Arc<dyn NotificationHandler> = Arc::new(OwnerHandler::new(registry.clone()));
        for kind in registry.secondaries() {
            handlers.insert(*kind, Arc::clone(&owners));
        }
        Self {
            store,
            queue,
            handlers,
        }
    }

    /// Kinds with a registered handler
    pub fn kinds(&self) -> Vec<ResourceKind> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Route one notification; returns the key that was enqueued, if any
    pub fn dispatch(&self, notification: &Notification) -> Option<ReconcileKey> {
        let kind = notification.kind();
        let Some(handler) = self.handlers.get(&kind) else {
            warn!(%kind, "no handler registered, notification dropped");
            return None;
        };
        let key = handler.route(notification, self.store.as_ref())?;
        trace!(%kind, key = %key, "enqueue");
        self.queue.add(key.clone());
        Some(key)
    }

    /// Subscribe to every handled kind and drain each subscription on its own task
    ///
    /// Subscriptions are taken before this returns, so nothing the store
    /// holds at that point is missed. Tasks stop on `cancel` or when the
    /// store closes the stream.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        self.kinds()
            .into_iter()
            .map(|kind| {
                let mut rx = self.store.subscribe(kind);
                let router = Arc::clone(&self);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            next = rx.recv() => match next {
                                Some(notification) => {
                                    router.dispatch(&notification);
                                }
                                None => {
                                    debug!(%kind, "notification stream closed");
                                    break;
                                }
                            }
                        }
                    }
                })
            })
            .collect()
    }
}
