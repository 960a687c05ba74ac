//! Snapshot cache for one resource kind
//!
//! Readers go straight to the map and get an `Arc` back. Writers and new
//! subscribers serialize on the subscriber list so a subscriber never misses a
//! change between its replay and its registration.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::{Resource, ResourceExt};
use tokio::sync::mpsc;
use tracing::debug;

use super::{Change, Notification, SecondaryObject, Tombstone};
use crate::crd::Bookstore;
use crate::key::ReconcileKey;
use crate::registry::ResourceKind;

/// A resource type the store can cache and announce
pub trait Cached: Resource<DynamicType = ()> + Clone + Send + Sync + 'static {
    /// Kind announced in notifications
    const KIND: ResourceKind;

    /// Wrap a change of this type into a notification
    fn notification(change: Change<Arc<Self>>) -> Notification;
}

impl Cached for Bookstore {
    const KIND: ResourceKind = ResourceKind::Bookstore;

    fn notification(change: Change<Arc<Self>>) -> Notification {
        Notification::Primary(change)
    }
}

impl Cached for Deployment {
    const KIND: ResourceKind = ResourceKind::Deployment;

    fn notification(change: Change<Arc<Self>>) -> Notification {
        Notification::Secondary(change.map(SecondaryObject::Deployment))
    }
}

impl Cached for Service {
    const KIND: ResourceKind = ResourceKind::Service;

    fn notification(change: Change<Arc<Self>>) -> Notification {
        Notification::Secondary(change.map(SecondaryObject::Service))
    }
}

type Subscribers = Vec<mpsc::UnboundedSender<Notification>>;

pub(crate) struct ObjectCache<K> {
    objects: DashMap<ReconcileKey, Arc<K>>,
    subscribers: Mutex<Subscribers>,
}

impl<K: Cached> ObjectCache<K> {
    pub(crate) fn new() -> Self {
        Self {
            objects: DashMap::new(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.objects
            .get(&ReconcileKey::new(namespace, name))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn len(&self) -> usize {
        self.objects.len()
    }

    /// Register a subscriber and replay the current contents to it as `Added`
    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.lock();
        for entry in self.objects.iter() {
            let _ = tx.send(K::notification(Change::Added(Arc::clone(entry.value()))));
        }
        subscribers.push(tx);
        rx
    }

    /// Insert or replace an object; nameless objects are ignored
    pub(crate) fn apply(&self, obj: K) -> Option<Arc<K>> {
        let mut subscribers = self.lock();
        self.apply_locked(&mut subscribers, obj)
    }

    /// Remove an object after a delete event carrying its final state
    pub(crate) fn delete(&self, obj: K) {
        let Some(key) = ReconcileKey::for_object(&obj) else {
            return;
        };
        let mut subscribers = self.lock();
        self.objects.remove(&key);
        broadcast(&mut subscribers, K::notification(Change::Deleted(Arc::new(obj))));
    }

    /// Remove a cached object by key, announcing its last cached state
    pub(crate) fn remove(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        let mut subscribers = self.lock();
        let (_, old) = self.objects.remove(&ReconcileKey::new(namespace, name))?;
        broadcast(
            &mut subscribers,
            K::notification(Change::Deleted(Arc::clone(&old))),
        );
        Some(old)
    }

    /// Drop an object whose deletion was never observed
    pub(crate) fn tombstone(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        let mut subscribers = self.lock();
        self.tombstone_locked(&mut subscribers, &ReconcileKey::new(namespace, name))
    }

    /// Swap in the result of a full list
    ///
    /// Cached objects missing from the list are announced as tombstones,
    /// everything listed is applied as usual.
    pub(crate) fn replace(&self, listed: Vec<K>) {
        let mut subscribers = self.lock();
        let fresh: HashSet<ReconcileKey> =
            listed.iter().filter_map(ReconcileKey::for_object).collect();
        let stale: Vec<ReconcileKey> = self
            .objects
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| !fresh.contains(key))
            .collect();
        for key in &stale {
            self.tombstone_locked(&mut subscribers, key);
        }
        for obj in listed {
            self.apply_locked(&mut subscribers, obj);
        }
        debug!(
            kind = %K::KIND,
            listed = fresh.len(),
            stale = stale.len(),
            "cache relisted"
        );
    }

    /// Re-announce every cached object as an update to itself
    pub(crate) fn resync(&self) {
        let mut subscribers = self.lock();
        for entry in self.objects.iter() {
            let obj = entry.value();
            broadcast(
                &mut subscribers,
                K::notification(Change::Updated {
                    old: Arc::clone(obj),
                    new: Arc::clone(obj),
                }),
            );
        }
    }

    fn apply_locked(&self, subscribers: &mut Subscribers, obj: K) -> Option<Arc<K>> {
        let key = ReconcileKey::for_object(&obj)?;
        let new = Arc::new(obj);
        let change = match self.objects.insert(key, Arc::clone(&new)) {
            Some(old) => Change::Updated {
                old,
                new: Arc::clone(&new),
            },
            None => Change::Added(Arc::clone(&new)),
        };
        broadcast(subscribers, K::notification(change));
        Some(new)
    }

    fn tombstone_locked(&self, subscribers: &mut Subscribers, key: &ReconcileKey) -> Option<Arc<K>> {
        let (_, old) = self.objects.remove(key)?;
        broadcast(
            subscribers,
            Notification::Tombstone(Tombstone {
                kind: K::KIND,
                key: key.to_string(),
                last_known: Some(Arc::new(old.meta().clone())),
            }),
        );
        debug!(kind = %K::KIND, name = %old.name_any(), "object tombstoned");
        Some(old)
    }
}

fn broadcast(subscribers: &mut Subscribers, notification: Notification) {
    // closed receivers are pruned on the way
    subscribers.retain(|tx| tx.send(notification.clone()).is_ok());
}
