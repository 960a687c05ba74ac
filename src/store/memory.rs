//! In-process state store
//!
//! Holds objects in memory and announces changes exactly like the
//! watch-backed store. Used by tests and by [`crate::client::MemoryClient`]
//! to simulate an API server.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::Service;
use kube::Resource;
use tokio::sync::{mpsc, watch};

use super::cache::ObjectCache;
use super::{wait_synced, Cached, Notification, StateStore};
use crate::crd::Bookstore;
use crate::registry::ResourceKind;
use crate::Error;

/// State store backed by in-memory maps
pub struct MemoryStore {
    bookstores: ObjectCache<Bookstore>,
    deployments: ObjectCache<Deployment>,
    services: ObjectCache<Service>,
    versions: AtomicU64,
    synced: watch::Sender<bool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// A store that reports itself synced immediately
    pub fn new() -> Self {
        let store = Self::unsynced();
        store.mark_synced();
        store
    }

    /// A store whose initial sync has not completed yet
    pub fn unsynced() -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            bookstores: ObjectCache::new(),
            deployments: ObjectCache::new(),
            services: ObjectCache::new(),
            versions: AtomicU64::new(0),
            synced,
        }
    }

    /// Complete the initial sync, releasing every `wait_for_sync` caller
    pub fn mark_synced(&self) {
        self.synced.send_replace(true);
    }

    /// Insert or replace a Bookstore, stamping a fresh resourceVersion and uid
    pub fn apply_bookstore(&self, obj: Bookstore) -> Option<Arc<Bookstore>> {
        let obj = self.stamp(obj);
        self.bookstores.apply(obj)
    }

    /// Insert or replace a Deployment, stamping a fresh resourceVersion and uid
    pub fn apply_deployment(&self, obj: Deployment) -> Option<Arc<Deployment>> {
        let obj = self.stamp(obj);
        self.deployments.apply(obj)
    }

    /// Insert or replace a Service, stamping a fresh resourceVersion and uid
    pub fn apply_service(&self, obj: Service) -> Option<Arc<Service>> {
        let obj = self.stamp(obj);
        self.services.apply(obj)
    }

    /// Delete a Bookstore
    pub fn delete_bookstore(&self, namespace: &str, name: &str) -> Option<Arc<Bookstore>> {
        self.bookstores.remove(namespace, name)
    }

    /// Delete a Deployment
    pub fn delete_deployment(&self, namespace: &str, name: &str) -> Option<Arc<Deployment>> {
        self.deployments.remove(namespace, name)
    }

    /// Delete a Service
    pub fn delete_service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        self.services.remove(namespace, name)
    }

    /// Lose a Deployment without a delete event, as after a missed watch window
    pub fn tombstone_deployment(&self, namespace: &str, name: &str) -> Option<Arc<Deployment>> {
        self.deployments.tombstone(namespace, name)
    }

    /// Lose a Service without a delete event
    pub fn tombstone_service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        self.services.tombstone(namespace, name)
    }

    /// Re-announce every cached object of `kind` unchanged
    pub fn resync(&self, kind: ResourceKind) {
        match kind {
            ResourceKind::Bookstore => self.bookstores.resync(),
            ResourceKind::Deployment => self.deployments.resync(),
            ResourceKind::Service => self.services.resync(),
        }
    }

    /// Simulate the deployment controller reporting rollout progress
    pub fn set_available_replicas(
        &self,
        namespace: &str,
        name: &str,
        available: i32,
    ) -> Option<Arc<Deployment>> {
        let current = self.deployments.get(namespace, name)?;
        let mut next = (*current).clone();
        next.status = Some(DeploymentStatus {
            available_replicas: Some(available),
            ..next.status.take().unwrap_or_default()
        });
        self.apply_deployment(next)
    }

    /// Number of cached Deployments
    pub fn deployment_count(&self) -> usize {
        self.deployments.len()
    }

    /// Number of cached Services
    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    fn stamp<K: Cached>(&self, mut obj: K) -> K {
        let version = self.versions.fetch_add(1, Ordering::SeqCst) + 1;
        let meta = obj.meta_mut();
        meta.resource_version = Some(version.to_string());
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{version}"));
        }
        if meta.namespace.is_none() {
            meta.namespace = Some("default".to_string());
        }
        obj
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    fn get_bookstore(&self, namespace: &str, name: &str) -> Result<Option<Arc<Bookstore>>, Error> {
        Ok(self.bookstores.get(namespace, name))
    }

    fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Arc<Deployment>>, Error> {
        Ok(self.deployments.get(namespace, name))
    }

    fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Arc<Service>>, Error> {
        Ok(self.services.get(namespace, name))
    }

    fn subscribe(&self, kind: ResourceKind) -> mpsc::UnboundedReceiver<Notification> {
        match kind {
            ResourceKind::Bookstore => self.bookstores.subscribe(),
            ResourceKind::Deployment => self.deployments.subscribe(),
            ResourceKind::Service => self.services.subscribe(),
        }
    }

    async fn wait_for_sync(&self) -> Result<(), Error> {
        wait_synced(&self.synced)
            .await
            .map_err(|_| Error::store("memory store dropped before sync"))
    }
}
