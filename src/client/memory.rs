//! In-process system of record
//!
//! Applies writes to a [`MemoryStore`] with API-server semantics: creates
//! collide on existing names, replaces must carry the current
//! resourceVersion, and status writes leave the spec alone. Successful writes
//! are recorded so tests can assert on exactly what the controller did.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;

use super::KubeClient;
use crate::crd::Bookstore;
use crate::registry::ResourceKind;
use crate::store::{MemoryStore, StateStore};
use crate::Error;

/// Kind of write operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOp {
    /// Object created
    Create,
    /// Object replaced
    Update,
    /// Status subresource replaced
    UpdateStatus,
}

/// One successful write
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Write {
    /// What was done
    pub op: WriteOp,
    /// Kind of the written object
    pub kind: ResourceKind,
    /// `namespace/name` of the written object
    pub key: String,
}

/// [`KubeClient`] that writes into a [`MemoryStore`]
pub struct MemoryClient {
    store: Arc<MemoryStore>,
    writes: Mutex<Vec<Write>>,
    failures: Mutex<VecDeque<String>>,
}

impl MemoryClient {
    /// Create a client writing into `store`
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            writes: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Make the next write fail with a transient error carrying `message`
    ///
    /// Calls stack: each queued failure is consumed by one write attempt.
    pub fn fail_next_write(&self, message: impl Into<String>) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(message.into());
    }

    /// Every successful write so far, oldest first
    pub fn writes(&self) -> Vec<Write> {
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Successful writes touching `kind`
    pub fn writes_for(&self, kind: ResourceKind) -> Vec<Write> {
        self.writes()
            .into_iter()
            .filter(|w| w.kind == kind)
            .collect()
    }

    /// Forget recorded writes
    pub fn clear_writes(&self) {
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn injected_failure(&self) -> Result<(), Error> {
        let next = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match next {
            Some(message) => Err(Error::transient(message)),
            None => Ok(()),
        }
    }

    fn record(&self, op: WriteOp, kind: ResourceKind, key: String) {
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Write { op, kind, key });
    }
}

fn key_of<K: ResourceExt>(kind: ResourceKind, obj: &K) -> Result<(String, String), Error> {
    let name = obj
        .meta()
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::internal(format!("{kind} without a name cannot be written")))?;
    Ok((obj.namespace().unwrap_or_else(|| "default".to_string()), name))
}

/// Reject a replace whose resourceVersion does not match the stored object
fn check_version<K: ResourceExt>(
    kind: ResourceKind,
    name: &str,
    current: &K,
    incoming: &K,
) -> Result<(), Error> {
    let expected = incoming.resource_version();
    if expected.is_some() && expected != current.resource_version() {
        return Err(Error::conflict(
            kind.as_str(),
            name,
            "the object has been modified; please apply your changes to the latest version",
        ));
    }
    Ok(())
}

fn already_exists(kind: ResourceKind, name: &str) -> Error {
    Error::conflict(kind.as_str(), name, format!("{kind} {name:?} already exists"))
}

#[async_trait]
impl KubeClient for MemoryClient {
    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        self.injected_failure()?;
        let kind = ResourceKind::Deployment;
        let (ns, name) = key_of(kind, deployment)?;
        if self.store.get_deployment(&ns, &name)?.is_some() {
            return Err(already_exists(kind, &name));
        }
        let mut obj = deployment.clone();
        obj.metadata.namespace = Some(ns.clone());
        let stored = self
            .store
            .apply_deployment(obj)
            .ok_or_else(|| Error::internal("deployment rejected by store"))?;
        self.record(WriteOp::Create, kind, format!("{ns}/{name}"));
        Ok((*stored).clone())
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        self.injected_failure()?;
        let kind = ResourceKind::Deployment;
        let (ns, name) = key_of(kind, deployment)?;
        let current = self
            .store
            .get_deployment(&ns, &name)?
            .ok_or_else(|| Error::not_found(kind.as_str(), &name))?;
        check_version(kind, &name, current.as_ref(), deployment)?;
        let mut obj = deployment.clone();
        obj.metadata.namespace = Some(ns.clone());
        // status is owned by the deployment controller, not by replace
        obj.status = current.status.clone();
        let stored = self
            .store
            .apply_deployment(obj)
            .ok_or_else(|| Error::internal("deployment rejected by store"))?;
        self.record(WriteOp::Update, kind, format!("{ns}/{name}"));
        Ok((*stored).clone())
    }

    async fn create_service(&self, service: &Service) -> Result<Service, Error> {
        self.injected_failure()?;
        let kind = ResourceKind::Service;
        let (ns, name) = key_of(kind, service)?;
        if self.store.get_service(&ns, &name)?.is_some() {
            return Err(already_exists(kind, &name));
        }
        let mut obj = service.clone();
        obj.metadata.namespace = Some(ns.clone());
        let stored = self
            .store
            .apply_service(obj)
            .ok_or_else(|| Error::internal("service rejected by store"))?;
        self.record(WriteOp::Create, kind, format!("{ns}/{name}"));
        Ok((*stored).clone())
    }

    async fn update_service(&self, service: &Service) -> Result<Service, Error> {
        self.injected_failure()?;
        let kind = ResourceKind::Service;
        let (ns, name) = key_of(kind, service)?;
        let current = self
            .store
            .get_service(&ns, &name)?
            .ok_or_else(|| Error::not_found(kind.as_str(), &name))?;
        check_version(kind, &name, current.as_ref(), service)?;
        let mut obj = service.clone();
        obj.metadata.namespace = Some(ns.clone());
        obj.status = current.status.clone();
        let stored = self
            .store
            .apply_service(obj)
            .ok_or_else(|| Error::internal("service rejected by store"))?;
        self.record(WriteOp::Update, kind, format!("{ns}/{name}"));
        Ok((*stored).clone())
    }

    async fn update_bookstore_status(&self, bookstore: &Bookstore) -> Result<Bookstore, Error> {
        self.injected_failure()?;
        let kind = ResourceKind::Bookstore;
        let (ns, name) = key_of(kind, bookstore)?;
        let current = self
            .store
            .get_bookstore(&ns, &name)?
            .ok_or_else(|| Error::not_found(kind.as_str(), &name))?;
        check_version(kind, &name, current.as_ref(), bookstore)?;
        // only status travels; the stored spec wins
        let mut obj = (*current).clone();
        obj.status = bookstore.status.clone();
        let stored = self
            .store
            .apply_bookstore(obj)
            .ok_or_else(|| Error::internal("bookstore rejected by store"))?;
        self.record(WriteOp::UpdateStatus, kind, format!("{ns}/{name}"));
        Ok((*stored).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{BookstoreSpec, BookstoreStatus};

    fn deployment(name: &str) -> Deployment {
        let mut d = Deployment::default();
        d.metadata.name = Some(name.to_string());
        d.metadata.namespace = Some("shop".to_string());
        d
    }

    fn setup() -> (Arc<MemoryStore>, MemoryClient) {
        let store = Arc::new(MemoryStore::new());
        let client = MemoryClient::new(Arc::clone(&store));
        (store, client)
    }

    #[tokio::test]
    async fn test_create_then_duplicate_create_conflicts() {
        let (store, client) = setup();
        client.create_deployment(&deployment("d1")).await.unwrap();
        assert!(store.get_deployment("shop", "d1").unwrap().is_some());

        let err = client.create_deployment(&deployment("d1")).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(client.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let (_store, client) = setup();
        let created = client.create_deployment(&deployment("d1")).await.unwrap();
        client.update_deployment(&created).await.unwrap();

        // `created` now carries an outdated resourceVersion
        let err = client.update_deployment(&created).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let (_store, client) = setup();
        let err = client.update_service(&{
            let mut s = Service::default();
            s.metadata.name = Some("s1".to_string());
            s
        })
        .await
        .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_status_update_keeps_stored_spec() {
        let (store, client) = setup();
        let mut obj = Bookstore::new(
            "store1",
            BookstoreSpec {
                replicas: Some(3),
                ..Default::default()
            },
        );
        obj.metadata.namespace = Some("shop".to_string());
        let stored = store.apply_bookstore(obj).unwrap();

        let mut write = (*stored).clone();
        write.spec.replicas = Some(99);
        write.status = Some(BookstoreStatus {
            available_replicas: 2,
        });
        client.update_bookstore_status(&write).await.unwrap();

        let after = store.get_bookstore("shop", "store1").unwrap().unwrap();
        assert_eq!(after.spec.replicas, Some(3));
        assert_eq!(after.status.as_ref().map(|s| s.available_replicas), Some(2));
        assert_eq!(
            client.writes(),
            vec![Write {
                op: WriteOp::UpdateStatus,
                kind: ResourceKind::Bookstore,
                key: "shop/store1".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_injected_failure_is_transient_and_consumed() {
        let (_store, client) = setup();
        client.fail_next_write("connection reset");

        let err = client.create_deployment(&deployment("d1")).await.unwrap_err();
        assert!(matches!(err, Error::Transient(_)));
        assert!(err.is_retryable());

        client.create_deployment(&deployment("d1")).await.unwrap();
        assert_eq!(client.writes_for(ResourceKind::Deployment).len(), 1);
    }
}
