//! Write path to the system of record
//!
//! Every mutation the controller makes goes through [`KubeClient`]. Reads
//! come from the [`crate::store::StateStore`] cache instead.

mod memory;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::Bookstore;
use crate::registry::ResourceKind;
use crate::Error;

pub use memory::{MemoryClient, Write, WriteOp};

/// Trait abstracting writes to Bookstores and the objects they own
///
/// Failures are classified into not-found, conflict or a transient
/// [`Error::Kube`]; every one of them is retryable.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Create a Deployment in its own namespace
    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error>;

    /// Replace a Deployment; the resourceVersion it carries must be current
    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error>;

    /// Create a Service in its own namespace
    async fn create_service(&self, service: &Service) -> Result<Service, Error>;

    /// Replace a Service; the resourceVersion it carries must be current
    async fn update_service(&self, service: &Service) -> Result<Service, Error>;

    /// Write only the status subresource of a Bookstore
    async fn update_bookstore_status(&self, bookstore: &Bookstore) -> Result<Bookstore, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, obj: &K) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
        Api::namespaced(self.client.clone(), &namespace)
    }

    async fn create<K>(&self, kind: ResourceKind, obj: &K) -> Result<K, Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + Serialize
            + DeserializeOwned,
    {
        let name = obj.name_any();
        debug!(%kind, %name, "creating");
        self.api(obj)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| classify(e, kind, &name))
    }

    async fn replace<K>(&self, kind: ResourceKind, obj: &K) -> Result<K, Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + Serialize
            + DeserializeOwned,
    {
        let name = required_name(kind, obj)?;
        debug!(%kind, %name, "replacing");
        self.api(obj)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| classify(e, kind, &name))
    }
}

fn required_name<K: Resource>(kind: ResourceKind, obj: &K) -> Result<String, Error> {
    obj.meta()
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::internal(format!("{kind} without a name cannot be written")))
}

/// Map API status codes onto the controller's error taxonomy
fn classify(err: kube::Error, kind: ResourceKind, name: &str) -> Error {
    match &err {
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found(kind.as_str(), name),
        kube::Error::Api(ae) if ae.code == 409 => {
            Error::conflict(kind.as_str(), name, ae.message.clone())
        }
        _ => Error::Kube(err),
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        self.create(ResourceKind::Deployment, deployment).await
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        self.replace(ResourceKind::Deployment, deployment).await
    }

    async fn create_service(&self, service: &Service) -> Result<Service, Error> {
        self.create(ResourceKind::Service, service).await
    }

    async fn update_service(&self, service: &Service) -> Result<Service, Error> {
        self.replace(ResourceKind::Service, service).await
    }

    async fn update_bookstore_status(&self, bookstore: &Bookstore) -> Result<Bookstore, Error> {
        let name = required_name(ResourceKind::Bookstore, bookstore)?;
        let body = serde_json::to_vec(bookstore)
            .map_err(|e| Error::internal(format!("failed to encode Bookstore {name}: {e}")))?;
        self.api(bookstore)
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(|e| classify(e, ResourceKind::Bookstore, &name))
    }
}
