//! Watch-backed state store
//!
//! One `kube::runtime::watcher` per kind keeps an [`ObjectCache`] current.
//! The initial list (and every relist after a watch gap) is buffered and
//! swapped in at `InitDone`, which is also when the kind counts as synced.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::ObjectCache;
use super::{wait_synced, Cached, Notification, StateStore};
use crate::crd::Bookstore;
use crate::registry::ResourceKind;
use crate::Error;

/// Server-side watch timeout, kept below the client read timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// State store fed by Kubernetes watches
pub struct KubeStateStore {
    client: Client,
    namespace: Option<String>,
    bookstores: Arc<ObjectCache<Bookstore>>,
    deployments: Arc<ObjectCache<Deployment>>,
    services: Arc<ObjectCache<Service>>,
    bookstores_synced: Arc<watch::Sender<bool>>,
    deployments_synced: Arc<watch::Sender<bool>>,
    services_synced: Arc<watch::Sender<bool>>,
}

impl KubeStateStore {
    /// Create a store watching `namespace`, or every namespace when `None`
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self {
            client,
            namespace,
            bookstores: Arc::new(ObjectCache::new()),
            deployments: Arc::new(ObjectCache::new()),
            services: Arc::new(ObjectCache::new()),
            bookstores_synced: Arc::new(watch::channel(false).0),
            deployments_synced: Arc::new(watch::channel(false).0),
            services_synced: Arc::new(watch::channel(false).0),
        }
    }

    /// Spawn the watch tasks, plus a periodic resync when `resync` is set
    ///
    /// Tasks run until `cancel` fires.
    pub fn start(&self, resync: Option<Duration>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![
            tokio::spawn(run_watcher(
                self.api::<Bookstore>(),
                Arc::clone(&self.bookstores),
                Arc::clone(&self.bookstores_synced),
                cancel.clone(),
            )),
            tokio::spawn(run_watcher(
                self.api::<Deployment>(),
                Arc::clone(&self.deployments),
                Arc::clone(&self.deployments_synced),
                cancel.clone(),
            )),
            tokio::spawn(run_watcher(
                self.api::<Service>(),
                Arc::clone(&self.services),
                Arc::clone(&self.services_synced),
                cancel.clone(),
            )),
        ];

        if let Some(period) = resync.filter(|p| !p.is_zero()) {
            let bookstores = Arc::clone(&self.bookstores);
            let deployments = Arc::clone(&self.deployments);
            let services = Arc::clone(&self.services);
            tasks.push(tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            debug!("periodic resync");
                            bookstores.resync();
                            deployments.resync();
                            services.resync();
                        }
                    }
                }
            }));
        }

        info!(namespace = ?self.namespace, "state store watches started");
        tasks
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

async fn run_watcher<K>(
    api: Api<K>,
    cache: Arc<ObjectCache<K>>,
    synced: Arc<watch::Sender<bool>>,
    cancel: CancellationToken,
) where
    K: Cached + DeserializeOwned + Debug,
{
    // errors are retried with backoff inside the stream, so cancellation is never blocked
    let stream = watcher::watcher(api, watcher::Config::default().timeout(WATCH_TIMEOUT_SECS))
        .default_backoff();
    let mut stream = std::pin::pin!(stream);
    let mut listing: Vec<K> = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.next() => match event {
                Some(Ok(Event::Init)) => {
                    debug!(kind = %K::KIND, "relist started");
                    listing.clear();
                }
                Some(Ok(Event::InitApply(obj))) => listing.push(obj),
                Some(Ok(Event::InitDone)) => {
                    cache.replace(std::mem::take(&mut listing));
                    if !synced.send_replace(true) {
                        info!(kind = %K::KIND, objects = cache.len(), "cache synced");
                    }
                }
                Some(Ok(Event::Apply(obj))) => {
                    cache.apply(obj);
                }
                Some(Ok(Event::Delete(obj))) => cache.delete(obj),
                Some(Err(e)) => {
                    warn!(kind = %K::KIND, error = %e, "watch error, backing off");
                }
                None => {
                    warn!(kind = %K::KIND, "watch stream ended");
                    break;
                }
            }
        }
    }
}

async fn wait_kind(kind: ResourceKind, synced: &watch::Sender<bool>) -> Result<(), Error> {
    wait_synced(synced)
        .await
        .map_err(|_| Error::store(format!("{kind} watch closed before sync")))
}

#[async_trait]
impl StateStore for KubeStateStore {
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
        wait_kind(ResourceKind::Bookstore, &self.bookstores_synced).await?;
        wait_kind(ResourceKind::Deployment, &self.deployments_synced).await?;
        wait_kind(ResourceKind::Service, &self.services_synced).await?;
        info!("all caches synced");
        Ok(())
    }
}
