//! Bookstore convergence
//!
//! One pass takes a Bookstore key, derives the Deployment and Service the
//! spec asks for, creates or corrects them, and mirrors the Deployment's
//! available replicas into the Bookstore status. Passes are idempotent: a
//! pass over a converged Bookstore writes nothing.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ObjectReference, Service};
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::client::KubeClient;
use crate::crd::{Bookstore, BookstoreStatus};
use crate::events::{actions, messages, reasons, EventPublisher, NoopEventPublisher};
use crate::key::ReconcileKey;
use crate::owner::is_controlled_by;
use crate::registry::{ResourceKind, ResourceRegistry};
use crate::store::StateStore;
use crate::workload::{
    deployment_drifted, deployment_update, desired_deployment, desired_service, service_drifted,
    service_update,
};
use crate::Error;

/// Controller context shared by every worker
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(store, kube)
///     .events(Arc::new(KubeEventPublisher::new(client, "bookstore-controller")))
///     .build();
/// ```
pub struct Context {
    /// Read-only cache of Bookstores, Deployments and Services
    pub store: Arc<dyn StateStore>,
    /// Write path to the API server (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Kubernetes Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Primary and secondary kinds
    pub registry: ResourceRegistry,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(store: Arc<dyn StateStore>, kube: Arc<dyn KubeClient>) -> ContextBuilder {
        ContextBuilder::new(store, kube)
    }

    /// Context with no event sink and the Bookstore registry
    pub fn new(store: Arc<dyn StateStore>, kube: Arc<dyn KubeClient>) -> Self {
        Self::builder(store, kube).build()
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    store: Arc<dyn StateStore>,
    kube: Arc<dyn KubeClient>,
    events: Option<Arc<dyn EventPublisher>>,
    registry: ResourceRegistry,
}

impl ContextBuilder {
    fn new(store: Arc<dyn StateStore>, kube: Arc<dyn KubeClient>) -> Self {
        Self {
            store,
            kube,
            events: None,
            registry: ResourceRegistry::bookstore(),
        }
    }

    /// Set the event publisher (defaults to a no-op publisher)
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            store: self.store,
            kube: self.kube,
            events: self
                .events
                .unwrap_or_else(|| Arc::new(NoopEventPublisher)),
            registry: self.registry,
        }
    }
}

/// How a pass that did not fail ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Deployment, Service and status match the spec
    Synced,
    /// The Bookstore is gone; nothing to do
    PrimaryMissing,
    /// The spec cannot be acted on until the user fixes it
    InvalidSpec,
}

/// Converge one Bookstore
///
/// Returns an error for anything worth retrying: cache read failures, API
/// failures and ownership conflicts. Steps run in order and the first error
/// aborts the rest of the pass.
#[instrument(skip(ctx), fields(key = %key))]
pub async fn reconcile(key: &ReconcileKey, ctx: &Context) -> Result<ReconcileOutcome, Error> {
    let Some(bookstore) = ctx.store.get_bookstore(key.namespace(), key.name())? else {
        debug!("Bookstore no longer exists");
        return Ok(ReconcileOutcome::PrimaryMissing);
    };
    let subject = bookstore.object_ref(&());

    if let Err(e) = bookstore.spec.validate() {
        return Ok(invalid_spec(e, &subject, ctx).await);
    }

    let deployment = converge_deployment(&bookstore, &subject, ctx).await?;

    // the Deployment stays converged even when the Service cannot be built
    if let Err(e) = bookstore.spec.validate_service() {
        return Ok(invalid_spec(e, &subject, ctx).await);
    }
    converge_service(&bookstore, &subject, ctx).await?;
    update_status(&bookstore, &deployment, ctx).await?;

    ctx.events
        .publish(
            &subject,
            EventType::Normal,
            reasons::SYNCED,
            actions::RECONCILE,
            Some(messages::RESOURCE_SYNCED.to_string()),
        )
        .await;
    Ok(ReconcileOutcome::Synced)
}

/// Publish the validation warning; the key is not retried
async fn invalid_spec(
    error: Error,
    subject: &ObjectReference,
    ctx: &Context,
) -> ReconcileOutcome {
    warn!(error = %error, "invalid Bookstore spec, not retrying");
    ctx.events
        .publish(
            subject,
            EventType::Warning,
            reasons::VALIDATION_FAILED,
            actions::RECONCILE,
            Some(error.to_string()),
        )
        .await;
    ReconcileOutcome::InvalidSpec
}

/// Publish the ownership warning and build the matching error
async fn ownership_conflict(
    kind: ResourceKind,
    name: &str,
    subject: &ObjectReference,
    ctx: &Context,
) -> Error {
    let note = messages::resource_exists(name);
    warn!(%kind, name, "{note}");
    ctx.events
        .publish(
            subject,
            EventType::Warning,
            reasons::ERR_RESOURCE_EXISTS,
            actions::RECONCILE,
            Some(note),
        )
        .await;
    Error::ownership_conflict(kind.as_str(), name)
}

fn owner_uid(bookstore: &Bookstore) -> Result<String, Error> {
    bookstore
        .uid()
        .ok_or_else(|| Error::internal(format!("Bookstore {} has no uid", bookstore.name_any())))
}

async fn converge_deployment(
    bookstore: &Bookstore,
    subject: &ObjectReference,
    ctx: &Context,
) -> Result<Arc<Deployment>, Error> {
    let namespace = bookstore.namespace().unwrap_or_default();
    let name = bookstore.spec.deployment_name.as_str();

    let Some(current) = ctx.store.get_deployment(&namespace, name)? else {
        let desired = desired_deployment(bookstore, &ctx.registry)?;
        info!(deployment = name, replicas = ?desired.spec.as_ref().and_then(|s| s.replicas), "creating Deployment");
        return ctx.kube.create_deployment(&desired).await.map(Arc::new);
    };

    if !is_controlled_by(&current.metadata, &owner_uid(bookstore)?) {
        return Err(ownership_conflict(ResourceKind::Deployment, name, subject, ctx).await);
    }

    if deployment_drifted(bookstore, &current) {
        info!(
            deployment = name,
            from = ?current.spec.as_ref().and_then(|s| s.replicas),
            to = ?bookstore.spec.replicas,
            "updating Deployment replicas"
        );
        let next = deployment_update(bookstore, &ctx.registry, &current)?;
        return ctx.kube.update_deployment(&next).await.map(Arc::new);
    }

    Ok(current)
}

async fn converge_service(
    bookstore: &Bookstore,
    subject: &ObjectReference,
    ctx: &Context,
) -> Result<Arc<Service>, Error> {
    let namespace = bookstore.namespace().unwrap_or_default();
    let name = bookstore.spec.service_name.as_str();
    let desired = desired_service(bookstore, &ctx.registry)?;

    let Some(current) = ctx.store.get_service(&namespace, name)? else {
        info!(service = name, "creating Service");
        return ctx.kube.create_service(&desired).await.map(Arc::new);
    };

    if !is_controlled_by(&current.metadata, &owner_uid(bookstore)?) {
        return Err(ownership_conflict(ResourceKind::Service, name, subject, ctx).await);
    }

    if service_drifted(&desired, &current) {
        info!(service = name, "updating Service");
        let next = service_update(&desired, &current);
        return ctx.kube.update_service(&next).await.map(Arc::new);
    }

    Ok(current)
}

async fn update_status(
    bookstore: &Bookstore,
    deployment: &Deployment,
    ctx: &Context,
) -> Result<(), Error> {
    let status = BookstoreStatus {
        available_replicas: deployment
            .status
            .as_ref()
            .and_then(|s| s.available_replicas)
            .unwrap_or(0),
    };
    if bookstore.status.as_ref() == Some(&status) {
        debug!("status unchanged");
        return Ok(());
    }

    debug!(available_replicas = status.available_replicas, "updating status");
    let mut next = bookstore.clone();
    next.status = Some(status);
    ctx.kube.update_bookstore_status(&next).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MemoryClient, MockKubeClient, WriteOp};
    use crate::crd::BookstoreSpec;
    use crate::events::{MockEventPublisher, RecordingEventPublisher};
    use crate::store::{MemoryStore, MockStateStore};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    fn sample_bookstore(name: &str) -> Bookstore {
        let mut b = Bookstore::new(
            name,
            BookstoreSpec {
                deployment_name: "d1".to_string(),
                service_name: "s1".to_string(),
                deployment_image_name: "bookstore".to_string(),
                deployment_image_tag: "1.0".to_string(),
                replicas: Some(3),
                service_type: "NodePort".to_string(),
                container_port: 8080,
                target_port: 8080,
                ..Default::default()
            },
        );
        b.metadata.namespace = Some("shop".to_string());
        b
    }

    struct Harness {
        store: Arc<MemoryStore>,
        client: Arc<MemoryClient>,
        events: Arc<RecordingEventPublisher>,
        ctx: Context,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(MemoryClient::new(Arc::clone(&store)));
        let events = Arc::new(RecordingEventPublisher::new());
        let ctx = Context::builder(store.clone(), client.clone())
            .events(events.clone())
            .build();
        Harness {
            store,
            client,
            events,
            ctx,
        }
    }

    fn key() -> ReconcileKey {
        ReconcileKey::new("shop", "store1")
    }

    fn foreign_deployment() -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("d1".to_string()),
                namespace: Some("shop".to_string()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "apps/v1".to_string(),
                    kind: "Something".to_string(),
                    name: "other".to_string(),
                    uid: "someone-else".to_string(),
                    controller: Some(true),
                    block_owner_deletion: None,
                }]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Story: a new Bookstore gets its Deployment and Service created and a
    /// Synced event.
    #[tokio::test]
    async fn story_new_bookstore_creates_deployment_and_service() {
        let h = harness();
        h.store.apply_bookstore(sample_bookstore("store1"));

        let outcome = reconcile(&key(), &h.ctx).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Synced);
        let writes = h.client.writes();
        assert_eq!(writes[0].op, WriteOp::Create);
        assert_eq!(writes[0].kind, ResourceKind::Deployment);
        assert_eq!(writes[1].op, WriteOp::Create);
        assert_eq!(writes[1].kind, ResourceKind::Service);

        let d = h.store.get_deployment("shop", "d1").unwrap().unwrap();
        assert_eq!(d.spec.as_ref().unwrap().replicas, Some(3));
        assert_eq!(h.events.with_reason(reasons::SYNCED).len(), 1);
    }

    /// Story: a second pass over a converged Bookstore writes nothing.
    #[tokio::test]
    async fn story_second_pass_is_a_no_op() {
        let h = harness();
        h.store.apply_bookstore(sample_bookstore("store1"));
        reconcile(&key(), &h.ctx).await.unwrap();
        h.client.clear_writes();

        let outcome = reconcile(&key(), &h.ctx).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Synced);
        assert!(h.client.writes().is_empty(), "{:?}", h.client.writes());
    }

    /// Story: scaling the Bookstore updates only the Deployment.
    #[tokio::test]
    async fn story_replica_change_updates_deployment_once() {
        let h = harness();
        let stored = h.store.apply_bookstore(sample_bookstore("store1")).unwrap();
        reconcile(&key(), &h.ctx).await.unwrap();
        h.client.clear_writes();

        let current = h.store.get_bookstore("shop", "store1").unwrap().unwrap();
        let mut scaled = (*current).clone();
        scaled.spec.replicas = Some(5);
        assert_eq!(scaled.metadata.uid, stored.metadata.uid);
        h.store.apply_bookstore(scaled);

        reconcile(&key(), &h.ctx).await.unwrap();

        let deployment_writes = h.client.writes_for(ResourceKind::Deployment);
        assert_eq!(deployment_writes.len(), 1);
        assert_eq!(deployment_writes[0].op, WriteOp::Update);
        assert!(h.client.writes_for(ResourceKind::Service).is_empty());
        let d = h.store.get_deployment("shop", "d1").unwrap().unwrap();
        assert_eq!(d.spec.as_ref().unwrap().replicas, Some(5));
    }

    /// Story: status mirrors the Deployment's available replicas.
    #[tokio::test]
    async fn story_status_follows_available_replicas() {
        let h = harness();
        h.store.apply_bookstore(sample_bookstore("store1"));
        reconcile(&key(), &h.ctx).await.unwrap();

        h.store.set_available_replicas("shop", "d1", 3);
        reconcile(&key(), &h.ctx).await.unwrap();

        let b = h.store.get_bookstore("shop", "store1").unwrap().unwrap();
        assert_eq!(b.available_replicas(), 3);
        assert_eq!(b.spec.replicas, Some(3));
    }

    /// Story: a Deployment someone else controls is never touched.
    #[tokio::test]
    async fn story_foreign_deployment_is_left_alone() {
        let store = Arc::new(MemoryStore::new());
        store.apply_bookstore(sample_bookstore("store1"));
        store.apply_deployment(foreign_deployment());

        // no expectations: any write panics the test
        let kube = Arc::new(MockKubeClient::new());
        let events = Arc::new(RecordingEventPublisher::new());
        let ctx = Context::builder(store.clone(), kube)
            .events(events.clone())
            .build();

        let err = reconcile(&key(), &ctx).await.unwrap_err();

        assert!(matches!(err, Error::OwnershipConflict { .. }));
        assert!(err.is_retryable());
        let warnings = events.with_reason(reasons::ERR_RESOURCE_EXISTS);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].type_, EventType::Warning);
        assert!(warnings[0].note.as_deref().unwrap().contains("\"d1\""));
        assert!(events.with_reason(reasons::SYNCED).is_empty());
    }

    /// Story: a foreign Service blocks the pass after the Deployment converged.
    #[tokio::test]
    async fn story_foreign_service_conflicts() {
        let h = harness();
        h.store.apply_bookstore(sample_bookstore("store1"));
        let mut s = Service::default();
        s.metadata.name = Some("s1".to_string());
        s.metadata.namespace = Some("shop".to_string());
        h.store.apply_service(s);

        let err = reconcile(&key(), &h.ctx).await.unwrap_err();

        assert!(matches!(err, Error::OwnershipConflict { .. }));
        assert!(err.to_string().contains("s1"));
        assert!(h.client.writes_for(ResourceKind::Service).is_empty());
        assert!(h.client.writes_for(ResourceKind::Bookstore).is_empty());
    }

    /// Story: an invalid spec raises a warning and is not retried.
    #[tokio::test]
    async fn story_invalid_spec_is_dropped_with_warning() {
        let h = harness();
        let mut b = sample_bookstore("store1");
        b.spec.deployment_name.clear();
        h.store.apply_bookstore(b);

        let outcome = reconcile(&key(), &h.ctx).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::InvalidSpec);
        assert!(h.client.writes().is_empty());
        let warnings = h.events.with_reason(reasons::VALIDATION_FAILED);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].type_, EventType::Warning);
    }

    /// Story: a Bookstore deleted while its key was queued ends the pass quietly.
    #[tokio::test]
    async fn story_deleted_bookstore_is_dropped() {
        let h = harness();
        let outcome = reconcile(&key(), &h.ctx).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::PrimaryMissing);
        assert!(h.client.writes().is_empty());
        assert!(h.events.events().is_empty());
    }

    /// Story: a failed Deployment create aborts before the Service is touched.
    #[tokio::test]
    async fn story_api_failure_aborts_remaining_steps() {
        let h = harness();
        h.store.apply_bookstore(sample_bookstore("store1"));
        h.client.fail_next_write("connection refused");

        let err = reconcile(&key(), &h.ctx).await.unwrap_err();

        assert!(err.is_retryable());
        assert!(err.to_string().contains("connection refused"));
        assert!(h.client.writes().is_empty());
        assert!(h.events.events().is_empty());
    }

    /// Story: a cache read failure surfaces as a retryable error.
    #[tokio::test]
    async fn story_store_failure_is_retryable() {
        let mut store = MockStateStore::new();
        store
            .expect_get_bookstore()
            .returning(|_, _| Err(Error::store("cache unavailable")));
        let ctx = Context::new(Arc::new(store), Arc::new(MockKubeClient::new()));

        let err = reconcile(&key(), &ctx).await.unwrap_err();
        assert!(err.is_retryable());
    }

    /// Story: a stale status write surfaces as a retryable conflict.
    #[tokio::test]
    async fn story_status_conflict_is_retryable() {
        let store = Arc::new(MemoryStore::new());
        store.apply_bookstore(sample_bookstore("store1"));

        let mut kube = MockKubeClient::new();
        kube.expect_create_deployment()
            .times(1)
            .returning(|d| Ok(d.clone()));
        kube.expect_create_service()
            .times(1)
            .returning(|s| Ok(s.clone()));
        kube.expect_update_bookstore_status()
            .times(1)
            .returning(|_| Err(Error::conflict("Bookstore", "store1", "stale")));
        let ctx = Context::new(store, Arc::new(kube));

        let err = reconcile(&key(), &ctx).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(err.is_retryable());
    }

    /// Story: a missing service name still lets the Deployment converge; the
    /// pass then stops with a warning and is not retried.
    #[tokio::test]
    async fn story_missing_service_name_still_creates_deployment() {
        let h = harness();
        let mut b = sample_bookstore("store1");
        b.spec.service_name.clear();
        h.store.apply_bookstore(b);

        let outcome = reconcile(&key(), &h.ctx).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::InvalidSpec);
        let d = h.store.get_deployment("shop", "d1").unwrap().unwrap();
        assert_eq!(d.spec.as_ref().unwrap().replicas, Some(3));
        let deployment_writes = h.client.writes_for(ResourceKind::Deployment);
        assert_eq!(deployment_writes.len(), 1);
        assert_eq!(deployment_writes[0].op, WriteOp::Create);
        assert!(h.client.writes_for(ResourceKind::Service).is_empty());
        assert!(h.client.writes_for(ResourceKind::Bookstore).is_empty());

        let warnings = h.events.with_reason(reasons::VALIDATION_FAILED);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].note.as_deref().unwrap().contains("service name"));
        assert!(h.events.with_reason(reasons::SYNCED).is_empty());
    }

    /// Story: an owned Service edited out of band is put back with a single
    /// update and the Deployment is left alone.
    #[tokio::test]
    async fn story_service_drift_is_corrected_once() {
        let h = harness();
        h.store.apply_bookstore(sample_bookstore("store1"));
        reconcile(&key(), &h.ctx).await.unwrap();
        h.client.clear_writes();

        let current = h.store.get_service("shop", "s1").unwrap().unwrap();
        let mut edited = (*current).clone();
        if let Some(spec) = edited.spec.as_mut() {
            spec.type_ = Some("ClusterIP".to_string());
            spec.ports.as_mut().unwrap()[0].port = 9090;
        }
        h.store.apply_service(edited);

        let outcome = reconcile(&key(), &h.ctx).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Synced);
        let service_writes = h.client.writes_for(ResourceKind::Service);
        assert_eq!(service_writes.len(), 1);
        assert_eq!(service_writes[0].op, WriteOp::Update);
        assert!(h.client.writes_for(ResourceKind::Deployment).is_empty());

        let s = h.store.get_service("shop", "s1").unwrap().unwrap();
        let spec = s.spec.as_ref().unwrap();
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        assert_eq!(spec.ports.as_ref().unwrap()[0].port, 8080);
    }

    /// Story: a converged pass reports exactly one Synced event on the Bookstore.
    #[tokio::test]
    async fn story_synced_event_targets_the_bookstore() {
        let store = Arc::new(MemoryStore::new());
        store.apply_bookstore(sample_bookstore("store1"));
        let client = Arc::new(MemoryClient::new(Arc::clone(&store)));

        let mut events = MockEventPublisher::new();
        events
            .expect_publish()
            .withf(|obj, type_, reason, action, note| {
                obj.name.as_deref() == Some("store1")
                    && obj.namespace.as_deref() == Some("shop")
                    && *type_ == EventType::Normal
                    && reason == reasons::SYNCED
                    && action == actions::RECONCILE
                    && note.as_deref() == Some(messages::RESOURCE_SYNCED)
            })
            .times(1)
            .return_const(());
        let ctx = Context::builder(store, client)
            .events(Arc::new(events))
            .build();

        let outcome = reconcile(&key(), &ctx).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Synced);
    }
}
