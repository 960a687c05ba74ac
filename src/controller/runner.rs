//! Worker pool
//!
//! A fixed number of tokio tasks pull keys from one shared [`WorkQueue`] and
//! run [`reconcile`] on them. The queue guarantees a key is held by at most
//! one worker, so passes for the same Bookstore never overlap.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bookstore::{reconcile, Context};
use crate::config::ControllerConfig;
use crate::key::ReconcileKey;
use crate::queue::WorkQueue;
use crate::router::EventRouter;
use crate::Error;

/// Wires the event router, work queue and workers together
pub struct Controller {
    ctx: Arc<Context>,
    queue: Arc<WorkQueue>,
    workers: usize,
}

impl Controller {
    /// Create a controller; nothing runs until [`run`](Self::run)
    pub fn new(ctx: Arc<Context>, config: &ControllerConfig) -> Self {
        Self {
            ctx,
            queue: Arc::new(WorkQueue::with_config(&config.rate_limit)),
            workers: config.workers.max(1),
        }
    }

    /// The queue workers pull from
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Run until `cancel` fires
    ///
    /// Subscribes the router, waits for the caches to sync, then starts the
    /// workers. On cancellation the queue is shut down, in-flight passes
    /// finish, and every task is awaited before returning.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), Error> {
        info!("starting Bookstore controller");
        let router = Arc::new(EventRouter::new(
            Arc::clone(&self.ctx.store),
            Arc::clone(&self.queue),
            &self.ctx.registry,
        ));
        let routing = cancel.child_token();
        let routers = router.spawn(routing.clone());

        info!("waiting for caches to sync");
        let synced = tokio::select! {
            r = self.ctx.store.wait_for_sync() => Some(r),
            _ = cancel.cancelled() => None,
        };
        match synced {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                routing.cancel();
                join_all("router", routers).await;
                return Err(e);
            }
            None => {
                info!("cancelled before caches synced");
                self.queue.shut_down();
                join_all("router", routers).await;
                return Ok(());
            }
        }

        let workers: Vec<JoinHandle<()>> = (0..self.workers)
            .map(|id| {
                let ctx = Arc::clone(&self.ctx);
                let queue = Arc::clone(&self.queue);
                tokio::spawn(run_worker(id, ctx, queue))
            })
            .collect();
        info!(workers = self.workers, "started workers");

        cancel.cancelled().await;
        info!("shutting down workers");
        self.queue.shut_down();
        join_all("worker", workers).await;
        join_all("router", routers).await;
        info!("controller stopped");
        Ok(())
    }
}

async fn join_all(role: &str, tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        if let Err(e) = task.await {
            error!(role, error = %e, "task ended abnormally");
        }
    }
}

async fn run_worker(id: usize, ctx: Arc<Context>, queue: Arc<WorkQueue>) {
    debug!(worker = id, "worker started");
    while let Some(key) = queue.get().await {
        process_key(&ctx, &queue, key).await;
    }
    debug!(worker = id, "worker stopped");
}

/// Run one pass for `key` and settle it with the queue
///
/// Success and terminal failures clear the key's backoff; retryable failures
/// requeue it rate-limited. The key is always released with `done`.
pub async fn process_key(ctx: &Context, queue: &WorkQueue, key: ReconcileKey) {
    match reconcile(&key, ctx).await {
        Ok(outcome) => {
            queue.forget(&key);
            debug!(key = %key, ?outcome, "successfully synced");
        }
        Err(e) if !e.is_retryable() => {
            queue.forget(&key);
            warn!(key = %key, error = %e, "dropping key after terminal error");
        }
        Err(e) => {
            let retries = queue.num_requeues(&key);
            queue.add_rate_limited(key.clone());
            error!(key = %key, retries, error = %e, "error syncing, requeuing");
        }
    }
    queue.done(&key);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::client::{KubeClient, MemoryClient};
    use crate::crd::{Bookstore, BookstoreSpec};
    use crate::store::MemoryStore;

    fn sample_bookstore() -> Bookstore {
        let mut b = Bookstore::new(
            "store1",
            BookstoreSpec {
                deployment_name: "d1".to_string(),
                service_name: "s1".to_string(),
                replicas: Some(1),
                container_port: 80,
                ..Default::default()
            },
        );
        b.metadata.namespace = Some("shop".to_string());
        b
    }

    fn context(store: &Arc<MemoryStore>) -> (Arc<MemoryClient>, Arc<Context>) {
        let client = Arc::new(MemoryClient::new(Arc::clone(store)));
        let ctx = Arc::new(Context::new(store.clone(), client.clone() as Arc<dyn KubeClient>));
        (client, ctx)
    }

    #[tokio::test]
    async fn story_failed_pass_is_requeued_with_backoff() {
        let store = Arc::new(MemoryStore::new());
        store.apply_bookstore(sample_bookstore());
        let (client, ctx) = context(&store);
        let queue = WorkQueue::default();
        client.fail_next_write("connection refused");

        let key = ReconcileKey::new("shop", "store1");
        queue.add(key.clone());
        let got = queue.get().await.unwrap();
        process_key(&ctx, &queue, got).await;

        assert_eq!(queue.num_requeues(&key), 1);
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.parked(), 1);
    }

    #[tokio::test]
    async fn story_success_forgets_backoff() {
        let store = Arc::new(MemoryStore::new());
        store.apply_bookstore(sample_bookstore());
        let (_client, ctx) = context(&store);
        let queue = WorkQueue::default();

        let key = ReconcileKey::new("shop", "store1");
        queue.add_rate_limited(key.clone());
        queue.add_rate_limited(key.clone());
        assert_eq!(queue.num_requeues(&key), 2);

        queue.add(key.clone());
        let got = queue.get().await.unwrap();
        process_key(&ctx, &queue, got).await;

        assert_eq!(queue.num_requeues(&key), 0);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn story_run_converges_and_stops_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        store.apply_bookstore(sample_bookstore());
        let (client, ctx) = context(&store);
        let controller = Controller::new(ctx, &ControllerConfig::default());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(controller.run(cancel.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.service_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(store.deployment_count(), 1);
        assert!(!client.writes().is_empty());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn story_cancel_before_sync_returns_cleanly() {
        let store = Arc::new(MemoryStore::unsynced());
        let (_client, ctx) = context(&store);
        let controller = Controller::new(ctx, &ControllerConfig::default());

        let cancel = CancellationToken::new();
        cancel.cancel();
        controller.run(cancel).await.unwrap();
    }
}
