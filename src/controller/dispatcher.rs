//! Event dispatcher
//!
//! Feeds informer events for one kind through a rate-limited work queue to a
//! handler running on a fixed pool of workers. Only the latest pending event
//! per object is kept; a failed event is retried unless a newer one arrived.

use super::informer::{Event, EventKind, EventSink, Informer};
use super::queue::{RateLimiter, WorkQueue};
use crate::client::{ListOptions, ResourceClient};
use crate::crd::DirectResource;
use crate::error::{ErrorAction, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use kube::ResourceExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default number of workers per handler
pub const DEFAULT_WORKERS: usize = 40;

/// Reacts to changes of one kind. Delivery is at least once.
#[async_trait]
pub trait EventHandler<K: DirectResource>: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Restrict the objects this handler sees
    fn list_options(&self) -> ListOptions {
        ListOptions::default()
    }

    async fn handle(&self, kind: EventKind, object: Arc<K>) -> Result<()>;
}

/// Runs one handler
pub struct Dispatcher<K: DirectResource> {
    informer: Arc<Informer<K>>,
    queue: Arc<WorkQueue>,
    pending: Arc<DashMap<String, Event<K>>>,
    handler: Arc<dyn EventHandler<K>>,
    workers: usize,
}

impl<K: DirectResource> Dispatcher<K> {
    pub fn new(client: Arc<dyn ResourceClient<K>>, handler: Arc<dyn EventHandler<K>>, workers: usize) -> Self {
        Self {
            informer: Arc::new(Informer::new(client, handler.list_options())),
            queue: WorkQueue::new(RateLimiter::default()),
            pending: Arc::new(DashMap::new()),
            handler,
            workers: workers.max(1),
        }
    }

    /// Run until `cancel` fires, then drain the workers
    pub async fn run(self, cancel: CancellationToken) {
        let name = self.handler.name().to_string();
        info!(handler = %name, workers = self.workers, "starting dispatcher");

        let sink: EventSink<K> = {
            let pending = Arc::clone(&self.pending);
            let queue = Arc::clone(&self.queue);
            Arc::new(move |event: Event<K>| {
                let key = event.object.name_any();
                merge_pending(&pending, &key, event);
                queue.add(&key);
            })
        };

        let informer = {
            let informer = Arc::clone(&self.informer);
            let cancel = cancel.clone();
            tokio::spawn(async move { informer.run(sink, cancel).await })
        };

        let mut workers = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let worker = Worker {
                queue: Arc::clone(&self.queue),
                pending: Arc::clone(&self.pending),
                handler: Arc::clone(&self.handler),
            };
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move { worker.run(cancel).await }));
        }

        cancel.cancelled().await;
        self.queue.shut_down();
        for handle in workers {
            let _ = handle.await;
        }
        let _ = informer.await;
        info!(handler = %name, "dispatcher stopped");
    }
}

/// Keep the newest event; an unprocessed Add stays an Add
fn merge_pending<K>(pending: &DashMap<String, Event<K>>, key: &str, event: Event<K>) {
    let merged = match pending.get(key) {
        Some(previous) if previous.kind == EventKind::Add && event.kind == EventKind::Update => Event {
            kind: EventKind::Add,
            object: event.object,
        },
        _ => event,
    };
    pending.insert(key.to_string(), merged);
}

struct Worker<K: DirectResource> {
    queue: Arc<WorkQueue>,
    pending: Arc<DashMap<String, Event<K>>>,
    handler: Arc<dyn EventHandler<K>>,
}

impl<K: DirectResource> Worker<K> {
    async fn run(self, cancel: CancellationToken) {
        loop {
            let key = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                key = self.queue.pop() => match key {
                    Some(key) => key,
                    None => return,
                },
            };
            self.process(&key).await;
            self.queue.done(&key);
        }
    }

    async fn process(&self, key: &str) {
        let Some((_, event)) = self.pending.remove(key) else {
            return;
        };
        let name = self.handler.name();
        debug!(handler = %name, object = %key, event = %event.kind, "handling event");

        let error = match self.handler.handle(event.kind, Arc::clone(&event.object)).await {
            Ok(()) => {
                self.queue.forget(key);
                return;
            }
            Err(e) => e,
        };

        // retry the failed event unless a newer one superseded it
        self.pending.entry(key.to_string()).or_insert(event);
        match error.action() {
            ErrorAction::RequeueWithBackoff => {
                warn!(handler = %name, object = %key, error = %error, retries = self.queue.num_requeues(key), "handler failed; requeueing");
                self.queue.add_rate_limited(key);
            }
            ErrorAction::RequeueAfter(delay) => {
                warn!(handler = %name, object = %key, error = %error, ?delay, "handler failed; requeueing later");
                self.queue.add_after(key, delay);
            }
            ErrorAction::NoRequeue => {
                error!(handler = %name, object = %key, error = %error, "handler failed permanently");
                self.pending.remove(key);
                self.queue.forget(key);
            }
        }
    }
}
