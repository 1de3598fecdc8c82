//! Shared informer
//!
//! Lists, then watches from the list's resource version, keeping a local
//! cache. A watch that ends or fails triggers a fresh list, and the list is
//! diffed against the cache so no transition is lost across the gap.

use crate::client::{ListOptions, ResourceClient, WatchEvent};
use crate::crd::DirectResource;
use crate::error::Result;
use dashmap::DashMap;
use futures::StreamExt;
use kube::ResourceExt;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const RELIST_DELAY: Duration = Duration::from_secs(1);

/// Kind of change delivered to a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Add,
    Update,
    Delete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A change to one object
#[derive(Debug, Clone)]
pub struct Event<K> {
    pub kind: EventKind,
    pub object: Arc<K>,
}

pub type EventSink<K> = Arc<dyn Fn(Event<K>) + Send + Sync>;

/// List+watch cache for one kind
pub struct Informer<K: DirectResource> {
    client: Arc<dyn ResourceClient<K>>,
    options: ListOptions,
    cache: DashMap<String, Arc<K>>,
}

impl<K: DirectResource> Informer<K> {
    pub fn new(client: Arc<dyn ResourceClient<K>>, options: ListOptions) -> Self {
        Self {
            client,
            options,
            cache: DashMap::new(),
        }
    }

    /// Cached object by name
    pub fn get(&self, name: &str) -> Option<Arc<K>> {
        self.cache.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Run until cancelled, delivering every change to `sink`
    pub async fn run(&self, sink: EventSink<K>, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            let resource_version = match self.relist(&sink).await {
                Ok(version) => version,
                Err(e) => {
                    warn!(kind = %K::kind(&()), error = %e, "list failed");
                    self.pause(&cancel).await;
                    continue;
                }
            };
            if let Err(e) = self.watch(&resource_version, &sink, &cancel).await {
                warn!(kind = %K::kind(&()), error = %e, "watch failed");
            }
            self.pause(&cancel).await;
        }
    }

    async fn pause(&self, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(RELIST_DELAY) => {}
        }
    }

    /// List everything and reconcile the cache; returns the list version
    pub async fn relist(&self, sink: &EventSink<K>) -> Result<String> {
        let mut options = self.options.clone();
        options.continue_token = None;
        let mut seen = HashSet::new();
        let resource_version = loop {
            let page = self.client.list(&options).await?;
            for object in page.items {
                seen.insert(object.name_any());
                self.apply(object, sink);
            }
            match page.continue_token {
                Some(token) => options.continue_token = Some(token),
                None => break page.resource_version,
            }
        };

        let gone: Vec<String> = self
            .cache
            .iter()
            .filter(|entry| !seen.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for name in gone {
            if let Some((_, object)) = self.cache.remove(&name) {
                sink(Event {
                    kind: EventKind::Delete,
                    object,
                });
            }
        }
        debug!(kind = %K::kind(&()), objects = self.cache.len(), "relisted");
        Ok(resource_version)
    }

    async fn watch(&self, resource_version: &str, sink: &EventSink<K>, cancel: &CancellationToken) -> Result<()> {
        let mut events = self.client.watch(&self.options, resource_version).await?;
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = events.next() => event,
            };
            match event {
                Some(Ok(WatchEvent::Added(object))) | Some(Ok(WatchEvent::Modified(object))) => {
                    self.apply(object, sink);
                }
                Some(Ok(WatchEvent::Deleted(object))) => {
                    let name = object.name_any();
                    self.cache.remove(&name);
                    sink(Event {
                        kind: EventKind::Delete,
                        object: Arc::new(object),
                    });
                }
                Some(Ok(WatchEvent::Bookmark(_))) => {}
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            }
        }
    }

    /// Cache `object`; Add when new, Update when its resource version moved
    fn apply(&self, object: K, sink: &EventSink<K>) {
        let name = object.name_any();
        let kind = match self.cache.get(&name) {
            None => EventKind::Add,
            Some(cached) if cached.resource_version() != object.resource_version() => {
                EventKind::Update
            }
            Some(_) => return,
        };
        let object = Arc::new(object);
        self.cache.insert(name, Arc::clone(&object));
        sink(Event { kind, object });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::FakeClient;
    use crate::crd::{DirectPVNode, DirectResource, NodeSpec};
    use parking_lot::Mutex;

    fn recorder() -> (EventSink<DirectPVNode>, Arc<Mutex<Vec<(EventKind, String)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: EventSink<DirectPVNode> = Arc::new(move |event: Event<DirectPVNode>| {
            sink_seen.lock().push((event.kind, event.object.name_any()));
        });
        (sink, seen)
    }

    #[tokio::test]
    async fn test_relist_diffs_cache() {
        let fake = Arc::new(FakeClient::<DirectPVNode>::new());
        fake.create(&DirectPVNode::new("n1", NodeSpec::default())).await.unwrap();
        let informer = Informer::new(fake.clone(), ListOptions::default());
        let (sink, seen) = recorder();

        informer.relist(&sink).await.unwrap();
        informer.relist(&sink).await.unwrap();
        assert_eq!(seen.lock().clone(), vec![(EventKind::Add, "n1".to_string())]);

        let mut node = fake.get("n1").await.unwrap();
        node.spec.refresh = true;
        fake.update(&node).await.unwrap();
        fake.create(&DirectPVNode::new("n2", NodeSpec::default())).await.unwrap();
        informer.relist(&sink).await.unwrap();

        fake.delete("n1").await.unwrap();
        informer.relist(&sink).await.unwrap();

        assert_eq!(
            seen.lock().clone(),
            vec![
                (EventKind::Add, "n1".to_string()),
                (EventKind::Update, "n1".to_string()),
                (EventKind::Add, "n2".to_string()),
                (EventKind::Delete, "n1".to_string()),
            ]
        );
        assert!(informer.get("n1").is_none());
        assert_eq!(informer.len(), 1);
    }

    #[tokio::test]
    async fn test_deleting_with_finalizers_is_update() {
        let fake = Arc::new(FakeClient::<DirectPVNode>::new());
        let mut node = DirectPVNode::new("n1", NodeSpec::default());
        node.add_finalizer("directpv.min.io/test");
        fake.create(&node).await.unwrap();

        let informer = Arc::new(Informer::new(fake.clone(), ListOptions::default()));
        let (sink, seen) = recorder();
        let cancel = CancellationToken::new();
        let task = {
            let informer = Arc::clone(&informer);
            let cancel = cancel.clone();
            tokio::spawn(async move { informer.run(sink, cancel).await })
        };

        while informer.is_empty() {
            tokio::task::yield_now().await;
        }
        fake.delete("n1").await.unwrap();
        while seen.lock().len() < 2 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(seen.lock()[1], (EventKind::Update, "n1".to_string()));
    }
}
