//! In-memory cluster store
//!
//! Mirrors the API server behaviours the reconcilers depend on: resource
//! versions with optimistic concurrency, finalizer-gated deletion, label
//! selection, paged lists and watches that replay from a resource version.

use super::{ListOptions, Page, PodLabels, ResourceClient, WatchEvent};
use crate::crd::DirectResource;
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

const WATCH_BUFFER: usize = 1024;

struct Store<K> {
    objects: BTreeMap<String, K>,
    revision: u64,
    /// Every event with the revision it produced
    log: Vec<(u64, WatchEvent<K>)>,
}

/// In-memory [`ResourceClient`]
pub struct FakeClient<K: DirectResource> {
    store: Mutex<Store<K>>,
    events: broadcast::Sender<(u64, WatchEvent<K>)>,
}

impl<K: DirectResource> Default for FakeClient<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: DirectResource> FakeClient<K> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            store: Mutex::new(Store {
                objects: BTreeMap::new(),
                revision: 0,
                log: Vec::new(),
            }),
            events,
        }
    }

    /// Current objects, ordered by name
    pub fn objects(&self) -> Vec<K> {
        self.store.lock().objects.values().cloned().collect()
    }

    fn kind() -> String {
        K::kind(&()).to_string()
    }

    fn name_of(object: &K) -> Result<String> {
        object
            .meta()
            .name
            .clone()
            .ok_or_else(|| Error::InvalidArgument(format!("{} without a name", Self::kind())))
    }

    /// Bump the revision, stamp it on the object and publish the event
    fn commit(&self, store: &mut Store<K>, event: fn(K) -> WatchEvent<K>, object: &mut K) {
        store.revision += 1;
        object.meta_mut().resource_version = Some(store.revision.to_string());
        let event = event(object.clone());
        store.log.push((store.revision, event.clone()));
        let _ = self.events.send((store.revision, event));
    }

    fn check_version(stored: &K, object: &K, name: &str) -> Result<()> {
        match &object.meta().resource_version {
            Some(version) if Some(version) != stored.meta().resource_version.as_ref() => {
                Err(Error::Conflict {
                    kind: Self::kind(),
                    name: name.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    fn store_update(&self, store: &mut Store<K>, name: &str, mut object: K) -> K {
        if object.is_deleting() && object.meta().finalizers.as_ref().map_or(true, Vec::is_empty) {
            store.objects.remove(name);
            self.commit(store, WatchEvent::Deleted, &mut object);
            return object;
        }
        self.commit(store, WatchEvent::Modified, &mut object);
        store.objects.insert(name.to_string(), object.clone());
        object
    }
}

fn labels_of<K: DirectResource>(object: &K) -> BTreeMap<String, String> {
    object.meta().labels.clone().unwrap_or_default()
}

fn event_object<K>(event: &WatchEvent<K>) -> Option<&K> {
    match event {
        WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => Some(o),
        WatchEvent::Bookmark(_) => None,
    }
}

#[async_trait]
impl<K: DirectResource> ResourceClient<K> for FakeClient<K> {
    async fn get(&self, name: &str) -> Result<K> {
        self.store
            .lock()
            .objects
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(Self::kind(), name))
    }

    async fn list(&self, options: &ListOptions) -> Result<Page<K>> {
        let store = self.store.lock();
        let start = options.continue_token.clone().unwrap_or_default();
        let mut matching = store
            .objects
            .iter()
            .filter(|(name, _)| start.is_empty() || name.as_str() > start.as_str())
            .filter(|(_, object)| options.selector.matches(&labels_of(*object)))
            .map(|(_, object)| object.clone());

        let limit = if options.limit == 0 {
            usize::MAX
        } else {
            options.limit as usize
        };
        let items: Vec<K> = matching.by_ref().take(limit).collect();
        let continue_token = if matching.next().is_some() {
            items.last().and_then(|o| o.meta().name.clone())
        } else {
            None
        };
        Ok(Page {
            items,
            continue_token,
            resource_version: store.revision.to_string(),
        })
    }

    async fn create(&self, object: &K) -> Result<K> {
        let name = Self::name_of(object)?;
        let mut store = self.store.lock();
        if store.objects.contains_key(&name) {
            return Err(Error::ResourceExists {
                kind: Self::kind(),
                name,
            });
        }
        let mut created = object.clone();
        let meta = created.meta_mut();
        meta.creation_timestamp = Some(Time(chrono::Utc::now()));
        meta.deletion_timestamp = None;
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        self.commit(&mut store, WatchEvent::Added, &mut created);
        store.objects.insert(name, created.clone());
        Ok(created)
    }

    async fn update(&self, object: &K) -> Result<K> {
        let name = Self::name_of(object)?;
        let mut store = self.store.lock();
        let stored = store
            .objects
            .get(&name)
            .ok_or_else(|| Error::not_found(Self::kind(), &name))?;
        Self::check_version(stored, object, &name)?;

        let mut updated = object.clone();
        let meta = updated.meta_mut();
        meta.deletion_timestamp = stored.meta().deletion_timestamp.clone();
        meta.creation_timestamp = stored.meta().creation_timestamp.clone();
        meta.uid = stored.meta().uid.clone();
        Ok(self.store_update(&mut store, &name, updated))
    }

    async fn update_status(&self, object: &K) -> Result<K> {
        let name = Self::name_of(object)?;
        let mut store = self.store.lock();
        let stored = store
            .objects
            .get(&name)
            .ok_or_else(|| Error::not_found(Self::kind(), &name))?;
        Self::check_version(stored, object, &name)?;

        // only the status subresource changes
        let mut value = serde_json::to_value(stored)?;
        let incoming = serde_json::to_value(object)?;
        value["status"] = incoming.get("status").cloned().unwrap_or_default();
        let updated: K = serde_json::from_value(value)?;
        Ok(self.store_update(&mut store, &name, updated))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut store = self.store.lock();
        let mut object = store
            .objects
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(Self::kind(), name))?;

        let has_finalizers = object.meta().finalizers.as_ref().is_some_and(|f| !f.is_empty());
        if has_finalizers {
            if object.meta().deletion_timestamp.is_none() {
                object.meta_mut().deletion_timestamp = Some(Time(chrono::Utc::now()));
                self.commit(&mut store, WatchEvent::Modified, &mut object);
                store.objects.insert(name.to_string(), object);
            }
            return Ok(());
        }

        store.objects.remove(name);
        self.commit(&mut store, WatchEvent::Deleted, &mut object);
        Ok(())
    }

    async fn watch(
        &self,
        options: &ListOptions,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent<K>>>> {
        let store = self.store.lock();
        let since: u64 = resource_version.parse().unwrap_or(0);

        let replay: Vec<WatchEvent<K>> = if since == 0 {
            store.objects.values().cloned().map(WatchEvent::Added).collect()
        } else {
            store
                .log
                .iter()
                .filter(|(revision, _)| *revision > since)
                .map(|(_, event)| event.clone())
                .collect()
        };
        let receiver = self.events.subscribe();
        let last_replayed = store.revision;
        drop(store);

        let selector = options.selector.clone();
        let selector_live = selector.clone();
        let replayed = stream::iter(replay)
            .filter(move |event| {
                let keep = event_object(event).map_or(true, |o| selector.matches(&labels_of(o)));
                futures::future::ready(keep)
            })
            .map(Ok);

        // a lagging receiver ends the stream so the caller re-lists
        let live = BroadcastStream::new(receiver)
            .take_while(|item| futures::future::ready(item.is_ok()))
            .filter_map(move |item| {
                let event = match item {
                    Ok((revision, event)) if revision > last_replayed => Some(event),
                    _ => None,
                };
                let event = event.filter(|event| {
                    event_object(event).map_or(true, |o| selector_live.matches(&labels_of(o)))
                });
                futures::future::ready(event.map(Ok))
            });

        Ok(replayed.chain(live).boxed())
    }
}

/// Pod labels keyed by `namespace/name`
#[derive(Default)]
pub struct FakePodLabels {
    pods: Mutex<HashMap<String, BTreeMap<String, String>>>,
}

impl FakePodLabels {
    pub fn insert(&self, namespace: &str, name: &str, labels: BTreeMap<String, String>) {
        self.pods.lock().insert(format!("{namespace}/{name}"), labels);
    }
}

#[async_trait]
impl PodLabels for FakePodLabels {
    async fn pod_labels(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>> {
        self.pods
            .lock()
            .get(&format!("{namespace}/{name}"))
            .cloned()
            .ok_or_else(|| Error::not_found("Pod", format!("{namespace}/{name}")))
    }
}
