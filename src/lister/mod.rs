//! Listers
//!
//! Builder-style queries that produce lazy streams of latest-version objects.
//! A single producer task pages through the cluster and hands results over a
//! one-slot channel; every send is raced against cancellation. When only a
//! name set is given, listing is skipped and each name is fetched directly.

mod builders;
mod selector;

pub use builders::{DriveLister, InitRequestLister, NodeLister, VolumeLister};
pub use selector::{LabelSelector, Requirement};

use crate::client::{ListOptions, ResourceClient};
use crate::crd::DirectResource;
use crate::error::Result;
use futures::StreamExt;
use kube::ResourceExt;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default page size, also the default worker fan-out
pub const MAX_THREAD_COUNT: u32 = 200;

type Predicate<K> = Arc<dyn Fn(&K) -> bool + Send + Sync>;

/// Generic list query shared by the per-kind builders
pub struct Query<K: DirectResource> {
    client: Arc<dyn ResourceClient<K>>,
    selector: LabelSelector,
    names: Vec<String>,
    predicates: Vec<Predicate<K>>,
    ignore_not_found: bool,
    max_objects: u32,
}

impl<K: DirectResource> Query<K> {
    pub fn new(client: Arc<dyn ResourceClient<K>>) -> Self {
        Self {
            client,
            selector: LabelSelector::new(),
            names: Vec::new(),
            predicates: Vec::new(),
            ignore_not_found: false,
            max_objects: MAX_THREAD_COUNT,
        }
    }

    pub(crate) fn select(&mut self, f: impl FnOnce(LabelSelector) -> LabelSelector) {
        self.selector = f(std::mem::take(&mut self.selector));
    }

    pub(crate) fn add_names<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            let name = name.into();
            if !self.names.contains(&name) {
                self.names.push(name);
            }
        }
    }

    pub(crate) fn filter(&mut self, predicate: impl Fn(&K) -> bool + Send + Sync + 'static) {
        self.predicates.push(Arc::new(predicate));
    }

    pub(crate) fn set_ignore_not_found(&mut self, ignore: bool) {
        self.ignore_not_found = ignore;
    }

    pub(crate) fn set_max_objects(&mut self, max_objects: u32) {
        self.max_objects = max_objects;
    }

    fn accepts(predicates: &[Predicate<K>], object: &K) -> bool {
        predicates.iter().all(|p| p(object))
    }

    /// Lazy stream of results; stops when `cancel` fires
    pub fn list(self, cancel: CancellationToken) -> ReceiverStream<Result<K>> {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let result = if self.selector.is_empty() && !self.names.is_empty() {
                self.get_only(&tx, &cancel).await
            } else {
                self.list_pages(&tx, &cancel).await
            };
            if let Err(e) = result {
                send(&tx, &cancel, Err(e)).await;
            }
        });
        ReceiverStream::new(rx)
    }

    /// Collect every result, failing on the first error
    pub async fn get(self, cancel: CancellationToken) -> Result<Vec<K>> {
        let mut stream = self.list(cancel);
        let mut objects = Vec::new();
        while let Some(item) = stream.next().await {
            objects.push(item?);
        }
        Ok(objects)
    }

    async fn get_only(&self, tx: &mpsc::Sender<Result<K>>, cancel: &CancellationToken) -> Result<()> {
        for name in &self.names {
            if !self.fetch(name, tx, cancel).await? {
                break;
            }
        }
        Ok(())
    }

    async fn list_pages(&self, tx: &mpsc::Sender<Result<K>>, cancel: &CancellationToken) -> Result<()> {
        let wanted: HashSet<&str> = self.names.iter().map(String::as_str).collect();
        let mut resolved: HashSet<String> = HashSet::new();
        let mut options = ListOptions {
            selector: self.selector.clone(),
            limit: self.max_objects,
            continue_token: None,
        };

        loop {
            let page = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                page = self.client.list(&options) => page?,
            };
            for object in page.items {
                let name = object.name_any();
                if !wanted.is_empty() {
                    if !wanted.contains(name.as_str()) {
                        continue;
                    }
                    resolved.insert(name);
                }
                if !Self::accepts(&self.predicates, &object) {
                    continue;
                }
                if !send(tx, cancel, Ok(object)).await {
                    return Ok(());
                }
            }
            match page.continue_token {
                Some(token) => options.continue_token = Some(token),
                None => break,
            }
        }

        for name in self.names.iter().filter(|n| !resolved.contains(n.as_str())) {
            if !self.fetch(name, tx, cancel).await? {
                break;
            }
        }
        Ok(())
    }

    /// Get one name and forward it; returns false once the consumer is gone
    async fn fetch(&self, name: &str, tx: &mpsc::Sender<Result<K>>, cancel: &CancellationToken) -> Result<bool> {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(false),
            fetched = self.client.get(name) => fetched,
        };
        let object = match fetched {
            Ok(object) => object,
            Err(e) if e.is_not_found() && self.ignore_not_found => {
                debug!(name = %name, "ignoring missing object");
                return Ok(true);
            }
            Err(e) => return Err(e),
        };
        let labels = object.labels().clone();
        if !self.selector.matches(&labels) || !Self::accepts(&self.predicates, &object) {
            return Ok(true);
        }
        Ok(send(tx, cancel, Ok(object)).await)
    }
}

async fn send<K>(tx: &mpsc::Sender<Result<K>>, cancel: &CancellationToken, item: Result<K>) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

/// Helper for callers that need exactly one object by name
pub async fn get_one<K: DirectResource>(client: &Arc<dyn ResourceClient<K>>, name: &str) -> Result<Option<K>> {
    match client.get(name).await {
        Ok(object) => Ok(Some(object)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
