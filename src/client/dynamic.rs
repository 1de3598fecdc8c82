//! kube-backed client that hides schema versions
//!
//! Talks to the highest version the API server serves for a kind and migrates
//! every object to the latest version before handing it upstream.

use super::{ListOptions, Page, PodLabels, ResourceClient, WatchEvent};
use crate::converter::Converter;
use crate::crd::DirectResource;
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, PostParams, WatchParams,
};
use kube::core::WatchEvent as KubeWatchEvent;
use kube::discovery;
use serde_json::Value;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Client for one kind at the latest schema version
pub struct LatestClient<K> {
    api: Api<DynamicObject>,
    resource: ApiResource,
    converter: &'static Converter,
    _kind: PhantomData<fn() -> K>,
}

impl<K: DirectResource> LatestClient<K> {
    /// Pick the highest served version of `K` via API discovery
    pub async fn discover(client: kube::Client) -> Result<Self> {
        let kind = K::kind(&()).to_string();
        let group = K::group(&()).to_string();
        let api_group = discovery::group(&client, &group).await?;

        // versions() is ordered by Kubernetes version priority, highest first
        let resource = api_group
            .versions()
            .find_map(|version| {
                api_group
                    .versioned_resources(version)
                    .into_iter()
                    .map(|(resource, _)| resource)
                    .find(|resource| resource.kind == kind)
            })
            .ok_or_else(|| Error::not_found("APIResource", format!("{group}/{kind}")))?;

        debug!(kind = %kind, version = %resource.version, "discovered served version");
        Ok(Self::with_resource(client, resource))
    }

    /// Build a client for an already known resource
    pub fn with_resource(client: kube::Client, resource: ApiResource) -> Self {
        Self {
            api: Api::all_with(client, &resource),
            resource,
            converter: Converter::global(),
            _kind: PhantomData,
        }
    }

    /// Typed latest object to the served version
    fn to_served(&self, object: &K) -> Result<DynamicObject> {
        let mut value = serde_json::to_value(object)?;
        if let Some(map) = value.as_object_mut() {
            map.insert("apiVersion".into(), Value::String(K::api_version(&()).to_string()));
            map.insert("kind".into(), Value::String(K::kind(&()).to_string()));
        }
        let served = self.converter.migrate(&value, &self.resource.api_version)?;
        Ok(serde_json::from_value(served)?)
    }

    /// Served object to the typed latest object
    fn from_served(&self, object: DynamicObject) -> Result<K> {
        from_served(self.converter, &self.resource, object)
    }

    fn object_name(object: &K) -> Result<String> {
        object
            .meta()
            .name
            .clone()
            .ok_or_else(|| Error::InvalidArgument(format!("{} without a name", K::kind(&()))))
    }

    /// Write the status subresource when it differs from what the server holds
    async fn sync_status(&self, name: &str, desired: &DynamicObject, current: DynamicObject) -> Result<K> {
        if desired.data.get("status") == current.data.get("status") {
            return self.from_served(current);
        }
        let mut body = current;
        if let Some(status) = desired.data.get("status") {
            body.data["status"] = status.clone();
        }
        let updated = self
            .api
            .replace_status(name, &PostParams::default(), serde_json::to_vec(&body)?)
            .await?;
        self.from_served(updated)
    }
}

fn from_served<K: DirectResource>(
    converter: &Converter,
    resource: &ApiResource,
    object: DynamicObject,
) -> Result<K> {
    let mut value = serde_json::to_value(&object)?;
    if let Some(map) = value.as_object_mut() {
        // list items may omit their type meta
        map.entry("apiVersion")
            .or_insert_with(|| Value::String(resource.api_version.clone()));
        map.entry("kind")
            .or_insert_with(|| Value::String(resource.kind.clone()));
    }
    let latest = converter.migrate_to_latest(&value)?;
    Ok(serde_json::from_value(latest)?)
}

#[async_trait]
impl<K: DirectResource> ResourceClient<K> for LatestClient<K> {
    async fn get(&self, name: &str) -> Result<K> {
        let object = self.api.get(name).await?;
        self.from_served(object)
    }

    async fn list(&self, options: &ListOptions) -> Result<Page<K>> {
        let mut params = ListParams::default();
        let selector = options.selector.to_string();
        if !selector.is_empty() {
            params = params.labels(&selector);
        }
        if options.limit > 0 {
            params = params.limit(options.limit);
        }
        if let Some(token) = &options.continue_token {
            params = params.continue_token(token);
        }

        let list = self.api.list(&params).await?;
        let items = list
            .items
            .into_iter()
            .map(|object| self.from_served(object))
            .collect::<Result<Vec<_>>>()?;
        Ok(Page {
            items,
            continue_token: list.metadata.continue_.filter(|token| !token.is_empty()),
            resource_version: list.metadata.resource_version.unwrap_or_default(),
        })
    }

    async fn create(&self, object: &K) -> Result<K> {
        let name = Self::object_name(object)?;
        let desired = self.to_served(object)?;
        let created = self.api.create(&PostParams::default(), &desired).await?;
        self.sync_status(&name, &desired, created).await
    }

    async fn update(&self, object: &K) -> Result<K> {
        let name = Self::object_name(object)?;
        let desired = self.to_served(object)?;
        let replaced = self
            .api
            .replace(&name, &PostParams::default(), &desired)
            .await?;
        self.sync_status(&name, &desired, replaced).await
    }

    async fn update_status(&self, object: &K) -> Result<K> {
        let name = Self::object_name(object)?;
        let desired = self.to_served(object)?;
        let updated = self
            .api
            .replace_status(&name, &PostParams::default(), serde_json::to_vec(&desired)?)
            .await?;
        self.from_served(updated)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn watch(
        &self,
        options: &ListOptions,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent<K>>>> {
        let mut params = WatchParams::default();
        let selector = options.selector.to_string();
        if !selector.is_empty() {
            params = params.labels(&selector);
        }
        let mut events = self.api.watch(&params, resource_version).await?.boxed();

        let (tx, rx) = mpsc::channel(1);
        let converter = self.converter;
        let resource = self.resource.clone();
        tokio::spawn(async move {
            loop {
                let event = match events.try_next().await {
                    Ok(Some(event)) => event,
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(Error::from(e))).await;
                        break;
                    }
                };
                let migrated = match event {
                    KubeWatchEvent::Added(o) => from_served(converter, &resource, o).map(WatchEvent::Added),
                    KubeWatchEvent::Modified(o) => {
                        from_served(converter, &resource, o).map(WatchEvent::Modified)
                    }
                    KubeWatchEvent::Deleted(o) => {
                        from_served(converter, &resource, o).map(WatchEvent::Deleted)
                    }
                    KubeWatchEvent::Bookmark(b) => Ok(WatchEvent::Bookmark(b.metadata.resource_version)),
                    KubeWatchEvent::Error(e) => {
                        warn!(code = e.code, message = %e.message, "watch error event");
                        break;
                    }
                };
                match migrated {
                    Ok(event) => {
                        if tx.send(Ok(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // closing the stream makes the informer re-list
                        warn!(kind = %resource.kind, error = %e, "migration failed on watch event");
                        break;
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// Reads pod labels from the API server
pub struct KubePodLabels {
    client: kube::Client,
}

impl KubePodLabels {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodLabels for KubePodLabels {
    async fn pod_labels(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = pods.get(name).await?;
        Ok(pod.metadata.labels.unwrap_or_default())
    }
}
