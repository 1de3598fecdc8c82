//! Cluster clients
//!
//! Every component talks to the cluster through [`ResourceClient`], which
//! always yields objects at the latest schema version. The kube-backed
//! implementation discovers the served version and migrates on the way in and
//! out; the in-memory implementation backs the tests.

pub mod dynamic;
pub mod events;
pub mod fake;

pub use dynamic::{KubePodLabels, LatestClient};
pub use events::{EventReason, EventRecorder, EventType, KubeEventRecorder, MemoryEventRecorder, RecordedEvent};
pub use fake::{FakeClient, FakePodLabels};

use crate::crd::{DirectPVDrive, DirectPVInitRequest, DirectPVNode, DirectPVVolume, DirectResource};
use crate::error::{Error, Result};
use crate::lister::LabelSelector;
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{info, warn};

// =============================================================================
// Client contract
// =============================================================================

/// Options for list and watch calls
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub selector: LabelSelector,
    /// Page size; 0 means unlimited
    pub limit: u32,
    pub continue_token: Option<String>,
}

/// One page of a list call
#[derive(Debug, Clone)]
pub struct Page<K> {
    pub items: Vec<K>,
    /// Set when more items remain
    pub continue_token: Option<String>,
    pub resource_version: String,
}

/// Watch event at the latest schema version
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Resource version checkpoint
    Bookmark(String),
}

/// Latest-version CRUD/List/Watch for one kind
#[async_trait]
pub trait ResourceClient<K: DirectResource>: Send + Sync {
    async fn get(&self, name: &str) -> Result<K>;

    async fn list(&self, options: &ListOptions) -> Result<Page<K>>;

    async fn create(&self, object: &K) -> Result<K>;

    /// Optimistic update; a stale resource version fails with a conflict
    async fn update(&self, object: &K) -> Result<K>;

    async fn update_status(&self, object: &K) -> Result<K>;

    async fn delete(&self, name: &str) -> Result<()>;

    /// Stream events after `resource_version`. The stream ends when the
    /// caller must re-list.
    async fn watch(
        &self,
        options: &ListOptions,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent<K>>>>;
}

/// Source of pod labels for NodePublishVolume
#[async_trait]
pub trait PodLabels: Send + Sync {
    async fn pod_labels(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>>;
}

// =============================================================================
// Client set
// =============================================================================

/// Clients for every DirectPV kind plus the collaborators the servers need
#[derive(Clone)]
pub struct Clients {
    pub drives: Arc<dyn ResourceClient<DirectPVDrive>>,
    pub volumes: Arc<dyn ResourceClient<DirectPVVolume>>,
    pub nodes: Arc<dyn ResourceClient<DirectPVNode>>,
    pub init_requests: Arc<dyn ResourceClient<DirectPVInitRequest>>,
    pub pods: Arc<dyn PodLabels>,
    pub events: Arc<dyn EventRecorder>,
    /// Underlying kube client; absent for the in-memory set
    pub kube: Option<kube::Client>,
}

impl Clients {
    /// Discover served versions and build kube-backed clients
    pub async fn discover(client: kube::Client, instance: &str) -> Result<Self> {
        Ok(Self {
            drives: Arc::new(LatestClient::<DirectPVDrive>::discover(client.clone()).await?),
            volumes: Arc::new(LatestClient::<DirectPVVolume>::discover(client.clone()).await?),
            nodes: Arc::new(LatestClient::<DirectPVNode>::discover(client.clone()).await?),
            init_requests: Arc::new(
                LatestClient::<DirectPVInitRequest>::discover(client.clone()).await?,
            ),
            pods: Arc::new(KubePodLabels::new(client.clone())),
            events: Arc::new(KubeEventRecorder::new(client.clone(), instance)),
            kube: Some(client),
        })
    }

    /// In-memory clients sharing nothing with a cluster
    pub fn fake() -> Self {
        Self {
            drives: Arc::new(FakeClient::<DirectPVDrive>::new()),
            volumes: Arc::new(FakeClient::<DirectPVVolume>::new()),
            nodes: Arc::new(FakeClient::<DirectPVNode>::new()),
            init_requests: Arc::new(FakeClient::<DirectPVInitRequest>::new()),
            pods: Arc::new(FakePodLabels::default()),
            events: Arc::new(MemoryEventRecorder::default()),
            kube: None,
        }
    }
}

static CLIENTS: OnceCell<Clients> = OnceCell::const_new();

/// Initialize the process-wide clients once. Discovery is retried with
/// backoff until the API server answers.
pub async fn init(instance: &str) -> Result<&'static Clients> {
    CLIENTS
        .get_or_try_init(|| async {
            let client = kube::Client::try_default().await?;
            let policy = ExponentialBackoff {
                max_elapsed_time: Some(Duration::from_secs(120)),
                ..Default::default()
            };
            let clients = backoff::future::retry(policy, || {
                let client = client.clone();
                async move {
                    Clients::discover(client, instance).await.map_err(|e| {
                        warn!(error = %e, "API discovery failed; retrying");
                        backoff::Error::transient(e)
                    })
                }
            })
            .await?;
            info!("Cluster clients initialized");
            Ok::<_, Error>(clients)
        })
        .await
}

/// Re-run `operation` while it fails with a resource-version conflict
pub async fn retry_on_conflict<T, F, Fut>(mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let policy = ExponentialBackoff {
        initial_interval: Duration::from_millis(10),
        max_elapsed_time: Some(Duration::from_secs(10)),
        ..Default::default()
    };
    backoff::future::retry(policy, || {
        let attempt = operation();
        async move {
            attempt.await.map_err(|e| {
                if e.is_conflict() {
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DriveSpec, DriveStatus};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_on_conflict() {
        let attempts = AtomicU32::new(0);
        let result = retry_on_conflict(|| async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::Conflict {
                    kind: "DirectPVDrive".into(),
                    name: "d1".into(),
                })
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_other_errors() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = retry_on_conflict(|| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::InvalidArgument("bad".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fake_set_round_trip() {
        let clients = Clients::fake();
        let mut drive = DirectPVDrive::new("d1", DriveSpec::default());
        drive.status = Some(DriveStatus {
            total_capacity: 10,
            free_capacity: 10,
            ..Default::default()
        });
        clients.drives.create(&drive).await.unwrap();
        let fetched = clients.drives.get("d1").await.unwrap();
        assert_eq!(fetched.total_capacity(), 10);
    }
}
