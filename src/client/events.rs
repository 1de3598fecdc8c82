//! Cluster events
//!
//! Events are best effort: a failure to post one is logged and never fails the
//! operation that produced it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType as KubeEventType, Recorder, Reporter};
use parking_lot::Mutex;
use std::fmt;
use tracing::warn;

/// Reporting component name
pub const REPORTER: &str = "controller";

/// Event reasons posted by DirectPV
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventReason {
    StageVolume,
    VolumeMoved,
    Metrics,
    VolumeProvisioned,
    VolumeAdded,
    VolumeExpanded,
    VolumeReleased,
    DriveHasMountError,
    DriveMounted,
    DriveHasMultipleMatches,
    DriveHasIOError,
}

impl fmt::Display for EventReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// Posts events about DirectPV objects
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(
        &self,
        object: ObjectReference,
        event_type: EventType,
        reason: EventReason,
        note: String,
    );
}

/// Posts events through the events API
pub struct KubeEventRecorder {
    client: kube::Client,
    reporter: Reporter,
}

impl KubeEventRecorder {
    pub fn new(client: kube::Client, instance: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: REPORTER.to_string(),
                instance: Some(instance.to_string()),
            },
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(
        &self,
        object: ObjectReference,
        event_type: EventType,
        reason: EventReason,
        note: String,
    ) {
        let name = object.name.clone().unwrap_or_default();
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), object);
        let event = Event {
            type_: match event_type {
                EventType::Normal => KubeEventType::Normal,
                EventType::Warning => KubeEventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(note),
            action: reason.to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(object = %name, reason = %reason, error = %e, "failed to post event");
        }
    }
}

/// An event captured by [`MemoryEventRecorder`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub kind: String,
    pub name: String,
    pub event_type: EventType,
    pub reason: EventReason,
    pub note: String,
}

/// Keeps events in memory
#[derive(Default)]
pub struct MemoryEventRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryEventRecorder {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn has_reason(&self, reason: EventReason) -> bool {
        self.events.lock().iter().any(|e| e.reason == reason)
    }
}

#[async_trait]
impl EventRecorder for MemoryEventRecorder {
    async fn record(
        &self,
        object: ObjectReference,
        event_type: EventType,
        reason: EventReason,
        note: String,
    ) {
        self.events.lock().push(RecordedEvent {
            kind: object.kind.unwrap_or_default(),
            name: object.name.unwrap_or_default(),
            event_type,
            reason,
            note,
        });
    }
}
