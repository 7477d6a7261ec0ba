//! # Acquisition Boundaries
//!
//! Calls the pipeline makes into collaborators it does not own: measurement
//! storage, voltage event management and device health.
//!
//! [`InMemoryEventBook`] and [`MemorySink`] keep everything in memory; they
//! back the tests and the demo and document the expected semantics for
//! persistent implementations.

use std::collections::HashMap;
use std::future::Future;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::debouncer::{Phase, VoltageState};
use crate::register_map::CollectionGroup;
use crate::value::DecodedMeasurement;

/// Stores decoded measurements.
pub trait MeasurementSink: Send + Sync {
    fn persist_measurement(
        &self,
        device_id: &str,
        group: CollectionGroup,
        measurement: DecodedMeasurement,
    ) -> impl Future<Output = ()> + Send;
}

/// Tracks voltage events per device.
pub trait EventSink: Send + Sync {
    /// Open the event of `state` for `device_id`, or add `phase` to it.
    fn open_or_update_event(
        &self,
        device_id: &str,
        phase: Phase,
        state: VoltageState,
        value: f64,
    ) -> impl Future<Output = ()> + Send;

    /// Remove `phase` from the event it belongs to; an event left without
    /// phases ends.
    fn close_event(&self, device_id: &str, phase: Phase) -> impl Future<Output = ()> + Send;
}

/// Records whether a device is reachable.
pub trait DeviceHealth: Send + Sync {
    fn mark_device_broken(&self, device_id: &str, broken: bool)
        -> impl Future<Output = ()> + Send;
}

/// Voltage event of one device and state.
#[derive(Debug, Clone, PartialEq)]
pub struct VoltageEvent {
    pub device_id: String,
    pub state: VoltageState,
    /// Latest sample per affected phase.
    pub values: HashMap<Phase, f64>,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct EventBookState {
    open: HashMap<(String, VoltageState), VoltageEvent>,
    /// Event state each (device, phase) currently belongs to.
    phases: HashMap<(String, Phase), VoltageState>,
    ended: Vec<VoltageEvent>,
}

impl EventBookState {
    fn detach(&mut self, device_id: &str, phase: Phase) {
        let Some(state) = self.phases.remove(&(device_id.to_string(), phase)) else {
            return;
        };
        let key = (device_id.to_string(), state);
        let now_empty = match self.open.get_mut(&key) {
            Some(event) => {
                event.values.remove(&phase);
                event.updated_at = Utc::now();
                event.values.is_empty()
            }
            None => false,
        };
        if now_empty {
            if let Some(mut event) = self.open.remove(&key) {
                event.ended_at = Some(Utc::now());
                debug!("Event {} of {} ended", state, device_id);
                self.ended.push(event);
            }
        }
    }
}

/// One open event per (device, state), holding per-phase values.
#[derive(Debug, Default)]
pub struct InMemoryEventBook {
    state: Mutex<EventBookState>,
}

impl InMemoryEventBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open events ordered by device and state.
    pub async fn open_events(&self) -> Vec<VoltageEvent> {
        let book = self.state.lock().await;
        let mut events: Vec<_> = book.open.values().cloned().collect();
        events.sort_by(|a, b| (&a.device_id, a.state).cmp(&(&b.device_id, b.state)));
        events
    }

    /// Ended events in the order they ended.
    pub async fn ended_events(&self) -> Vec<VoltageEvent> {
        self.state.lock().await.ended.clone()
    }
}

impl EventSink for InMemoryEventBook {
    async fn open_or_update_event(
        &self,
        device_id: &str,
        phase: Phase,
        state: VoltageState,
        value: f64,
    ) {
        let mut book = self.state.lock().await;
        let phase_key = (device_id.to_string(), phase);
        if book.phases.get(&phase_key).is_some_and(|current| *current != state) {
            book.detach(device_id, phase);
        }

        let now = Utc::now();
        let event = book
            .open
            .entry((device_id.to_string(), state))
            .or_insert_with(|| VoltageEvent {
                device_id: device_id.to_string(),
                state,
                values: HashMap::new(),
                opened_at: now,
                updated_at: now,
                ended_at: None,
            });
        event.values.insert(phase, value);
        event.updated_at = now;
        book.phases.insert(phase_key, state);
    }

    async fn close_event(&self, device_id: &str, phase: Phase) {
        self.state.lock().await.detach(device_id, phase);
    }
}

/// Stored measurement with its collection context.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMeasurement {
    pub device_id: String,
    pub group: CollectionGroup,
    pub measurement: DecodedMeasurement,
    pub stored_at: DateTime<Utc>,
}

/// In-memory implementation of every boundary.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: InMemoryEventBook,
    measurements: Mutex<Vec<StoredMeasurement>>,
    broken: Mutex<HashMap<String, bool>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &InMemoryEventBook {
        &self.events
    }

    pub async fn measurements(&self) -> Vec<StoredMeasurement> {
        self.measurements.lock().await.clone()
    }

    /// Last reported health of `device_id`.
    pub async fn is_broken(&self, device_id: &str) -> Option<bool> {
        self.broken.lock().await.get(device_id).copied()
    }
}

impl MeasurementSink for MemorySink {
    async fn persist_measurement(
        &self,
        device_id: &str,
        group: CollectionGroup,
        measurement: DecodedMeasurement,
    ) {
        self.measurements.lock().await.push(StoredMeasurement {
            device_id: device_id.to_string(),
            group,
            measurement,
            stored_at: Utc::now(),
        });
    }
}

impl EventSink for MemorySink {
    async fn open_or_update_event(
        &self,
        device_id: &str,
        phase: Phase,
        state: VoltageState,
        value: f64,
    ) {
        self.events
            .open_or_update_event(device_id, phase, state, value)
            .await
    }

    async fn close_event(&self, device_id: &str, phase: Phase) {
        self.events.close_event(device_id, phase).await
    }
}

impl DeviceHealth for MemorySink {
    async fn mark_device_broken(&self, device_id: &str, broken: bool) {
        self.broken
            .lock()
            .await
            .insert(device_id.to_string(), broken);
    }
}
