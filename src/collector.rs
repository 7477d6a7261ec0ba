//! # Collection Cycle
//!
//! Runs plan → encode → relay → decode for every configured device of a
//! collection group, one task per device.
//!
//! A device's branch ends at its first error and persists nothing from that
//! cycle. Branches are independent: one failing device never affects
//! another, and the cycle completes once every branch has finished.
//!
//! | Outcome | Health call |
//! |---------|-------------|
//! | measurement stored | `mark_device_broken(id, false)` |
//! | transport error | `mark_device_broken(id, true)` |
//! | config, protocol or device error | none |

use std::sync::Arc;

use chrono::NaiveDateTime;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::codec::{ModbusCodec, Protocol};
use crate::debouncer::{DebouncerRegistry, Phase};
use crate::error::{ErrorKind, ModbusError, ModbusResult};
use crate::events::{DeviceHealth, EventSink, MeasurementSink};
use crate::register_map::CollectionGroup;
use crate::registry::ModelRegistry;
use crate::relay::{RelayEnvelope, TransportProtocol};
use crate::transport::RelayTransport;

/// Nominal contracted voltage used when none is configured.
pub const DEFAULT_NOMINAL_VOLTAGE: f64 = 220.0;

/// One transductor.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub id: String,
    /// Key into the [`ModelRegistry`].
    pub model: String,
    pub ip: String,
    pub port: u16,
    pub unit_id: u8,
    /// Wire framing spoken by the device.
    pub protocol: Protocol,
    /// How the broker reaches the device.
    pub transport: TransportProtocol,
    pub nominal_voltage: f64,
}

impl DeviceConfig {
    /// RTU device reached over UDP, unit 1, 220 V nominal.
    pub fn new(
        id: impl Into<String>,
        model: impl Into<String>,
        ip: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            ip: ip.into(),
            port,
            unit_id: 1,
            protocol: Protocol::Rtu,
            transport: TransportProtocol::Udp,
            nominal_voltage: DEFAULT_NOMINAL_VOLTAGE,
        }
    }

    pub fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = unit_id;
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol, transport: TransportProtocol) -> Self {
        self.protocol = protocol;
        self.transport = transport;
        self
    }

    pub fn with_nominal_voltage(mut self, nominal_voltage: f64) -> Self {
        self.nominal_voltage = nominal_voltage;
        self
    }
}

/// Result of one device's branch.
#[derive(Debug)]
pub struct DeviceOutcome {
    pub device_id: String,
    /// Number of stored fields, or the error that ended the branch.
    pub result: ModbusResult<usize>,
}

/// Per-device results of one cycle.
#[derive(Debug)]
pub struct CycleReport {
    pub group: CollectionGroup,
    pub outcomes: Vec<DeviceOutcome>,
    /// Branches that panicked instead of returning.
    pub aborted: usize,
}

impl CycleReport {
    fn new(group: CollectionGroup) -> Self {
        Self {
            group,
            outcomes: Vec::new(),
            aborted: 0,
        }
    }

    pub fn get(&self, device_id: &str) -> Option<&ModbusResult<usize>> {
        self.outcomes
            .iter()
            .find(|o| o.device_id == device_id)
            .map(|o| &o.result)
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded() + self.aborted
    }
}

/// Drives collection cycles.
pub struct Collector<T, S> {
    registry: Arc<ModelRegistry>,
    transport: Arc<T>,
    sink: Arc<S>,
    debouncers: Arc<DebouncerRegistry>,
}

impl<T, S> Clone for Collector<T, S> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            transport: Arc::clone(&self.transport),
            sink: Arc::clone(&self.sink),
            debouncers: Arc::clone(&self.debouncers),
        }
    }
}

impl<T, S> Collector<T, S>
where
    T: RelayTransport + 'static,
    S: MeasurementSink + EventSink + DeviceHealth + 'static,
{
    pub fn new(registry: Arc<ModelRegistry>, transport: Arc<T>, sink: Arc<S>) -> Self {
        Self {
            registry,
            transport,
            sink,
            debouncers: Arc::new(DebouncerRegistry::default()),
        }
    }

    /// Share an existing debouncer registry.
    pub fn with_debouncers(mut self, debouncers: Arc<DebouncerRegistry>) -> Self {
        self.debouncers = debouncers;
        self
    }

    pub fn debouncers(&self) -> &Arc<DebouncerRegistry> {
        &self.debouncers
    }

    /// Collect `group` from every device concurrently and wait for all.
    pub async fn run_cycle(&self, devices: &[DeviceConfig], group: CollectionGroup) -> CycleReport {
        let started = Instant::now();
        let mut tasks = JoinSet::new();
        for device in devices.iter().cloned() {
            let collector = self.clone();
            tasks.spawn(async move {
                let result = collector.collect_device(&device, group).await;
                DeviceOutcome {
                    device_id: device.id,
                    result,
                }
            });
        }

        let mut report = CycleReport::new(group);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => report.outcomes.push(outcome),
                Err(err) => {
                    error!("Device task aborted: {}", err);
                    report.aborted += 1;
                }
            }
        }

        info!(
            "Cycle {} finished in {:?}: {} ok, {} failed",
            group,
            started.elapsed(),
            report.succeeded(),
            report.failed()
        );
        report
    }

    /// One device's branch, reporting its health.
    pub async fn collect_device(
        &self,
        device: &DeviceConfig,
        group: CollectionGroup,
    ) -> ModbusResult<usize> {
        let result = self.collect(device, group).await;
        match &result {
            Ok(fields) => {
                debug!("Device {} stored {} fields for {}", device.id, fields, group);
                self.sink.mark_device_broken(&device.id, false).await;
            }
            Err(err) if err.kind() == ErrorKind::Transport => {
                error!("Device {} unreachable: {}", device.id, err);
                self.sink.mark_device_broken(&device.id, true).await;
            }
            Err(err) => error!("Device {} cycle {} failed: {}", device.id, group, err),
        }
        result
    }

    async fn collect(&self, device: &DeviceConfig, group: CollectionGroup) -> ModbusResult<usize> {
        let profile = self.registry.profile(&device.model)?;
        let plan = self.registry.plan(&device.model, group)?;
        let codec = ModbusCodec::new(device.protocol, device.unit_id)
            .with_max_read_registers(profile.limits.max_read_registers);

        let batch = codec.encode(&plan)?;
        let envelope = RelayEnvelope::new(
            device.transport,
            device.ip.as_str(),
            device.port,
            batch.messages.clone(),
        );
        let replies = self.transport.relay(&envelope, codec.framing()).await?;
        let measurement = codec.decode(&plan, &batch, &replies)?;

        let voltages: Vec<(Phase, f64)> = measurement
            .iter()
            .filter_map(|(field, value)| Phase::from_field(field).map(|phase| (phase, value)))
            .collect();
        let fields = measurement.len();

        self.sink
            .persist_measurement(&device.id, group, measurement)
            .await;
        for (phase, value) in voltages {
            self.debouncers
                .observe(&device.id, phase, device.nominal_voltage, value, self.sink.as_ref())
                .await;
        }
        Ok(fields)
    }

    /// Write the device clock: six registers at `address` set to `at`.
    pub async fn correct_clock(
        &self,
        device: &DeviceConfig,
        address: u16,
        at: NaiveDateTime,
    ) -> ModbusResult<()> {
        let codec = ModbusCodec::new(device.protocol, device.unit_id);
        let request = codec.build_clock_correction(address, at)?;
        let envelope = RelayEnvelope::new(
            device.transport,
            device.ip.as_str(),
            device.port,
            vec![request.clone()],
        );

        let replies = self.transport.relay(&envelope, codec.framing()).await?;
        let reply = replies
            .first()
            .ok_or_else(|| ModbusError::protocol("no reply to clock correction"))?;
        codec.parse_write_ack(&request, reply)?;
        info!("Clock of {} set to {}", device.id, at);
        Ok(())
    }
}
