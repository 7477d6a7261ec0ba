//! # Voltage Collector - Modbus Acquisition Pipeline for Remote Transductors
//!
//! Periodic acquisition of electrical measurements from metering devices
//! speaking Modbus over UDP or TCP, and classification of their voltages
//! into risk states.
//!
//! ## Pipeline
//!
//! ```text
//! RegisterMap ─► BlockPlanner ─► ModbusCodec::encode ─► TransportClient
//!                                                            │ UDP
//!                                                            ▼
//!                       device ◄── UDP/TCP ── RelayBroker (one worker per ip)
//!                                                            │
//! DecodedMeasurement ◄─ ModbusCodec::decode ◄────────────────┘
//!        │
//!        ├─► MeasurementSink
//!        └─► DebouncerRegistry (voltage_a/b/c) ─► EventSink
//! ```
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Use |
//! |------|----------|-----|
//! | 0x03 | Read Holding Registers | collection |
//! | 0x04 | Read Input Registers | collection |
//! | 0x10 | Write Multiple Registers | clock correction |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voltage_collector::{
//!     CollectionGroup, Collector, DeviceConfig, MemorySink, ModelProfile, ModelRegistry,
//!     ModbusResult, RegisterMap, RelayConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let registry = ModelRegistry::new();
//!     registry.register(
//!         "tr4020",
//!         ModelProfile::new(RegisterMap::from_csv_path("maps/tr4020.csv")?),
//!     );
//!
//!     let client = RelayConfig::from_env()?.transport_client();
//!     let collector = Collector::new(
//!         Arc::new(registry),
//!         Arc::new(client),
//!         Arc::new(MemorySink::new()),
//!     );
//!
//!     let devices = vec![DeviceConfig::new("meter-1", "tr4020", "10.0.0.5", 1001)];
//!     let report = collector.run_cycle(&devices, CollectionGroup::Minutely).await;
//!     println!("{} devices collected", report.succeeded());
//!     Ok(())
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Error taxonomy and result alias
pub mod error;

/// Modbus frame constants and relay timing defaults
pub mod constants;

/// Stack-allocated PDU and request builders
pub mod pdu;

/// Logging setup and packet formatting
pub mod logging;

/// Process configuration (environment and broker command line)
pub mod config;

// ============================================================================
// Register model and planning
// ============================================================================

/// Decoded register values
pub mod value;

/// Byte order handling for multi-register data types
pub mod bytes;

/// Register definitions and CSV register maps
pub mod register_map;

/// Device-model limits for planning and framing
pub mod device_limits;

/// Contiguous read block planning
pub mod planner;

/// Device models with cached collection plans
pub mod registry;

// ============================================================================
// Wire and relay
// ============================================================================

/// RTU/TCP framing, CRC16 and payload decoding
pub mod codec;

/// Relay envelope and response wire types
pub mod relay;

/// UDP relay broker
pub mod broker;

/// Client side of the relay with bounded retry
pub mod transport;

// ============================================================================
// Acquisition
// ============================================================================

/// Voltage state machine with hysteresis
pub mod debouncer;

/// Boundaries towards storage and event management
pub mod events;

/// Collection cycle fan-out
pub mod collector;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime ===
pub use tokio;

// === Error handling ===
pub use error::{ErrorKind, ExceptionCode, ModbusError, ModbusResult};

// === Register model ===
pub use self::bytes::ByteOrder;
pub use device_limits::DeviceLimits;
pub use planner::{AttributeSource, BlockPlanner, CollectionRequest, RegisterBlock};
pub use register_map::{
    CollectionGroup, ReadFunction, RegisterDefinition, RegisterMap, RegisterType,
};
pub use registry::{ModelProfile, ModelRegistry};
pub use value::{DecodedMeasurement, ModbusValue};

// === Codec ===
pub use codec::{DeviceFraming, EncodedBatch, Framing, ModbusCodec, Protocol};

// === Relay ===
pub use broker::{BrokerConfig, BrokerStats, DeviceExchange, NetworkExchange, RelayBroker};
pub use relay::{RelayEnvelope, RelayResponse, TransportProtocol};
pub use transport::{RelayTransport, TransportClient};

// === Acquisition ===
pub use collector::{Collector, CycleReport, DeviceConfig};
pub use debouncer::{DebouncerRegistry, Phase, VoltageDebouncer, VoltageState};
pub use events::{DeviceHealth, EventSink, InMemoryEventBook, MeasurementSink, MemorySink};

// === Configuration and logging ===
pub use config::{BrokerArgs, RelayConfig};
pub use logging::{init_logging, LogConfig, LogFormat};

// === Protocol limits (commonly needed constants) ===
pub use constants::{MAX_PDU_SIZE, MAX_READ_REGISTERS, MAX_WRITE_REGISTERS};

// === PDU (advanced usage) ===
pub use pdu::{ModbusPdu, PduBuilder};

// === Hidden but preserved ===
#[doc(hidden)]
pub use self::bytes::{regs_to_bytes_4, regs_to_bytes_8};
#[doc(hidden)]
pub use codec::{crc16, decode_register_value, verify_crc};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage Collector v{} - Modbus acquisition pipeline", VERSION)
}
