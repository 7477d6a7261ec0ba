//! Modbus protocol constants and relay timing defaults
//!
//! Frame constants are derived from the official Modbus specification:
//! - Maximum PDU size: 253 bytes (inherited from RS485 ADU limit of 256 bytes)
//! - Register limits are calculated to fit within the PDU size constraint
//!
//! Timing defaults describe the relay path: broker ↔ device exchanges and the
//! client-side retry policy towards the broker.

use std::time::Duration;

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Modbus MBAP header length for TCP
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2) = 6 bytes
/// Note: Unit ID is counted by the Length field, not by the header
pub const MBAP_HEADER_LEN: usize = 6;

/// Maximum PDU (Protocol Data Unit) size per Modbus specification
/// RS485 ADU (256 bytes) - Slave Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU) = 254 bytes
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// RTU trailer: CRC16, low byte first
pub const RTU_CRC_LEN: usize = 2;

/// RTU read response header: Unit ID(1) + Function(1) + Byte count(1)
pub const RTU_RESPONSE_HEADER_LEN: usize = 3;

/// TCP read response header: MBAP(6) + Unit ID(1) + Function(1) + Byte count(1)
pub const TCP_RESPONSE_HEADER_LEN: usize = MBAP_HEADER_LEN + 3;

// ============================================================================
// Register Operation Limits
// ============================================================================

/// Maximum number of registers for FC03/FC04 (Read Holding/Input Registers)
///
/// Response PDU: Function Code(1) + Byte Count(1) + N × 2 ≤ 253
/// Therefore: N ≤ 125 registers
pub const MAX_READ_REGISTERS: usize = 125;

/// Maximum number of registers for FC16 (Write Multiple Registers)
///
/// Request PDU: FC(1) + Address(2) + Quantity(2) + Byte Count(1) + N × 2 ≤ 253
/// Therefore: N ≤ 123 registers
pub const MAX_WRITE_REGISTERS: usize = 123;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Read Input Registers (FC04)
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;

/// Write Multiple Registers (FC16), used for clock correction
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Bit set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Relay Timing Defaults
// ============================================================================

/// Broker → device UDP exchange timeout, per message
pub const DEVICE_UDP_TIMEOUT: Duration = Duration::from_secs(1);

/// Broker → device TCP connect/exchange timeout
pub const DEVICE_TCP_TIMEOUT: Duration = Duration::from_secs(3);

/// Client wait between two attempts towards the broker
pub const CLIENT_RETRY_INTERVAL: Duration = Duration::from_millis(2500);

/// Client total time budget before giving up on the broker
pub const CLIENT_RETRY_BUDGET: Duration = Duration::from_secs(30);

/// Client wait for one broker reply
pub const CLIENT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Broker worker lifetime without traffic before its route is evicted
pub const BROKER_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Pending envelopes per destination before senders wait
pub const BROKER_QUEUE_CAPACITY: usize = 64;
