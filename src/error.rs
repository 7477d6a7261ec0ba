//! # Error Types
//!
//! One error enum for the whole acquisition pipeline. Every variant belongs to
//! exactly one [`ErrorKind`], which decides how a collection cycle reacts:
//!
//! | Kind | Raised by | Effect |
//! |------|-----------|--------|
//! | `Config` | register map loading, planning | device/group skipped this cycle |
//! | `Protocol` | codec (CRC, framing, unknown function) | whole batch discarded |
//! | `Device` | codec (Modbus exception response) | device cycle ends |
//! | `Transport` | transport client, broker replies | device marked broken |
//! | `Relay` | broker (unsupported protocol) | reported back to sender |

use std::fmt;

use thiserror::Error;

/// Result alias used across the crate.
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Coarse classification of [`ModbusError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or missing register definitions.
    Config,
    /// Wire-level violation: CRC mismatch, bad frame, unknown function code.
    Protocol,
    /// The device answered with a Modbus exception.
    Device,
    /// Timeouts, exhausted retries, broker-reported failures, socket errors.
    Transport,
    /// The broker received an envelope it cannot route.
    Relay,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Config => "config",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Device => "device",
            ErrorKind::Transport => "transport",
            ErrorKind::Relay => "relay",
        };
        f.write_str(name)
    }
}

/// Modbus exception codes a device may report (function code | 0x80).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
    CommandAcknowledge,
    SlaveDeviceBusy,
    MemoryParityError,
    /// Any code outside the standard set, kept verbatim.
    Unknown(u8),
}

impl ExceptionCode {
    /// Map a raw exception byte.
    pub fn from_u8(code: u8) -> Self {
        match code {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::SlaveDeviceFailure,
            0x05 => Self::CommandAcknowledge,
            0x06 => Self::SlaveDeviceBusy,
            0x08 => Self::MemoryParityError,
            other => Self::Unknown(other),
        }
    }

    /// Raw exception byte.
    pub fn to_u8(self) -> u8 {
        match self {
            Self::IllegalFunction => 0x01,
            Self::IllegalDataAddress => 0x02,
            Self::IllegalDataValue => 0x03,
            Self::SlaveDeviceFailure => 0x04,
            Self::CommandAcknowledge => 0x05,
            Self::SlaveDeviceBusy => 0x06,
            Self::MemoryParityError => 0x08,
            Self::Unknown(code) => code,
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalFunction => f.write_str("illegal function"),
            Self::IllegalDataAddress => f.write_str("illegal data address"),
            Self::IllegalDataValue => f.write_str("illegal data value"),
            Self::SlaveDeviceFailure => f.write_str("slave device failure"),
            Self::CommandAcknowledge => f.write_str("command acknowledge"),
            Self::SlaveDeviceBusy => f.write_str("slave device busy"),
            Self::MemoryParityError => f.write_str("memory parity error"),
            Self::Unknown(code) => write!(f, "unknown exception 0x{:02X}", code),
        }
    }
}

/// Errors produced by the acquisition pipeline.
#[derive(Error, Debug)]
pub enum ModbusError {
    /// A register map row could not be turned into a definition.
    #[error("Configuration error{}: {message}", row_suffix(.row))]
    Config { row: Option<usize>, message: String },

    /// Planning was asked to work on no registers at all.
    #[error("Empty register set")]
    EmptyRegisterSet,

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{received:04X}")]
    CrcInvalid { expected: u16, received: u16 },

    /// Function name or code the codec does not speak.
    #[error("Function not implemented: {function}")]
    NotImplemented { function: String },

    /// The device returned an exception response.
    #[error("Device exception on function 0x{function:02X}: {exception}")]
    Device {
        function: u8,
        exception: ExceptionCode,
    },

    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The retry budget of the transport client ran out.
    #[error("Number of attempts reached: {attempts} attempts in {elapsed_ms}ms")]
    AttemptsExhausted { attempts: u32, elapsed_ms: u64 },

    /// The broker answered with `status = 0`.
    #[error("Broker reported failure: {message}")]
    Broker { message: String },

    /// The broker was asked to relay over a protocol it does not know.
    #[error("Unknown protocol: {protocol}")]
    Relay { protocol: String },

    #[error("Timeout during {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl ModbusError {
    /// Configuration error tied to a register map row (1-based).
    pub fn config_row(row: usize, message: impl Into<String>) -> Self {
        Self::Config {
            row: Some(row),
            message: message.into(),
        }
    }

    /// Configuration error without a row (environment, missing files).
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Config {
            row: None,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn not_implemented(function: impl Into<String>) -> Self {
        Self::NotImplemented {
            function: function.into(),
        }
    }

    pub fn device(function: u8, code: u8) -> Self {
        Self::Device {
            function,
            exception: ExceptionCode::from_u8(code),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Which branch of the error taxonomy this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config { .. } | Self::EmptyRegisterSet => ErrorKind::Config,
            Self::Protocol { .. }
            | Self::CrcInvalid { .. }
            | Self::NotImplemented { .. }
            | Self::Serialization { .. } => ErrorKind::Protocol,
            Self::Device { .. } => ErrorKind::Device,
            Self::Transport { .. }
            | Self::AttemptsExhausted { .. }
            | Self::Broker { .. }
            | Self::Timeout { .. }
            | Self::Io(_) => ErrorKind::Transport,
            Self::Relay { .. } => ErrorKind::Relay,
        }
    }

    /// Socket timeouts, and a peer refusing or resetting the exchange while
    /// it restarts, are worth repeating; decode errors never are.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }
}

fn row_suffix(row: &Option<usize>) -> String {
    match row {
        Some(row) => format!(" (row {})", row),
        None => String::new(),
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<csv::Error> for ModbusError {
    fn from(err: csv::Error) -> Self {
        let row = err
            .position()
            .map(|pos| pos.record() as usize)
            .filter(|&record| record > 0);
        Self::Config {
            row,
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_code_mapping() {
        assert_eq!(ExceptionCode::from_u8(0x02), ExceptionCode::IllegalDataAddress);
        assert_eq!(ExceptionCode::from_u8(0x08), ExceptionCode::MemoryParityError);
        assert_eq!(ExceptionCode::from_u8(0x42), ExceptionCode::Unknown(0x42));
        assert_eq!(ExceptionCode::SlaveDeviceBusy.to_u8(), 0x06);
        assert_eq!(ExceptionCode::SlaveDeviceFailure.to_string(), "slave device failure");
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(ModbusError::EmptyRegisterSet.kind(), ErrorKind::Config);
        assert_eq!(
            ModbusError::CrcInvalid {
                expected: 1,
                received: 2
            }
            .kind(),
            ErrorKind::Protocol
        );
        assert_eq!(ModbusError::device(0x03, 0x02).kind(), ErrorKind::Device);
        assert_eq!(ModbusError::broker("boom").kind(), ErrorKind::Transport);
        assert_eq!(
            ModbusError::Relay {
                protocol: "SERIAL".into()
            }
            .kind(),
            ErrorKind::Relay
        );
    }

    #[test]
    fn test_retryable_errors() {
        use std::io::{Error, ErrorKind as IoKind};

        assert!(ModbusError::timeout("recv", 1000).is_retryable());
        assert!(ModbusError::from(Error::from(IoKind::ConnectionRefused)).is_retryable());
        assert!(ModbusError::from(Error::from(IoKind::ConnectionReset)).is_retryable());
        assert!(!ModbusError::from(Error::from(IoKind::AddrInUse)).is_retryable());
        assert!(!ModbusError::protocol("bad frame").is_retryable());
        assert!(!ModbusError::CrcInvalid {
            expected: 0,
            received: 1
        }
        .is_retryable());
    }

    #[test]
    fn test_config_row_in_message() {
        let err = ModbusError::config_row(4, "unknown type 'int12'");
        assert_eq!(
            err.to_string(),
            "Configuration error (row 4): unknown type 'int12'"
        );
        assert_eq!(
            ModbusError::configuration("MAX_MSG_SIZE missing").to_string(),
            "Configuration error: MAX_MSG_SIZE missing"
        );
    }
}
