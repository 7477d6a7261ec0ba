//! Process configuration
//!
//! Clients read [`RelayConfig`] from the environment. The broker binary
//! parses [`BrokerArgs`], where every flag can also come from the
//! environment.

use std::time::Duration;

use clap::Parser;

use crate::broker::BrokerConfig;
use crate::constants::BROKER_QUEUE_CAPACITY;
use crate::error::{ModbusError, ModbusResult};
use crate::logging::{LogConfig, LogFormat};
use crate::transport::TransportClient;

/// Broker host used by clients when `BROKER_HOST` is unset.
pub const DEFAULT_BROKER_HOST: &str = "127.0.0.1";

/// Relay settings shared by broker and clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// `MAX_MSG_SIZE`
    pub max_msg_size: usize,
    /// `BROKER_PORT`
    pub broker_port: u16,
    /// `BROKER_HOST`
    pub broker_host: String,
}

impl RelayConfig {
    pub fn from_env() -> ModbusResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value source.
    pub fn from_lookup<F>(lookup: F) -> ModbusResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ModbusError::configuration(format!("{} is not set", key)))
        };

        let raw = required("MAX_MSG_SIZE")?;
        let max_msg_size = raw
            .parse::<usize>()
            .ok()
            .filter(|size| *size > 0)
            .ok_or_else(|| {
                ModbusError::configuration(format!(
                    "MAX_MSG_SIZE must be a positive integer, got '{}'",
                    raw
                ))
            })?;

        let raw = required("BROKER_PORT")?;
        let broker_port = raw.parse::<u16>().map_err(|_| {
            ModbusError::configuration(format!("BROKER_PORT must be a port number, got '{}'", raw))
        })?;

        let broker_host = lookup("BROKER_HOST")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_BROKER_HOST.to_string());

        Ok(Self {
            max_msg_size,
            broker_port,
            broker_host,
        })
    }

    /// Client for the configured broker, with default retry policy.
    pub fn transport_client(&self) -> TransportClient {
        TransportClient::new(self.broker_host.clone(), self.broker_port, self.max_msg_size)
    }
}

/// Relay broker command line.
#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "UDP relay between collectors and Modbus transductors")]
pub struct BrokerArgs {
    /// Largest datagram accepted or sent, in bytes
    #[arg(long, env = "MAX_MSG_SIZE")]
    pub max_msg_size: usize,

    /// UDP port to listen on (all interfaces)
    #[arg(short = 'p', long, env = "BROKER_PORT")]
    pub port: u16,

    /// Log filter (trace, debug, info, warn, error, or directives)
    #[arg(short = 'l', long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Log output format (compact, pretty, json)
    #[arg(long, default_value = "compact", env = "LOG_FORMAT")]
    pub log_format: String,

    /// Seconds a destination may stay idle before its worker is evicted
    #[arg(long, default_value_t = 60, env = "BROKER_IDLE_TIMEOUT_SECS")]
    pub idle_timeout_secs: u64,

    /// Envelopes queued per destination; more are refused with a failure reply
    #[arg(long, default_value_t = BROKER_QUEUE_CAPACITY, env = "BROKER_QUEUE_CAPACITY")]
    pub queue_capacity: usize,

    /// Log every datagram and device frame as hex at debug level
    #[arg(long)]
    pub packet_log: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,
}

impl BrokerArgs {
    pub fn broker_config(&self) -> ModbusResult<BrokerConfig> {
        if self.max_msg_size == 0 {
            return Err(ModbusError::configuration(
                "MAX_MSG_SIZE must be a positive integer, got '0'",
            ));
        }
        Ok(BrokerConfig::new(self.port, self.max_msg_size)
            .with_idle_timeout(Duration::from_secs(self.idle_timeout_secs.max(1)))
            .with_queue_capacity(self.queue_capacity)
            .with_packet_logging(self.packet_log))
    }

    pub fn log_config(&self) -> ModbusResult<LogConfig> {
        Ok(LogConfig {
            level: self.log_level.clone(),
            format: self.log_format.parse::<LogFormat>()?,
            ansi: !self.no_color,
        })
    }
}
