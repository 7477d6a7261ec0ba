//! # Transport Client
//!
//! Client side of the relay: sends one [`RelayEnvelope`] to the broker and
//! waits for its [`RelayResponse`].
//!
//! Timeouts are retried, and so is a broker that refuses the datagram
//! while it is down or restarting. Each attempt is a fresh send/receive on a new
//! socket; attempts are spaced by a fixed interval until the elapsed-time
//! budget runs out, which ends with [`ModbusError::AttemptsExhausted`].
//! A broker failure (`status = 0`) and a bad reply checksum are never
//! retried.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use crate::codec::{DeviceFraming, Framing};
use crate::constants::{CLIENT_ATTEMPT_TIMEOUT, CLIENT_RETRY_BUDGET, CLIENT_RETRY_INTERVAL};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::log_packet;
use crate::relay::{RelayEnvelope, RelayResponse};

/// Sends envelopes and returns the validated device replies.
pub trait RelayTransport: Send + Sync {
    /// Relay `envelope` and check every reply with `framing`.
    fn relay(
        &self,
        envelope: &RelayEnvelope,
        framing: &DeviceFraming,
    ) -> impl Future<Output = ModbusResult<Vec<Bytes>>> + Send;
}

/// UDP client of the relay broker.
#[derive(Debug, Clone)]
pub struct TransportClient {
    broker_host: String,
    broker_port: u16,
    max_msg_size: usize,
    attempt_timeout: Duration,
    retry_interval: Duration,
    retry_budget: Duration,
    packet_logging: bool,
}

impl TransportClient {
    pub fn new(broker_host: impl Into<String>, broker_port: u16, max_msg_size: usize) -> Self {
        Self {
            broker_host: broker_host.into(),
            broker_port,
            max_msg_size,
            attempt_timeout: CLIENT_ATTEMPT_TIMEOUT,
            retry_interval: CLIENT_RETRY_INTERVAL,
            retry_budget: CLIENT_RETRY_BUDGET,
            packet_logging: false,
        }
    }

    /// How long one attempt waits for the broker's answer.
    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Total time after which no further attempt is started.
    pub fn with_retry_budget(mut self, retry_budget: Duration) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }

    pub fn broker(&self) -> String {
        format!("{}:{}", self.broker_host, self.broker_port)
    }

    /// Send `envelope` with retry; return the replies validated by `framing`.
    pub async fn send<F: Framing + ?Sized>(
        &self,
        envelope: &RelayEnvelope,
        framing: &F,
    ) -> ModbusResult<Vec<Bytes>> {
        let datagram = envelope.encode(self.max_msg_size)?;
        let response = self.send_with_retry(&datagram).await?;
        let frames = response.into_frames()?;
        framing.validate_batch(&frames)?;

        debug!(
            "Relay to {}:{} returned {} replies",
            envelope.ip,
            envelope.port,
            frames.len()
        );
        Ok(frames)
    }

    async fn send_with_retry(&self, datagram: &[u8]) -> ModbusResult<RelayResponse> {
        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            match self.attempt(datagram).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() => {
                    let elapsed = started.elapsed();
                    if elapsed + self.retry_interval >= self.retry_budget {
                        warn!(
                            "Giving up on broker {} after {} attempts",
                            self.broker(),
                            attempts
                        );
                        return Err(ModbusError::AttemptsExhausted {
                            attempts,
                            elapsed_ms: elapsed.as_millis() as u64,
                        });
                    }
                    debug!("Attempt {} to {} failed: {}, retrying", attempts, self.broker(), err);
                    sleep(self.retry_interval).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt(&self, datagram: &[u8]) -> ModbusResult<RelayResponse> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket
            .connect((self.broker_host.as_str(), self.broker_port))
            .await?;

        if self.packet_logging {
            log_packet(">>", &self.broker(), datagram);
        }
        socket.send(datagram).await?;

        let mut buf = vec![0u8; self.max_msg_size];
        let len = timeout(self.attempt_timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| {
                ModbusError::timeout(
                    format!("broker exchange with {}", self.broker()),
                    self.attempt_timeout.as_millis() as u64,
                )
            })??;
        if self.packet_logging {
            log_packet("<<", &self.broker(), &buf[..len]);
        }
        RelayResponse::decode(&buf[..len])
    }
}

impl RelayTransport for TransportClient {
    async fn relay(
        &self,
        envelope: &RelayEnvelope,
        framing: &DeviceFraming,
    ) -> ModbusResult<Vec<Bytes>> {
        self.send(envelope, framing).await
    }
}
