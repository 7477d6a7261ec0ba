//! # Relay Broker
//!
//! Receives [`RelayEnvelope`]s on one UDP socket, exchanges their messages
//! with the destination device and answers the sender with a
//! [`RelayResponse`].
//!
//! ## Routing
//!
//! Envelopes are routed by destination ip. Each destination owns a bounded
//! queue drained by one worker task, so a device sees at most one exchange
//! at a time and in arrival order, while different devices proceed in
//! parallel. The receive loop never waits on a queue: when a destination's
//! queue is full the envelope is refused with `status = 0`. A worker whose queue stays empty for the idle timeout removes
//! its route and exits; the next envelope for that ip starts a new one.
//!
//! Route creation and eviction both happen under the routing map's shard
//! lock: a route is only removed while its queue is empty, and an envelope
//! is only queued on a route that is still in the map.
//!
//! ## Failures
//!
//! Every envelope gets an answer. Malformed envelopes, unknown protocols
//! and envelopes for a full queue are answered with `status = 0` straight
//! from the receive loop. Exchange
//! failures are answered by the worker. Answers are best-effort: a reply
//! that cannot be delivered is logged and dropped.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::constants::{
    BROKER_IDLE_TIMEOUT, BROKER_QUEUE_CAPACITY, DEVICE_TCP_TIMEOUT, DEVICE_UDP_TIMEOUT,
    MBAP_HEADER_LEN,
};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::log_packet;
use crate::relay::{RelayEnvelope, RelayResponse, TransportProtocol};

/// Broker settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind_addr: SocketAddr,
    /// Largest datagram accepted or produced, shared with clients.
    pub max_msg_size: usize,
    pub idle_timeout: Duration,
    pub queue_capacity: usize,
    pub packet_logging: bool,
}

impl BrokerConfig {
    /// Listen on all interfaces at `port`.
    pub fn new(port: u16, max_msg_size: usize) -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            max_msg_size,
            idle_timeout: BROKER_IDLE_TIMEOUT,
            queue_capacity: BROKER_QUEUE_CAPACITY,
            packet_logging: false,
        }
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Queue capacity per destination, at least 1.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }
}

// ============================================================================
// Device exchange
// ============================================================================

/// Performs the actual exchange with a device.
pub trait DeviceExchange: Send + Sync + 'static {
    /// Send each message in order, awaiting one reply per message.
    fn exchange(
        &self,
        protocol: TransportProtocol,
        ip: &str,
        port: u16,
        content: &[Bytes],
    ) -> impl Future<Output = ModbusResult<Vec<Bytes>>> + Send;
}

/// Exchange over real UDP/TCP sockets.
#[derive(Debug, Clone)]
pub struct NetworkExchange {
    max_msg_size: usize,
    udp_timeout: Duration,
    tcp_timeout: Duration,
    packet_logging: bool,
}

impl NetworkExchange {
    pub fn new(max_msg_size: usize) -> Self {
        Self {
            max_msg_size,
            udp_timeout: DEVICE_UDP_TIMEOUT,
            tcp_timeout: DEVICE_TCP_TIMEOUT,
            packet_logging: false,
        }
    }

    pub fn with_udp_timeout(mut self, udp_timeout: Duration) -> Self {
        self.udp_timeout = udp_timeout;
        self
    }

    pub fn with_tcp_timeout(mut self, tcp_timeout: Duration) -> Self {
        self.tcp_timeout = tcp_timeout;
        self
    }

    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }

    async fn exchange_udp(&self, ip: &str, port: u16, content: &[Bytes]) -> ModbusResult<Vec<Bytes>> {
        let peer = format!("{}:{}", ip, port);
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((ip, port)).await?;

        let mut buf = vec![0u8; self.max_msg_size];
        let mut replies = Vec::with_capacity(content.len());
        for message in content {
            if self.packet_logging {
                log_packet("->", &peer, message);
            }
            socket.send(message).await?;
            let len = timeout(self.udp_timeout, socket.recv(&mut buf))
                .await
                .map_err(|_| {
                    ModbusError::timeout(
                        format!("UDP exchange with {}", peer),
                        self.udp_timeout.as_millis() as u64,
                    )
                })??;
            if self.packet_logging {
                log_packet("<-", &peer, &buf[..len]);
            }
            replies.push(Bytes::copy_from_slice(&buf[..len]));
        }
        Ok(replies)
    }

    async fn exchange_tcp(&self, ip: &str, port: u16, content: &[Bytes]) -> ModbusResult<Vec<Bytes>> {
        let peer = format!("{}:{}", ip, port);
        let timeout_ms = self.tcp_timeout.as_millis() as u64;
        let mut stream = timeout(self.tcp_timeout, TcpStream::connect((ip, port)))
            .await
            .map_err(|_| ModbusError::timeout(format!("TCP connect to {}", peer), timeout_ms))??;

        let mut replies = Vec::with_capacity(content.len());
        for message in content {
            if self.packet_logging {
                log_packet("->", &peer, message);
            }
            timeout(self.tcp_timeout, stream.write_all(message))
                .await
                .map_err(|_| ModbusError::timeout(format!("TCP send to {}", peer), timeout_ms))??;
            let reply = timeout(self.tcp_timeout, self.read_mbap_frame(&mut stream, &peer))
                .await
                .map_err(|_| ModbusError::timeout(format!("TCP receive from {}", peer), timeout_ms))??;
            if self.packet_logging {
                log_packet("<-", &peer, &reply);
            }
            replies.push(reply);
        }

        if let Err(err) = stream.shutdown().await {
            debug!("TCP shutdown of {} failed: {}", peer, err);
        }
        Ok(replies)
    }

    /// Read one complete MBAP frame: the header, then as many bytes as its
    /// length field announces.
    async fn read_mbap_frame(&self, stream: &mut TcpStream, peer: &str) -> ModbusResult<Bytes> {
        let mut header = [0u8; MBAP_HEADER_LEN];
        stream.read_exact(&mut header).await.map_err(|err| closed_or_io(err, peer))?;

        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        if length == 0 || MBAP_HEADER_LEN + length > self.max_msg_size {
            return Err(ModbusError::protocol(format!(
                "invalid MBAP length {} from {}",
                length, peer
            )));
        }

        let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + length);
        frame.extend_from_slice(&header);
        frame.resize(MBAP_HEADER_LEN + length, 0);
        stream
            .read_exact(&mut frame[MBAP_HEADER_LEN..])
            .await
            .map_err(|err| closed_or_io(err, peer))?;
        Ok(frame.freeze())
    }
}

fn closed_or_io(err: std::io::Error, peer: &str) -> ModbusError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ModbusError::transport(format!("connection closed by {}", peer))
    } else {
        err.into()
    }
}

impl DeviceExchange for NetworkExchange {
    async fn exchange(
        &self,
        protocol: TransportProtocol,
        ip: &str,
        port: u16,
        content: &[Bytes],
    ) -> ModbusResult<Vec<Bytes>> {
        match protocol {
            TransportProtocol::Udp => self.exchange_udp(ip, port, content).await,
            TransportProtocol::Tcp => self.exchange_tcp(ip, port, content).await,
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Counters of a running broker.
#[derive(Debug, Default)]
pub struct BrokerStats {
    received: AtomicU64,
    relayed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    active_routes: AtomicU64,
}

/// Point-in-time copy of [`BrokerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BrokerStatsSnapshot {
    /// Datagrams received on the control socket.
    pub received: u64,
    /// Envelopes answered with device replies.
    pub relayed: u64,
    /// Envelopes whose device exchange failed.
    pub failed: u64,
    /// Datagrams refused before queueing (malformed, unknown protocol,
    /// destination queue full).
    pub rejected: u64,
    pub active_routes: u64,
}

impl BrokerStats {
    pub fn snapshot(&self) -> BrokerStatsSnapshot {
        BrokerStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            active_routes: self.active_routes.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Broker
// ============================================================================

struct Job {
    envelope: RelayEnvelope,
    protocol: TransportProtocol,
    reply_to: SocketAddr,
}

struct Route {
    id: u64,
    tx: mpsc::Sender<Job>,
}

/// State shared by the receive loop and every worker.
struct Shared<E> {
    socket: UdpSocket,
    exchange: E,
    routes: DashMap<String, Route>,
    stats: Arc<BrokerStats>,
    config: BrokerConfig,
}

/// UDP relay broker.
pub struct RelayBroker<E: DeviceExchange = NetworkExchange> {
    shared: Arc<Shared<E>>,
    next_route_id: AtomicU64,
    /// Cloned into every worker; closed once all workers have exited.
    workers_done_tx: mpsc::Sender<()>,
    workers_done_rx: mpsc::Receiver<()>,
}

impl RelayBroker<NetworkExchange> {
    /// Bind a broker exchanging with devices over the network.
    pub async fn bind(config: BrokerConfig) -> ModbusResult<Self> {
        let exchange = NetworkExchange::new(config.max_msg_size)
            .with_packet_logging(config.packet_logging);
        Self::with_exchange(config, exchange).await
    }
}

impl<E: DeviceExchange> RelayBroker<E> {
    /// Bind a broker with a custom device exchange.
    pub async fn with_exchange(config: BrokerConfig, exchange: E) -> ModbusResult<Self> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        info!(
            "Relay broker listening on {} (max_msg_size={}, queue_capacity={}, idle_timeout={:?})",
            socket.local_addr()?,
            config.max_msg_size,
            config.queue_capacity,
            config.idle_timeout
        );
        let (workers_done_tx, workers_done_rx) = mpsc::channel(1);

        Ok(Self {
            shared: Arc::new(Shared {
                socket,
                exchange,
                routes: DashMap::new(),
                stats: Arc::new(BrokerStats::default()),
                config,
            }),
            next_route_id: AtomicU64::new(1),
            workers_done_tx,
            workers_done_rx,
        })
    }

    pub fn local_addr(&self) -> ModbusResult<SocketAddr> {
        Ok(self.shared.socket.local_addr()?)
    }

    /// Counters, readable while the broker runs.
    pub fn stats(&self) -> Arc<BrokerStats> {
        Arc::clone(&self.shared.stats)
    }

    /// Serve forever.
    pub async fn run(self) -> ModbusResult<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Serve until `shutdown` completes, then let workers drain their queues.
    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) -> ModbusResult<()> {
        tokio::pin!(shutdown);
        let mut buf = vec![0u8; self.shared.config.max_msg_size];

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                received = self.shared.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, peer)) => self.handle_datagram(&buf[..len], peer).await,
                        Err(err) => warn!("Receive on control socket failed: {}", err),
                    }
                }
            }
        }

        info!("Relay broker stopping, draining {} routes", self.shared.routes.len());
        self.shared.routes.clear();
        drop(self.workers_done_tx);
        let _ = self.workers_done_rx.recv().await;
        info!("Relay broker stopped");
        Ok(())
    }

    async fn handle_datagram(&self, datagram: &[u8], peer: SocketAddr) {
        let shared = &self.shared;
        shared.stats.received.fetch_add(1, Ordering::Relaxed);
        if shared.config.packet_logging {
            log_packet("<<", &peer.to_string(), datagram);
        }

        let envelope = match RelayEnvelope::decode(datagram) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("Malformed envelope from {}: {}", peer, err);
                shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
                shared
                    .reply(RelayResponse::failure(format!("malformed envelope: {}", err)), peer)
                    .await;
                return;
            }
        };
        let protocol = match envelope.transport() {
            Ok(protocol) => protocol,
            Err(err) => {
                warn!("Rejecting envelope from {}: {}", peer, err);
                shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
                shared.reply(RelayResponse::failure(err.to_string()), peer).await;
                return;
            }
        };

        self.dispatch(Job {
            envelope,
            protocol,
            reply_to: peer,
        })
        .await;
    }

    /// Queue a job on its destination's route, creating the route if needed.
    ///
    /// Never waits: a job arriving at a full queue is answered with a
    /// failure straight away, so one stalled device cannot hold up the
    /// receive loop.
    async fn dispatch(&self, mut job: Job) {
        let key = job.envelope.routing_key().to_string();

        loop {
            let route = self
                .shared
                .routes
                .entry(key.clone())
                .or_insert_with(|| self.spawn_worker(&key));
            let outcome = route.tx.try_send(job);
            let id = route.id;
            drop(route);

            match outcome {
                Ok(()) => return,
                Err(TrySendError::Full(returned)) => {
                    warn!("Queue for {} is full, refusing envelope from {}", key, returned.reply_to);
                    self.shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    self.shared
                        .reply(
                            RelayResponse::failure(format!("queue for {} is full", key)),
                            returned.reply_to,
                        )
                        .await;
                    return;
                }
                Err(TrySendError::Closed(returned)) => {
                    self.shared.routes.remove_if(&key, |_, r| r.id == id);
                    job = returned;
                }
            }
        }
    }

    fn spawn_worker(&self, key: &str) -> Route {
        let id = self.next_route_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.shared.config.queue_capacity);
        let shared = Arc::clone(&self.shared);
        let done = self.workers_done_tx.clone();
        let key = key.to_string();

        shared.stats.active_routes.fetch_add(1, Ordering::Relaxed);
        debug!("Starting worker {} for {}", id, key);
        tokio::spawn(async move {
            shared.work(key, id, rx).await;
            drop(done);
        });
        Route { id, tx }
    }
}

impl<E: DeviceExchange> Shared<E> {
    async fn work(&self, key: String, id: u64, mut rx: mpsc::Receiver<Job>) {
        loop {
            match timeout(self.config.idle_timeout, rx.recv()).await {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => break,
                Err(_) => {
                    let evicted = self
                        .routes
                        .remove_if(&key, |_, route| route.id == id && rx.is_empty());
                    if evicted.is_some() {
                        debug!("Worker {} for {} idle, route evicted", id, key);
                        break;
                    }
                }
            }
        }
        self.stats.active_routes.fetch_sub(1, Ordering::Relaxed);
    }

    async fn process(&self, job: Job) {
        let Job {
            envelope,
            protocol,
            reply_to,
        } = job;
        let started = Instant::now();

        let response = match self
            .exchange
            .exchange(protocol, &envelope.ip, envelope.port, &envelope.content)
            .await
        {
            Ok(frames) => {
                self.stats.relayed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Relayed {} messages to {}:{} over {} in {:?}",
                    envelope.content.len(),
                    envelope.ip,
                    envelope.port,
                    protocol,
                    started.elapsed()
                );
                RelayResponse::success(frames)
            }
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Exchange with {}:{} over {} failed: {}",
                    envelope.ip, envelope.port, protocol, err
                );
                RelayResponse::failure(err.to_string())
            }
        };

        self.reply(response, reply_to).await;
    }

    /// Best-effort answer to `peer`.
    async fn reply(&self, response: RelayResponse, peer: SocketAddr) {
        let encoded = match response.encode(self.config.max_msg_size) {
            Ok(encoded) => encoded,
            Err(err) => match RelayResponse::failure(err.to_string()).encode(self.config.max_msg_size) {
                Ok(encoded) => encoded,
                Err(err) => {
                    warn!("Cannot encode reply for {}: {}", peer, err);
                    return;
                }
            },
        };

        if self.config.packet_logging {
            log_packet(">>", &peer.to_string(), &encoded);
        }
        if let Err(err) = self.socket.send_to(&encoded, peer).await {
            warn!("Reply to {} not delivered: {}", peer, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Echoes each message back, recording the destinations it saw.
    #[derive(Default)]
    struct EchoExchange {
        seen: Mutex<Vec<String>>,
    }

    impl DeviceExchange for EchoExchange {
        async fn exchange(
            &self,
            _protocol: TransportProtocol,
            ip: &str,
            _port: u16,
            content: &[Bytes],
        ) -> ModbusResult<Vec<Bytes>> {
            self.seen.lock().unwrap().push(ip.to_string());
            Ok(content.to_vec())
        }
    }

    async fn start(
        config: BrokerConfig,
    ) -> (SocketAddr, Arc<BrokerStats>, tokio::sync::oneshot::Sender<()>) {
        let broker = RelayBroker::with_exchange(config, EchoExchange::default())
            .await
            .unwrap();
        let addr = broker.local_addr().unwrap();
        let stats = broker.stats();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(broker.run_until(async move {
            let _ = stop_rx.await;
        }));
        (addr, stats, stop_tx)
    }

    async fn roundtrip(broker: SocketAddr, datagram: &[u8]) -> RelayResponse {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(datagram, broker).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let (len, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        RelayResponse::decode(&buf[..len]).unwrap()
    }

    fn local_config() -> BrokerConfig {
        BrokerConfig::new(0, 4096).with_bind_addr("127.0.0.1:0".parse().unwrap())
    }

    #[test]
    fn test_config_defaults() {
        let config = BrokerConfig::new(9000, 2048).with_queue_capacity(0);
        assert_eq!(config.bind_addr, "0.0.0.0:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.queue_capacity, 1);
    }

    #[tokio::test]
    async fn test_relays_and_answers() {
        let (addr, stats, _stop) = start(local_config()).await;
        let envelope = RelayEnvelope::new(
            TransportProtocol::Udp,
            "10.0.0.1",
            1001,
            vec![Bytes::from_static(&[1, 2, 3])],
        );

        let response = roundtrip(addr, &envelope.encode(4096).unwrap()).await;
        assert_eq!(
            response.into_frames().unwrap(),
            vec![Bytes::from_static(&[1, 2, 3])]
        );

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.received, 1);
        assert_eq!(snapshot.relayed, 1);
        assert_eq!(snapshot.active_routes, 1);
    }

    #[tokio::test]
    async fn test_unknown_protocol_rejected_without_route() {
        let (addr, stats, _stop) = start(local_config()).await;
        let datagram = br#"{"protocol":"SERIAL","ip":"10.0.0.1","port":1,"content":[]}"#;

        let response = roundtrip(addr, datagram).await;
        assert!(!response.is_success());
        assert!(response
            .into_frames()
            .unwrap_err()
            .to_string()
            .contains("Unknown protocol: SERIAL"));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.rejected, 1);
        assert_eq!(snapshot.active_routes, 0);
    }

    #[tokio::test]
    async fn test_malformed_datagram_answered() {
        let (addr, stats, _stop) = start(local_config()).await;
        let response = roundtrip(addr, b"not json").await;
        assert_eq!(response.status, RelayResponse::FAILURE);
        assert_eq!(stats.snapshot().rejected, 1);
    }

    #[tokio::test]
    async fn test_idle_route_is_evicted_and_recreated() {
        let config = local_config().with_idle_timeout(Duration::from_millis(50));
        let (addr, stats, _stop) = start(config).await;
        let datagram = RelayEnvelope::new(TransportProtocol::Udp, "10.0.0.2", 1, vec![])
            .encode(4096)
            .unwrap();

        roundtrip(addr, &datagram).await;
        assert_eq!(stats.snapshot().active_routes, 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(stats.snapshot().active_routes, 0);

        let response = roundtrip(addr, &datagram).await;
        assert!(response.is_success());
        assert_eq!(stats.snapshot().active_routes, 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_workers() {
        let broker = RelayBroker::with_exchange(local_config(), EchoExchange::default())
            .await
            .unwrap();
        let stats = broker.stats();
        let addr = broker.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(broker.run_until(async move {
            let _ = stop_rx.await;
        }));

        let datagram = RelayEnvelope::new(TransportProtocol::Udp, "10.0.0.3", 1, vec![])
            .encode(4096)
            .unwrap();
        roundtrip(addr, &datagram).await;

        stop_tx.send(()).unwrap();
        timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(stats.snapshot().active_routes, 0);
    }

    #[tokio::test]
    async fn test_network_exchange_udp_timeout() {
        // A bound socket that never answers.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        let exchange = NetworkExchange::new(512).with_udp_timeout(Duration::from_millis(50));

        let err = exchange
            .exchange(
                TransportProtocol::Udp,
                "127.0.0.1",
                port,
                &[Bytes::from_static(&[1])],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::Timeout { .. }));
    }

    /// MBAP read request for one register at `address`.
    fn mbap_request(transaction: u16, address: u16) -> Bytes {
        let mut frame = BytesMut::new();
        frame.extend_from_slice(&transaction.to_be_bytes());
        frame.extend_from_slice(&[0, 0, 0, 6, 1, 0x03]);
        frame.extend_from_slice(&address.to_be_bytes());
        frame.extend_from_slice(&[0, 1]);
        frame.freeze()
    }

    #[tokio::test]
    async fn test_network_exchange_tcp_sequential() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 12];
            while stream.read_exact(&mut request).await.is_ok() {
                // Header and body in separate segments.
                let mut header = [0u8; 6];
                header[..2].copy_from_slice(&request[..2]);
                header[5] = 5;
                stream.write_all(&header).await.unwrap();
                stream.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(30)).await;
                stream
                    .write_all(&[1, 0x03, 2, 0, request[9] + 1])
                    .await
                    .unwrap();
            }
        });

        let replies = NetworkExchange::new(512)
            .exchange(
                TransportProtocol::Tcp,
                "127.0.0.1",
                port,
                &[mbap_request(1, 41), mbap_request(2, 9)],
            )
            .await
            .unwrap();
        assert_eq!(
            replies,
            vec![
                Bytes::from_static(&[0, 1, 0, 0, 0, 5, 1, 0x03, 2, 0, 42]),
                Bytes::from_static(&[0, 2, 0, 0, 0, 5, 1, 0x03, 2, 0, 10]),
            ]
        );
    }

    #[tokio::test]
    async fn test_network_exchange_tcp_rejects_bad_length() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 12];
            stream.read_exact(&mut request).await.unwrap();
            stream.write_all(&[0, 1, 0, 0, 0xFF, 0xFF]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let err = NetworkExchange::new(64)
            .exchange(
                TransportProtocol::Tcp,
                "127.0.0.1",
                port,
                &[mbap_request(1, 0)],
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid MBAP length 65535"));
    }

    #[tokio::test]
    async fn test_network_exchange_tcp_truncated_reply() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 12];
            stream.read_exact(&mut request).await.unwrap();
            stream.write_all(&[0, 1, 0, 0, 0, 5, 1]).await.unwrap();
        });

        let err = NetworkExchange::new(512)
            .exchange(
                TransportProtocol::Tcp,
                "127.0.0.1",
                port,
                &[mbap_request(1, 0)],
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection closed by"));
    }
}
