//! Relay broker behaviour over real sockets: per-device ordering,
//! cross-device parallelism, failure isolation, and the full
//! collector → broker → device path.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout, Instant};

use voltage_collector::codec::append_crc;
use voltage_collector::{
    BrokerConfig, CollectionGroup, Collector, DeviceConfig, DeviceExchange, DeviceLimits,
    MemorySink, ModbusError, ModbusResult, ModelProfile, ModelRegistry, Protocol, RegisterDefinition,
    RegisterMap, RegisterType, RelayBroker, RelayEnvelope, RelayResponse, TransportClient,
    TransportProtocol,
};

const MAX_MSG_SIZE: usize = 4096;
const FAILING_IP: &str = "10.0.0.66";

#[derive(Debug, Clone)]
struct Call {
    ip: String,
    tag: u8,
    started: Instant,
    finished: Instant,
}

/// Device stub answering after `delay`; `FAILING_IP` always times out.
struct SlowExchange {
    delay: Duration,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl DeviceExchange for SlowExchange {
    async fn exchange(
        &self,
        _protocol: TransportProtocol,
        ip: &str,
        port: u16,
        content: &[Bytes],
    ) -> ModbusResult<Vec<Bytes>> {
        let started = Instant::now();
        sleep(self.delay).await;
        if ip == FAILING_IP {
            return Err(ModbusError::timeout(
                format!("UDP exchange with {}:{}", ip, port),
                1000,
            ));
        }
        let call = Call {
            ip: ip.to_string(),
            tag: content.first().and_then(|m| m.first()).copied().unwrap_or(0),
            started,
            finished: Instant::now(),
        };
        self.calls.lock().unwrap().push(call);
        Ok(content.to_vec())
    }
}

async fn start_slow_broker(
    delay: Duration,
) -> (SocketAddr, Arc<Mutex<Vec<Call>>>, oneshot::Sender<()>) {
    start_slow_broker_with(BrokerConfig::new(0, MAX_MSG_SIZE), delay).await
}

async fn start_slow_broker_with(
    config: BrokerConfig,
    delay: Duration,
) -> (SocketAddr, Arc<Mutex<Vec<Call>>>, oneshot::Sender<()>) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let exchange = SlowExchange {
        delay,
        calls: Arc::clone(&calls),
    };
    let config = config.with_bind_addr("127.0.0.1:0".parse().unwrap());
    let broker = RelayBroker::with_exchange(config, exchange).await.unwrap();
    let addr = broker.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(broker.run_until(async move {
        stop_rx.await.ok();
    }));
    (addr, calls, stop_tx)
}

fn envelope(ip: &str, tag: u8) -> Vec<u8> {
    RelayEnvelope::new(TransportProtocol::Udp, ip, 1001, vec![Bytes::from(vec![tag])])
        .encode(MAX_MSG_SIZE)
        .unwrap()
}

/// Send a datagram from a fresh socket and wait for the answer.
async fn ask(broker: SocketAddr, datagram: Vec<u8>) -> (RelayResponse, Instant) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(&datagram, broker).await.unwrap();
    let mut buf = vec![0u8; MAX_MSG_SIZE];
    let (len, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    (RelayResponse::decode(&buf[..len]).unwrap(), Instant::now())
}

#[tokio::test]
async fn test_same_device_is_relayed_in_order() {
    let (broker, calls, _stop) = start_slow_broker(Duration::from_millis(150)).await;

    let first = tokio::spawn(ask(broker, envelope("10.0.0.1", b'A')));
    sleep(Duration::from_millis(20)).await;
    let second = tokio::spawn(ask(broker, envelope("10.0.0.1", b'B')));

    let (a, _) = first.await.unwrap();
    let (b, _) = second.await.unwrap();
    assert_eq!(a.into_frames().unwrap(), vec![Bytes::from_static(b"A")]);
    assert_eq!(b.into_frames().unwrap(), vec![Bytes::from_static(b"B")]);

    let calls = calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 2);
    assert_eq!((calls[0].tag, calls[1].tag), (b'A', b'B'));
    // never two exchanges in flight for one device
    assert!(calls[1].started >= calls[0].finished);
}

#[tokio::test]
async fn test_different_devices_proceed_in_parallel() {
    let delay = Duration::from_millis(300);
    let (broker, calls, _stop) = start_slow_broker(delay).await;

    let started = Instant::now();
    let one = tokio::spawn(ask(broker, envelope("10.0.0.1", 1)));
    let two = tokio::spawn(ask(broker, envelope("10.0.0.2", 2)));
    let (r1, _) = one.await.unwrap();
    let (r2, _) = two.await.unwrap();

    assert!(r1.is_success() && r2.is_success());
    let elapsed = started.elapsed();
    assert!(
        elapsed < delay * 2,
        "devices were served one after the other: {:?}",
        elapsed
    );

    let calls = calls.lock().unwrap().clone();
    let mut ips: Vec<_> = calls.iter().map(|c| c.ip.as_str()).collect();
    ips.sort();
    assert_eq!(ips, vec!["10.0.0.1", "10.0.0.2"]);
}

#[tokio::test]
async fn test_failure_does_not_affect_other_device() {
    let (broker, _calls, _stop) = start_slow_broker(Duration::from_millis(100)).await;

    let failing = tokio::spawn(ask(broker, envelope(FAILING_IP, 1)));
    let healthy = tokio::spawn(ask(broker, envelope("10.0.0.7", 2)));

    let (failed, _) = failing.await.unwrap();
    let (ok, _) = healthy.await.unwrap();

    assert_eq!(failed.status, RelayResponse::FAILURE);
    let err = failed.into_frames().unwrap_err();
    assert!(err.to_string().contains("Timeout during UDP exchange"));
    assert_eq!(ok.into_frames().unwrap(), vec![Bytes::from_static(&[2])]);
}

#[tokio::test]
async fn test_full_queue_does_not_hold_up_other_device() {
    let delay = Duration::from_millis(300);
    let config = BrokerConfig::new(0, MAX_MSG_SIZE).with_queue_capacity(1);
    let (broker, _calls, _stop) = start_slow_broker_with(config, delay).await;

    let backlog: Vec<_> = (1..=5)
        .map(|tag| tokio::spawn(ask(broker, envelope("10.0.0.1", tag))))
        .collect();
    sleep(Duration::from_millis(20)).await;

    let sent = Instant::now();
    let (other, answered) = ask(broker, envelope("10.0.0.2", 9)).await;
    assert_eq!(other.into_frames().unwrap(), vec![Bytes::from_static(&[9])]);
    assert!(
        answered - sent < delay + Duration::from_millis(150),
        "other device waited {:?}",
        answered - sent
    );

    // One exchange in flight plus one queued; the rest are refused.
    let mut refused = 0;
    for handle in backlog {
        let (response, _) = handle.await.unwrap();
        if !response.is_success() {
            let err = response.into_frames().unwrap_err();
            assert!(err.to_string().contains("queue for 10.0.0.1 is full"));
            refused += 1;
        }
    }
    assert!(refused >= 3, "only {} envelopes refused", refused);
}

#[tokio::test]
async fn test_unknown_protocol_answered_with_failure() {
    let (broker, calls, _stop) = start_slow_broker(Duration::from_millis(10)).await;
    let datagram = br#"{"protocol":"SERIAL","ip":"10.0.0.1","port":1,"content":[[1]]}"#.to_vec();

    let (response, _) = ask(broker, datagram).await;
    assert!(!response.is_success());
    assert!(calls.lock().unwrap().is_empty());
}

// ============================================================================
// End to end
// ============================================================================

/// Register image; RTU devices store the most significant word last, TCP
/// devices first.
fn register_image(most_significant_last: bool) -> HashMap<u16, u16> {
    let mut image = HashMap::new();
    for (address, value) in [(0u16, 229.5f32), (2, 220.25)] {
        let bits = value.to_bits();
        let (hi, lo) = ((bits >> 16) as u16, bits as u16);
        let (first, second) = if most_significant_last { (lo, hi) } else { (hi, lo) };
        image.insert(address, first);
        image.insert(address + 1, second);
    }
    image.insert(10, 6000);
    image
}

fn read_payload(image: &HashMap<u16, u16>, start: u16, count: u16, out: &mut BytesMut) {
    out.put_u8((count * 2) as u8);
    for address in start..start + count {
        out.put_u16(image.get(&address).copied().unwrap_or(0));
    }
}

/// Modbus RTU device answering read requests over UDP.
async fn spawn_rtu_udp_device(image: HashMap<u16, u16>) -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 256];
        loop {
            let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
            let request = &buf[..len];
            let start = u16::from_be_bytes([request[2], request[3]]);
            let count = u16::from_be_bytes([request[4], request[5]]);

            let mut reply = BytesMut::new();
            reply.put_u8(request[0]);
            reply.put_u8(request[1]);
            read_payload(&image, start, count, &mut reply);
            append_crc(&mut reply);
            socket.send_to(&reply, peer).await.unwrap();
        }
    });
    port
}

/// Modbus TCP device answering read requests on one connection at a time.
async fn spawn_tcp_device(image: HashMap<u16, u16>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 260];
            loop {
                let len = stream.read(&mut buf).await.unwrap();
                if len == 0 {
                    break;
                }
                let request = &buf[..len];
                let start = u16::from_be_bytes([request[8], request[9]]);
                let count = u16::from_be_bytes([request[10], request[11]]);

                let mut pdu = BytesMut::new();
                pdu.put_u8(request[6]);
                pdu.put_u8(request[7]);
                read_payload(&image, start, count, &mut pdu);

                let mut reply = BytesMut::new();
                reply.extend_from_slice(&request[0..2]);
                reply.put_u16(0);
                reply.put_u16(pdu.len() as u16);
                reply.extend_from_slice(&pdu);
                stream.write_all(&reply).await.unwrap();
            }
        }
    });
    port
}

fn registry() -> Arc<ModelRegistry> {
    let registry = ModelRegistry::new();
    registry.register(
        "tr4020",
        ModelProfile::new(RegisterMap::new(vec![
            RegisterDefinition::new("voltage_a", 0, RegisterType::Float32),
            RegisterDefinition::new("voltage_b", 2, RegisterType::Float32),
            RegisterDefinition::new("frequency", 10, RegisterType::Uint16),
        ]))
        .with_limits(DeviceLimits::new().with_max_block_size(10)),
    );
    Arc::new(registry)
}

#[tokio::test]
async fn test_collection_through_real_broker() {
    let rtu_port = spawn_rtu_udp_device(register_image(true)).await;
    let tcp_port = spawn_tcp_device(register_image(false)).await;

    let config = BrokerConfig::new(0, MAX_MSG_SIZE)
        .with_bind_addr("127.0.0.1:0".parse().unwrap())
        .with_packet_logging(true);
    let broker = RelayBroker::bind(config).await.unwrap();
    let broker_port = broker.local_addr().unwrap().port();
    let stats = broker.stats();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let broker_task = tokio::spawn(broker.run_until(async move {
        stop_rx.await.ok();
    }));

    let client = TransportClient::new("127.0.0.1", broker_port, MAX_MSG_SIZE)
        .with_attempt_timeout(Duration::from_secs(3));
    let sink = Arc::new(MemorySink::new());
    let collector = Collector::new(registry(), Arc::new(client), Arc::clone(&sink));

    let devices = vec![
        DeviceConfig::new("rtu-meter", "tr4020", "127.0.0.1", rtu_port),
        DeviceConfig::new("tcp-meter", "tr4020", "127.0.0.1", tcp_port)
            .with_protocol(Protocol::Tcp, TransportProtocol::Tcp),
    ];
    let report = collector
        .run_cycle(&devices, CollectionGroup::Minutely)
        .await;

    assert_eq!(report.succeeded(), 2, "{:?}", report.outcomes);
    let stored = sink.measurements().await;
    assert_eq!(stored.len(), 2);
    for entry in &stored {
        assert_eq!(entry.measurement.get("voltage_a"), Some(229.5));
        assert_eq!(entry.measurement.get("voltage_b"), Some(220.25));
        assert_eq!(entry.measurement.get("frequency"), Some(6000.0));
    }
    assert_eq!(sink.is_broken("rtu-meter").await, Some(false));
    // 229.5 V on 220 V nominal
    assert_eq!(sink.events().open_events().await.len(), 2);

    assert_eq!(stats.snapshot().relayed, 2);
    stop_tx.send(()).unwrap();
    timeout(Duration::from_secs(2), broker_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
