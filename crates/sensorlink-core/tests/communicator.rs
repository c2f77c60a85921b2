//! Integration tests for the concurrent communicator, driven by a scripted
//! in-memory transport standing in for the device.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use sensorlink_core::codec::attributes::{id, Attribute};
use sensorlink_core::codec::{self, Message};
use sensorlink_core::helpers::SendHelper;
use sensorlink_core::prelude::*;
use sensorlink_core::protocol::transport::Transport;
use sensorlink_core::protocol::FrameReassembler;

type Responder = Box<dyn FnMut(&Message) -> Vec<Message> + Send>;

/// Shared state of one simulated device link.
struct MockInner {
    rx: Mutex<VecDeque<u8>>,
    rx_ready: Condvar,
    written: Mutex<FrameReassembler>,
    requests: Mutex<Vec<Message>>,
    responder: Mutex<Option<Responder>>,
    fail_writes: AtomicBool,
    closed: AtomicBool,
    read_timeout: Mutex<Duration>,
}

impl MockInner {
    fn push_bytes(&self, bytes: &[u8]) {
        self.rx.lock().unwrap().extend(bytes.iter().copied());
        self.rx_ready.notify_all();
    }
}

struct MockTransport {
    inner: Arc<MockInner>,
}

impl Read for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let timeout = *self.inner.read_timeout.lock().unwrap();
        let mut rx = self.inner.rx.lock().unwrap();
        if rx.is_empty() {
            if self.inner.closed.load(Ordering::Acquire) {
                return Ok(0);
            }
            let (guard, _) = self.inner.rx_ready.wait_timeout(rx, timeout).unwrap();
            rx = guard;
        }
        if rx.is_empty() {
            if self.inner.closed.load(Ordering::Acquire) {
                return Ok(0);
            }
            return Err(io::Error::new(io::ErrorKind::TimedOut, "mock read timeout"));
        }
        let n = buf.len().min(rx.len());
        for slot in buf.iter_mut().take(n) {
            *slot = rx.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for MockTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.inner.fail_writes.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock write failure"));
        }
        let decoded = self.inner.written.lock().unwrap().feed(buf);
        for message in decoded {
            self.inner.requests.lock().unwrap().push(message.clone());
            let responses = {
                let mut responder = self.inner.responder.lock().unwrap();
                responder.as_mut().map(|f| f(&message)).unwrap_or_default()
            };
            for response in responses {
                self.inner.push_bytes(&codec::encode(&response));
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MockTransport {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        *self.inner.read_timeout.lock().unwrap() = timeout;
        Ok(())
    }

    fn try_clone_transport(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(MockTransport {
            inner: self.inner.clone(),
        }))
    }
}

/// Test-side handle to drive the simulated device.
#[derive(Clone)]
struct Device(Arc<MockInner>);

impl Device {
    fn respond_with(&self, f: impl FnMut(&Message) -> Vec<Message> + Send + 'static) {
        *self.0.responder.lock().unwrap() = Some(Box::new(f));
    }

    fn push(&self, message: &Message) {
        self.0.push_bytes(&codec::encode(message));
    }

    fn requests(&self) -> Vec<Message> {
        self.0.requests.lock().unwrap().clone()
    }

    fn fail_writes(&self) {
        self.0.fail_writes.store(true, Ordering::Release);
    }

    fn close(&self) {
        self.0.closed.store(true, Ordering::Release);
        self.0.rx_ready.notify_all();
    }
}

fn mock_pair() -> (Box<dyn Transport>, Device) {
    let inner = Arc::new(MockInner {
        rx: Mutex::new(VecDeque::new()),
        rx_ready: Condvar::new(),
        written: Mutex::new(FrameReassembler::new()),
        requests: Mutex::new(Vec::new()),
        responder: Mutex::new(None),
        fail_writes: AtomicBool::new(false),
        closed: AtomicBool::new(false),
        read_timeout: Mutex::new(Duration::from_millis(50)),
    });
    (
        Box::new(MockTransport {
            inner: inner.clone(),
        }),
        Device(inner),
    )
}

fn connect_mock() -> (Arc<Communicator>, Device) {
    let (transport, device) = mock_pair();
    let comm = Arc::new(Communicator::new(CommConfig::default()));
    comm.connect_with_transport(transport).expect("connects");
    (comm, device)
}

/// Poll `predicate` until it holds or the deadline passes.
fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    predicate()
}

#[test]
fn test_send_and_wait_receives_matching_response() {
    let (comm, device) = connect_mock();

    let battery_caller = {
        let comm = comm.clone();
        thread::spawn(move || {
            comm.send_and_wait(
                &Message::GetAttribute {
                    attribute_id: id::BATTERY_LEVEL,
                },
                Duration::from_secs(5),
            )
        })
    };
    let listing_caller = {
        let comm = comm.clone();
        thread::spawn(move || comm.send_and_wait(&Message::ListFiles, Duration::from_secs(5)))
    };

    // Wait for both requests on the wire, then answer in reverse order
    assert!(wait_until(Duration::from_secs(5), || device.requests().len() == 2));
    device.push(&Message::ListFilesResponse { entries: vec![] });
    device.push(&Message::GetAttributeResponse {
        attribute: Attribute::BatteryLevel(81),
    });

    let battery = battery_caller.join().unwrap().expect("battery response");
    let listing = listing_caller.join().unwrap().expect("listing response");
    assert_eq!(
        battery,
        Message::GetAttributeResponse {
            attribute: Attribute::BatteryLevel(81)
        }
    );
    assert_eq!(listing, Message::ListFilesResponse { entries: vec![] });
    comm.shutdown();
}

#[test]
fn test_response_observers_get_a_copy() {
    struct Recorder(Mutex<Vec<Message>>);
    impl ResponseListener for Recorder {
        fn response_received(&self, message: &Message) {
            self.0.lock().unwrap().push(message.clone());
        }
    }

    let (comm, device) = connect_mock();
    device.respond_with(|request| match request {
        Message::Heartbeat => vec![Message::HeartbeatResponse],
        _ => vec![],
    });
    let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
    comm.subscribe_responses(recorder.clone());

    let response = comm
        .send_and_wait(&Message::Heartbeat, Duration::from_secs(5))
        .expect("heartbeat answered");
    assert_eq!(response, Message::HeartbeatResponse);

    // The waiting caller and the observer both see the response
    assert!(wait_until(Duration::from_secs(5), || {
        recorder.0.lock().unwrap().len() == 1
    }));
    comm.shutdown();
}

#[test]
fn test_duplicate_correlation_key_rejected() {
    let (comm, _device) = connect_mock();

    let first = {
        let comm = comm.clone();
        thread::spawn(move || comm.send_and_wait(&Message::Heartbeat, Duration::from_millis(600)))
    };
    thread::sleep(Duration::from_millis(100));

    let second = comm.send_and_wait(&Message::Heartbeat, Duration::from_millis(100));
    assert!(matches!(second, Err(ProtocolError::DuplicateKey(_))));

    assert!(matches!(first.join().unwrap(), Err(ProtocolError::Timeout)));
    comm.shutdown();
}

#[test]
fn test_timeout_not_before_deadline() {
    let (comm, _device) = connect_mock();

    let timeout = Duration::from_millis(200);
    let start = Instant::now();
    let result = comm.send_and_wait(&Message::Heartbeat, timeout);
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(ProtocolError::Timeout)));
    assert!(elapsed >= timeout, "resolved early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1500), "took {:?}", elapsed);
    comm.shutdown();
}

#[test]
fn test_message_handler_can_send_and_wait() {
    // The deadlock-avoidance property: a message handler blocks in its own
    // synchronous call and must still complete, because response delivery
    // runs on its own pool.
    struct ReentrantHandler {
        comm: Weak<Communicator>,
        results: std::sync::mpsc::Sender<Result<Message, ProtocolError>>,
    }
    impl MessageListener for ReentrantHandler {
        fn message_received(&self, _message: &Message) {
            if let Some(comm) = self.comm.upgrade() {
                let result = comm.send_and_wait(&Message::Heartbeat, Duration::from_secs(5));
                let _ = self.results.send(result);
            }
        }
    }

    let (comm, device) = connect_mock();
    device.respond_with(|request| match request {
        Message::Heartbeat => vec![Message::HeartbeatResponse],
        _ => vec![],
    });

    let (results_tx, results_rx) = channel();
    comm.subscribe_messages(Arc::new(ReentrantHandler {
        comm: Arc::downgrade(&comm),
        results: results_tx,
    }));

    // An unsolicited message triggers the handler
    device.push(&Message::AttributeChanged {
        attribute: Attribute::HeartRate(64),
    });

    let inner = results_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("handler completed before the test timeout");
    assert_eq!(inner.expect("inner call succeeded"), Message::HeartbeatResponse);
    comm.shutdown();
}

#[test]
fn test_concurrent_shutdown_is_idempotent() {
    let (comm, _device) = connect_mock();

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let comm = comm.clone();
            thread::spawn(move || comm.shutdown())
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    comm.shutdown(); // one more for good measure

    assert_eq!(comm.state(), ConnectionState::Disconnected);
    assert!(matches!(
        comm.send_async(&Message::Heartbeat),
        Err(ProtocolError::NotConnected)
    ));
    assert!(matches!(
        comm.send_and_wait(&Message::Heartbeat, Duration::from_millis(50)),
        Err(ProtocolError::NotConnected)
    ));
}

#[test]
fn test_shutdown_resolves_outstanding_requests() {
    let (comm, device) = connect_mock();

    let waiter = {
        let comm = comm.clone();
        thread::spawn(move || comm.send_and_wait(&Message::Heartbeat, Duration::from_secs(30)))
    };
    // Only shut down once the request is actually on the wire
    assert!(wait_until(Duration::from_secs(5), || !device
        .requests()
        .is_empty()));

    comm.shutdown();
    assert!(matches!(
        waiter.join().unwrap(),
        Err(ProtocolError::ConnectionClosed)
    ));
}

#[test]
fn test_send_failure_resolves_immediately() {
    let (comm, device) = connect_mock();
    device.fail_writes();

    let start = Instant::now();
    let result = comm.send_and_wait(&Message::Heartbeat, Duration::from_secs(30));
    assert!(matches!(result, Err(ProtocolError::SendFailed(_))));
    assert!(start.elapsed() < Duration::from_secs(2));

    // A failed write is fatal to the link; the reader notices and tears down
    assert!(wait_until(Duration::from_secs(5), || comm.state()
        == ConnectionState::Disconnected));
}

#[test]
fn test_transport_eof_triggers_disconnect() {
    struct Events(Mutex<Vec<bool>>);
    impl ConnectionListener for Events {
        fn on_connected(&self, connected: bool) {
            self.0.lock().unwrap().push(connected);
        }
    }

    let (transport, device) = mock_pair();
    let comm = Arc::new(Communicator::new(CommConfig::default()));
    let events = Arc::new(Events(Mutex::new(Vec::new())));
    comm.subscribe_connection(events.clone());
    comm.connect_with_transport(transport).expect("connects");

    device.close();
    assert!(wait_until(Duration::from_secs(5), || comm.state()
        == ConnectionState::Disconnected));
    assert!(wait_until(Duration::from_secs(5), || {
        *events.0.lock().unwrap() == vec![true, false]
    }));
}

#[test]
fn test_unsolicited_delivery_preserves_order() {
    struct Recorder(Mutex<Vec<u16>>);
    impl MessageListener for Recorder {
        fn message_received(&self, message: &Message) {
            if let Message::AttributeChanged {
                attribute: Attribute::HeartRate(bpm),
            } = message
            {
                self.0.lock().unwrap().push(*bpm);
            }
        }
    }

    let (comm, device) = connect_mock();
    let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
    comm.subscribe_messages(recorder.clone());

    for bpm in 60..65 {
        device.push(&Message::AttributeChanged {
            attribute: Attribute::HeartRate(bpm),
        });
    }
    assert!(wait_until(Duration::from_secs(5), || {
        recorder.0.lock().unwrap().len() == 5
    }));
    assert_eq!(*recorder.0.lock().unwrap(), vec![60, 61, 62, 63, 64]);
    comm.shutdown();
}

#[test]
fn test_panicking_handler_does_not_stop_delivery() {
    struct Panicker;
    impl MessageListener for Panicker {
        fn message_received(&self, _message: &Message) {
            panic!("bad subscriber");
        }
    }
    struct Counter(Mutex<u32>);
    impl MessageListener for Counter {
        fn message_received(&self, _message: &Message) {
            *self.0.lock().unwrap() += 1;
        }
    }

    let (comm, device) = connect_mock();
    comm.subscribe_messages(Arc::new(Panicker));
    let counter = Arc::new(Counter(Mutex::new(0)));
    comm.subscribe_messages(counter.clone());

    for _ in 0..3 {
        device.push(&Message::AttributeChanged {
            attribute: Attribute::BatteryLevel(50),
        });
    }
    assert!(wait_until(Duration::from_secs(5), || {
        *counter.0.lock().unwrap() == 3
    }));
    comm.shutdown();
}

#[test]
fn test_unsubscribe_stops_delivery() {
    struct Counter(Mutex<u32>);
    impl MessageListener for Counter {
        fn message_received(&self, _message: &Message) {
            *self.0.lock().unwrap() += 1;
        }
    }

    let (comm, device) = connect_mock();
    let counter = Arc::new(Counter(Mutex::new(0)));
    let token = comm.subscribe_messages(counter.clone());

    device.push(&Message::AttributeChanged {
        attribute: Attribute::BatteryLevel(50),
    });
    assert!(wait_until(Duration::from_secs(5), || {
        *counter.0.lock().unwrap() == 1
    }));

    assert!(comm.unsubscribe(token));
    assert!(!comm.unsubscribe(token));
    device.push(&Message::AttributeChanged {
        attribute: Attribute::BatteryLevel(49),
    });
    thread::sleep(Duration::from_millis(200));
    assert_eq!(*counter.0.lock().unwrap(), 1);
    comm.shutdown();
}

#[test]
fn test_helper_attribute_roundtrips() {
    let (comm, device) = connect_mock();
    device.respond_with(|request| match request {
        Message::Heartbeat => vec![Message::HeartbeatResponse],
        Message::GetAttribute { attribute_id } => {
            let attribute = match *attribute_id {
                id::SERIAL_NO => Attribute::SerialNo(0xCAFE),
                id::BATTERY_LEVEL => Attribute::BatteryLevel(77),
                id::TEMPERATURE => Attribute::Temperature(0x1A80),
                _ => return vec![],
            };
            vec![Message::GetAttributeResponse { attribute }]
        }
        Message::SetAttribute { .. } => vec![Message::SetAttributeResponse { accepted: true }],
        Message::ListFiles => vec![Message::ListFilesResponse {
            entries: vec![codec::FileEntry {
                name: "ecg_0001.bin".to_string(),
                size: 512,
            }],
        }],
        _ => vec![],
    });

    let helper = SendHelper::new(&comm, Duration::from_secs(5));
    helper.ping().expect("device answers");
    assert_eq!(helper.get_serial_no().unwrap(), 0xCAFE);
    assert_eq!(helper.get_battery_level().unwrap(), 77);
    assert_eq!(helper.get_temperature().unwrap(), 26.5);
    assert!(helper.set_current_time_now().unwrap());
    let files = helper.list_files().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "ecg_0001.bin");
    comm.shutdown();
}

#[test]
fn test_download_file() {
    struct Progress {
        complete: Mutex<Option<(u32, f64)>>,
    }
    impl FileDownloadListener for Progress {
        fn on_complete(&self, _file: &str, _path: &Path, kibps: f64) {
            *self.complete.lock().unwrap() = Some((100, kibps));
        }
    }

    const CHUNK: usize = 256;
    const CHUNKS: usize = 10;
    let payload: Vec<u8> = (0..CHUNK * CHUNKS).map(|i| (i % 251) as u8).collect();

    let (comm, device) = connect_mock();
    let chunks = payload.clone();
    device.respond_with(move |request| match request {
        Message::GetFile { name } if name == "ecg_0001.bin" => chunks
            .chunks(CHUNK)
            .enumerate()
            .map(|(i, data)| Message::FileData {
                offset: (i * CHUNK) as u32,
                data: data.to_vec(),
            })
            .collect(),
        _ => vec![],
    });

    let progress = Arc::new(Progress {
        complete: Mutex::new(None),
    });
    let path = comm
        .download_file(
            "ecg_0001.bin",
            payload.len() as u64,
            Some(progress.clone()),
            Duration::from_secs(10),
        )
        .expect("download completes");

    let downloaded = std::fs::read(&path).expect("file readable");
    assert_eq!(downloaded, payload);
    assert!(progress.complete.lock().unwrap().is_some());
    std::fs::remove_file(&path).ok();
    comm.shutdown();
}

#[test]
fn test_download_timeout_when_stream_stalls() {
    let (comm, device) = connect_mock();
    // Device answers with only the first half of the file
    device.respond_with(|request| match request {
        Message::GetFile { .. } => vec![Message::FileData {
            offset: 0,
            data: vec![0xAB; 128],
        }],
        _ => vec![],
    });

    let result = comm.download_file("ecg_0001.bin", 256, None, Duration::from_millis(300));
    assert!(matches!(result, Err(ProtocolError::Timeout)));
    comm.shutdown();
}

#[test]
fn test_reconnect_after_shutdown() {
    let (transport, device) = mock_pair();
    let comm = Arc::new(Communicator::new(CommConfig::default()));
    comm.connect_with_transport(transport).expect("first connect");
    drop(device);
    comm.shutdown();
    assert_eq!(comm.state(), ConnectionState::Disconnected);

    let (transport, device) = mock_pair();
    device.respond_with(|request| match request {
        Message::Heartbeat => vec![Message::HeartbeatResponse],
        _ => vec![],
    });
    comm.connect_with_transport(transport).expect("second connect");
    assert_eq!(comm.state(), ConnectionState::Connected);

    let helper = SendHelper::new(&comm, Duration::from_secs(5));
    helper.ping().expect("fresh link answers");
    comm.shutdown();
}

#[test]
fn test_connect_twice_rejected() {
    let (transport, _device) = mock_pair();
    let comm = Communicator::new(CommConfig::default());
    comm.connect_with_transport(transport).expect("connects");

    let (transport, _device2) = mock_pair();
    assert!(matches!(
        comm.connect_with_transport(transport),
        Err(ProtocolError::AlreadyConnected)
    ));
    comm.shutdown();
}

#[test]
fn test_stats_track_traffic() {
    let (comm, device) = connect_mock();
    device.respond_with(|request| match request {
        Message::Heartbeat => vec![Message::HeartbeatResponse],
        _ => vec![],
    });

    comm.send_and_wait(&Message::Heartbeat, Duration::from_secs(5))
        .expect("answered");
    assert!(wait_until(Duration::from_secs(5), || {
        comm.stats().rx_frames == 1
    }));
    let stats = comm.stats();
    assert_eq!(stats.tx_frames, 1);
    assert!(stats.tx_bytes > 0);
    assert!(stats.rx_bytes > 0);
    assert_eq!(stats.decode_errors, 0);
    comm.shutdown();
}
