//! End-to-end tests against an in-process mock controller speaking real
//! msgpack-rpc over real ZeroMQ sockets.

use rmpv::Value;
use servolink_channel::{
    Channel, ChannelConfig, ChannelEvent, ChannelStatus, DeviceProfile, RegisterBank,
    RegisterDescriptor,
};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use zeromq::{PubSocket, RepSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

const REG_GAIN: u8 = 1;
const REG_OFFSET: u8 = 2;

const GAIN_INITIAL: u64 = 120;
const OFFSET_INITIAL: u64 = 0xFFF0; // -16 in the signed view

/// Wire value the mock controller refuses to accept, to exercise the write
/// conflict path.
const REJECTED_VALUE: u64 = 13;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Generous settle time for PUB/SUB subscription propagation.
const SETTLE: Duration = Duration::from_millis(400);

struct BenchProfile;

impl DeviceProfile for BenchProfile {
    fn registers(&self) -> Vec<RegisterDescriptor> {
        vec![
            RegisterDescriptor::unsigned(REG_GAIN),
            RegisterDescriptor::signed(REG_OFFSET),
        ]
    }

    fn status(&self, _registers: &RegisterBank) -> ChannelStatus {
        ChannelStatus::Running
    }
}

fn reserve_tcp_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind ephemeral port");
    let port = listener
        .local_addr()
        .expect("Failed to read local address")
        .port();
    drop(listener);
    port
}

fn endpoint(port: u16) -> String {
    format!("tcp://127.0.0.1:{port}")
}

fn pack(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, value).unwrap();
    buf
}

fn response(result: Value) -> Vec<u8> {
    pack(&Value::Array(vec![
        Value::from(1u64),
        Value::from(0u64),
        Value::Nil,
        result,
    ]))
}

fn notification(method: &str, params: Vec<Value>) -> Vec<u8> {
    pack(&Value::Array(vec![
        Value::from(2u64),
        Value::from(method),
        Value::Array(params),
    ]))
}

/// The controller half of the RPC conversation. Replies to the fixed method
/// set and reports each `modifyRegister` it accepts.
async fn serve_rpc(
    mut socket: RepSocket,
    notification_port: u16,
    stream_port: u16,
    writes: mpsc::UnboundedSender<(u64, u64, u64)>,
) {
    loop {
        let request = match socket.recv().await {
            Ok(request) => request,
            Err(_) => return,
        };
        let frames = request.into_vec();
        let payload = frames.last().expect("request without payload");
        let mut cursor = &payload[..];
        let frame = rmpv::decode::read_value(&mut cursor).unwrap();
        let fields = frame.as_array().unwrap();
        assert_eq!(fields[0].as_u64(), Some(0), "expected request kind");
        let method = fields[2].as_str().unwrap();
        let args = fields[3].as_array().unwrap();

        let result = match method {
            "notificationPort" => Value::from(notification_port),
            "streamPorts" => Value::Array(vec![Value::from(stream_port)]),
            "streamAcquisitionConfig" => {
                Value::Array(vec![Value::F64(0.01), Value::from(512u64)])
            }
            "setStreamAcquisitionConfig" => Value::Nil,
            "readRegister" => match args[0].as_u64().unwrap() {
                x if x == u64::from(REG_GAIN) => Value::from(GAIN_INITIAL),
                x if x == u64::from(REG_OFFSET) => Value::from(OFFSET_INITIAL),
                other => panic!("read of unexpected register {other}"),
            },
            "modifyRegister" => {
                let index = args[0].as_u64().unwrap();
                let old = args[1].as_u64().unwrap();
                let new = args[2].as_u64().unwrap();
                if new == REJECTED_VALUE {
                    Value::Boolean(false)
                } else {
                    let _ = writes.send((index, old, new));
                    Value::Boolean(true)
                }
            }
            "ping" => Value::Nil,
            other => panic!("unexpected RPC method {other}"),
        };
        socket.send(ZmqMessage::from(response(result))).await.unwrap();
    }
}

struct MockController {
    rpc_task: JoinHandle<()>,
    notifications: PubSocket,
    stream: PubSocket,
    writes: mpsc::UnboundedReceiver<(u64, u64, u64)>,
    rpc_port: u16,
}

impl MockController {
    async fn start() -> Self {
        let rpc_port = reserve_tcp_port();
        let notification_port = reserve_tcp_port();
        let stream_port = reserve_tcp_port();

        let mut rpc_socket = RepSocket::new();
        rpc_socket.bind(&endpoint(rpc_port)).await.unwrap();
        let mut notifications = PubSocket::new();
        notifications.bind(&endpoint(notification_port)).await.unwrap();
        let mut stream = PubSocket::new();
        stream.bind(&endpoint(stream_port)).await.unwrap();

        let (writes_tx, writes) = mpsc::unbounded_channel();
        let rpc_task = tokio::spawn(serve_rpc(
            rpc_socket,
            notification_port,
            stream_port,
            writes_tx,
        ));
        Self {
            rpc_task,
            notifications,
            stream,
            writes,
            rpc_port,
        }
    }

    fn config(&self) -> ChannelConfig {
        ChannelConfig::new("127.0.0.1", self.rpc_port).with_display_name("mock")
    }

    async fn publish_notification(&mut self, method: &str, params: Vec<Value>) {
        self.notifications
            .send(ZmqMessage::from(notification(method, params)))
            .await
            .unwrap();
    }

    async fn publish_samples(&mut self, samples: &[i8]) {
        let data: Vec<u8> = samples.iter().map(|&v| v as u8).collect();
        let param = Value::Map(vec![
            (Value::from("sampleIntervalSeconds"), Value::F64(0.001)),
            (Value::from("triggerOffset"), Value::from(3u64)),
            (Value::from("samples"), Value::Ext(1, data)),
        ]);
        self.stream
            .send(ZmqMessage::from(notification("streamPacket", vec![param])))
            .await
            .unwrap();
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> ChannelEvent {
    timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for a channel event")
        .expect("channel actor went away")
}

/// Drain events until `ConnectionReady`, failing the test on
/// `ConnectionFailed`. Returns the register values seen during bring-up.
async fn wait_for_ready(
    events: &mut mpsc::UnboundedReceiver<ChannelEvent>,
) -> Vec<(u8, i32)> {
    let mut reads = Vec::new();
    loop {
        match next_event(events).await {
            ChannelEvent::ConnectionReady => return reads,
            ChannelEvent::ConnectionFailed { reason } => {
                panic!("bring-up failed: {reason}");
            }
            ChannelEvent::RegisterChanged { index, value } => reads.push((index, value)),
            _ => {}
        }
    }
}

#[tokio::test]
async fn bring_up_reaches_ready_and_shuts_down_cleanly() {
    let controller = MockController::start().await;
    let (channel, mut events) = Channel::open(controller.config(), Arc::new(BenchProfile)).unwrap();

    let reads = wait_for_ready(&mut events).await;
    assert_eq!(
        reads,
        vec![(REG_GAIN, GAIN_INITIAL as i32), (REG_OFFSET, -16)]
    );

    channel.shutdown();
    assert_eq!(next_event(&mut events).await, ChannelEvent::ShuttingDown);
    controller.rpc_task.abort();
}

#[tokio::test]
async fn local_write_confirms_and_suppresses_echo() {
    let mut controller = MockController::start().await;
    let (channel, mut events) = Channel::open(controller.config(), Arc::new(BenchProfile)).unwrap();
    wait_for_ready(&mut events).await;
    sleep(SETTLE).await;

    channel.write_register(REG_GAIN, 200);
    assert_eq!(
        next_event(&mut events).await,
        ChannelEvent::RegisterChanged {
            index: REG_GAIN,
            value: 200
        }
    );
    let write = timeout(EVENT_TIMEOUT, controller.writes.recv())
        .await
        .expect("controller never saw the write")
        .unwrap();
    assert_eq!(write, (u64::from(REG_GAIN), GAIN_INITIAL, 200));

    // Echo of our own write, then an external change. Only the external one
    // may produce an event.
    controller
        .publish_notification(
            "registerChanged",
            vec![Value::from(REG_GAIN), Value::from(200u64)],
        )
        .await;
    controller
        .publish_notification(
            "registerChanged",
            vec![Value::from(REG_GAIN), Value::from(90u64)],
        )
        .await;
    assert_eq!(
        next_event(&mut events).await,
        ChannelEvent::RegisterChanged {
            index: REG_GAIN,
            value: 90
        }
    );

    channel.shutdown();
    controller.rpc_task.abort();
}

#[tokio::test]
async fn write_conflict_desynchronizes_and_rereads() {
    let controller = MockController::start().await;
    let (channel, mut events) = Channel::open(controller.config(), Arc::new(BenchProfile)).unwrap();
    wait_for_ready(&mut events).await;

    channel.write_register(REG_GAIN, REJECTED_VALUE as i32);
    assert_eq!(
        next_event(&mut events).await,
        ChannelEvent::RegisterChanged {
            index: REG_GAIN,
            value: REJECTED_VALUE as i32
        }
    );
    assert_eq!(
        next_event(&mut events).await,
        ChannelEvent::RegisterDesynchronized { index: REG_GAIN }
    );
    // The targeted re-read restores the controller's value.
    assert_eq!(
        next_event(&mut events).await,
        ChannelEvent::RegisterChanged {
            index: REG_GAIN,
            value: GAIN_INITIAL as i32
        }
    );

    channel.shutdown();
    controller.rpc_task.abort();
}

#[tokio::test]
async fn stream_subscription_decodes_sample_packets() {
    let mut controller = MockController::start().await;
    let (channel, mut events) = Channel::open(controller.config(), Arc::new(BenchProfile)).unwrap();
    wait_for_ready(&mut events).await;

    channel.subscribe_stream(0);
    sleep(SETTLE).await;

    controller.publish_samples(&[-1, 0, 1, 127]).await;
    match next_event(&mut events).await {
        ChannelEvent::StreamPacket(packet) => {
            assert_eq!(packet.stream_index, 0);
            assert_eq!(packet.sample_interval_seconds, 0.001);
            assert_eq!(packet.trigger_offset, 3);
            assert_eq!(packet.samples, vec![-4, 0, 4, 508]);
        }
        other => panic!("expected a stream packet, got {other:?}"),
    }

    channel.shutdown();
    controller.rpc_task.abort();
}

#[tokio::test]
async fn remote_shutdown_notification_ends_the_session() {
    let mut controller = MockController::start().await;
    let (_channel, mut events) =
        Channel::open(controller.config(), Arc::new(BenchProfile)).unwrap();
    wait_for_ready(&mut events).await;
    sleep(SETTLE).await;

    controller.publish_notification("shutdown", vec![]).await;
    assert_eq!(next_event(&mut events).await, ChannelEvent::ShuttingDown);
    controller.rpc_task.abort();
}

#[tokio::test]
async fn unanswered_heartbeat_fails_the_connection() {
    let controller = MockController::start().await;
    let config = controller
        .config()
        .with_heartbeat_interval(Duration::from_millis(400))
        .with_heartbeat_timeout(Duration::from_millis(200));
    let (_channel, mut events) = Channel::open(config, Arc::new(BenchProfile)).unwrap();
    wait_for_ready(&mut events).await;

    // Kill the controller: the next ping can never be answered.
    controller.rpc_task.abort();

    loop {
        match next_event(&mut events).await {
            ChannelEvent::ConnectionFailed { .. } => break,
            ChannelEvent::ShuttingDown => panic!("shutdown before a failure was reported"),
            _ => {}
        }
    }
    assert_eq!(next_event(&mut events).await, ChannelEvent::ShuttingDown);
}

#[tokio::test]
async fn failed_bring_up_never_reports_ready() {
    // A controller that refuses the very first bring-up call.
    let rpc_port = reserve_tcp_port();
    let mut socket = RepSocket::new();
    socket.bind(&endpoint(rpc_port)).await.unwrap();
    let server = tokio::spawn(async move {
        let _request = socket.recv().await.unwrap();
        let reply = pack(&Value::Array(vec![
            Value::from(1u64),
            Value::from(0u64),
            Value::from("unsupported client"),
            Value::Nil,
        ]));
        socket.send(ZmqMessage::from(reply)).await.unwrap();
    });

    let config = ChannelConfig::new("127.0.0.1", rpc_port);
    let (_channel, mut events) = Channel::open(config, Arc::new(BenchProfile)).unwrap();

    match next_event(&mut events).await {
        ChannelEvent::ConnectionFailed { reason } => {
            assert!(reason.contains("unsupported client"), "reason: {reason}");
        }
        other => panic!("expected a connection failure, got {other:?}"),
    }
    assert_eq!(next_event(&mut events).await, ChannelEvent::ShuttingDown);

    // Terminal: the actor is gone, no ready event can ever follow.
    let trailing = timeout(Duration::from_millis(300), events.recv()).await;
    assert!(matches!(trailing, Ok(None) | Err(_)), "got {trailing:?}");
    server.await.unwrap();
}
