//! In-memory transport and a scripted server for the connection tests.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use super::error::ConnectionError;
use super::receiver::ServerEventHandler;
use super::server_comm::{RegistrationProvider, ServerCommunication};
use super::transport::{BoxedStream, Connector};
use crate::configs::ConnectionSettings;
use crate::protocol::{
    decode_frame, encode_frame, frame_codec, tags, Envelope, InboundEvent, NodeManifest, SensorData,
    SensorDataType, SensorManifest, SensorsState, StateChange,
};

/// Hands the server end of every new duplex pipe to the test.
pub(crate) struct PipeConnector {
    servers: mpsc::UnboundedSender<DuplexStream>,
    failing: AtomicBool,
}

impl PipeConnector {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (servers, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { servers, failing: AtomicBool::new(false) }), rx)
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Connector for PipeConnector {
    fn connect(&self) -> BoxFuture<'_, Result<BoxedStream, ConnectionError>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ConnectionError::Transport(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")));
            }
            let (client, server) = duplex(256 * 1024);
            self.servers
                .send(server)
                .map_err(|_| ConnectionError::Transport(io::Error::other("test server gone")))?;
            Ok(Box::new(client) as BoxedStream)
        })
    }

    fn describe(&self) -> String {
        "in-memory pipe".to_string()
    }
}

pub(crate) struct FakeServer {
    lines: FramedRead<ReadHalf<DuplexStream>, LinesCodec>,
    sink: FramedWrite<WriteHalf<DuplexStream>, LinesCodec>,
}

impl FakeServer {
    pub(crate) fn new(stream: DuplexStream) -> Self {
        let (read, write) = split(stream);
        Self { lines: FramedRead::new(read, frame_codec()), sink: FramedWrite::new(write, frame_codec()) }
    }

    pub(crate) async fn recv(&mut self) -> Envelope {
        let line = self.lines.next().await.expect("client closed the pipe").expect("read failed");
        decode_frame(&line).expect("client sent a malformed frame")
    }

    pub(crate) async fn send(&mut self, envelope: &Envelope) {
        self.sink.send(encode_frame(envelope).expect("encode")).await.expect("write failed");
    }

    pub(crate) async fn send_raw(&mut self, line: &str) {
        self.sink.send(line.to_string()).await.expect("write failed");
    }

    /// Waits for the client to close its write side.
    pub(crate) async fn expect_closed(&mut self) {
        assert!(self.lines.next().await.is_none(), "client kept the pipe open");
    }

    /// Accepts authentication and registration; returns both request frames.
    pub(crate) async fn accept_handshake(&mut self) -> (Envelope, Envelope) {
        let auth = self.recv().await;
        assert_eq!(auth.message, tags::AUTHENTICATION);
        self.send(&server_response(tags::AUTHENTICATION, json!({"version": 0.3, "rev": 1}))).await;

        let registration = self.recv().await;
        assert_eq!(registration.message, tags::REGISTRATION);
        self.send(&server_response(tags::REGISTRATION, json!({}))).await;
        (auth, registration)
    }
}

fn server_frame(tag: &str, kind: &str, extra: Value) -> Envelope {
    let mut payload = match extra {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    payload.insert("type".into(), Value::String(kind.into()));
    Envelope { message: tag.to_string(), client_time: None, server_time: Some(1_700_000_000), payload }
}

pub(crate) fn server_response(tag: &str, extra: Value) -> Envelope {
    let mut envelope = server_frame(tag, "response", extra);
    envelope.payload.insert("result".into(), Value::String("ok".into()));
    envelope
}

pub(crate) fn server_error_response(tag: &str, reason: &str) -> Envelope {
    let mut envelope = server_frame(tag, "response", json!({}));
    envelope.payload.insert("result".into(), Value::String("error".into()));
    envelope.payload.insert("error".into(), Value::String(reason.into()));
    envelope
}

pub(crate) fn server_request(tag: &str, payload: Value) -> Envelope {
    server_frame(tag, "request", payload)
}

#[derive(Default)]
pub(crate) struct RecordingHandler {
    events: Mutex<Vec<InboundEvent>>,
}

impl RecordingHandler {
    pub(crate) fn events(&self) -> Vec<InboundEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ServerEventHandler for RecordingHandler {
    fn handle_event(&self, event: InboundEvent) -> Result<(), String> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Registers one sensor with id 1 and reports it as normal.
pub(crate) struct OneSensorProvider;

impl RegistrationProvider for OneSensorProvider {
    fn manifest(&self) -> NodeManifest {
        NodeManifest::Sensors(vec![SensorManifest {
            sensor_id: 1,
            description: "front door".into(),
            alert_delay: 0,
            alert_levels: vec![0],
            state: 0,
            data_type: SensorDataType::None,
            sensor_data: SensorData::None,
        }])
    }

    fn sensors_state(&self) -> Option<SensorsState> {
        Some(SensorsState {
            sensors: vec![StateChange {
                sensor_id: 1,
                state: 0,
                data_type: SensorDataType::None,
                sensor_data: SensorData::None,
            }],
        })
    }
}

pub(crate) fn test_settings() -> ConnectionSettings {
    ConnectionSettings {
        username: "sensor_user".into(),
        password: "secret".into(),
        instance: "garage".into(),
        ..ConnectionSettings::default()
    }
}

pub(crate) struct Harness {
    pub(crate) comm: Arc<ServerCommunication>,
    pub(crate) connector: Arc<PipeConnector>,
    pub(crate) handler: Arc<RecordingHandler>,
    servers: tokio::sync::Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
}

impl Harness {
    pub(crate) fn sensor_node() -> Self {
        Self::with_provider(Arc::new(OneSensorProvider), test_settings())
    }

    pub(crate) fn with_provider(provider: Arc<dyn RegistrationProvider>, settings: ConnectionSettings) -> Self {
        let (connector, servers) = PipeConnector::new();
        let handler = Arc::new(RecordingHandler::default());
        let comm = ServerCommunication::new(settings, connector.clone(), provider, handler.clone());
        Self { comm, connector, handler, servers: tokio::sync::Mutex::new(servers) }
    }

    pub(crate) async fn next_server(&self) -> FakeServer {
        let stream = self.servers.lock().await.recv().await.expect("connector dropped");
        FakeServer::new(stream)
    }

    /// Drives a full handshake and returns the connected harness.
    pub(crate) async fn connect(&self) -> FakeServer {
        let comm = self.comm.clone();
        let connecting = tokio::spawn(async move { comm.connect().await });
        let mut server = self.next_server().await;
        server.accept_handshake().await;
        connecting.await.expect("connect task panicked").expect("connect failed");
        server
    }

    pub(crate) async fn connected_sensor_node() -> (Self, FakeServer) {
        let harness = Self::sensor_node();
        let server = harness.connect().await;
        (harness, server)
    }
}
