//! # Server Communication
//!
//! The connection engine. It owns the one session with the alarm server and
//! runs the protocol state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Authenticating -> Registering -> Connected
//!       ^                                                          |
//!       +----------- transport error / protocol violation ---------+
//! ```
//!
//! ## Session layout
//! - **Writer task**: the only code touching the write half. Frames are queued
//!   on an mpsc channel and written whole, in submission order.
//! - **Receiver task**: reads frames, completes pending requests, answers
//!   server requests (see [`super::receiver`]).
//! - **Keepalive task**: pings on a fixed interval; an unanswered ping drops
//!   the session.
//!
//! Other components never see the transport. They call the `send_*`
//! operations, which queue a request frame and await its correlated response.
//! The [`ConnectionWatchdog`](super::watchdog::ConnectionWatchdog) rebuilds
//! dropped sessions.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::SinkExt;
use serde::Serialize;
use tokio::io::{split, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::error::ConnectionError;
use super::receiver::{Receiver, ServerEventHandler};
use super::transport::Connector;
use crate::configs::{ConnectionSettings, EngineTimings};
use crate::protocol::{
    encode_frame, frame_codec, tags, AuthenticationRequest, Envelope, InboundEvent, NodeManifest, OptionRequest,
    PayloadKind, ProtocolError, RegistrationRequest, SensorAlert, SensorsState, ServerVersion, StateChange,
};

/// How long a graceful shutdown waits for the writer to flush queued frames.
const SHUTDOWN_FLUSH_LIMIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Registering,
    Connected,
}

/// # Registration Provider
///
/// Supplies what the node registers with and, for sensor nodes, the current
/// full-state snapshot.
pub trait RegistrationProvider: Send + Sync {
    fn manifest(&self) -> NodeManifest;

    /// Current state of every sensor; `None` for nodes without sensors.
    fn sensors_state(&self) -> Option<SensorsState> {
        None
    }
}

struct Session {
    id: u64,
    outbound: mpsc::UnboundedSender<String>,
    /// Stops the receiver and keepalive tasks.
    reader_cancel: CancellationToken,
    /// Stops the writer, possibly mid-frame. Only used when the transport is
    /// already considered dead.
    writer_cancel: CancellationToken,
    writer: JoinHandle<()>,
}

type PendingRequests = HashMap<String, VecDeque<oneshot::Sender<Envelope>>>;

pub struct ServerCommunication {
    settings: ConnectionSettings,
    hostname: String,
    connector: Arc<dyn Connector>,
    provider: Arc<dyn RegistrationProvider>,
    handler: Arc<dyn ServerEventHandler>,
    state: watch::Sender<ConnectionState>,
    connect_lock: tokio::sync::Mutex<()>,
    session: Mutex<Option<Session>>,
    pending: Mutex<PendingRequests>,
    next_session_id: AtomicU64,
    epoch: AtomicU64,
    correlation_failures: AtomicU32,
    last_activity: Mutex<Option<Instant>>,
    server_version: Mutex<Option<ServerVersion>>,
    shut_down: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ServerCommunication {
    pub fn new(
        settings: ConnectionSettings,
        connector: Arc<dyn Connector>,
        provider: Arc<dyn RegistrationProvider>,
        handler: Arc<dyn ServerEventHandler>,
    ) -> Arc<Self> {
        let hostname = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Arc::new(Self {
            settings,
            hostname,
            connector,
            provider,
            handler,
            state,
            connect_lock: tokio::sync::Mutex::new(()),
            session: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            correlation_failures: AtomicU32::new(0),
            last_activity: Mutex::new(None),
            server_version: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn timings(&self) -> &EngineTimings {
        &self.settings.timings
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Resolves once the engine reaches `Connected`.
    pub async fn wait_connected(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnectionState::Connected).await;
    }

    /// Number of sessions that completed registration. Changes on every
    /// successful (re)connect.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Version the server reported during the last authentication.
    pub fn server_version(&self) -> Option<ServerVersion> {
        *lock(&self.server_version)
    }

    /// Time since the last inbound frame of the current session.
    pub fn idle_for(&self) -> Duration {
        lock(&self.last_activity).map(|at| at.elapsed()).unwrap_or_default()
    }

    pub fn describe_target(&self) -> String {
        self.connector.describe()
    }

    /// # Connect
    ///
    /// Opens the transport, authenticates, registers and starts the keepalive.
    /// Concurrent callers are serialized; a caller arriving while connected
    /// returns immediately. On failure the engine is left `Disconnected`.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let _guard = self.connect_lock.lock().await;
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ConnectionError::ShutDown);
        }
        if self.is_connected() {
            return Ok(());
        }

        self.close_current("starting a new session");
        self.state.send_replace(ConnectionState::Connecting);
        info!(target_addr = %self.connector.describe(), "Connecting to server");

        match self.establish().await {
            Ok(session_id) => {
                let epoch = self.epoch();
                info!(session = session_id, epoch, "Connected and registered with server");
                Ok(())
            }
            Err(e) => {
                self.close_current("connection attempt failed");
                Err(e)
            }
        }
    }

    async fn establish(self: &Arc<Self>) -> Result<u64, ConnectionError> {
        let timings = &self.settings.timings;

        // --- Phase 1: transport and session tasks ---
        let stream = self.connector.connect().await?;
        let (read_half, write_half) = split(stream);
        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst) + 1;

        let reader_cancel = CancellationToken::new();
        let writer_cancel = CancellationToken::new();
        let (outbound, queue) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(
            Arc::clone(self),
            session_id,
            FramedWrite::new(write_half, frame_codec()),
            queue,
            writer_cancel.clone(),
        ));

        *lock(&self.session) =
            Some(Session { id: session_id, outbound, reader_cancel: reader_cancel.clone(), writer_cancel, writer });
        self.touch();
        self.correlation_failures.store(0, Ordering::SeqCst);

        let receiver = Receiver::new(
            Arc::clone(self),
            session_id,
            FramedRead::new(read_half, frame_codec()),
            reader_cancel.clone(),
            timings.max_malformed_frames,
        );
        tokio::spawn(receiver.run());

        // --- Phase 2: authentication ---
        self.advance(session_id, ConnectionState::Authenticating)?;
        let auth = AuthenticationRequest {
            version: crate::protocol::PROTOCOL_VERSION,
            rev: crate::protocol::PROTOCOL_REV,
            username: self.settings.username.clone(),
            password: self.settings.password.clone(),
            client_type: self.provider.manifest().client_type(),
        };
        let response = self
            .request(tags::AUTHENTICATION, &auth, timings.response_timeout(), false)
            .await
            .map_err(|e| match e {
                ConnectionError::Rejected { reason, .. } => ConnectionError::AuthenticationRejected(reason),
                other => other,
            })?;
        match response.payload_as::<ServerVersion>() {
            Ok(version) => *lock(&self.server_version) = Some(version),
            Err(e) => warn!("Server did not report its version: {}", e),
        }

        // --- Phase 3: registration ---
        self.advance(session_id, ConnectionState::Registering)?;
        let registration = RegistrationRequest::new(
            self.hostname.clone(),
            self.settings.instance.clone(),
            self.settings.persistent,
            self.provider.manifest(),
        );
        self.request(tags::REGISTRATION, &registration, timings.response_timeout(), false)
            .await
            .map_err(|e| match e {
                ConnectionError::Rejected { reason, .. } => ConnectionError::RegistrationRejected(reason),
                other => other,
            })?;

        // --- Phase 4: go live ---
        self.advance(session_id, ConnectionState::Connected)?;
        tokio::spawn(Arc::clone(self).keepalive_loop(session_id, reader_cancel));
        Ok(session_id)
    }

    /// Moves the state machine forward, provided `session_id` is still the
    /// live session. Reaching `Connected` starts a new epoch.
    fn advance(&self, session_id: u64, next: ConnectionState) -> Result<(), ConnectionError> {
        let slot = lock(&self.session);
        match slot.as_ref() {
            Some(session) if session.id == session_id => {
                if next == ConnectionState::Connected {
                    self.epoch.fetch_add(1, Ordering::SeqCst);
                }
                self.state.send_replace(next);
                debug!(session = session_id, state = ?next, "Connection state advanced");
                Ok(())
            }
            _ => Err(ConnectionError::SessionClosed(format!("{next:?}").to_lowercase())),
        }
    }

    // --- Outbound operations ---

    /// # Send Option
    ///
    /// Asks the server to change an option (e.g. arm or disarm the alert
    /// system) and waits for its answer.
    pub async fn send_option(&self, option_type: &str, value: f64, time_delay: u32) -> Result<(), ConnectionError> {
        let option = OptionRequest { option_type: option_type.to_string(), value, time_delay };
        self.request(tags::OPTION, &option, self.settings.timings.response_timeout(), true).await?;
        info!(option_type, value, time_delay, "Option change acknowledged by server");
        Ok(())
    }

    /// # Send Sensor Alert
    ///
    /// Alerts are acknowledged and re-sent after an unanswered attempt, up to
    /// the configured number of attempts. Refusals and lost sessions are not
    /// retried.
    pub async fn send_sensor_alert(&self, alert: &SensorAlert) -> Result<(), ConnectionError> {
        let attempts = self.settings.timings.alert_retry_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.request(tags::SENSOR_ALERT, alert, self.settings.timings.response_timeout(), true).await {
                Ok(_) => {
                    debug!(sensor_id = alert.sensor_id, state = alert.state, attempt, "Sensor alert acknowledged");
                    return Ok(());
                }
                Err(ConnectionError::ResponseTimeout { .. }) if attempt < attempts => {
                    warn!(sensor_id = alert.sensor_id, attempt, attempts, "Sensor alert not acknowledged, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Best effort: one attempt, no retry.
    pub async fn send_state_change(&self, change: &StateChange) -> Result<(), ConnectionError> {
        self.request(tags::STATE_CHANGE, change, self.settings.timings.response_timeout(), true).await?;
        trace!(sensor_id = change.sensor_id, state = change.state, "State change acknowledged");
        Ok(())
    }

    /// Best effort: pushes the provider's full snapshot once. Nodes without
    /// sensors have nothing to send.
    pub async fn send_sensors_state(&self) -> Result<(), ConnectionError> {
        let Some(snapshot) = self.provider.sensors_state() else {
            return Ok(());
        };
        let count = snapshot.sensors.len();
        self.request(tags::SENSORS_STATE, &snapshot, self.settings.timings.response_timeout(), true).await?;
        debug!(sensors = count, "Full sensor state acknowledged");
        Ok(())
    }

    // --- Request correlation ---

    async fn request<P: Serialize>(
        &self,
        tag: &str,
        payload: &P,
        wait: Duration,
        require_connected: bool,
    ) -> Result<Envelope, ConnectionError> {
        let frame = encode_frame(&Envelope::request(tag, payload)?)?;
        let reply = self.enqueue_request(tag, frame, require_connected)?;

        match timeout(wait, reply).await {
            Ok(Ok(response)) => {
                self.correlation_failures.store(0, Ordering::SeqCst);
                response
                    .result()
                    .map_err(|reason| ConnectionError::Rejected { tag: tag.to_string(), reason })?;
                Ok(response)
            }
            Ok(Err(_)) => Err(ConnectionError::SessionClosed(tag.to_string())),
            Err(_) => {
                self.forget_abandoned(tag);
                self.record_correlation_failure(tag);
                Err(ConnectionError::ResponseTimeout { tag: tag.to_string(), timeout: wait })
            }
        }
    }

    /// Registers the response waiter and queues the frame while holding the
    /// session lock, so a session teardown either sees both or neither.
    fn enqueue_request(
        &self,
        tag: &str,
        frame: String,
        require_connected: bool,
    ) -> Result<oneshot::Receiver<Envelope>, ConnectionError> {
        let slot = lock(&self.session);
        let session = slot.as_ref().ok_or(ConnectionError::NotConnected)?;
        if require_connected && !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }

        let (tx, rx) = oneshot::channel();
        let mut pending = lock(&self.pending);
        pending.entry(tag.to_string()).or_default().push_back(tx);
        if session.outbound.send(frame).is_err() {
            if let Some(waiters) = pending.get_mut(tag) {
                waiters.pop_back();
            }
            return Err(ConnectionError::NotConnected);
        }
        Ok(rx)
    }

    /// Drops the waiters of requests that stopped listening, so the next
    /// response for `tag` reaches a live request.
    fn forget_abandoned(&self, tag: &str) {
        let mut pending = lock(&self.pending);
        if let Some(waiters) = pending.get_mut(tag) {
            waiters.retain(|waiter| !waiter.is_closed());
            if waiters.is_empty() {
                pending.remove(tag);
            }
        }
    }

    fn record_correlation_failure(&self, tag: &str) {
        let failures = self.correlation_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let limit = self.settings.timings.max_correlation_failures.max(1);
        warn!(tag, failures, limit, "Request went unanswered");
        if failures >= limit {
            self.correlation_failures.store(0, Ordering::SeqCst);
            self.close_current("too many unanswered requests");
        }
    }

    // --- Inbound handling (called by the receiver) ---

    pub(crate) fn handle_inbound(&self, session_id: u64, envelope: Envelope) -> Result<(), ProtocolError> {
        self.touch();
        match envelope.kind()? {
            PayloadKind::Response => self.complete_request(envelope),
            PayloadKind::Request => self.answer_server_request(session_id, envelope),
        }
    }

    fn complete_request(&self, envelope: Envelope) -> Result<(), ProtocolError> {
        let tag = envelope.message.clone();
        let waiter = {
            let mut pending = lock(&self.pending);
            let waiters = pending.get_mut(&tag);
            waiters.and_then(|waiters| {
                while let Some(waiter) = waiters.pop_front() {
                    if !waiter.is_closed() {
                        return Some(waiter);
                    }
                }
                None
            })
        };
        match waiter {
            Some(waiter) => {
                if waiter.send(envelope).is_err() {
                    debug!(tag = %tag, "Response raced a request that just timed out");
                }
                Ok(())
            }
            None => Err(ProtocolError::UnsolicitedResponse(tag)),
        }
    }

    fn answer_server_request(&self, session_id: u64, envelope: Envelope) -> Result<(), ProtocolError> {
        let tag = envelope.message.clone();
        if tag == tags::KEEPALIVE {
            self.send_frame(session_id, &Envelope::response_ok(&tag));
            return Ok(());
        }

        let event = match InboundEvent::from_envelope(&envelope) {
            Ok(event) => event,
            Err(e) => {
                self.send_frame(session_id, &Envelope::response_error(&tag, &e.to_string()));
                return Err(e);
            }
        };

        let reply = match self.handler.handle_event(event) {
            Ok(()) => Envelope::response_ok(&tag),
            Err(reason) => {
                warn!(tag = %tag, "Server request refused by handler: {}", reason);
                Envelope::response_error(&tag, &reason)
            }
        };
        self.send_frame(session_id, &reply);
        Ok(())
    }

    /// Queues a frame that expects no answer (responses to server requests).
    fn send_frame(&self, session_id: u64, envelope: &Envelope) {
        let frame = match encode_frame(envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(tag = %envelope.message, "Dropping unencodable frame: {}", e);
                return;
            }
        };
        let slot = lock(&self.session);
        match slot.as_ref() {
            Some(session) if session.id == session_id => {
                if session.outbound.send(frame).is_err() {
                    debug!(session = session_id, "Writer gone, response dropped");
                }
            }
            _ => debug!(session = session_id, "Session replaced, response dropped"),
        }
    }

    fn touch(&self) {
        *lock(&self.last_activity) = Some(Instant::now());
    }

    // --- Teardown ---

    /// Drops the live session, whatever it is. Pending requests fail with
    /// [`ConnectionError::SessionClosed`].
    pub fn disconnect(&self, reason: &str) {
        self.close_current(reason);
    }

    fn close_current(&self, reason: &str) {
        let session = {
            let mut slot = lock(&self.session);
            self.state.send_replace(ConnectionState::Disconnected);
            slot.take()
        };
        if let Some(session) = session {
            self.teardown(session, reason);
        }
    }

    /// Drops the session only if `session_id` is still the live one, so a late
    /// failure of an old session cannot kill its replacement.
    pub(crate) fn close_session(&self, session_id: u64, reason: &str) {
        let session = {
            let mut slot = lock(&self.session);
            match slot.as_ref() {
                Some(session) if session.id == session_id => {
                    self.state.send_replace(ConnectionState::Disconnected);
                    slot.take()
                }
                _ => None,
            }
        };
        if let Some(session) = session {
            self.teardown(session, reason);
        }
    }

    fn teardown(&self, session: Session, reason: &str) {
        warn!(session = session.id, reason, "Server session closed");
        session.reader_cancel.cancel();
        session.writer_cancel.cancel();
        drop(session.outbound);
        lock(&self.pending).clear();
    }

    /// # Shutdown
    ///
    /// Stops the engine for good. The receiver and keepalive stop at once; the
    /// writer finishes the frames already queued (bounded in time) and closes
    /// the transport, so no frame is left half-written.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let _guard = self.connect_lock.lock().await;

        let session = {
            let mut slot = lock(&self.session);
            self.state.send_replace(ConnectionState::Disconnected);
            slot.take()
        };
        let Some(Session { id, outbound, reader_cancel, writer_cancel, writer }) = session else {
            return;
        };

        reader_cancel.cancel();
        drop(outbound);
        lock(&self.pending).clear();

        match timeout(SHUTDOWN_FLUSH_LIMIT, writer).await {
            Ok(_) => info!(session = id, "Outbound queue flushed, server session closed"),
            Err(_) => {
                writer_cancel.cancel();
                warn!(session = id, "Writer did not drain in time, abandoning queued frames");
            }
        }
    }

    // --- Keepalive ---

    async fn keepalive_loop(self: Arc<Self>, session_id: u64, cancel: CancellationToken) {
        let every = self.settings.timings.keepalive_interval();
        let wait = self.settings.timings.keepalive_timeout();
        let mut ticker = interval_at(Instant::now() + every, every);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            match self.request(tags::KEEPALIVE, &(), wait, false).await {
                Ok(_) => trace!(session = session_id, "Keepalive acknowledged"),
                Err(ConnectionError::ResponseTimeout { .. }) => {
                    warn!(session = session_id, "Keepalive unanswered within {:?}", wait);
                    self.close_session(session_id, "keepalive timeout");
                    return;
                }
                Err(e) => {
                    debug!(session = session_id, "Keepalive stopped: {}", e);
                    self.close_session(session_id, "keepalive failed");
                    return;
                }
            }
        }
    }
}

/// Drains the outbound queue into the transport, one whole frame at a time.
async fn write_loop<W>(
    link: Arc<ServerCommunication>,
    session_id: u64,
    mut sink: FramedWrite<W, LinesCodec>,
    mut queue: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            frame = queue.recv() => frame,
        };
        let Some(frame) = frame else { break };

        let written = tokio::select! {
            _ = cancel.cancelled() => return,
            written = sink.send(frame) => written,
        };
        if let Err(e) = written {
            warn!(session = session_id, "Write to server failed: {}", e);
            link.close_session(session_id, "write failed");
            return;
        }
    }

    if let Err(e) = SinkExt::<String>::close(&mut sink).await {
        debug!(session = session_id, "Closing the transport failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::*;
    use crate::protocol::{SensorData, SensorDataType};
    use serde_json::json;

    fn alert() -> SensorAlert {
        SensorAlert {
            sensor_id: 3,
            state: 1,
            data_type: SensorDataType::None,
            sensor_data: SensorData::None,
            has_optional_data: false,
            optional_data: None,
            change_state: true,
            has_latest_data: false,
        }
    }

    fn change(sensor_id: u32, state: u8) -> StateChange {
        StateChange { sensor_id, state, data_type: SensorDataType::None, sensor_data: SensorData::None }
    }

    #[tokio::test]
    async fn test_connect_handshake() {
        let harness = Harness::sensor_node();
        let comm = harness.comm.clone();
        let connecting = tokio::spawn(async move { comm.connect().await });

        let mut server = harness.next_server().await;
        let (auth, registration) = server.accept_handshake().await;
        connecting.await.unwrap().unwrap();

        assert_eq!(auth.payload["username"], "sensor_user");
        assert_eq!(auth.payload["clientType"], "sensor");
        assert_eq!(registration.payload["nodeType"], "sensor");
        assert_eq!(registration.payload["instance"], "garage");
        assert_eq!(registration.payload["sensors"][0]["sensorId"], 1);

        assert!(harness.comm.is_connected());
        assert_eq!(harness.comm.epoch(), 1);
        assert_eq!(harness.comm.server_version(), Some(ServerVersion { version: 0.3, rev: 1 }));
    }

    #[tokio::test]
    async fn test_authentication_rejected() {
        let harness = Harness::sensor_node();
        let comm = harness.comm.clone();
        let connecting = tokio::spawn(async move { comm.connect().await });

        let mut server = harness.next_server().await;
        let auth = server.recv().await;
        assert_eq!(auth.message, "authentication");
        server.send(&server_error_response("authentication", "wrong password")).await;

        let err = connecting.await.unwrap().unwrap_err();
        assert!(matches!(err, ConnectionError::AuthenticationRejected(reason) if reason == "wrong password"));
        assert_eq!(harness.comm.state(), ConnectionState::Disconnected);
        assert_eq!(harness.comm.epoch(), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_leaves_disconnected() {
        let harness = Harness::sensor_node();
        harness.connector.set_failing(true);
        let err = harness.comm.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Transport(_)));
        assert_eq!(harness.comm.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_sends_require_connection() {
        let harness = Harness::sensor_node();
        assert!(matches!(
            harness.comm.send_option("alertSystemActive", 1.0, 0).await,
            Err(ConnectionError::NotConnected)
        ));
        assert!(matches!(harness.comm.send_state_change(&change(1, 1)).await, Err(ConnectionError::NotConnected)));
    }

    #[tokio::test]
    async fn test_responses_correlate_in_fifo_order() {
        let (harness, mut server) = Harness::connected_sensor_node().await;

        let comm = harness.comm.clone();
        let first = tokio::spawn(async move { comm.send_state_change(&change(1, 1)).await });
        let first_frame = server.recv().await;
        let comm = harness.comm.clone();
        let second = tokio::spawn(async move { comm.send_state_change(&change(2, 0)).await });
        let second_frame = server.recv().await;

        assert_eq!(first_frame.payload["sensorId"], 1);
        assert_eq!(second_frame.payload["sensorId"], 2);

        server.send(&server_error_response("statechange", "unknown sensor")).await;
        server.send(&server_response("statechange", json!({}))).await;

        assert!(matches!(first.await.unwrap(), Err(ConnectionError::Rejected { reason, .. }) if reason == "unknown sensor"));
        assert!(second.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_option_round_trip() {
        let (harness, mut server) = Harness::connected_sensor_node().await;
        let comm = harness.comm.clone();
        let sending = tokio::spawn(async move { comm.send_option("alertSystemActive", 1.0, 30).await });

        let frame = server.recv().await;
        assert_eq!(frame.message, "option");
        assert_eq!(frame.payload["optionType"], "alertSystemActive");
        assert_eq!(frame.payload["timeDelay"], 30);
        server.send(&server_response("option", json!({}))).await;
        assert!(sending.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_alert_is_retried_after_timeout() {
        let (harness, mut server) = Harness::connected_sensor_node().await;
        let comm = harness.comm.clone();
        let sending = tokio::spawn(async move { comm.send_sensor_alert(&alert()).await });

        // The first attempt goes unanswered; only the retry is acknowledged.
        let first = server.recv().await;
        assert_eq!(first.message, "sensoralert");
        let retry = server.recv().await;
        assert_eq!(retry.payload["sensorId"], 3);
        server.send(&server_response("sensoralert", json!({}))).await;

        assert!(sending.await.unwrap().is_ok());
        assert!(harness.comm.is_connected());

        // Exactly two copies went out: the next frame is the following alert.
        let comm = harness.comm.clone();
        let next = tokio::spawn(async move { comm.send_sensor_alert(&alert()).await });
        assert_eq!(server.recv().await.message, "sensoralert");
        server.send(&server_response("sensoralert", json!({}))).await;
        assert!(next.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_change_after_unanswered_one_succeeds() {
        let (harness, mut server) = Harness::connected_sensor_node().await;

        let comm = harness.comm.clone();
        let lost = tokio::spawn(async move { comm.send_state_change(&change(1, 1)).await });
        assert_eq!(server.recv().await.payload["sensorId"], 1);
        assert!(matches!(lost.await.unwrap(), Err(ConnectionError::ResponseTimeout { .. })));

        let comm = harness.comm.clone();
        let answered = tokio::spawn(async move { comm.send_state_change(&change(2, 0)).await });
        assert_eq!(server.recv().await.payload["sensorId"], 2);
        server.send(&server_response("statechange", json!({}))).await;

        assert!(answered.await.unwrap().is_ok());
        assert!(harness.comm.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_alert_gives_up_after_attempts() {
        let (harness, mut server) = Harness::connected_sensor_node().await;
        let comm = harness.comm.clone();
        let sending = tokio::spawn(async move { comm.send_sensor_alert(&alert()).await });

        for _ in 0..3 {
            assert_eq!(server.recv().await.message, "sensoralert");
        }
        let result = sending.await.unwrap();
        assert!(result.is_err());
        // Three unanswered requests in a row also count as a dead session.
        assert!(!harness.comm.is_connected());
    }

    #[tokio::test]
    async fn test_server_request_is_dispatched_and_acknowledged() {
        let (harness, mut server) = Harness::connected_sensor_node().await;
        server.send(&server_request("option", json!({"optionType": "alertSystemActive", "value": 0.0}))).await;

        let reply = server.recv().await;
        assert_eq!(reply.message, "option");
        assert_eq!(reply.kind().unwrap(), PayloadKind::Response);
        assert!(reply.result().is_ok());
        assert_eq!(harness.handler.events().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_server_request_gets_error_response() {
        let (_harness, mut server) = Harness::connected_sensor_node().await;
        server.send(&server_request("reboot", json!({}))).await;

        let reply = server.recv().await;
        assert_eq!(reply.message, "reboot");
        assert!(reply.result().unwrap_err().contains("reboot"));
    }

    #[tokio::test]
    async fn test_repeated_malformed_frames_drop_session() {
        let (harness, mut server) = Harness::connected_sensor_node().await;
        let mut state = harness.comm.subscribe_state();

        server.send_raw("this is not json").await;
        server.send_raw("{\"message\": 12}").await;
        server.send_raw("[]").await;

        state.wait_for(|s| *s == ConnectionState::Disconnected).await.unwrap();
        assert!(!harness.comm.is_connected());
    }

    #[tokio::test]
    async fn test_valid_frame_resets_malformed_count() {
        let (harness, mut server) = Harness::connected_sensor_node().await;

        server.send_raw("garbage").await;
        server.send_raw("garbage").await;
        server.send(&server_request("option", json!({"optionType": "x", "value": 1.0}))).await;
        assert_eq!(server.recv().await.message, "option");
        server.send_raw("garbage").await;
        server.send_raw("garbage").await;
        server.send(&server_request("option", json!({"optionType": "x", "value": 0.0}))).await;
        assert_eq!(server.recv().await.message, "option");

        assert!(harness.comm.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_keepalive_drops_session() {
        let (harness, mut server) = Harness::connected_sensor_node().await;
        let mut state = harness.comm.subscribe_state();

        let ping = server.recv().await;
        assert_eq!(ping.message, "keepalive");
        state.wait_for(|s| *s == ConnectionState::Disconnected).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_keepalive_keeps_session() {
        let (harness, mut server) = Harness::connected_sensor_node().await;
        for _ in 0..3 {
            let ping = server.recv().await;
            assert_eq!(ping.message, "keepalive");
            server.send(&server_response("keepalive", json!({}))).await;
        }
        assert!(harness.comm.is_connected());
    }

    #[tokio::test]
    async fn test_server_hangup_fails_pending_request() {
        let (harness, mut server) = Harness::connected_sensor_node().await;
        let comm = harness.comm.clone();
        let sending = tokio::spawn(async move { comm.send_state_change(&change(1, 1)).await });
        assert_eq!(server.recv().await.message, "statechange");
        drop(server);

        let result = sending.await.unwrap();
        assert!(matches!(result, Err(ConnectionError::SessionClosed(_))));
        assert!(!harness.comm.is_connected());
    }

    #[tokio::test]
    async fn test_reconnect_starts_new_epoch() {
        let (harness, server) = Harness::connected_sensor_node().await;
        harness.comm.disconnect("test");
        drop(server);

        let comm = harness.comm.clone();
        let connecting = tokio::spawn(async move { comm.connect().await });
        let mut server = harness.next_server().await;
        server.accept_handshake().await;
        connecting.await.unwrap().unwrap();
        assert_eq!(harness.comm.epoch(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_reconnect() {
        let (harness, _server) = Harness::connected_sensor_node().await;
        harness.comm.shutdown().await;
        assert!(!harness.comm.is_connected());
        assert!(matches!(harness.comm.connect().await, Err(ConnectionError::ShutDown)));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_closes_transport() {
        let (harness, mut server) = Harness::connected_sensor_node().await;
        let comm = harness.comm.clone();
        let pending = tokio::spawn(async move { comm.send_state_change(&change(4, 1)).await });
        assert_eq!(server.recv().await.payload["sensorId"], 4);

        harness.comm.shutdown().await;
        server.expect_closed().await;
        assert!(matches!(pending.await.unwrap(), Err(ConnectionError::SessionClosed(_))));
    }

    #[tokio::test]
    async fn test_sensors_state_uses_provider_snapshot() {
        let (harness, mut server) = Harness::connected_sensor_node().await;
        let comm = harness.comm.clone();
        let sending = tokio::spawn(async move { comm.send_sensors_state().await });

        let frame = server.recv().await;
        assert_eq!(frame.message, "sensorsstate");
        assert_eq!(frame.payload["sensors"][0]["sensorId"], 1);
        server.send(&server_response("sensorsstate", json!({}))).await;
        assert!(sending.await.unwrap().is_ok());
    }
}
