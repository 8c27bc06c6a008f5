//! # Local Admin Relay
//!
//! A Unix-domain socket through which local tools (a web UI, a keypad
//! daemon) ask the manager to change the alert system's activation. Every
//! connection carries exactly one request and one reply:
//!
//! ```json
//! {"message": "option", "payload": {"optionType": "alertSystemActive", "value": 1.0, "timeDelay": 0}}
//! ```
//!
//! The request is forwarded to the server and the reply is either
//! `{"serverTime", "message": "option", "payload": {"type": "response", "result": "ok"}}`
//! or `{"serverTime", "message", "error"}` with a reason.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionError, ServerCommunication};
use crate::protocol::{tags, unix_now};

/// Largest request accepted on the socket.
pub const REQUEST_LIMIT: usize = 1024;

/// The only option local clients may change.
pub const ALERT_SYSTEM_ACTIVE: &str = "alertSystemActive";

/// Forwards option changes to the server.
pub trait OptionRelay: Send + Sync {
    fn relay_option<'a>(
        &'a self,
        option_type: &'a str,
        value: f64,
        time_delay: u32,
    ) -> BoxFuture<'a, Result<(), ConnectionError>>;
}

impl OptionRelay for ServerCommunication {
    fn relay_option<'a>(
        &'a self,
        option_type: &'a str,
        value: f64,
        time_delay: u32,
    ) -> BoxFuture<'a, Result<(), ConnectionError>> {
        Box::pin(self.send_option(option_type, value, time_delay))
    }
}

fn error_reply(message: Option<&Value>, reason: &str) -> Value {
    let mut reply = Map::new();
    reply.insert("serverTime".into(), json!(unix_now()));
    if let Some(message) = message {
        reply.insert("message".into(), message.clone());
    }
    reply.insert("error".into(), json!(reason));
    Value::Object(reply)
}

fn number_field(payload: &Value, key: &str) -> Option<f64> {
    match payload.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Option type, value and delay from an option request payload. The delay
/// must be a whole number of seconds.
fn option_fields(request: &Value) -> Option<(String, f64, u32)> {
    let payload = request.get("payload")?;
    let option_type = payload.get("optionType")?.as_str()?.to_string();
    let value = number_field(payload, "value")?;
    let delay = number_field(payload, "timeDelay")?;
    if !(0.0..=f64::from(u32::MAX)).contains(&delay) || delay.fract() != 0.0 {
        return None;
    }
    Some((option_type, value, delay as u32))
}

/// # Handle Request
///
/// Validates one raw request, relays it and builds the reply.
pub async fn handle_request(relay: &dyn OptionRelay, raw: &[u8]) -> Value {
    let request: Value = match serde_json::from_slice(raw.trim_ascii()) {
        Ok(value) => value,
        Err(e) => {
            warn!("Local request is not JSON: {}", e);
            return error_reply(None, "received json message invalid");
        }
    };
    let Some(message) = request.get("message") else {
        warn!("Local request has no message tag");
        return error_reply(None, "received json message invalid");
    };
    if message.as_str() != Some(tags::OPTION) {
        return error_reply(Some(message), "only option message valid");
    }

    let Some((option_type, value, time_delay)) = option_fields(&request) else {
        warn!("Local option request has invalid attributes");
        return error_reply(Some(message), "received attributes invalid");
    };
    if option_type != ALERT_SYSTEM_ACTIVE {
        return error_reply(Some(message), "only option type 'alertSystemActive' allowed");
    }

    match relay.relay_option(&option_type, value, time_delay).await {
        Ok(()) => json!({
            "serverTime": unix_now(),
            "message": message,
            "payload": {"type": "response", "result": "ok"},
        }),
        Err(e) => {
            error!(option_type = %option_type, "Sending option to server failed: {}", e);
            error_reply(Some(message), &format!("sending message to server failed: {e}"))
        }
    }
}

/// # Local Server
///
/// Listens on the admin socket until cancelled, serving each connection on
/// its own task. The socket file is removed on exit.
pub struct LocalServer {
    path: PathBuf,
    listener: UnixListener,
    relay: Arc<dyn OptionRelay>,
}

impl LocalServer {
    /// Binds the socket, replacing a stale socket file left by a previous run.
    pub fn bind(path: impl Into<PathBuf>, relay: Arc<dyn OptionRelay>) -> io::Result<Self> {
        let path = path.into();
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "Removed stale admin socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(&path)?;
        info!(path = %path.display(), "Admin socket listening");
        Ok(Self { path, listener, relay })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn run(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let relay = Arc::clone(&self.relay);
                        tokio::spawn(async move {
                            if let Err(e) = serve(stream, relay).await {
                                warn!("Admin connection failed: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("Accepting admin connection failed: {}", e),
                },
            }
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), "Could not remove admin socket: {}", e);
        }
        info!("Admin socket closed");
    }
}

async fn serve(mut stream: UnixStream, relay: Arc<dyn OptionRelay>) -> io::Result<()> {
    debug!("Admin client connected");
    let mut buf = vec![0u8; REQUEST_LIMIT];
    let read = stream.read(&mut buf).await?;
    let reply = handle_request(relay.as_ref(), &buf[..read]).await;
    stream.write_all(&serde_json::to_vec(&reply)?).await?;
    stream.shutdown().await
}
