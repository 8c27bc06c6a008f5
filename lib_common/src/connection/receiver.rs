//! # Receiver
//!
//! One read loop per session. Each frame is decoded and handed to the engine,
//! which either completes a pending request or dispatches a server request to
//! the node's [`ServerEventHandler`]. Undecodable frames are dropped and
//! counted; a run of them ends the session.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::server_comm::ServerCommunication;
use crate::protocol::{decode_frame, InboundEvent, ProtocolError};

/// # Server Event Handler
///
/// Receives decoded server requests. Returning `Err(reason)` makes the client
/// answer the request with an error response carrying `reason`.
pub trait ServerEventHandler: Send + Sync {
    fn handle_event(&self, event: InboundEvent) -> Result<(), String>;
}

/// Handler for sensor nodes: acknowledges every server request.
#[derive(Debug, Default, Clone, Copy)]
pub struct AckOnlyHandler;

impl ServerEventHandler for AckOnlyHandler {
    fn handle_event(&self, event: InboundEvent) -> Result<(), String> {
        debug!(tag = event.tag(), "Acknowledging server request");
        Ok(())
    }
}

pub(crate) struct Receiver<R> {
    link: Arc<ServerCommunication>,
    session_id: u64,
    frames: FramedRead<R, LinesCodec>,
    cancel: CancellationToken,
    max_malformed: u32,
    malformed: u32,
}

impl<R> Receiver<R>
where
    R: AsyncRead + Unpin,
{
    pub(crate) fn new(
        link: Arc<ServerCommunication>,
        session_id: u64,
        frames: FramedRead<R, LinesCodec>,
        cancel: CancellationToken,
        max_malformed: u32,
    ) -> Self {
        Self { link, session_id, frames, cancel, max_malformed: max_malformed.max(1), malformed: 0 }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return,
                next = self.frames.next() => next,
            };

            match next {
                Some(Ok(line)) => {
                    if !self.on_line(&line) {
                        return;
                    }
                }
                Some(Err(e)) => {
                    let e = ProtocolError::from(e);
                    warn!(session = self.session_id, "Reading from server failed: {}", e);
                    self.link.close_session(self.session_id, "read failed");
                    return;
                }
                None => {
                    info!(session = self.session_id, "Server closed the connection");
                    self.link.close_session(self.session_id, "closed by server");
                    return;
                }
            }
        }
    }

    /// Returns `false` once the session has been dropped.
    fn on_line(&mut self, line: &str) -> bool {
        if line.trim().is_empty() {
            return true;
        }

        match decode_frame(line).and_then(|envelope| self.link.handle_inbound(self.session_id, envelope)) {
            Ok(()) => {
                self.malformed = 0;
                true
            }
            Err(e) => {
                self.malformed += 1;
                warn!(
                    session = self.session_id,
                    malformed = self.malformed,
                    limit = self.max_malformed,
                    "Dropping frame: {}",
                    e
                );
                if self.malformed >= self.max_malformed {
                    self.link.close_session(self.session_id, "repeated protocol violations");
                    return false;
                }
                true
            }
        }
    }
}
