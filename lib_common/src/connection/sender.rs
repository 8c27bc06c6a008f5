//! # Send Pool
//!
//! Outbound events are delivered by a fixed set of worker tasks draining a
//! bounded queue, so the poll loop never waits on the network and a flapping
//! connection cannot pile up an unbounded number of send tasks. Each delivery
//! is one self-contained unit of work: serialize, send, await the
//! acknowledgment the message kind calls for, log the result.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::server_comm::ServerCommunication;
use crate::protocol::{SensorAlert, StateChange};

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    SensorAlert(SensorAlert),
    StateChange(StateChange),
    /// Full snapshot, read from the node's registration provider at send time.
    SensorsState,
}

impl OutboundEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundEvent::SensorAlert(_) => "sensor alert",
            OutboundEvent::StateChange(_) => "state change",
            OutboundEvent::SensorsState => "full state",
        }
    }
}

/// Anything that accepts outbound events without blocking the caller.
pub trait EventSink: Send + Sync {
    /// Returns `false` when the event was dropped.
    fn dispatch(&self, event: OutboundEvent) -> bool;
}

pub struct SendPool {
    queue: mpsc::Sender<OutboundEvent>,
    workers: Vec<JoinHandle<()>>,
}

impl SendPool {
    /// Spawns `workers` delivery tasks sharing a queue of `capacity` events.
    pub fn spawn(comm: Arc<ServerCommunication>, workers: usize, capacity: usize) -> Self {
        let (queue, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..workers.max(1))
            .map(|worker| {
                let comm = Arc::clone(&comm);
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        // The lock is held only while waiting for the next
                        // event, never during delivery.
                        let next = rx.lock().await.recv().await;
                        let Some(event) = next else { break };
                        deliver(&comm, worker, event).await;
                    }
                    debug!(worker, "Send worker stopped");
                })
            })
            .collect();

        Self { queue, workers }
    }

    /// Events waiting for a worker.
    pub fn backlog(&self) -> usize {
        self.queue.max_capacity() - self.queue.capacity()
    }

    /// Stops the workers. Queued events are discarded.
    pub fn abort(&self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

impl EventSink for SendPool {
    fn dispatch(&self, event: OutboundEvent) -> bool {
        match self.queue.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(kind = event.kind(), "Send queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                warn!(kind = event.kind(), "Send queue closed, dropping event");
                false
            }
        }
    }
}

/// Delivers one event. Failures are logged and discarded; the next poll cycle
/// and the periodic full-state push restore the server's view.
async fn deliver(comm: &ServerCommunication, worker: usize, event: OutboundEvent) {
    let result = match &event {
        OutboundEvent::SensorAlert(alert) => comm.send_sensor_alert(alert).await,
        OutboundEvent::StateChange(change) => comm.send_state_change(change).await,
        OutboundEvent::SensorsState => comm.send_sensors_state().await,
    };
    if let Err(e) = result {
        warn!(worker, kind = event.kind(), "Sending to server failed: {}", e);
    }
}
