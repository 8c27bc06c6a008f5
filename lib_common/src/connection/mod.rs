//! # Connection Engine
//!
//! Everything between a client and the alarm server:
//!
//! - **`transport`**: TLS connector (tokio-rustls) behind the [`Connector`] seam.
//! - **`server_comm`**: [`ServerCommunication`], the session state machine with
//!   request correlation and keepalive.
//! - **`receiver`**: the per-session read loop and the [`ServerEventHandler`] seam.
//! - **`watchdog`**: [`ConnectionWatchdog`], reconnects and staleness checks.
//! - **`sender`**: [`SendPool`], bounded asynchronous delivery of outbound events.
//! - **`backoff`**: capped exponential reconnect delays.

pub mod backoff;
pub mod error;
pub mod receiver;
pub mod sender;
pub mod server_comm;
pub mod transport;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod testing;

pub use backoff::Backoff;
pub use error::ConnectionError;
pub use receiver::{AckOnlyHandler, ServerEventHandler};
pub use sender::{EventSink, OutboundEvent, SendPool};
pub use server_comm::{ConnectionState, RegistrationProvider, ServerCommunication};
pub use transport::{build_client_config, AsyncStream, BoxedStream, Connector, TlsServerConnector};
pub use watchdog::{ConnectionWatchdog, WatchdogOutcome};
