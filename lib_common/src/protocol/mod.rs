//! # Wire Protocol
//!
//! Newline-delimited JSON frames exchanged with the alarm server over TLS.
//!
//! ## Layers
//! - **`envelope`**: the `{message, clientTime|serverTime, payload}` frame and
//!   request/response classification.
//! - **`messages`**: payloads the clients send (authentication, registration,
//!   alerts, state changes, snapshots, options).
//! - **`inbound`**: payloads the server pushes (status, relayed alerts and
//!   state changes, option changes).
//! - **`codec`**: line framing with a frame size limit.
//!
//! Requests and responses are correlated by tag in FIFO order: the n-th
//! response with tag T answers the n-th outstanding request with tag T.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod inbound;
pub mod messages;
pub mod types;

pub use codec::{decode_frame, encode_frame, frame_codec, MAX_FRAME_LENGTH};
pub use envelope::{tags, unix_now, Envelope, PayloadKind};
pub use error::ProtocolError;
pub use inbound::InboundEvent;
pub use messages::{
    AuthenticationRequest, ManagerManifest, NodeManifest, OptionRequest, RegistrationRequest, SensorAlert,
    SensorManifest, SensorsState, ServerVersion, StateChange, PROTOCOL_REV, PROTOCOL_VERSION,
};
pub use types::{Ordering, SensorData, SensorDataType};
