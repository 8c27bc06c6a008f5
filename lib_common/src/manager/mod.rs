//! # Manager
//!
//! Manager-node side of the client: the mirrored server state and the local
//! admin socket that forwards option changes to the server.

pub mod local_server;
pub mod model;

pub use local_server::{handle_request, LocalServer, OptionRelay, ALERT_SYSTEM_ACTIVE, REQUEST_LIMIT};
pub use model::{ManagerModel, ManagerProfile, ALERT_HISTORY_LIMIT};
