//! Persistent duplex connection to the voice service
//!
//! - `endpoint`: URL, credential and query parameter construction
//! - `transport`: connector seam and the WebSocket implementation
//! - `state`: connection lifecycle and its serialized transition cell
//! - `manager`: connect/send/close on top of a connector

mod endpoint;
mod manager;
mod state;
mod transport;

pub use endpoint::{ConnectRequest, CredentialPlacement, Credentials, SessionParams};
pub use manager::{ConnectionManager, ConnectionOptions, CLOSE_NORMAL};
pub use state::{ConnectionState, StateCell};
pub use transport::{Connector, Link, LinkCommand, LinkEvent, WebSocketConnector};
