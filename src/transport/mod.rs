//! Persistent streaming channel to the conversation backend.
//!
//! `ConnectionManager` owns the channel lifecycle and publishes typed
//! `TransportEvent`s; `Connector` implementations supply the raw pipes.

pub mod assembler;
pub mod connection;
pub mod mock;
pub mod protocol;
pub mod websocket;

pub use assembler::ReplyAssembler;
pub use connection::{
    ConnectionManager, ConnectionState, Connector, Credentials, LiveChannel, LiveSettings,
    TransportEvent, TransportEventKind,
};
pub use mock::{MockConnector, MockServer};
pub use protocol::{InboundMessage, OutboundMessage};
pub use websocket::WebSocketConnector;
