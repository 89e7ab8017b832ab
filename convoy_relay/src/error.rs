// Error type for the relay.
//
// Per-peer failures (a write to one client, one UDP send) are logged where
// they happen and never surface here. `RelayError` covers what stops a
// transport or the whole relay: failing to bind, a listener that faults after
// startup, and the few conversions the event loop propagates with `?`.

use std::net::SocketAddr;

use thiserror::Error;

/// Errors that end a transport or the relay itself.
#[derive(Error, Debug)]
pub enum RelayError {
    /// A listener or socket could not be bound at startup.
    #[error("failed to bind {transport} on {addr}: {source}")]
    Bind {
        transport: &'static str,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A base port too high for the datagram and WebSocket ports after it.
    #[error("base port {port} leaves no room for the datagram and websocket ports")]
    PortRange { port: u16 },

    /// The stream listener faulted after startup.
    #[error("{transport} listener failed: {source}")]
    ListenerFailed {
        transport: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Every event source hung up while the relay was still meant to run.
    #[error("event channel closed unexpectedly")]
    ChannelClosed,

    /// A relay client received something other than the expected greeting.
    #[error("unexpected greeting: {0}")]
    Greeting(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
