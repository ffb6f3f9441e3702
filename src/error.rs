//! Error types shared by the signaling, negotiation and transfer layers.

use thiserror::Error;

/// A frame or signaling message that failed validation at the boundary.
///
/// These are protocol violations: callers log and drop them, they are never
/// surfaced to the consumer of a session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload was not valid JSON for the expected shape
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Text frame without a known prefix
    #[error("unknown frame: {0}")]
    UnknownFrame(String),

    /// Signaling message with missing or inconsistent fields
    #[error("invalid signal: {0}")]
    InvalidSignal(String),
}

/// Failure writing to the peer data channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel is closed; retrying cannot succeed
    #[error("data channel closed")]
    Closed,

    /// A send failed but the channel is still open
    #[error("data channel send failed: {0}")]
    Send(String),
}

/// Failure driving the offer/answer exchange on a peer connection.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// The underlying peer connection rejected an operation
    #[error("peer transport error: {0}")]
    Transport(String),

    /// A description was applied in a signaling state that does not allow it
    #[error("invalid signaling state for {op}: {state:?}")]
    InvalidState {
        op: &'static str,
        state: crate::negotiation::SignalingPhase,
    },
}

/// Terminal failure of a single file transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The data channel went away mid-transfer
    #[error("data channel closed during transfer")]
    ChannelClosed,

    /// A frame could not be written after the configured number of retries
    #[error("send failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: ChannelError,
    },

    /// The source yielded a different byte count than the META announced
    #[error("source produced {sent} bytes, announced {declared}")]
    SizeMismatch { declared: u64, sent: u64 },

    /// Reading the local source failed
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding a frame failed
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Failure in the relay connection.
#[derive(Debug, Error)]
pub enum SignalingError {
    /// The relay did not complete the handshake in time
    #[error("relay connect timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// WebSocket connect or I/O failure
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Encoding an outbound message failed
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
