//! Data channel framing: `META:`, `DONE:`, `TEXT:` text frames, raw binary
//! chunks and a bare heartbeat token. Frame boundaries are the channel's own
//! message boundaries; there is no length prefix.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

pub const META_PREFIX: &str = "META:";
pub const DONE_PREFIX: &str = "DONE:";
pub const TEXT_PREFIX: &str = "TEXT:";
pub const HEARTBEAT: &str = "HEARTBEAT";
pub const DEFAULT_MIME: &str = "application/octet-stream";

/// One message as carried by the data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Bytes),
}

impl WireFrame {
    pub fn len(&self) -> usize {
        match self {
            WireFrame::Text(t) => t.len(),
            WireFrame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub id: String,
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub mime: String,
}

impl FileMeta {
    pub fn mime_or_default(&self) -> &str {
        if self.mime.trim().is_empty() {
            DEFAULT_MIME
        } else {
            &self.mime
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneMarker {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPayload {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Meta(FileMeta),
    Chunk(Bytes),
    Done(DoneMarker),
    Text(TextPayload),
    Heartbeat,
}

impl Frame {
    pub fn encode(&self) -> Result<WireFrame, ProtocolError> {
        Ok(match self {
            Frame::Meta(meta) => {
                WireFrame::Text(format!("{META_PREFIX}{}", serde_json::to_string(meta)?))
            }
            Frame::Done(done) => {
                WireFrame::Text(format!("{DONE_PREFIX}{}", serde_json::to_string(done)?))
            }
            Frame::Text(text) => {
                WireFrame::Text(format!("{TEXT_PREFIX}{}", serde_json::to_string(text)?))
            }
            Frame::Heartbeat => WireFrame::Text(HEARTBEAT.to_string()),
            Frame::Chunk(data) => WireFrame::Binary(data.clone()),
        })
    }

    pub fn decode(wire: WireFrame) -> Result<Frame, ProtocolError> {
        let text = match wire {
            WireFrame::Binary(data) => return Ok(Frame::Chunk(data)),
            WireFrame::Text(text) => text,
        };
        if let Some(rest) = text.strip_prefix(META_PREFIX) {
            return Ok(Frame::Meta(serde_json::from_str(rest)?));
        }
        if let Some(rest) = text.strip_prefix(DONE_PREFIX) {
            return Ok(Frame::Done(serde_json::from_str(rest)?));
        }
        if let Some(rest) = text.strip_prefix(TEXT_PREFIX) {
            return Ok(Frame::Text(serde_json::from_str(rest)?));
        }
        if text.trim() == HEARTBEAT {
            return Ok(Frame::Heartbeat);
        }
        let preview: String = text.chars().take(32).collect();
        Err(ProtocolError::UnknownFrame(preview))
    }
}
