//! Receiver reassembly.
//!
//! The [`Reassembler`] tracks one expectation: the most recent META not yet
//! closed by a DONE. A new META discards any unfinished expectation.

use std::io;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tracing::warn;

use crate::frame::{FileMeta, Frame, TextPayload};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub meta: FileMeta,
    pub data: Bytes,
    pub sha1: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveEvent {
    Started(FileMeta),
    Progress { id: String, bytes: u64 },
    Completed(ReceivedFile),
    Failed { id: String, reason: String },
    Chat(TextPayload),
}

struct Expectation {
    meta: FileMeta,
    buf: BytesMut,
    hasher: Sha1,
}

#[derive(Default)]
pub struct Reassembler {
    current: Option<Expectation>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current.as_ref().map(|e| e.meta.id.as_str())
    }

    pub fn handle(&mut self, frame: Frame) -> Vec<ReceiveEvent> {
        match frame {
            Frame::Meta(mut meta) => {
                let mut events = Vec::with_capacity(2);
                if let Some(prev) = self.current.take() {
                    warn!(transfer = %prev.meta.id, next = %meta.id, "unfinished file superseded");
                    events.push(ReceiveEvent::Failed {
                        id: prev.meta.id,
                        reason: "superseded by a newer file".to_string(),
                    });
                }
                meta.mime = meta.mime_or_default().to_string();
                let capacity = usize::try_from(meta.size).unwrap_or(0).min(64 * 1024 * 1024);
                self.current = Some(Expectation {
                    meta: meta.clone(),
                    buf: BytesMut::with_capacity(capacity),
                    hasher: Sha1::new(),
                });
                events.push(ReceiveEvent::Started(meta));
                events
            }
            Frame::Chunk(data) => {
                let Some(exp) = self.current.as_mut() else {
                    warn!(bytes = data.len(), "binary frame without an announced file");
                    return Vec::new();
                };
                if exp.buf.len() as u64 + data.len() as u64 > exp.meta.size {
                    let Some(exp) = self.current.take() else {
                        return Vec::new();
                    };
                    warn!(transfer = %exp.meta.id, declared = exp.meta.size, "file overran its declared size");
                    return vec![ReceiveEvent::Failed {
                        id: exp.meta.id,
                        reason: format!("received more than the declared {} bytes", exp.meta.size),
                    }];
                }
                exp.hasher.update(&data);
                exp.buf.extend_from_slice(&data);
                let bytes = (exp.buf.len() as u64).min(exp.meta.size);
                vec![ReceiveEvent::Progress {
                    id: exp.meta.id.clone(),
                    bytes,
                }]
            }
            Frame::Done(done) => {
                if self.current_id() != Some(done.id.as_str()) {
                    warn!(transfer = %done.id, "DONE without a matching META");
                    return Vec::new();
                }
                let Some(exp) = self.current.take() else {
                    return Vec::new();
                };
                let received = exp.buf.len() as u64;
                if received != exp.meta.size {
                    return vec![ReceiveEvent::Failed {
                        id: exp.meta.id,
                        reason: format!("received {received} bytes, expected {}", exp.meta.size),
                    }];
                }
                let sha1 = format!("{:x}", exp.hasher.finalize());
                vec![ReceiveEvent::Completed(ReceivedFile {
                    meta: exp.meta,
                    data: exp.buf.freeze(),
                    sha1,
                })]
            }
            Frame::Text(payload) => vec![ReceiveEvent::Chat(payload)],
            Frame::Heartbeat => Vec::new(),
        }
    }

    /// Drop any unfinished expectation, returning its id.
    pub fn reset(&mut self) -> Option<String> {
        self.current.take().map(|e| e.meta.id)
    }
}

/// Reduce a remote-supplied name to a single safe path component.
pub fn sanitize_file_name(name: &str) -> String {
    let normalized = name.replace('\\', "/");
    let last = normalized
        .split('/')
        .filter(|s| !s.is_empty() && !matches!(*s, "." | ".."))
        .last()
        .unwrap_or("");
    let safe: String = last
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ' | '(' | ')'))
        .collect();
    let safe = safe.trim().trim_start_matches('.').to_string();
    if safe.is_empty() {
        "file".to_string()
    } else {
        safe
    }
}

/// First free path for `name` under `dir`, appending ` (n)` before the
/// extension on collision.
pub fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i..]),
        _ => (name, ""),
    };
    (1..)
        .map(|n| dir.join(format!("{stem} ({n}){ext}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Write a completed artifact into `dir`.
pub async fn save_artifact(dir: &Path, file: &ReceivedFile) -> io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = unique_path(dir, &sanitize_file_name(&file.meta.name));
    tokio::fs::write(&path, &file.data).await?;
    Ok(path)
}
