use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::negotiation::ConnectivityState;
use crate::transfer::{ChatMessage, Transfer};

const EVENT_BUFFER: usize = 256;

/// What a session reports to user surfaces.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    SignalingStatus { online: bool },
    PeersChanged { peers: Vec<String> },
    ConnectionChanged { state: ConnectivityState },
    TransferUpdated { transfer: Transfer },
    MessageReceived { message: ChatMessage },
    FileSaved { id: String, path: PathBuf, sha1: String },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::SignalingStatus { .. } => "signaling_status",
            Notification::PeersChanged { .. } => "peers_changed",
            Notification::ConnectionChanged { .. } => "connection_changed",
            Notification::TransferUpdated { .. } => "transfer_updated",
            Notification::MessageReceived { .. } => "message_received",
            Notification::FileSaved { .. } => "file_saved",
        }
    }
}

#[derive(Clone)]
pub struct Events {
    sender: broadcast::Sender<Notification>,
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}

impl Events {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self { sender }
    }

    /// Publish to current subscribers; nobody listening is fine.
    pub fn publish(&self, n: Notification) {
        let _ = self.sender.send(n);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}
