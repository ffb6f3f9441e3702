//! Session coordinator.
//!
//! One task owns the relay connection, the peer connection, its data channel and
//! every transfer. Work reaches it as messages: user commands, relay updates,
//! peer callbacks and progress from the file pump. Files are sent one at a time
//! from a FIFO queue; chat and files requested before the channel opens are held
//! and flushed once, chat first, when it does.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::TransferError;
use crate::events::{Events, Notification};
use crate::frame::{self, FileMeta, Frame, TextPayload, WireFrame, DEFAULT_MIME};
use crate::negotiation::{
    ChannelOf, ConnectivityState, DataChannel, NegotiationEffect, NegotiationEngine, PeerEvent,
    PeerFactory, PeerTransport, RestartPolicy, DATA_CHANNEL_LABEL,
};
use crate::receiver::{save_artifact, ReceiveEvent, Reassembler};
use crate::sender::{FramePump, SenderConfig};
use crate::signaling::{SignalingClient, SignalingHandle, SignalingSettings, SignalingUpdate};
use crate::telemetry::{WireStats, WireStatsSnapshot};
use crate::transfer::{Author, ChatMessage, Direction, Transfer, TransferTable};
use crate::wsproto::{Role, SignalMessage};

const SIGNALING_STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub session_id: String,
    pub client_id: String,
    pub role: Role,
    pub signaling_url: Url,
    pub signaling: SignalingSettings,
    pub sender: SenderConfig,
    pub heartbeat_interval: Duration,
    pub restart: RestartPolicy,
    pub download_dir: PathBuf,
}

impl SessionConfig {
    pub fn from_config(cfg: &Config, session_id: &str, role: Role) -> Result<Self> {
        Ok(Self {
            session_id: session_id.to_string(),
            client_id: cfg.client_id.clone(),
            role,
            signaling_url: cfg.signaling_url(session_id)?,
            signaling: cfg.signaling_settings(),
            sender: cfg.sender_config(),
            heartbeat_interval: cfg.heartbeat_interval(),
            restart: RestartPolicy::default(),
            download_dir: cfg.download_dir.clone(),
        })
    }
}

/// Short random id suitable for a share link.
pub fn new_session_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub client_id: String,
    pub role: Role,
    pub signaling_online: bool,
    pub peers: Vec<String>,
    pub remote_peer: Option<String>,
    pub connection: ConnectivityState,
    pub channel_ready: bool,
    pub queued_files: usize,
    pub queued_messages: usize,
    pub transfers: Vec<Transfer>,
    pub messages: Vec<ChatMessage>,
    pub stats: WireStatsSnapshot,
}

impl SessionSnapshot {
    fn new(config: &SessionConfig) -> Self {
        Self {
            session_id: config.session_id.clone(),
            client_id: config.client_id.clone(),
            role: config.role,
            signaling_online: false,
            peers: Vec::new(),
            remote_peer: None,
            connection: ConnectivityState::New,
            channel_ready: false,
            queued_files: 0,
            queued_messages: 0,
            transfers: Vec::new(),
            messages: Vec::new(),
            stats: WireStatsSnapshot::default(),
        }
    }
}

#[derive(Debug)]
enum Source {
    Path(PathBuf),
    Memory(Bytes),
}

#[derive(Debug)]
struct OutgoingFile {
    meta: FileMeta,
    source: Source,
}

#[derive(Debug)]
enum Command {
    QueueFile(OutgoingFile),
    SendText { id: String, text: String },
    Shutdown,
}

#[derive(Debug)]
enum PumpEvent {
    Progress { id: String, bytes: u64 },
    Finished { id: String, result: Result<u64, String> },
}

/// Cloneable front door to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: String,
    commands: mpsc::UnboundedSender<Command>,
    events: Events,
    shared: Arc<RwLock<SessionSnapshot>>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Queue a file, or every regular file below a directory. Returns the
    /// transfer ids in queue order.
    pub async fn send_file(&self, path: impl AsRef<Path>) -> Result<Vec<String>> {
        let path = path.as_ref().to_path_buf();
        let files = tokio::task::spawn_blocking(move || collect_files(&path))
            .await
            .context("walk files")??;
        let mut ids = Vec::with_capacity(files.len());
        for (path, size) in files {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "file".to_string());
            let meta = FileMeta {
                id: uuid::Uuid::new_v4().to_string(),
                mime: guess_mime(&name).to_string(),
                name,
                size,
            };
            ids.push(meta.id.clone());
            self.command(Command::QueueFile(OutgoingFile {
                meta,
                source: Source::Path(path),
            }))?;
        }
        Ok(ids)
    }

    pub fn send_bytes(&self, name: &str, mime: &str, data: Bytes) -> Result<String> {
        let meta = FileMeta {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            size: data.len() as u64,
            mime: if mime.trim().is_empty() {
                DEFAULT_MIME.to_string()
            } else {
                mime.to_string()
            },
        };
        let id = meta.id.clone();
        self.command(Command::QueueFile(OutgoingFile {
            meta,
            source: Source::Memory(data),
        }))?;
        Ok(id)
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.command(Command::SendText {
            id: id.clone(),
            text: text.into(),
        })?;
        Ok(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    fn command(&self, cmd: Command) -> Result<()> {
        self.commands
            .send(cmd)
            .map_err(|_| anyhow::anyhow!("session {} has stopped", self.session_id))
    }
}

fn collect_files(root: &Path) -> Result<Vec<(PathBuf, u64)>> {
    let meta = std::fs::metadata(root).with_context(|| format!("stat {}", root.display()))?;
    if meta.is_file() {
        return Ok(vec![(root.to_path_buf(), meta.len())]);
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if entry.file_type().is_file() {
            let len = entry
                .metadata()
                .with_context(|| format!("stat {}", entry.path().display()))?
                .len();
            files.push((entry.into_path(), len));
        }
    }
    if files.is_empty() {
        anyhow::bail!("no files under {}", root.display());
    }
    Ok(files)
}

fn guess_mime(name: &str) -> &'static str {
    let ext = name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt") | Some("md") | Some("log") => "text/plain",
        Some("html") | Some("htm") => "text/html",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("mp4") => "video/mp4",
        _ => DEFAULT_MIME,
    }
}

struct PeerLink<F: PeerFactory> {
    engine: NegotiationEngine<F::Peer>,
    events: mpsc::UnboundedReceiver<PeerEvent<ChannelOf<F>>>,
    channel: Option<Arc<ChannelOf<F>>>,
    ready: bool,
}

struct ActivePump {
    id: String,
    task: JoinHandle<()>,
}

pub struct SessionCoordinator<F: PeerFactory> {
    config: SessionConfig,
    factory: F,
    signaling: SignalingHandle,
    events: Events,
    shared: Arc<RwLock<SessionSnapshot>>,
    stats: Arc<WireStats>,
    transfers: TransferTable,
    messages: Vec<ChatMessage>,
    peers: Vec<String>,
    online: bool,
    connection: ConnectivityState,
    link: Option<PeerLink<F>>,
    pending_files: VecDeque<OutgoingFile>,
    pending_texts: VecDeque<TextPayload>,
    reassembler: Reassembler,
    active: Option<ActivePump>,
    pump_tx: mpsc::UnboundedSender<PumpEvent>,
}

impl<F: PeerFactory> SessionCoordinator<F> {
    /// Start the session task and connect to the relay.
    pub fn spawn(config: SessionConfig, factory: F) -> (SessionHandle, JoinHandle<()>) {
        let events = Events::new();
        let shared = Arc::new(RwLock::new(SessionSnapshot::new(&config)));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            session_id: config.session_id.clone(),
            commands: cmd_tx,
            events: events.clone(),
            shared: Arc::clone(&shared),
        };

        let task = tokio::spawn(async move {
            let stop = Arc::new(Notify::new());
            let client = SignalingClient::new(
                config.signaling_url.clone(),
                &config.client_id,
                config.role,
                config.signaling.clone(),
            );
            let (signaling, updates, signaling_task) = client.connect(Arc::clone(&stop));
            let (pump_tx, pump_rx) = mpsc::unbounded_channel();
            info!(
                session = %config.session_id,
                client = %config.client_id,
                role = config.role.as_str(),
                "session started"
            );
            let coordinator = SessionCoordinator {
                config,
                factory,
                signaling,
                events,
                shared,
                stats: Arc::new(WireStats::default()),
                transfers: TransferTable::default(),
                messages: Vec::new(),
                peers: Vec::new(),
                online: false,
                connection: ConnectivityState::New,
                link: None,
                pending_files: VecDeque::new(),
                pending_texts: VecDeque::new(),
                reassembler: Reassembler::new(),
                active: None,
                pump_tx,
            };
            coordinator.run(cmd_rx, updates, pump_rx).await;
            stop.notify_one();
            if tokio::time::timeout(SIGNALING_STOP_GRACE, signaling_task)
                .await
                .is_err()
            {
                warn!("signaling client did not stop in time");
            }
        });
        (handle, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut updates: mpsc::UnboundedReceiver<SignalingUpdate>,
        mut pump_events: mpsc::UnboundedReceiver<PumpEvent>,
    ) {
        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.on_command(cmd).await,
                },
                update = updates.recv() => match update {
                    Some(update) => self.on_signaling(update).await,
                    None => {
                        warn!("signaling client ended");
                        break;
                    }
                },
                event = next_peer_event(self.link.as_mut().map(|l| &mut l.events)) => {
                    self.on_peer_event(event).await
                }
                Some(event) = pump_events.recv() => self.on_pump_event(event).await,
                _ = heartbeat.tick() => self.send_heartbeat().await,
            }
        }

        self.teardown("session closed").await;
        info!(session = %self.config.session_id, "session stopped");
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::QueueFile(file) => {
                let meta = &file.meta;
                let transfer = Transfer::new(
                    &meta.id,
                    &meta.name,
                    meta.size,
                    meta.mime_or_default(),
                    Direction::Send,
                );
                info!(transfer = %meta.id, name = %meta.name, size = meta.size, "file queued");
                self.transfers.insert(transfer.clone());
                self.events
                    .publish(Notification::TransferUpdated { transfer });
                self.pending_files.push_back(file);
                self.start_next_file();
            }
            Command::SendText { id, text } => {
                let message = ChatMessage::new(&id, Author::Local, &text);
                self.messages.push(message.clone());
                self.events
                    .publish(Notification::MessageReceived { message });
                self.pending_texts.push_back(TextPayload { id, text });
                self.flush_texts().await;
            }
            Command::Shutdown => {}
        }
        self.sync();
    }

    async fn on_signaling(&mut self, update: SignalingUpdate) {
        match update {
            SignalingUpdate::Connected => self.set_online(true),
            SignalingUpdate::Disconnected => self.set_online(false),
            SignalingUpdate::Message(SignalMessage::Peers { peers }) => self.on_peers(peers).await,
            SignalingUpdate::Message(
                msg @ (SignalMessage::SdpOffer { .. }
                | SignalMessage::SdpAnswer { .. }
                | SignalMessage::IceCandidate { .. }),
            ) => self.on_negotiation_signal(msg).await,
            SignalingUpdate::Message(other) => {
                debug!(kind = other.kind(), "ignoring relay message");
            }
        }
        self.sync();
    }

    async fn on_peers(&mut self, list: Vec<String>) {
        let mut others: Vec<String> = Vec::with_capacity(list.len());
        for id in list {
            if id != self.config.client_id && !others.contains(&id) {
                others.push(id);
            }
        }
        if others != self.peers {
            info!(peers = ?others, "peer list changed");
            self.peers = others;
            self.events.publish(Notification::PeersChanged {
                peers: self.peers.clone(),
            });
        }

        self.reconcile_link().await;
    }

    /// Drop a link whose remote is gone from the relay, then link up with the
    /// first listed peer if there is no link. A remote missing from the peer
    /// list only means its relay socket dropped; a link that is connected or
    /// has an open channel stays until the peer connection itself reports
    /// the loss.
    async fn reconcile_link(&mut self) {
        let stale = match self.link.as_ref() {
            Some(link) => {
                let listed = self.peers.iter().any(|p| p == link.engine.remote_id());
                let established = link.ready || self.connection == ConnectivityState::Connected;
                !listed && !established
            }
            None => false,
        };
        if stale {
            info!("remote peer left the session");
            self.teardown("remote peer left").await;
        }
        if self.link.is_none() {
            if let Some(first) = self.peers.first().cloned() {
                self.open_link(first).await;
            }
        }
    }

    async fn open_link(&mut self, remote: String) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = match self.factory.create(tx).await {
            Ok(peer) => peer,
            Err(err) => {
                warn!(peer = %remote, error = %err, "failed to create peer connection");
                return;
            }
        };
        info!(peer = %remote, polite = self.config.role.is_polite(), "opening peer connection");
        let mut link = PeerLink::<F> {
            engine: NegotiationEngine::new(peer, remote, self.config.role, self.config.restart.clone()),
            events: rx,
            channel: None,
            ready: false,
        };

        let mut effects = Vec::new();
        if self.config.role == Role::Initiator {
            match link.engine.peer().create_data_channel(DATA_CHANNEL_LABEL).await {
                Ok(channel) => link.channel = Some(channel),
                Err(err) => warn!(error = %err, "failed to create data channel"),
            }
            match link.engine.negotiate(false).await {
                Ok(out) => effects = out,
                Err(err) => warn!(error = %err, "initial offer failed"),
            }
        }
        self.link = Some(link);
        self.set_connection(ConnectivityState::Connecting);
        self.apply(effects).await;
    }

    async fn on_negotiation_signal(&mut self, msg: SignalMessage) {
        let from = msg.from().map(str::to_string);
        let restarted = match (&msg, self.link.as_ref(), from.as_deref()) {
            (SignalMessage::SdpOffer { sdp, .. }, Some(link), Some(from))
                if from == link.engine.remote_id() && link.engine.is_new_remote_session(sdp) =>
            {
                Some(from.to_string())
            }
            _ => None,
        };
        if let Some(remote) = restarted {
            info!(peer = %remote, "remote opened a new peer connection; rebuilding");
            self.teardown("remote peer reconnected").await;
            self.open_link(remote).await;
        }
        if self.link.is_none() {
            match (&msg, from.clone()) {
                (SignalMessage::SdpOffer { .. }, Some(remote)) => self.open_link(remote).await,
                _ => {
                    debug!(kind = msg.kind(), "signal without a peer connection");
                    return;
                }
            }
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };
        if let Some(from) = &from {
            if from != link.engine.remote_id() {
                debug!(from = %from, "signal from a peer other than the remote");
                return;
            }
        }
        let kind = msg.kind();
        match link.engine.handle_signal(msg).await {
            Ok(effects) => self.apply(effects).await,
            Err(err) => warn!(kind, error = %err, "negotiation step failed"),
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent<ChannelOf<F>>) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if let Some(link) = self.link.as_ref() {
                    let effect = link.engine.local_candidate(candidate);
                    self.apply(vec![effect]).await;
                }
            }
            PeerEvent::Connectivity(state) => {
                self.set_connection(state);
                let effects = match self.link.as_mut() {
                    Some(link) => link.engine.handle_connectivity(state).await,
                    None => Vec::new(),
                };
                self.apply(effects).await;
                if state.is_lost() {
                    self.reconcile_link().await;
                }
            }
            PeerEvent::RemoteChannel(channel) => {
                let open = channel.is_open();
                if let Some(link) = self.link.as_mut() {
                    link.channel = Some(channel);
                    link.ready = false;
                }
                if open {
                    self.channel_ready().await;
                }
            }
            PeerEvent::ChannelOpen => self.channel_ready().await,
            PeerEvent::ChannelMessage(wire) => self.on_wire(wire).await,
            PeerEvent::ChannelClosed => self.on_channel_closed().await,
        }
        self.sync();
    }

    async fn on_pump_event(&mut self, event: PumpEvent) {
        match event {
            PumpEvent::Progress { id, bytes } => {
                self.update_transfer(&id, |t| t.advance(bytes));
            }
            PumpEvent::Finished { id, result } => {
                if self.active.as_ref().map(|a| a.id == id).unwrap_or(false) {
                    self.active = None;
                }
                match result {
                    Ok(sent) => {
                        info!(transfer = %id, bytes = sent, "file sent");
                        self.update_transfer(&id, Transfer::complete);
                    }
                    Err(reason) => {
                        warn!(transfer = %id, error = %reason, "file send failed");
                        self.stats.set_last_error(&reason);
                        self.update_transfer(&id, |t| t.fail(reason));
                    }
                }
                self.start_next_file();
            }
        }
        self.sync();
    }

    async fn apply(&mut self, effects: Vec<NegotiationEffect>) {
        for effect in effects {
            match effect {
                NegotiationEffect::Signal(msg) => self.signaling.send(msg),
                NegotiationEffect::ConnectionLost(state) => {
                    self.connection_lost(&format!("peer connection {state:?}").to_lowercase())
                }
                NegotiationEffect::ConnectionRestored => {
                    let open = self
                        .link
                        .as_ref()
                        .and_then(|l| l.channel.as_ref())
                        .map(|c| c.is_open())
                        .unwrap_or(false);
                    if open {
                        self.channel_ready().await;
                    }
                }
                NegotiationEffect::RestartIce => {}
            }
        }
    }

    async fn channel_ready(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let Some(channel) = link.channel.clone() else {
            return;
        };
        if link.ready || !channel.is_open() {
            return;
        }
        link.ready = true;
        info!(peer = %link.engine.remote_id(), "data channel ready");

        self.flush_texts().await;
        self.start_next_file();
    }

    /// Send queued chat oldest first. A failed line stays at the head so later
    /// lines never overtake it.
    async fn flush_texts(&mut self) {
        let Some(channel) = self.ready_channel() else {
            return;
        };
        let pump = self.pump(channel);
        while let Some(payload) = self.pending_texts.pop_front() {
            if let Err(err) = pump.send_frame(&Frame::Text(payload.clone())).await {
                warn!(error = %err, queued = self.pending_texts.len() + 1, "chat send failed; holding");
                self.pending_texts.push_front(payload);
                break;
            }
        }
    }

    /// The channel is gone but the peer connection may not be. Start over with
    /// a fresh connection: the initiator offers again right away, the joiner
    /// waits for that offer. Queued files go out on the new channel.
    async fn on_channel_closed(&mut self) {
        let Some(remote) = self.link.as_ref().map(|l| l.engine.remote_id().to_string()) else {
            return;
        };
        info!(peer = %remote, "data channel closed");
        self.teardown("data channel closed").await;
        if self.config.role == Role::Initiator && self.peers.contains(&remote) {
            self.open_link(remote).await;
        }
    }

    fn start_next_file(&mut self) {
        if self.active.is_some() {
            return;
        }
        let Some(channel) = self.ready_channel() else {
            return;
        };
        let Some(file) = self.pending_files.pop_front() else {
            return;
        };
        let id = file.meta.id.clone();
        self.update_transfer(&id, Transfer::start);
        info!(transfer = %id, name = %file.meta.name, "sending file");
        let task = tokio::spawn(run_pump(self.pump(channel), file, self.pump_tx.clone()));
        self.active = Some(ActivePump { id, task });
    }

    fn connection_lost(&mut self, reason: &str) {
        if let Some(link) = self.link.as_mut() {
            link.ready = false;
        }
        if let Some(active) = self.active.take() {
            debug!(transfer = %active.id, "aborting file pump");
            active.task.abort();
        }
        if let Some(id) = self.reassembler.reset() {
            debug!(transfer = %id, "dropping partial file");
        }
        for transfer in self.transfers.fail_in_flight(reason) {
            warn!(transfer = %transfer.id, reason, "transfer interrupted");
            self.events
                .publish(Notification::TransferUpdated { transfer });
        }
    }

    async fn teardown(&mut self, reason: &str) {
        self.connection_lost(reason);
        if let Some(link) = self.link.take() {
            if let Some(channel) = &link.channel {
                channel.close().await;
            }
            link.engine.close().await;
            self.set_connection(ConnectivityState::Closed);
        }
        self.sync();
    }

    async fn on_wire(&mut self, wire: WireFrame) {
        self.stats.on_recv(wire.len());
        let frame = match Frame::decode(wire) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "dropping malformed frame");
                return;
            }
        };
        for event in self.reassembler.handle(frame) {
            self.on_receive_event(event).await;
        }
    }

    async fn on_receive_event(&mut self, event: ReceiveEvent) {
        match event {
            ReceiveEvent::Started(meta) => {
                info!(transfer = %meta.id, name = %meta.name, size = meta.size, "receiving file");
                let mut transfer =
                    Transfer::new(&meta.id, &meta.name, meta.size, &meta.mime, Direction::Receive);
                transfer.start();
                self.transfers.insert(transfer.clone());
                self.events
                    .publish(Notification::TransferUpdated { transfer });
            }
            ReceiveEvent::Progress { id, bytes } => {
                self.update_transfer(&id, |t| t.advance(bytes));
            }
            ReceiveEvent::Completed(file) => {
                let id = file.meta.id.clone();
                match save_artifact(&self.config.download_dir, &file).await {
                    Ok(path) => {
                        info!(transfer = %id, path = %path.display(), sha1 = %file.sha1, "file received");
                        self.update_transfer(&id, Transfer::complete);
                        self.events.publish(Notification::FileSaved {
                            id,
                            path,
                            sha1: file.sha1,
                        });
                    }
                    Err(err) => {
                        warn!(transfer = %id, error = %err, "failed to save file");
                        self.update_transfer(&id, |t| t.fail(format!("save failed: {err}")));
                    }
                }
            }
            ReceiveEvent::Failed { id, reason } => {
                warn!(transfer = %id, reason = %reason, "receive failed");
                self.update_transfer(&id, |t| t.fail(reason));
            }
            ReceiveEvent::Chat(payload) => {
                let message = ChatMessage::new(payload.id, Author::Remote, payload.text);
                self.messages.push(message.clone());
                self.events
                    .publish(Notification::MessageReceived { message });
            }
        }
    }

    async fn send_heartbeat(&mut self) {
        if !self.pending_texts.is_empty() {
            self.flush_texts().await;
            self.sync();
        }
        if let Some(channel) = self.ready_channel() {
            if let Err(err) = channel.send_text(frame::HEARTBEAT).await {
                debug!(error = %err, "heartbeat failed");
            }
        }
    }

    fn ready_channel(&self) -> Option<Arc<ChannelOf<F>>> {
        let link = self.link.as_ref()?;
        if !link.ready {
            return None;
        }
        link.channel.clone()
    }

    fn pump(&self, channel: Arc<ChannelOf<F>>) -> FramePump<ChannelOf<F>> {
        FramePump::new(channel, self.config.sender.clone(), Arc::clone(&self.stats))
    }

    fn update_transfer(&mut self, id: &str, f: impl FnOnce(&mut Transfer) -> bool) {
        if let Some(transfer) = self.transfers.update(id, f) {
            self.events
                .publish(Notification::TransferUpdated { transfer });
        }
    }

    fn set_online(&mut self, online: bool) {
        if self.online != online {
            self.online = online;
            info!(online, "relay status changed");
            self.events
                .publish(Notification::SignalingStatus { online });
        }
    }

    fn set_connection(&mut self, state: ConnectivityState) {
        if self.connection != state {
            self.connection = state;
            self.events
                .publish(Notification::ConnectionChanged { state });
        }
    }

    fn sync(&self) {
        let mut snap = self.shared.write().unwrap_or_else(|p| p.into_inner());
        snap.signaling_online = self.online;
        snap.peers = self.peers.clone();
        snap.remote_peer = self
            .link
            .as_ref()
            .map(|l| l.engine.remote_id().to_string());
        snap.connection = self.connection;
        snap.channel_ready = self.link.as_ref().map(|l| l.ready).unwrap_or(false);
        snap.queued_files = self.pending_files.len();
        snap.queued_messages = self.pending_texts.len();
        snap.transfers = self.transfers.list();
        snap.messages = self.messages.clone();
        snap.stats = self.stats.snapshot();
    }
}

async fn next_peer_event<C>(events: Option<&mut mpsc::UnboundedReceiver<PeerEvent<C>>>) -> PeerEvent<C> {
    match events {
        Some(rx) => match rx.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

async fn run_pump<C>(pump: FramePump<C>, file: OutgoingFile, tx: mpsc::UnboundedSender<PumpEvent>)
where
    C: DataChannel + ?Sized + 'static,
{
    let id = file.meta.id.clone();
    let progress_tx = tx.clone();
    let progress_id = id.clone();
    let progress = move |bytes: u64| {
        let _ = progress_tx.send(PumpEvent::Progress {
            id: progress_id.clone(),
            bytes,
        });
    };
    let result = match file.source {
        Source::Path(path) => match tokio::fs::File::open(&path).await {
            Ok(source) => pump.send_file(&file.meta, source, progress).await,
            Err(err) => Err(TransferError::Io(err)),
        },
        Source::Memory(data) => pump.send_file(&file.meta, &data[..], progress).await,
    };
    let _ = tx.send(PumpEvent::Finished {
        id,
        result: result.map_err(|e| e.to_string()),
    });
}
