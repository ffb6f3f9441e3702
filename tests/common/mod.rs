#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use meshdrop::error::{ChannelError, NegotiationError};
use meshdrop::frame::WireFrame;
use meshdrop::negotiation::{
    ConnectivityState, DataChannel, PeerEvent, PeerEvents, PeerFactory, PeerTransport,
    SignalingPhase,
};
use meshdrop::wsproto::{IceCandidate, SdpKind, SessionDescription};

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

pub async fn within<T>(timeout: Duration, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(timeout, fut)
        .await
        .expect("timed out")
}

// ---------------------------------------------------------------------------
// Relay stub
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RelayState {
    clients: HashMap<String, mpsc::UnboundedSender<Message>>,
    order: Vec<String>,
    received: Vec<(String, Value)>,
}

impl RelayState {
    fn broadcast_peers(&self) {
        let msg = serde_json::json!({ "type": "peers", "peers": self.order }).to_string();
        for tx in self.clients.values() {
            let _ = tx.send(Message::Text(msg.clone()));
        }
    }
}

/// A single-session relay speaking the same JSON the real one does: `join`
/// registers the socket, `peers` is broadcast on every membership change and
/// addressed messages are forwarded with `from` filled in.
#[derive(Clone)]
pub struct RelayStub {
    addr: SocketAddr,
    state: Arc<Mutex<RelayState>>,
}

impl RelayStub {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(RelayState::default()));
        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = accept_state.clone();
                tokio::spawn(async move {
                    if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                        serve(ws, state).await;
                    }
                });
            }
        });
        Self { addr, state }
    }

    pub fn url(&self, session: &str, client: &str) -> url::Url {
        url::Url::parse(&format!(
            "ws://{}/api/ws/session/{session}?client_id={client}",
            self.addr
        ))
        .unwrap()
    }

    /// Close `client`'s socket from the relay side.
    pub fn kick(&self, client: &str) {
        let state = self.state.lock().unwrap();
        if let Some(tx) = state.clients.get(client) {
            let _ = tx.send(Message::Close(None));
        }
    }

    pub fn is_joined(&self, client: &str) -> bool {
        self.state.lock().unwrap().clients.contains_key(client)
    }

    /// Every message the relay received from `client`, oldest first.
    pub fn received_from(&self, client: &str) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .received
            .iter()
            .filter(|(from, _)| from == client)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

async fn serve(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    state: Arc<Mutex<RelayState>>,
) {
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if write.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    let mut me: Option<String> = None;
    while let Some(Ok(msg)) = read.next().await {
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(mut value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let kind = value["type"].as_str().unwrap_or_default().to_string();
        let mut st = state.lock().unwrap();
        if kind == "join" {
            let id = value["clientId"].as_str().unwrap_or_default().to_string();
            st.received.push((id.clone(), value.clone()));
            st.clients.insert(id.clone(), tx.clone());
            if !st.order.contains(&id) {
                st.order.push(id.clone());
            }
            st.broadcast_peers();
            me = Some(id);
            continue;
        }
        let Some(id) = me.clone() else {
            continue;
        };
        st.received.push((id.clone(), value.clone()));
        match kind.as_str() {
            "ping" => {
                let _ = tx.send(Message::Text(r#"{"type":"pong"}"#.to_string()));
            }
            "leave" => break,
            _ => {
                if let Some(to) = value["to"].as_str().map(str::to_string) {
                    value["from"] = Value::String(id.clone());
                    if let Some(target) = st.clients.get(&to) {
                        let _ = target.send(Message::Text(value.to_string()));
                    }
                }
            }
        }
    }

    if let Some(id) = me {
        let mut st = state.lock().unwrap();
        let same_socket = st
            .clients
            .get(&id)
            .map(|c| c.same_channel(&tx))
            .unwrap_or(false);
        if same_socket {
            st.clients.remove(&id);
            st.order.retain(|c| c != &id);
            st.broadcast_peers();
        }
    }
    drop(tx);
    let _ = writer.await;
}

// ---------------------------------------------------------------------------
// In-memory peer network
// ---------------------------------------------------------------------------

#[derive(Default)]
struct NetState {
    peers: Vec<Arc<MemPeer>>,
}

/// Peer connections that pair up in process. A link comes up when the offerer
/// applies the answer; frames then flow through channels directly.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetState>>,
    fail_after: Arc<Mutex<Option<u64>>>,
    ice_fail_after: Arc<Mutex<Option<u64>>>,
    chat_failures: Arc<AtomicUsize>,
    pace: Arc<Mutex<Option<Duration>>>,
    sent: Arc<AtomicU64>,
    broken: Arc<AtomicBool>,
    next_id: Arc<AtomicUsize>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Break every link once this many payload bytes have crossed it.
    pub fn fail_after(&self, bytes: u64) {
        *self.fail_after.lock().unwrap() = Some(bytes);
    }

    /// Report `failed` connectivity to every peer once this many payload bytes
    /// have crossed, leaving the channels themselves untouched.
    pub fn fail_ice_after(&self, bytes: u64) {
        *self.ice_fail_after.lock().unwrap() = Some(bytes);
    }

    /// Delay every binary frame, so a transfer stays in flight for a while.
    pub fn pace(&self, per_chunk: Duration) {
        *self.pace.lock().unwrap() = Some(per_chunk);
    }

    /// Reject the next `n` chat frames with a transient send error.
    pub fn reject_chat(&self, n: usize) {
        self.chat_failures.store(n, Ordering::SeqCst);
    }

    /// Close every data channel while the peer connections stay up.
    pub fn drop_channels(&self) {
        let peers = self.state.lock().unwrap().peers.clone();
        for peer in peers {
            for ch in peer.channels() {
                if ch.open.swap(false, Ordering::SeqCst) {
                    let _ = ch.own.send(PeerEvent::ChannelClosed);
                }
            }
        }
    }

    pub fn factory(&self) -> MemoryFactory {
        MemoryFactory { net: self.clone() }
    }

    fn other_than(&self, id: usize) -> Option<Arc<MemPeer>> {
        self.state
            .lock()
            .unwrap()
            .peers
            .iter()
            .rev()
            .find(|p| p.id != id && !p.closed.load(Ordering::SeqCst))
            .cloned()
    }

    fn take_chat_failure(&self) -> bool {
        self.chat_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn account(&self, n: usize) -> bool {
        let total = self.sent.fetch_add(n as u64, Ordering::SeqCst) + n as u64;
        let ice_due = matches!(*self.ice_fail_after.lock().unwrap(), Some(limit) if total > limit);
        if ice_due && self.ice_fail_after.lock().unwrap().take().is_some() {
            let peers = self.state.lock().unwrap().peers.clone();
            for peer in peers {
                let _ = peer
                    .events
                    .send(PeerEvent::Connectivity(ConnectivityState::Failed));
            }
        }
        match *self.fail_after.lock().unwrap() {
            Some(limit) if total > limit => {
                self.break_links();
                false
            }
            _ => !self.broken.load(Ordering::SeqCst),
        }
    }

    fn break_links(&self) {
        if self.broken.swap(true, Ordering::SeqCst) {
            return;
        }
        let peers = self.state.lock().unwrap().peers.clone();
        for peer in peers {
            for ch in peer.channels() {
                ch.open.store(false, Ordering::SeqCst);
            }
            let _ = peer.events.send(PeerEvent::ChannelClosed);
        }
    }
}

pub struct MemoryFactory {
    net: MemoryNetwork,
}

#[async_trait]
impl PeerFactory for MemoryFactory {
    type Peer = MemPeer;

    async fn create(
        &self,
        events: PeerEvents<MemChannel>,
    ) -> Result<Arc<MemPeer>, NegotiationError> {
        let peer = Arc::new(MemPeer {
            id: self.net.next_id.fetch_add(1, Ordering::SeqCst),
            net: self.net.clone(),
            events,
            phase: Mutex::new(SignalingPhase::Stable),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        self.net.state.lock().unwrap().peers.push(peer.clone());
        Ok(peer)
    }
}

pub struct MemPeer {
    id: usize,
    net: MemoryNetwork,
    events: PeerEvents<MemChannel>,
    phase: Mutex<SignalingPhase>,
    local: Mutex<Option<Arc<MemChannel>>>,
    remote: Mutex<Option<Arc<MemChannel>>>,
    closed: AtomicBool,
}

impl MemPeer {
    fn channels(&self) -> Vec<Arc<MemChannel>> {
        let mut out = Vec::new();
        out.extend(self.local.lock().unwrap().clone());
        out.extend(self.remote.lock().unwrap().clone());
        out
    }

    /// One origin session per peer, like a real peer connection.
    fn sdp(&self, kind: &str) -> String {
        format!("v=0\r\no=- {} 1 IN IP4 127.0.0.1\r\ns=mem-{kind}\r\n", self.id + 1000)
    }

    fn transition(&self, next: SignalingPhase) {
        *self.phase.lock().unwrap() = next;
    }

    fn invalid(&self, op: &'static str) -> NegotiationError {
        NegotiationError::InvalidState {
            op,
            state: self.signaling_phase(),
        }
    }

    /// The offerer just applied the answer: wire its channel to the other side.
    fn link_up(&self) {
        let Some(other) = self.net.other_than(self.id) else {
            return;
        };
        let _ = self.events.send(PeerEvent::Connectivity(ConnectivityState::Connected));
        let _ = other
            .events
            .send(PeerEvent::Connectivity(ConnectivityState::Connected));

        let Some(local) = self.local.lock().unwrap().clone() else {
            return;
        };
        if local.open.load(Ordering::SeqCst) {
            return;
        }
        let theirs = Arc::new(MemChannel::new(self.net.clone(), other.events.clone()));
        *theirs.to.lock().unwrap() = Some(self.events.clone());
        *local.to.lock().unwrap() = Some(other.events.clone());
        theirs.open.store(true, Ordering::SeqCst);
        local.open.store(true, Ordering::SeqCst);
        *other.remote.lock().unwrap() = Some(theirs.clone());
        let _ = other.events.send(PeerEvent::RemoteChannel(theirs));
        let _ = self.events.send(PeerEvent::ChannelOpen);
    }
}

#[async_trait]
impl PeerTransport for MemPeer {
    type Channel = MemChannel;

    fn signaling_phase(&self) -> SignalingPhase {
        *self.phase.lock().unwrap()
    }

    async fn create_offer(&self, _ice_restart: bool) -> Result<SessionDescription, NegotiationError> {
        Ok(SessionDescription::offer(self.sdp("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        if self.signaling_phase() != SignalingPhase::HaveRemoteOffer {
            return Err(self.invalid("create_answer"));
        }
        Ok(SessionDescription::answer(self.sdp("answer")))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        match (desc.kind, self.signaling_phase()) {
            (SdpKind::Offer, SignalingPhase::Stable | SignalingPhase::HaveLocalOffer) => {
                self.transition(SignalingPhase::HaveLocalOffer)
            }
            (SdpKind::Answer, SignalingPhase::HaveRemoteOffer) => {
                self.transition(SignalingPhase::Stable)
            }
            _ => return Err(self.invalid("set_local_description")),
        }
        let _ = self.events.send(PeerEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:{} 1 udp 1 127.0.0.1 9 typ host", self.id),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        match (desc.kind, self.signaling_phase()) {
            (SdpKind::Offer, SignalingPhase::Stable) => {
                self.transition(SignalingPhase::HaveRemoteOffer);
                Ok(())
            }
            (SdpKind::Answer, SignalingPhase::HaveLocalOffer) => {
                self.transition(SignalingPhase::Stable);
                self.link_up();
                Ok(())
            }
            _ => Err(self.invalid("set_remote_description")),
        }
    }

    async fn rollback(&self) -> Result<(), NegotiationError> {
        if self.signaling_phase() != SignalingPhase::HaveLocalOffer {
            return Err(self.invalid("rollback"));
        }
        self.transition(SignalingPhase::Stable);
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), NegotiationError> {
        Ok(())
    }

    async fn create_data_channel(&self, _label: &str) -> Result<Arc<MemChannel>, NegotiationError> {
        let ch = Arc::new(MemChannel::new(self.net.clone(), self.events.clone()));
        *self.local.lock().unwrap() = Some(ch.clone());
        Ok(ch)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.transition(SignalingPhase::Closed);
    }
}

pub struct MemChannel {
    net: MemoryNetwork,
    open: AtomicBool,
    /// Events of the peer that owns this end.
    own: PeerEvents<MemChannel>,
    /// Events of the peer on the other end.
    to: Mutex<Option<PeerEvents<MemChannel>>>,
}

impl MemChannel {
    fn new(net: MemoryNetwork, own: PeerEvents<MemChannel>) -> Self {
        Self {
            net,
            open: AtomicBool::new(false),
            own,
            to: Mutex::new(None),
        }
    }

    fn deliver(&self, frame: WireFrame) -> Result<(), ChannelError> {
        if !self.is_open() || !self.net.account(frame.len()) {
            return Err(ChannelError::Closed);
        }
        let to = self.to.lock().unwrap().clone();
        match to {
            Some(to) => to
                .send(PeerEvent::ChannelMessage(frame))
                .map_err(|_| ChannelError::Closed),
            None => Err(ChannelError::Closed),
        }
    }
}

#[async_trait]
impl DataChannel for MemChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: &str) -> Result<(), ChannelError> {
        if text.starts_with("TEXT:") && self.is_open() && self.net.take_chat_failure() {
            return Err(ChannelError::Send("busy".into()));
        }
        self.deliver(WireFrame::Text(text.to_string()))
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), ChannelError> {
        let pace = *self.net.pace.lock().unwrap();
        if let Some(delay) = pace {
            tokio::time::sleep(delay).await;
        }
        self.deliver(WireFrame::Binary(data))
    }

    async fn buffered_amount(&self) -> usize {
        0
    }

    async fn drained(&self, _threshold: usize) {}

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.own.send(PeerEvent::ChannelClosed);
        }
    }
}
