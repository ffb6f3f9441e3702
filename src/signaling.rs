//! Relay connection: queued sends, join-on-open, keep-alive and reconnect backoff.
//!
//! [`SignalingState`] is a pure transition function from [`SignalingEvent`] to a
//! list of [`SignalingEffect`]s. [`SignalingClient`] drives it against a
//! tokio-tungstenite connection and exposes the result as a channel of
//! [`SignalingUpdate`]s.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::SignalingError;
use crate::wsproto::{self, Role, SignalMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct SignalingSettings {
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub keepalive_interval: Duration,
    /// Upper bound on one dial, handshake included.
    pub connect_timeout: Duration,
}

impl Default for SignalingSettings {
    fn default() -> Self {
        Self {
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl SignalingSettings {
    /// `min(max, base * 2^attempt)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.reconnect_base
            .checked_mul(factor)
            .unwrap_or(self.reconnect_max)
            .min(self.reconnect_max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    Open,
    Waiting,
    Closed,
}

#[derive(Debug)]
pub enum SignalingEvent {
    Connect,
    Opened,
    /// The socket closed or a dial failed. `unsent` holds messages that were
    /// handed to the socket layer but never written, oldest first.
    Closed { unsent: Vec<SignalMessage> },
    Inbound(String),
    Outbound(SignalMessage),
    ReconnectDue,
    KeepAliveTick,
    Shutdown,
}

#[derive(Debug, PartialEq)]
pub enum SignalingEffect {
    Dial,
    Transmit(SignalMessage),
    ScheduleReconnect(Duration),
    StartKeepAlive(Duration),
    StopKeepAlive,
    Deliver(SignalMessage),
    Online(bool),
    Hangup,
}

pub struct SignalingState {
    client_id: String,
    role: Role,
    settings: SignalingSettings,
    phase: Phase,
    attempt: u32,
    queue: VecDeque<SignalMessage>,
}

impl SignalingState {
    pub fn new(client_id: impl Into<String>, role: Role, settings: SignalingSettings) -> Self {
        Self {
            client_id: client_id.into(),
            role,
            settings,
            phase: Phase::Idle,
            attempt: 0,
            queue: VecDeque::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn handle(&mut self, event: SignalingEvent) -> Vec<SignalingEffect> {
        if self.phase == Phase::Closed {
            return Vec::new();
        }
        match event {
            SignalingEvent::Connect => {
                if matches!(self.phase, Phase::Idle | Phase::Waiting) {
                    self.phase = Phase::Connecting;
                    vec![SignalingEffect::Dial]
                } else {
                    Vec::new()
                }
            }
            SignalingEvent::ReconnectDue => {
                if self.phase == Phase::Waiting {
                    self.phase = Phase::Connecting;
                    vec![SignalingEffect::Dial]
                } else {
                    Vec::new()
                }
            }
            SignalingEvent::Opened => {
                if self.phase != Phase::Connecting {
                    return Vec::new();
                }
                self.phase = Phase::Open;
                self.attempt = 0;
                let mut effects = Vec::with_capacity(self.queue.len() + 3);
                effects.push(SignalingEffect::Transmit(SignalMessage::Join {
                    client_id: self.client_id.clone(),
                    role: self.role,
                }));
                effects.extend(self.queue.drain(..).map(SignalingEffect::Transmit));
                effects.push(SignalingEffect::StartKeepAlive(
                    self.settings.keepalive_interval,
                ));
                effects.push(SignalingEffect::Online(true));
                effects
            }
            SignalingEvent::Closed { unsent } => {
                for msg in unsent.into_iter().rev() {
                    if Self::worth_replaying(&msg) {
                        self.queue.push_front(msg);
                    }
                }
                match self.phase {
                    Phase::Open | Phase::Connecting => {
                        let was_open = self.phase == Phase::Open;
                        let delay = self.settings.backoff(self.attempt);
                        self.attempt = self.attempt.saturating_add(1);
                        self.phase = Phase::Waiting;
                        let mut effects = vec![SignalingEffect::StopKeepAlive];
                        if was_open {
                            effects.push(SignalingEffect::Online(false));
                        }
                        effects.push(SignalingEffect::ScheduleReconnect(delay));
                        effects
                    }
                    _ => Vec::new(),
                }
            }
            SignalingEvent::Inbound(raw) => match wsproto::decode_text(&raw) {
                Ok(SignalMessage::Pong) | Ok(SignalMessage::Unknown) => Vec::new(),
                Ok(msg) => vec![SignalingEffect::Deliver(msg)],
                Err(err) => {
                    warn!(error = %err, "dropping malformed relay message");
                    Vec::new()
                }
            },
            SignalingEvent::Outbound(msg) => {
                if self.phase == Phase::Open {
                    vec![SignalingEffect::Transmit(msg)]
                } else {
                    self.queue.push_back(msg);
                    Vec::new()
                }
            }
            SignalingEvent::KeepAliveTick => {
                if self.phase == Phase::Open {
                    vec![SignalingEffect::Transmit(SignalMessage::Ping)]
                } else {
                    Vec::new()
                }
            }
            SignalingEvent::Shutdown => {
                let was_open = self.phase == Phase::Open;
                self.phase = Phase::Closed;
                let mut effects = vec![SignalingEffect::StopKeepAlive];
                if was_open {
                    effects.push(SignalingEffect::Transmit(SignalMessage::Leave));
                    effects.push(SignalingEffect::Online(false));
                }
                effects.push(SignalingEffect::Hangup);
                effects
            }
        }
    }

    // Join is re-issued on every open and a stale ping is pointless.
    fn worth_replaying(msg: &SignalMessage) -> bool {
        !matches!(msg, SignalMessage::Join { .. } | SignalMessage::Ping)
    }
}

/// What the relay connection reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingUpdate {
    Connected,
    Disconnected,
    Message(SignalMessage),
}

/// Cloneable sender side of a running [`SignalingClient`].
#[derive(Clone)]
pub struct SignalingHandle {
    outbound: mpsc::UnboundedSender<SignalMessage>,
}

impl SignalingHandle {
    /// Queue `msg` for the relay. Messages are held while disconnected and
    /// written in FIFO order after the next successful open.
    pub fn send(&self, msg: SignalMessage) {
        if self.outbound.send(msg).is_err() {
            debug!("signaling client stopped; dropping outbound message");
        }
    }
}

pub struct SignalingClient {
    url: Url,
    connect_timeout: Duration,
    state: SignalingState,
}

impl SignalingClient {
    pub fn new(url: Url, client_id: &str, role: Role, settings: SignalingSettings) -> Self {
        Self {
            url,
            connect_timeout: settings.connect_timeout,
            state: SignalingState::new(client_id, role, settings),
        }
    }

    /// Spawn the connection task and start dialing.
    pub fn connect(
        self,
        shutdown: Arc<Notify>,
    ) -> (
        SignalingHandle,
        mpsc::UnboundedReceiver<SignalingUpdate>,
        JoinHandle<()>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (up_tx, up_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(out_rx, up_tx, shutdown));
        (SignalingHandle { outbound: out_tx }, up_rx, task)
    }

    async fn run(
        mut self,
        mut outbound: mpsc::UnboundedReceiver<SignalMessage>,
        updates: mpsc::UnboundedSender<SignalingUpdate>,
        shutdown: Arc<Notify>,
    ) {
        let mut conn = Connection::default();
        let mut effects: VecDeque<SignalingEffect> =
            self.state.handle(SignalingEvent::Connect).into();

        loop {
            while let Some(effect) = effects.pop_front() {
                match effect {
                    SignalingEffect::Dial => {
                        info!(url = %self.url, attempt = self.state.attempt(), "dialing relay");
                        match dial(&self.url, self.connect_timeout).await {
                            Ok(ws) => {
                                conn.attach(ws);
                                effects.extend(self.state.handle(SignalingEvent::Opened));
                            }
                            Err(err) => {
                                warn!(error = %err, "relay connect failed");
                                effects.extend(
                                    self.state
                                        .handle(SignalingEvent::Closed { unsent: Vec::new() }),
                                );
                            }
                        }
                    }
                    SignalingEffect::Transmit(msg) => {
                        if let Err(err) = conn.write(&msg).await {
                            warn!(error = %err, kind = msg.kind(), "relay write failed");
                            conn.detach();
                            let mut unsent = vec![msg];
                            unsent.extend(take_pending_transmits(&mut effects));
                            effects.extend(self.state.handle(SignalingEvent::Closed { unsent }));
                        }
                    }
                    SignalingEffect::ScheduleReconnect(delay) => {
                        info!(delay_ms = delay.as_millis() as u64, "relay reconnect scheduled");
                        conn.reconnect_at = Some(Box::pin(tokio::time::sleep(delay)));
                    }
                    SignalingEffect::StartKeepAlive(period) => {
                        let mut interval =
                            tokio::time::interval_at(Instant::now() + period, period);
                        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        conn.keepalive = Some(interval);
                    }
                    SignalingEffect::StopKeepAlive => conn.keepalive = None,
                    SignalingEffect::Deliver(msg) => {
                        let _ = updates.send(SignalingUpdate::Message(msg));
                    }
                    SignalingEffect::Online(true) => {
                        let _ = updates.send(SignalingUpdate::Connected);
                    }
                    SignalingEffect::Online(false) => {
                        let _ = updates.send(SignalingUpdate::Disconnected);
                    }
                    SignalingEffect::Hangup => {
                        conn.close().await;
                        info!("signaling client stopped");
                        return;
                    }
                }
            }

            let event = tokio::select! {
                _ = shutdown.notified() => SignalingEvent::Shutdown,
                msg = outbound.recv() => match msg {
                    Some(msg) => SignalingEvent::Outbound(msg),
                    None => SignalingEvent::Shutdown,
                },
                frame = next_frame(&mut conn.read) => match frame {
                    Some(Ok(Message::Text(txt))) => SignalingEvent::Inbound(txt),
                    Some(Ok(Message::Binary(bin))) => match String::from_utf8(bin) {
                        Ok(txt) => SignalingEvent::Inbound(txt),
                        Err(err) => {
                            debug!(error = %err, "dropping non-utf8 relay frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        info!("relay closed the connection");
                        conn.detach();
                        SignalingEvent::Closed { unsent: Vec::new() }
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!(error = %err, "relay read failed");
                        conn.detach();
                        SignalingEvent::Closed { unsent: Vec::new() }
                    }
                },
                _ = keepalive_tick(&mut conn.keepalive) => SignalingEvent::KeepAliveTick,
                _ = reconnect_due(&mut conn.reconnect_at) => {
                    conn.reconnect_at = None;
                    SignalingEvent::ReconnectDue
                }
            };
            effects.extend(self.state.handle(event));
        }
    }
}

/// Pull every queued transmit out of `effects`, keeping the rest in order.
fn take_pending_transmits(effects: &mut VecDeque<SignalingEffect>) -> Vec<SignalMessage> {
    let mut unsent = Vec::new();
    let mut rest = VecDeque::with_capacity(effects.len());
    for effect in effects.drain(..) {
        match effect {
            SignalingEffect::Transmit(msg) => unsent.push(msg),
            other => rest.push_back(other),
        }
    }
    *effects = rest;
    unsent
}

#[derive(Default)]
struct Connection {
    write: Option<SplitSink<WsStream, Message>>,
    read: Option<SplitStream<WsStream>>,
    keepalive: Option<Interval>,
    reconnect_at: Option<Pin<Box<Sleep>>>,
}

impl Connection {
    fn attach(&mut self, ws: WsStream) {
        let (write, read) = ws.split();
        self.write = Some(write);
        self.read = Some(read);
    }

    fn detach(&mut self) {
        self.write = None;
        self.read = None;
    }

    async fn write(&mut self, msg: &SignalMessage) -> Result<(), SignalingError> {
        let Some(write) = self.write.as_mut() else {
            return Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed.into());
        };
        let text = wsproto::encode_text(msg)?;
        write.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(write) = self.write.as_mut() {
            let _ = write.close().await;
        }
        self.detach();
    }
}

async fn dial(url: &Url, limit: Duration) -> Result<WsStream, SignalingError> {
    match tokio::time::timeout(limit, connect_async(url.as_str())).await {
        Ok(Ok((ws, _))) => Ok(ws),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(SignalingError::Timeout(limit)),
    }
}

async fn next_frame(
    read: &mut Option<SplitStream<WsStream>>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match read.as_mut() {
        Some(read) => read.next().await,
        None => std::future::pending().await,
    }
}

async fn keepalive_tick(keepalive: &mut Option<Interval>) {
    match keepalive.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn reconnect_due(at: &mut Option<Pin<Box<Sleep>>>) {
    match at.as_mut() {
        Some(sleep) => sleep.await,
        None => std::future::pending::<()>().await,
    }
}
