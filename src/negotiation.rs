//! Offer/answer exchange for one peer connection.
//!
//! The joiner is the polite peer. When both sides offer at once the polite side
//! rolls back its own offer and answers the remote one; the impolite side
//! ignores the remote offer and waits for its own answer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ChannelError, NegotiationError};
use crate::frame::WireFrame;
use crate::wsproto::{IceCandidate, Role, SessionDescription, SignalMessage};

/// Label of the single data channel carrying file and chat frames.
pub const DATA_CHANNEL_LABEL: &str = "file";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingPhase {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    pub fn is_lost(self) -> bool {
        matches!(
            self,
            ConnectivityState::Disconnected | ConnectivityState::Failed | ConnectivityState::Closed
        )
    }
}

/// Ordered, reliable message channel between the two peers.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn is_open(&self) -> bool;
    async fn send_text(&self, text: &str) -> Result<(), ChannelError>;
    async fn send_binary(&self, data: Bytes) -> Result<(), ChannelError>;
    /// Bytes queued locally but not yet handed to the network.
    async fn buffered_amount(&self) -> usize;
    /// Resolves once the buffered amount is at or below `threshold`, or the
    /// channel is no longer open.
    async fn drained(&self, threshold: usize);
    async fn close(&self);
}

/// The peer connection operations negotiation needs.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    type Channel: DataChannel + 'static;

    fn signaling_phase(&self) -> SignalingPhase;
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError>;
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn set_local_description(&self, desc: SessionDescription)
        -> Result<(), NegotiationError>;
    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError>;
    async fn rollback(&self) -> Result<(), NegotiationError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;
    /// Create the ordered, reliable channel. Its open/message/close events are
    /// reported through the peer's event sender.
    async fn create_data_channel(&self, label: &str)
        -> Result<Arc<Self::Channel>, NegotiationError>;
    async fn close(&self);
}

/// Callbacks from a peer connection and its data channel.
#[derive(Debug)]
pub enum PeerEvent<C> {
    LocalCandidate(IceCandidate),
    Connectivity(ConnectivityState),
    /// The remote side announced its data channel.
    RemoteChannel(Arc<C>),
    ChannelOpen,
    ChannelMessage(WireFrame),
    ChannelClosed,
}

pub type PeerEvents<C> = mpsc::UnboundedSender<PeerEvent<C>>;
pub type ChannelOf<F> = <<F as PeerFactory>::Peer as PeerTransport>::Channel;

/// Builds a fresh peer connection per remote peer.
#[async_trait]
pub trait PeerFactory: Send + Sync + 'static {
    type Peer: PeerTransport;

    async fn create(
        &self,
        events: PeerEvents<ChannelOf<Self>>,
    ) -> Result<Arc<Self::Peer>, NegotiationError>;
}

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub max_attempts: u32,
    pub min_interval: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDecision {
    Ignore,
    Accept { rollback: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationEffect {
    Signal(SignalMessage),
    RestartIce,
    ConnectionLost(ConnectivityState),
    ConnectionRestored,
}

/// Local negotiation bookkeeping for one peer connection.
///
/// `polite` is fixed at construction. `making_offer` is set for the duration of
/// an offer attempt and doubles as the exclusion flag against concurrent
/// negotiation. Restart attempts reset only on reaching `connected`.
#[derive(Debug)]
pub struct NegotiationState {
    polite: bool,
    making_offer: bool,
    ignore_offer: bool,
    policy: RestartPolicy,
    restart_attempts: u32,
    last_restart: Option<Instant>,
}

impl NegotiationState {
    pub fn new(role: Role, policy: RestartPolicy) -> Self {
        Self {
            polite: role.is_polite(),
            making_offer: false,
            ignore_offer: false,
            policy,
            restart_attempts: 0,
            last_restart: None,
        }
    }

    pub fn polite(&self) -> bool {
        self.polite
    }

    pub fn making_offer(&self) -> bool {
        self.making_offer
    }

    pub fn restart_attempts(&self) -> u32 {
        self.restart_attempts
    }

    /// Returns false if an offer is already in flight.
    pub fn begin_offer(&mut self) -> bool {
        if self.making_offer {
            return false;
        }
        self.making_offer = true;
        true
    }

    pub fn finish_offer(&mut self) {
        self.making_offer = false;
    }

    pub fn on_remote_offer(&mut self, phase: SignalingPhase) -> OfferDecision {
        let collision = self.making_offer || phase != SignalingPhase::Stable;
        self.ignore_offer = collision && !self.polite;
        if self.ignore_offer {
            OfferDecision::Ignore
        } else {
            OfferDecision::Accept {
                rollback: collision && phase == SignalingPhase::HaveLocalOffer,
            }
        }
    }

    pub fn accepts_answer(&self, phase: SignalingPhase) -> bool {
        phase == SignalingPhase::HaveLocalOffer
    }

    /// Candidate failures are expected for an offer we deliberately ignored.
    pub fn ignoring_offer(&self) -> bool {
        self.ignore_offer
    }

    pub fn on_connectivity(
        &mut self,
        state: ConnectivityState,
        now: Instant,
    ) -> Vec<NegotiationEffect> {
        match state {
            ConnectivityState::Connected => {
                self.restart_attempts = 0;
                vec![NegotiationEffect::ConnectionRestored]
            }
            ConnectivityState::Disconnected | ConnectivityState::Failed => {
                let mut effects = vec![NegotiationEffect::ConnectionLost(state)];
                if self.restart_allowed(now) {
                    self.restart_attempts += 1;
                    self.last_restart = Some(now);
                    effects.push(NegotiationEffect::RestartIce);
                }
                effects
            }
            ConnectivityState::Closed => vec![NegotiationEffect::ConnectionLost(state)],
            ConnectivityState::New | ConnectivityState::Connecting => Vec::new(),
        }
    }

    fn restart_allowed(&self, now: Instant) -> bool {
        if self.restart_attempts >= self.policy.max_attempts {
            return false;
        }
        match self.last_restart {
            Some(last) => now.saturating_duration_since(last) >= self.policy.min_interval,
            None => true,
        }
    }
}

/// Drives a [`PeerTransport`] through offer/answer/candidate exchange with one
/// remote peer. Every method returns the signaling messages to send.
pub struct NegotiationEngine<P: PeerTransport> {
    peer: Arc<P>,
    remote_id: String,
    state: NegotiationState,
    has_remote_description: bool,
    remote_session: Option<String>,
    pending_candidates: Vec<IceCandidate>,
}

impl<P: PeerTransport> NegotiationEngine<P> {
    pub fn new(peer: Arc<P>, remote_id: impl Into<String>, role: Role, policy: RestartPolicy) -> Self {
        Self {
            peer,
            remote_id: remote_id.into(),
            state: NegotiationState::new(role, policy),
            has_remote_description: false,
            remote_session: None,
            pending_candidates: Vec::new(),
        }
    }

    pub fn peer(&self) -> &Arc<P> {
        &self.peer
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn state(&self) -> &NegotiationState {
        &self.state
    }

    /// True when `offer` belongs to a different remote peer connection than
    /// the descriptions applied so far. Such an offer cannot be applied to
    /// this connection; the caller has to start over with a fresh one.
    pub fn is_new_remote_session(&self, offer: &SessionDescription) -> bool {
        match (self.remote_session.as_deref(), offer.origin_session()) {
            (Some(known), Some(incoming)) => known != incoming,
            _ => false,
        }
    }

    pub async fn negotiate(
        &mut self,
        ice_restart: bool,
    ) -> Result<Vec<NegotiationEffect>, NegotiationError> {
        if !self.state.begin_offer() {
            debug!(peer = %self.remote_id, "offer already in flight");
            return Ok(Vec::new());
        }
        let result = async {
            let offer = self.peer.create_offer(ice_restart).await?;
            self.peer.set_local_description(offer.clone()).await?;
            Ok::<_, NegotiationError>(offer)
        }
        .await;
        self.state.finish_offer();
        let offer = result?;
        info!(peer = %self.remote_id, ice_restart, "sending offer");
        Ok(vec![self.signal(SignalMessage::SdpOffer {
            to: None,
            from: None,
            sdp: offer,
        })])
    }

    pub async fn handle_signal(
        &mut self,
        msg: SignalMessage,
    ) -> Result<Vec<NegotiationEffect>, NegotiationError> {
        match msg {
            SignalMessage::SdpOffer { sdp, .. } => {
                let phase = self.peer.signaling_phase();
                match self.state.on_remote_offer(phase) {
                    OfferDecision::Ignore => {
                        debug!(peer = %self.remote_id, ?phase, "ignoring colliding offer");
                        Ok(Vec::new())
                    }
                    OfferDecision::Accept { rollback } => {
                        if rollback {
                            debug!(peer = %self.remote_id, "rolling back local offer");
                            self.peer.rollback().await?;
                        }
                        self.apply_remote(sdp).await?;
                        let answer = self.peer.create_answer().await?;
                        self.peer.set_local_description(answer.clone()).await?;
                        Ok(vec![self.signal(SignalMessage::SdpAnswer {
                            to: None,
                            from: None,
                            sdp: answer,
                        })])
                    }
                }
            }
            SignalMessage::SdpAnswer { sdp, .. } => {
                let phase = self.peer.signaling_phase();
                if self.state.accepts_answer(phase) {
                    self.apply_remote(sdp).await?;
                } else {
                    warn!(peer = %self.remote_id, ?phase, "ignoring stale answer");
                }
                Ok(Vec::new())
            }
            SignalMessage::IceCandidate { candidate, .. } => {
                if self.has_remote_description {
                    self.add_candidate(candidate).await;
                } else {
                    self.pending_candidates.push(candidate);
                }
                Ok(Vec::new())
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Apply a connectivity change, running an ICE restart when the policy
    /// allows one.
    pub async fn handle_connectivity(&mut self, state: ConnectivityState) -> Vec<NegotiationEffect> {
        let mut out = Vec::new();
        for effect in self.state.on_connectivity(state, Instant::now()) {
            match effect {
                NegotiationEffect::RestartIce => {
                    info!(
                        peer = %self.remote_id,
                        attempt = self.state.restart_attempts(),
                        "restarting ice"
                    );
                    match self.negotiate(true).await {
                        Ok(effects) => out.extend(effects),
                        Err(err) => warn!(peer = %self.remote_id, error = %err, "ice restart failed"),
                    }
                }
                other => out.push(other),
            }
        }
        out
    }

    pub fn local_candidate(&self, candidate: IceCandidate) -> NegotiationEffect {
        self.signal(SignalMessage::IceCandidate {
            to: None,
            from: None,
            candidate,
        })
    }

    pub async fn close(&self) {
        self.peer.close().await;
    }

    async fn apply_remote(&mut self, desc: SessionDescription) -> Result<(), NegotiationError> {
        let origin = desc.origin_session().map(str::to_string);
        self.peer.set_remote_description(desc).await?;
        self.has_remote_description = true;
        if origin.is_some() {
            self.remote_session = origin;
        }
        for candidate in std::mem::take(&mut self.pending_candidates) {
            self.add_candidate(candidate).await;
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) {
        if let Err(err) = self.peer.add_ice_candidate(candidate).await {
            if self.state.ignoring_offer() {
                debug!(peer = %self.remote_id, error = %err, "candidate for ignored offer");
            } else {
                warn!(peer = %self.remote_id, error = %err, "failed to add ice candidate");
            }
        }
    }

    fn signal(&self, msg: SignalMessage) -> NegotiationEffect {
        NegotiationEffect::Signal(msg.addressed_to(&self.remote_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct NoChannel;

    #[async_trait]
    impl DataChannel for NoChannel {
        fn is_open(&self) -> bool {
            false
        }
        async fn send_text(&self, _text: &str) -> Result<(), ChannelError> {
            Err(ChannelError::Closed)
        }
        async fn send_binary(&self, _data: Bytes) -> Result<(), ChannelError> {
            Err(ChannelError::Closed)
        }
        async fn buffered_amount(&self) -> usize {
            0
        }
        async fn drained(&self, _threshold: usize) {}
        async fn close(&self) {}
    }

    /// Tracks the signaling phase the way a browser peer connection does.
    #[derive(Default)]
    struct FakePeer {
        inner: Mutex<FakeInner>,
    }

    #[derive(Default)]
    struct FakeInner {
        phase: Option<SignalingPhase>,
        remote: Option<SessionDescription>,
        restarts: u32,
        candidates: Vec<String>,
        offers: u32,
    }

    impl FakePeer {
        fn phase(&self) -> SignalingPhase {
            self.inner.lock().unwrap().phase.unwrap_or(SignalingPhase::Stable)
        }
    }

    #[async_trait]
    impl PeerTransport for FakePeer {
        type Channel = NoChannel;

        fn signaling_phase(&self) -> SignalingPhase {
            self.phase()
        }

        async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError> {
            let mut inner = self.inner.lock().unwrap();
            inner.offers += 1;
            if ice_restart {
                inner.restarts += 1;
            }
            Ok(SessionDescription::offer(format!("offer-{}", inner.offers)))
        }

        async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
            Ok(SessionDescription::answer("answer"))
        }

        async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
            let mut inner = self.inner.lock().unwrap();
            let phase = inner.phase.unwrap_or(SignalingPhase::Stable);
            inner.phase = Some(match (desc.kind, phase) {
                (crate::wsproto::SdpKind::Offer, SignalingPhase::Stable | SignalingPhase::HaveLocalOffer) => {
                    SignalingPhase::HaveLocalOffer
                }
                (crate::wsproto::SdpKind::Answer, SignalingPhase::HaveRemoteOffer) => SignalingPhase::Stable,
                (_, state) => return Err(NegotiationError::InvalidState { op: "set_local", state }),
            });
            Ok(())
        }

        async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
            let mut inner = self.inner.lock().unwrap();
            let phase = inner.phase.unwrap_or(SignalingPhase::Stable);
            inner.phase = Some(match (desc.kind, phase) {
                (crate::wsproto::SdpKind::Offer, SignalingPhase::Stable) => SignalingPhase::HaveRemoteOffer,
                (crate::wsproto::SdpKind::Answer, SignalingPhase::HaveLocalOffer) => SignalingPhase::Stable,
                (_, state) => return Err(NegotiationError::InvalidState { op: "set_remote", state }),
            });
            inner.remote = Some(desc);
            Ok(())
        }

        async fn rollback(&self) -> Result<(), NegotiationError> {
            self.inner.lock().unwrap().phase = Some(SignalingPhase::Stable);
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
            self.inner.lock().unwrap().candidates.push(candidate.candidate);
            Ok(())
        }

        async fn create_data_channel(&self, _label: &str) -> Result<Arc<NoChannel>, NegotiationError> {
            Ok(Arc::new(NoChannel))
        }

        async fn close(&self) {
            self.inner.lock().unwrap().phase = Some(SignalingPhase::Closed);
        }
    }

    fn engine(role: Role) -> NegotiationEngine<FakePeer> {
        NegotiationEngine::new(Arc::new(FakePeer::default()), "remote", role, RestartPolicy::default())
    }

    fn remote_offer(sdp: &str) -> SignalMessage {
        SignalMessage::SdpOffer {
            to: Some("me".into()),
            from: Some("remote".into()),
            sdp: SessionDescription::offer(sdp),
        }
    }

    #[test]
    fn collision_rules_follow_politeness() {
        let mut impolite = NegotiationState::new(Role::Initiator, RestartPolicy::default());
        assert_eq!(
            impolite.on_remote_offer(SignalingPhase::HaveLocalOffer),
            OfferDecision::Ignore
        );
        assert_eq!(
            impolite.on_remote_offer(SignalingPhase::Stable),
            OfferDecision::Accept { rollback: false }
        );

        let mut polite = NegotiationState::new(Role::Joiner, RestartPolicy::default());
        assert_eq!(
            polite.on_remote_offer(SignalingPhase::HaveLocalOffer),
            OfferDecision::Accept { rollback: true }
        );
        assert!(polite.begin_offer());
        assert!(!polite.begin_offer());
        assert_eq!(
            polite.on_remote_offer(SignalingPhase::Stable),
            OfferDecision::Accept { rollback: false }
        );
        polite.finish_offer();
        assert!(!polite.making_offer());
    }

    #[tokio::test]
    async fn glare_polite_side_adopts_remote_offer() {
        let mut polite = engine(Role::Joiner);
        polite.negotiate(false).await.unwrap();
        assert_eq!(polite.peer().phase(), SignalingPhase::HaveLocalOffer);

        let effects = polite.handle_signal(remote_offer("theirs")).await.unwrap();
        assert_eq!(polite.peer().phase(), SignalingPhase::Stable);
        let remote = polite.peer().inner.lock().unwrap().remote.clone();
        assert_eq!(remote, Some(SessionDescription::offer("theirs")));
        assert!(matches!(
            &effects[..],
            [NegotiationEffect::Signal(SignalMessage::SdpAnswer { to: Some(to), .. })] if to == "remote"
        ));
    }

    #[tokio::test]
    async fn glare_impolite_side_keeps_its_offer() {
        let mut impolite = engine(Role::Initiator);
        impolite.negotiate(false).await.unwrap();
        let effects = impolite.handle_signal(remote_offer("theirs")).await.unwrap();
        assert!(effects.is_empty());
        assert_eq!(impolite.peer().phase(), SignalingPhase::HaveLocalOffer);

        impolite
            .handle_signal(SignalMessage::SdpAnswer {
                to: None,
                from: Some("remote".into()),
                sdp: SessionDescription::answer("answer"),
            })
            .await
            .unwrap();
        assert_eq!(impolite.peer().phase(), SignalingPhase::Stable);
    }

    #[tokio::test]
    async fn stale_answer_is_ignored() {
        let mut eng = engine(Role::Initiator);
        let effects = eng
            .handle_signal(SignalMessage::SdpAnswer {
                to: None,
                from: None,
                sdp: SessionDescription::answer("late"),
            })
            .await
            .unwrap();
        assert!(effects.is_empty());
        assert_eq!(eng.peer().phase(), SignalingPhase::Stable);
        assert!(eng.peer().inner.lock().unwrap().remote.is_none());
    }

    #[tokio::test]
    async fn early_candidates_wait_for_remote_description() {
        let mut eng = engine(Role::Joiner);
        let cand = SignalMessage::IceCandidate {
            to: None,
            from: Some("remote".into()),
            candidate: IceCandidate {
                candidate: "c1".into(),
                ..Default::default()
            },
        };
        eng.handle_signal(cand).await.unwrap();
        assert!(eng.peer().inner.lock().unwrap().candidates.is_empty());
        eng.handle_signal(remote_offer("o")).await.unwrap();
        assert_eq!(eng.peer().inner.lock().unwrap().candidates, vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn fresh_remote_connection_is_told_apart_from_a_restart() {
        let first = "v=0\r\no=- 111 1 IN IP4 0.0.0.0\r\n";
        let restart = "v=0\r\no=- 111 2 IN IP4 0.0.0.0\r\n";
        let fresh = "v=0\r\no=- 222 1 IN IP4 0.0.0.0\r\n";

        let mut eng = engine(Role::Joiner);
        assert!(!eng.is_new_remote_session(&SessionDescription::offer(fresh)));
        eng.handle_signal(remote_offer(first)).await.unwrap();
        assert!(!eng.is_new_remote_session(&SessionDescription::offer(restart)));
        assert!(eng.is_new_remote_session(&SessionDescription::offer(fresh)));
        assert!(!eng.is_new_remote_session(&SessionDescription::offer("no origin")));
    }

    #[tokio::test(start_paused = true)]
    async fn ice_restart_is_rate_limited_and_capped() {
        let mut eng = engine(Role::Initiator);
        for _ in 0..10 {
            eng.handle_connectivity(ConnectivityState::Failed).await;
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        // 10 failures over 10s allow restarts at t=0 and t=5 only
        assert_eq!(eng.peer().inner.lock().unwrap().restarts, 2);

        for _ in 0..10 {
            eng.handle_connectivity(ConnectivityState::Disconnected).await;
            tokio::time::advance(Duration::from_secs(6)).await;
        }
        assert_eq!(eng.peer().inner.lock().unwrap().restarts, 3);

        let effects = eng.handle_connectivity(ConnectivityState::Connected).await;
        assert_eq!(effects, vec![NegotiationEffect::ConnectionRestored]);
        assert_eq!(eng.state().restart_attempts(), 0);
    }

    #[tokio::test]
    async fn restart_offer_is_flagged_and_sent() {
        let mut eng = engine(Role::Initiator);
        let effects = eng.handle_connectivity(ConnectivityState::Failed).await;
        assert_eq!(
            effects[0],
            NegotiationEffect::ConnectionLost(ConnectivityState::Failed)
        );
        assert!(matches!(
            effects[1],
            NegotiationEffect::Signal(SignalMessage::SdpOffer { .. })
        ));
        assert_eq!(eng.peer().inner.lock().unwrap().restarts, 1);
    }
}
