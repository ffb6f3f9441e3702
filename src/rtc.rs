//! `webrtc` crate bindings for [`PeerTransport`] and [`DataChannel`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::{ChannelError, NegotiationError};
use crate::frame::WireFrame;
use crate::negotiation::{
    ConnectivityState, DataChannel, PeerEvent, PeerEvents, PeerFactory, PeerTransport,
    SignalingPhase,
};
use crate::wsproto::{IceCandidate, SdpKind, SessionDescription};

/// STUN servers used when the configuration names none.
pub const DEFAULT_ICE_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:global.stun.twilio.com:3478",
];

const DRAIN_POLL: Duration = Duration::from_millis(250);

fn transport_err(err: webrtc::Error) -> NegotiationError {
    NegotiationError::Transport(err.to_string())
}

pub struct RtcFactory {
    ice_servers: Vec<String>,
}

impl RtcFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl PeerFactory for RtcFactory {
    type Peer = RtcPeer;

    async fn create(
        &self,
        events: PeerEvents<RtcChannel>,
    ) -> Result<Arc<RtcPeer>, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(transport_err)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(transport_err)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(transport_err)?);

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => warn!(error = %err, "failed to serialize local candidate"),
                }
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                info!(?state, "peer connection state changed");
                let _ = tx.send(PeerEvent::Connectivity(connectivity(state)));
            })
        }));

        let tx = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = tx.clone();
            Box::pin(async move {
                info!(label = %dc.label(), "remote data channel announced");
                let channel = RtcChannel::wire(dc, tx.clone()).await;
                let _ = tx.send(PeerEvent::RemoteChannel(channel));
            })
        }));

        Ok(Arc::new(RtcPeer { pc, events }))
    }
}

fn connectivity(state: RTCPeerConnectionState) -> ConnectivityState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectivityState::Connecting,
        RTCPeerConnectionState::Connected => ConnectivityState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectivityState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectivityState::Failed,
        RTCPeerConnectionState::Closed => ConnectivityState::Closed,
        _ => ConnectivityState::New,
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp).map_err(transport_err),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp).map_err(transport_err),
        SdpKind::Rollback => Err(NegotiationError::Transport(
            "rollback is not a remote description".to_string(),
        )),
    }
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, NegotiationError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        other => {
            return Err(NegotiationError::Transport(format!(
                "unexpected local description type {other}"
            )))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    events: PeerEvents<RtcChannel>,
}

#[async_trait]
impl PeerTransport for RtcPeer {
    type Channel = RtcChannel;

    fn signaling_phase(&self) -> SignalingPhase {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingPhase::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingPhase::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingPhase::Closed,
            _ => SignalingPhase::Stable,
        }
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self.pc.create_offer(Some(options)).await.map_err(transport_err)?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await.map_err(transport_err)?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(transport_err)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(transport_err)
    }

    async fn rollback(&self) -> Result<(), NegotiationError> {
        // The rollback must carry parseable SDP, so reuse the pending offer.
        let Some(mut pending) = self.pc.pending_local_description().await else {
            return Ok(());
        };
        pending.sdp_type = RTCSdpType::Rollback;
        self.pc
            .set_local_description(pending)
            .await
            .map_err(transport_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(transport_err)
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<RtcChannel>, NegotiationError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(transport_err)?;
        info!(label, "created data channel");
        Ok(RtcChannel::wire(dc, self.events.clone()).await)
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!(error = %err, "peer connection close failed");
        }
    }
}

/// A `webrtc` data channel with drain notification.
pub struct RtcChannel {
    dc: Arc<RTCDataChannel>,
    low: Arc<Notify>,
}

impl RtcChannel {
    async fn wire(dc: Arc<RTCDataChannel>, events: PeerEvents<RtcChannel>) -> Arc<Self> {
        let low = Arc::new(Notify::new());

        let tx = events.clone();
        dc.on_open(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(PeerEvent::ChannelOpen);
            })
        }));

        let tx = events.clone();
        let notify = Arc::clone(&low);
        dc.on_close(Box::new(move || {
            let tx = tx.clone();
            let notify = Arc::clone(&notify);
            Box::pin(async move {
                notify.notify_waiters();
                let _ = tx.send(PeerEvent::ChannelClosed);
            })
        }));

        let tx = events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = tx.clone();
            Box::pin(async move {
                let frame = if msg.is_string {
                    WireFrame::Text(String::from_utf8_lossy(&msg.data).into_owned())
                } else {
                    WireFrame::Binary(msg.data)
                };
                let _ = tx.send(PeerEvent::ChannelMessage(frame));
            })
        }));

        let notify = Arc::clone(&low);
        dc.on_buffered_amount_low(Box::new(move || {
            let notify = Arc::clone(&notify);
            Box::pin(async move {
                notify.notify_waiters();
            })
        }))
        .await;

        Arc::new(Self { dc, low })
    }

    fn send_err(&self, err: webrtc::Error) -> ChannelError {
        if self.is_open() {
            ChannelError::Send(err.to_string())
        } else {
            ChannelError::Closed
        }
    }
}

#[async_trait]
impl DataChannel for RtcChannel {
    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: &str) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        self.dc
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(|e| self.send_err(e))
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| self.send_err(e))
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn drained(&self, threshold: usize) {
        self.dc.set_buffered_amount_low_threshold(threshold).await;
        loop {
            let notified = self.low.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_open() || self.dc.buffered_amount().await <= threshold {
                return;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(DRAIN_POLL) => {}
            }
        }
    }

    async fn close(&self) {
        if let Err(err) = self.dc.close().await {
            debug!(error = %err, "data channel close failed");
        }
    }
}
