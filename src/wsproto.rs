use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

pub const WS_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Which side of the session this client is on.
///
/// The initiator (`host` on the wire) started the session; the joiner (`peer`)
/// arrived through the share link. The joiner is the polite peer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "host", alias = "initiator")]
    Initiator,
    #[serde(rename = "peer", alias = "joiner")]
    Joiner,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Initiator => "host",
            Role::Joiner => "peer",
        }
    }

    pub fn is_polite(self) -> bool {
        matches!(self, Role::Joiner)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Rollback,
}

/// Session description as exchanged through the relay (`{type, sdp}`).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Session id from the `o=` line. It stays fixed for the life of one peer
    /// connection, across renegotiation and ICE restarts.
    pub fn origin_session(&self) -> Option<&str> {
        self.sdp
            .lines()
            .find_map(|line| line.trim_end().strip_prefix("o="))
            .and_then(|origin| origin.split_whitespace().nth(1))
    }
}

/// ICE candidate in the browser `RTCIceCandidateInit` shape.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Messages exchanged with the relay, tagged by `type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    Join {
        #[serde(rename = "clientId")]
        client_id: String,
        role: Role,
    },
    Peers {
        #[serde(default)]
        peers: Vec<String>,
    },
    SdpOffer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        sdp: SessionDescription,
    },
    SdpAnswer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        sdp: SessionDescription,
    },
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        candidate: IceCandidate,
    },
    Ping,
    Pong,
    Leave,
    #[serde(other)]
    Unknown,
}

impl SignalMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Join { .. } => "join",
            SignalMessage::Peers { .. } => "peers",
            SignalMessage::SdpOffer { .. } => "sdp-offer",
            SignalMessage::SdpAnswer { .. } => "sdp-answer",
            SignalMessage::IceCandidate { .. } => "ice-candidate",
            SignalMessage::Ping => "ping",
            SignalMessage::Pong => "pong",
            SignalMessage::Leave => "leave",
            SignalMessage::Unknown => "unknown",
        }
    }

    /// Sender id stamped by the relay on forwarded messages.
    pub fn from(&self) -> Option<&str> {
        match self {
            SignalMessage::SdpOffer { from, .. }
            | SignalMessage::SdpAnswer { from, .. }
            | SignalMessage::IceCandidate { from, .. } => from.as_deref(),
            _ => None,
        }
    }

    /// Address a peer-to-peer message to `target`.
    pub fn addressed_to(mut self, target: &str) -> Self {
        match &mut self {
            SignalMessage::SdpOffer { to, .. }
            | SignalMessage::SdpAnswer { to, .. }
            | SignalMessage::IceCandidate { to, .. } => *to = Some(target.to_string()),
            _ => {}
        }
        self
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            SignalMessage::Join { client_id, .. } if client_id.trim().is_empty() => Err(
                ProtocolError::InvalidSignal("join without clientId".to_string()),
            ),
            SignalMessage::SdpOffer { sdp, .. } if sdp.kind != SdpKind::Offer => Err(
                ProtocolError::InvalidSignal(format!("sdp-offer carries {:?}", sdp.kind)),
            ),
            SignalMessage::SdpAnswer { sdp, .. } if sdp.kind != SdpKind::Answer => Err(
                ProtocolError::InvalidSignal(format!("sdp-answer carries {:?}", sdp.kind)),
            ),
            SignalMessage::SdpOffer { sdp, .. } | SignalMessage::SdpAnswer { sdp, .. }
                if sdp.sdp.trim().is_empty() =>
            {
                Err(ProtocolError::InvalidSignal("empty sdp".to_string()))
            }
            _ => Ok(()),
        }
    }
}

pub fn encode_text(msg: &SignalMessage) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(msg)?)
}

/// Decode and validate one relay text frame.
pub fn decode_text(raw: &str) -> Result<SignalMessage, ProtocolError> {
    if raw.len() > WS_MAX_MESSAGE_BYTES {
        return Err(ProtocolError::InvalidSignal(format!(
            "message of {} bytes exceeds limit",
            raw.len()
        )));
    }
    let msg: SignalMessage = serde_json::from_str(raw)?;
    msg.validate()?;
    Ok(msg)
}
