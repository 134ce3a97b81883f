use std::fmt;

use serde::{Deserialize, Serialize};

/// Relay-issued identifier pairing one sender attempt with one receiver attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for RoomId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Which side of a transfer a peer plays.
///
/// Tags ICE updates so the relay knows which connection to forward them to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Sender,
    Receiver,
}

impl PeerRole {
    /// The role on the other end of the room.
    pub fn opposite(self) -> Self {
        match self {
            PeerRole::Sender => PeerRole::Receiver,
            PeerRole::Receiver => PeerRole::Sender,
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Sender => f.write_str("sender"),
            PeerRole::Receiver => f.write_str("receiver"),
        }
    }
}

/// Session description type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// An offer or answer: a type plus an opaque SDP payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A network reachability hint, shaped like a browser `RTCIceCandidateInit`.
///
/// The relay forwards it verbatim; only `candidate` is inspected, to drop
/// end-of-candidates markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    /// `true` for the empty candidate that signals the end of gathering.
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_id_is_a_bare_string_on_the_wire() {
        let id = RoomId::from("ABC123");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"ABC123\"");
        assert_eq!(id.to_string(), "ABC123");
    }

    #[test]
    fn peer_role_serialization() {
        assert_eq!(
            serde_json::to_string(&PeerRole::Sender).unwrap(),
            "\"sender\""
        );
        let role: PeerRole = serde_json::from_str("\"receiver\"").unwrap();
        assert_eq!(role, PeerRole::Receiver);
        assert_eq!(role.opposite(), PeerRole::Sender);
    }

    #[test]
    fn unknown_role_is_rejected() {
        assert!(serde_json::from_str::<PeerRole>("\"observer\"").is_err());
    }

    #[test]
    fn ice_candidate_uses_browser_field_names() {
        let cand = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 192.0.2.1 54400 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        };
        let json = serde_json::to_value(&cand).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
        assert!(json.get("usernameFragment").is_none());
    }

    #[test]
    fn end_of_candidates_marker() {
        assert!(IceCandidate::new("").is_end_of_candidates());
        assert!(!IceCandidate::new("candidate:1").is_end_of_candidates());
    }

    #[test]
    fn description_type_field() {
        let desc = SessionDescription::answer("v=0");
        let json = serde_json::to_string(&desc).unwrap();
        assert_eq!(json, r#"{"type":"answer","sdp":"v=0"}"#);
    }
}
