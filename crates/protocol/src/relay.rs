//! Relay signaling messages.
//!
//! # Wire format
//!
//! ```text
//! -> relay   {"create_room": true}
//! <- relay   {"request": "create_room", "id": ...}
//! -> relay   {"update_offer": {"id", "type", "sdp"}}
//! <- relay   {"request": "update_offer", "id": ...}            (ack)
//! -> relay   {"get_offer": {"id"}}
//! <- relay   {"request": "get_offer", "id", "type", "sdp"}
//! -> relay   {"create_answer": {"id", "type", "sdp"}}
//! <- relay   {"request": "recv_answer", "id", "type", "sdp"}
//! -> relay   {"ice_update": {"id", "peer", "ice_candidate"}}
//! <- relay   {"request": "ice_candidate", "id", "ice_candidate"}
//! <- relay   {"request": "error", "id"?, "message"}
//! ```

use serde::{Deserialize, Serialize};

use crate::ProtocolError;
use crate::types::{IceCandidate, PeerRole, RoomId, SdpType, SessionDescription};

/// A message sent from a peer to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayRequest {
    /// Request a new room id. The flag is always `true` on the wire.
    CreateRoom(bool),
    /// Publish the sender's offer.
    UpdateOffer(DescriptionUpdate),
    /// Ask for the offer stored in a room.
    GetOffer(RoomRef),
    /// Publish the receiver's answer.
    CreateAnswer(DescriptionUpdate),
    /// Publish one local ICE candidate.
    IceUpdate(IceUpdate),
}

/// A session description addressed to a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptionUpdate {
    pub id: RoomId,
    #[serde(flatten)]
    pub description: SessionDescription,
}

/// A bare room reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomRef {
    pub id: RoomId,
}

/// An ICE candidate tagged with its room and the publishing role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceUpdate {
    pub id: RoomId,
    pub peer: PeerRole,
    pub ice_candidate: IceCandidate,
}

impl RelayRequest {
    pub fn create_room() -> Self {
        RelayRequest::CreateRoom(true)
    }

    pub fn update_offer(id: RoomId, description: SessionDescription) -> Self {
        RelayRequest::UpdateOffer(DescriptionUpdate { id, description })
    }

    pub fn get_offer(id: RoomId) -> Self {
        RelayRequest::GetOffer(RoomRef { id })
    }

    pub fn create_answer(id: RoomId, description: SessionDescription) -> Self {
        RelayRequest::CreateAnswer(DescriptionUpdate { id, description })
    }

    pub fn ice_update(id: RoomId, peer: PeerRole, ice_candidate: IceCandidate) -> Self {
        RelayRequest::IceUpdate(IceUpdate {
            id,
            peer,
            ice_candidate,
        })
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// A message delivered by the relay to a peer, discriminated by `request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum RelayMessage {
    /// A room id was assigned.
    CreateRoom { id: RoomId },
    /// The offer was stored.
    UpdateOffer { id: RoomId },
    /// The offer for a room, delivered to the receiver.
    GetOffer {
        id: RoomId,
        #[serde(rename = "type")]
        sdp_type: SdpType,
        sdp: String,
    },
    /// The receiver's answer, delivered to the sender.
    RecvAnswer {
        id: RoomId,
        #[serde(rename = "type")]
        sdp_type: SdpType,
        sdp: String,
    },
    /// A candidate published by the other peer of the room.
    IceCandidate {
        id: RoomId,
        ice_candidate: IceCandidate,
    },
    /// The relay refused a request.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<RoomId>,
        message: String,
    },
    /// Forward compatibility: unknown requests deserialize here.
    #[serde(other)]
    Unknown,
}

impl RelayMessage {
    pub fn offer(id: RoomId, description: SessionDescription) -> Self {
        RelayMessage::GetOffer {
            id,
            sdp_type: description.sdp_type,
            sdp: description.sdp,
        }
    }

    pub fn answer(id: RoomId, description: SessionDescription) -> Self {
        RelayMessage::RecvAnswer {
            id,
            sdp_type: description.sdp_type,
            sdp: description.sdp,
        }
    }

    pub fn error(id: Option<RoomId>, message: impl Into<String>) -> Self {
        RelayMessage::Error {
            id,
            message: message.into(),
        }
    }

    /// The room this message refers to, if any.
    pub fn room_id(&self) -> Option<&RoomId> {
        match self {
            RelayMessage::CreateRoom { id }
            | RelayMessage::UpdateOffer { id }
            | RelayMessage::GetOffer { id, .. }
            | RelayMessage::RecvAnswer { id, .. }
            | RelayMessage::IceCandidate { id, .. } => Some(id),
            RelayMessage::Error { id, .. } => id.as_ref(),
            RelayMessage::Unknown => None,
        }
    }

    /// The session description carried by offer/answer deliveries.
    pub fn description(&self) -> Option<SessionDescription> {
        match self {
            RelayMessage::GetOffer { sdp_type, sdp, .. }
            | RelayMessage::RecvAnswer { sdp_type, sdp, .. } => Some(SessionDescription {
                sdp_type: *sdp_type,
                sdp: sdp.clone(),
            }),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_room_request_shape() {
        let json = RelayRequest::create_room().to_json().unwrap();
        assert_eq!(json, r#"{"create_room":true}"#);
    }

    #[test]
    fn update_offer_request_shape() {
        let req = RelayRequest::update_offer("ABC123".into(), SessionDescription::offer("v=0"));
        let value: serde_json::Value = serde_json::from_str(&req.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"update_offer": {"id": "ABC123", "type": "offer", "sdp": "v=0"}})
        );
    }

    #[test]
    fn get_offer_request_shape() {
        let value = serde_json::to_value(RelayRequest::get_offer("ABC123".into())).unwrap();
        assert_eq!(value, json!({"get_offer": {"id": "ABC123"}}));
    }

    #[test]
    fn ice_update_carries_role() {
        let req = RelayRequest::ice_update(
            "r1".into(),
            PeerRole::Receiver,
            IceCandidate::new("candidate:1"),
        );
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["ice_update"]["peer"], "receiver");
        assert_eq!(value["ice_update"]["ice_candidate"]["candidate"], "candidate:1");
    }

    #[test]
    fn request_parses_from_browser_json() {
        let text = r#"{"create_answer":{"type":"answer","sdp":"v=0","id":"r9"}}"#;
        let req = RelayRequest::from_json(text).unwrap();
        assert_eq!(
            req,
            RelayRequest::create_answer("r9".into(), SessionDescription::answer("v=0"))
        );
    }

    #[test]
    fn message_dispatch_on_request_field() {
        let msg = RelayMessage::from_json(r#"{"request":"create_room","id":"ABC123"}"#).unwrap();
        assert_eq!(msg, RelayMessage::CreateRoom { id: "ABC123".into() });

        let msg = RelayMessage::from_json(
            r#"{"request":"recv_answer","id":"ABC123","type":"answer","sdp":"v=0"}"#,
        )
        .unwrap();
        assert_eq!(msg.description(), Some(SessionDescription::answer("v=0")));
        assert_eq!(msg.room_id(), Some(&RoomId::from("ABC123")));
    }

    #[test]
    fn ice_candidate_message_decodes() {
        let text = r#"{"request":"ice_candidate","id":"r1","ice_candidate":{"candidate":"candidate:1","sdpMid":"0","sdpMLineIndex":0}}"#;
        match RelayMessage::from_json(text).unwrap() {
            RelayMessage::IceCandidate { id, ice_candidate } => {
                assert_eq!(id.as_str(), "r1");
                assert_eq!(ice_candidate.sdp_m_line_index, Some(0));
            }
            other => panic!("expected ice_candidate, got {other:?}"),
        }
    }

    #[test]
    fn unknown_request_is_tolerated() {
        let msg = RelayMessage::from_json(r#"{"request":"room_stats","rooms":3}"#).unwrap();
        assert_eq!(msg, RelayMessage::Unknown);
        assert!(msg.room_id().is_none());
    }

    #[test]
    fn malformed_message_is_an_error() {
        assert!(RelayMessage::from_json("not json").is_err());
        assert!(RelayMessage::from_json(r#"{"id":"r1"}"#).is_err());
    }

    #[test]
    fn error_message_omits_missing_id() {
        let json = RelayMessage::error(None, "room limit reached")
            .to_json()
            .unwrap();
        assert_eq!(json, r#"{"request":"error","message":"room limit reached"}"#);
    }
}
