use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{Frame, RoomCode};

/// Signaling wire message, one JSON object per frame.
///
/// `join` carries the raw text the user typed so that a malformed code can
/// still be answered with `NO_ROOM` instead of being dropped as unparseable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    /// Ask for a new room (client → server)
    Create,

    /// Room created, share `code` out of band (server → client)
    Created { code: RoomCode },

    /// Join the room named by `code` (client → server)
    Join { code: String },

    /// Joined successfully (server → client)
    Joined { code: RoomCode },

    /// Leave the current room without closing the connection (client → server)
    Leave,

    /// Opaque negotiation blob for the other member; never inspected by the server
    Signal { payload: Value },

    /// Another member joined the room
    PeerJoin,

    /// Another member left the room
    PeerLeave,

    /// Recoverable failure, e.g. `NO_ROOM`
    Error { reason: String },
}

impl Envelope {
    pub fn to_frame(&self) -> Result<Frame, serde_json::Error> {
        Ok(Frame::from(serde_json::to_string(self)?))
    }

    /// Parses a text frame, returning `None` for anything malformed.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_create() {
        let msg = Envelope::parse(r#"{"type": "create"}"#).unwrap();
        assert_eq!(msg, Envelope::Create);
    }

    #[test]
    fn parse_join() {
        let msg = Envelope::parse(r#"{"type": "join", "code": "abc12345"}"#).unwrap();
        assert_eq!(
            msg,
            Envelope::Join {
                code: "abc12345".to_string()
            }
        );
    }

    #[test]
    fn parse_signal_keeps_payload_verbatim() {
        let raw = r#"{"type":"signal","payload":{"sdp":"v=0\r\n","nested":[1,2,{"x":null}]}}"#;
        let msg = Envelope::parse(raw).unwrap();
        assert_eq!(
            msg,
            Envelope::Signal {
                payload: json!({"sdp": "v=0\r\n", "nested": [1, 2, {"x": null}]})
            }
        );
    }

    #[test]
    fn parse_rejects_unknown_type() {
        assert!(Envelope::parse(r#"{"type": "explode"}"#).is_none());
        assert!(Envelope::parse(r#"{"code": "ABCDEFGH"}"#).is_none());
        assert!(Envelope::parse("not json").is_none());
    }

    #[test]
    fn serialize_membership_tags() {
        assert_eq!(
            serde_json::to_string(&Envelope::PeerJoin).unwrap(),
            r#"{"type":"peer-join"}"#
        );
        assert_eq!(
            serde_json::to_string(&Envelope::PeerLeave).unwrap(),
            r#"{"type":"peer-leave"}"#
        );
    }

    #[test]
    fn parse_leave() {
        assert_eq!(Envelope::parse(r#"{"type":"leave"}"#), Some(Envelope::Leave));
        assert_eq!(
            serde_json::to_string(&Envelope::Leave).unwrap(),
            r#"{"type":"leave"}"#
        );
    }

    #[test]
    fn serialize_error() {
        let msg = Envelope::Error {
            reason: "NO_ROOM".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"error","reason":"NO_ROOM"}"#);
    }

    #[test]
    fn serialize_created() {
        let code = RoomCode::from_base(*b"K7M2P9X");
        let json = serde_json::to_string(&Envelope::Created { code }).unwrap();
        assert!(json.contains("created"));
        assert!(json.contains(code.as_str()));
    }
}
