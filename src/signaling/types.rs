use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Bytes, Message, Utf8Bytes};

use super::code::{BASE_LEN, CODE_LEN, checksum, symbol_index};

/// Signaling server errors
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("room not found: {0}")]
    RoomNotFound(RoomCode),

    #[error("room is full: {0}")]
    RoomFull(RoomCode),

    #[error("connection {0} is already in a room")]
    AlreadyInRoom(ConnId),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SignalingError {
    /// Reason string carried by `error{reason}` on the wire.
    pub fn wire_reason(&self) -> &'static str {
        match self {
            SignalingError::RoomNotFound(_) => "NO_ROOM",
            SignalingError::RoomFull(_) => "ROOM_FULL",
            SignalingError::AlreadyInRoom(_) => "ALREADY_IN_ROOM",
            SignalingError::Internal(_) => "INTERNAL",
        }
    }
}

/// Why a piece of text is not a room code.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodeError {
    #[error("room code must be {CODE_LEN} characters, got {0}")]
    Length(usize),

    #[error("invalid room code character: {0:?}")]
    Alphabet(char),

    #[error("room code checksum mismatch")]
    Checksum,
}

/// Room code: 7 random symbols followed by one checksum symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoomCode {
    bytes: [u8; CODE_LEN],
}

impl RoomCode {
    /// Builds a code from a base, appending its checksum.
    pub(crate) fn from_base(base: [u8; BASE_LEN]) -> Self {
        let mut bytes = [0u8; CODE_LEN];
        bytes[..BASE_LEN].copy_from_slice(&base);
        bytes[BASE_LEN] = checksum(&base);
        Self { bytes }
    }

    /// Parses user-typed text into canonical (uppercase) form.
    pub fn parse(s: &str) -> Result<Self, CodeError> {
        let s = s.trim();
        let count = s.chars().count();
        if count != CODE_LEN {
            return Err(CodeError::Length(count));
        }

        let mut bytes = [0u8; CODE_LEN];
        for (slot, c) in bytes.iter_mut().zip(s.chars()) {
            let upper = c.to_ascii_uppercase();
            if !upper.is_ascii() || symbol_index(upper as u8).is_none() {
                return Err(CodeError::Alphabet(c));
            }
            *slot = upper as u8;
        }

        let mut base = [0u8; BASE_LEN];
        base.copy_from_slice(&bytes[..BASE_LEN]);
        if checksum(&base) != bytes[BASE_LEN] {
            return Err(CodeError::Checksum);
        }
        Ok(Self { bytes })
    }

    pub fn base(&self) -> [u8; BASE_LEN] {
        let mut base = [0u8; BASE_LEN];
        base.copy_from_slice(&self.bytes[..BASE_LEN]);
        base
    }

    pub fn as_str(&self) -> &str {
        // Only ALPHABET bytes are ever stored.
        std::str::from_utf8(&self.bytes).unwrap_or("")
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RoomCode {
    type Err = CodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for RoomCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RoomCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        RoomCode::parse(&s).map_err(serde::de::Error::custom)
    }
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one server-side connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    pub fn next() -> Self {
        Self(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A WebSocket data frame. Both variants clone in O(1) for broadcast.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(Utf8Bytes),
    Binary(Bytes),
}

impl Frame {
    pub fn into_message(self) -> Message {
        match self {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
        }
    }
}

impl From<String> for Frame {
    fn from(s: String) -> Self {
        Self::Text(Utf8Bytes::from(s))
    }
}

/// Registry-side view of a connection: its id and the writer feeding its socket.
///
/// The registry never owns the socket; dropping a `Member` only drops a
/// sender clone.
#[derive(Debug, Clone)]
pub struct Member {
    pub id: ConnId,
    pub tx: mpsc::UnboundedSender<Frame>,
}

impl Member {
    pub fn new(id: ConnId, tx: mpsc::UnboundedSender<Frame>) -> Self {
        Self { id, tx }
    }

    /// Writable while the connection's writer task is alive.
    pub fn is_writable(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Fire-and-forget write. Returns false if the frame was dropped.
    pub fn deliver(&self, msg: Frame) -> bool {
        self.is_writable() && self.tx.send(msg).is_ok()
    }
}

/// An open room. Never empty: the registry removes it with its last member.
#[derive(Debug)]
pub(crate) struct Room {
    pub members: Vec<Member>,
}

impl Room {
    pub fn contains(&self, id: ConnId) -> bool {
        self.members.iter().any(|m| m.id == id)
    }

    /// Delivers `msg` to every writable member except `except`.
    pub fn broadcast(&self, msg: &Frame, except: Option<ConnId>) -> usize {
        self.members
            .iter()
            .filter(|m| Some(m.id) != except)
            .filter(|m| m.deliver(msg.clone()))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::code::{ALPHABET, CodeAllocator};

    #[test]
    fn parse_accepts_allocated_code() {
        let code = CodeAllocator::new().allocate(|_| false);
        assert_eq!(RoomCode::parse(code.as_str()), Ok(code));
    }

    #[test]
    fn parse_canonicalizes_lowercase_and_whitespace() {
        let code = CodeAllocator::new().allocate(|_| false);
        let typed = format!("  {}\n", code.as_str().to_ascii_lowercase());
        let parsed = RoomCode::parse(&typed).unwrap();
        assert_eq!(parsed, code);
        assert!(parsed.as_str().bytes().all(|b| ALPHABET.contains(&b)));
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert_eq!(RoomCode::parse("ABC"), Err(CodeError::Length(3)));
        assert_eq!(RoomCode::parse("ABCDEFGHJ"), Err(CodeError::Length(9)));
    }

    #[test]
    fn parse_rejects_ambiguous_symbols() {
        // 'O' and 'I' are excluded from the alphabet.
        assert_eq!(RoomCode::parse("OOOOOOO0"), Err(CodeError::Alphabet('O')));
        assert_eq!(RoomCode::parse("1234567I"), Err(CodeError::Alphabet('I')));
    }

    #[test]
    fn parse_rejects_bad_checksum() {
        let code = RoomCode::from_base(*b"ABCDEFG");
        let mut text = code.as_str().to_string();
        let last = text.pop().unwrap();
        let wrong = if last == '0' { '1' } else { '0' };
        text.push(wrong);
        assert_eq!(RoomCode::parse(&text), Err(CodeError::Checksum));
    }

    #[test]
    fn room_code_display() {
        let code = RoomCode::from_base(*b"2345678");
        assert_eq!(format!("{}", code), code.as_str());
        assert!(code.as_str().starts_with("2345678"));
    }

    #[test]
    fn room_code_serialization() {
        let code = RoomCode::from_base(*b"HJKMNPQ");
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, format!("\"{}\"", code));
        let back: RoomCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, code);
    }

    #[test]
    fn room_code_deserialization_rejects_garbage() {
        assert!(serde_json::from_str::<RoomCode>("\"nope\"").is_err());
    }

    #[test]
    fn conn_ids_are_unique() {
        let a = ConnId::next();
        let b = ConnId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn member_with_closed_writer_is_not_writable() {
        let (tx, rx) = mpsc::unbounded_channel();
        let member = Member::new(ConnId::next(), tx);
        assert!(member.is_writable());
        drop(rx);
        assert!(!member.is_writable());
        assert!(!member.deliver(Frame::from("x".to_string())));
    }

    #[test]
    fn wire_reasons() {
        let code = RoomCode::from_base(*b"ABCDEFG");
        assert_eq!(SignalingError::RoomNotFound(code).wire_reason(), "NO_ROOM");
        assert_eq!(SignalingError::RoomFull(code).wire_reason(), "ROOM_FULL");
    }
}
