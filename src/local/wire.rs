//! Multicast subgroup message codec
//!
//! Every message starts with a 2-byte big-endian type and a 4-byte session
//! id. Status-carrying messages add one status byte; APP messages carry the
//! raw payload in the remainder of the datagram.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::protocol::ManagerStatus;

pub const JOIN_REQUEST: u16 = 1;
pub const JOIN_RESPONSE: u16 = 2;
pub const DROP: u16 = 4;
pub const HEARTBEAT: u16 = 8;
pub const APP: u16 = 32;

/// Type + session id
pub const HEADER_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalMessage {
    JoinRequest { session_id: i32, status: ManagerStatus },
    JoinResponse { session_id: i32, status: ManagerStatus },
    Drop { session_id: i32 },
    Heartbeat { session_id: i32, status: ManagerStatus },
    App { session_id: i32, payload: Bytes },
}

impl LocalMessage {
    pub fn session_id(&self) -> i32 {
        match self {
            Self::JoinRequest { session_id, .. }
            | Self::JoinResponse { session_id, .. }
            | Self::Drop { session_id }
            | Self::Heartbeat { session_id, .. }
            | Self::App { session_id, .. } => *session_id,
        }
    }

    /// Whether a channel bound to `session_id` should deliver this message.
    ///
    /// APP traffic additionally requires the local session id to be positive.
    pub fn accepted_by(&self, session_id: i32) -> bool {
        match self {
            Self::App { .. } => session_id > 0 && self.session_id() == session_id,
            _ => self.session_id() == session_id,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.body_len());
        match self {
            Self::JoinRequest { session_id, status } => {
                buf.put_u16(JOIN_REQUEST);
                buf.put_i32(*session_id);
                buf.put_u8(status.as_byte());
            }
            Self::JoinResponse { session_id, status } => {
                buf.put_u16(JOIN_RESPONSE);
                buf.put_i32(*session_id);
                buf.put_u8(status.as_byte());
            }
            Self::Drop { session_id } => {
                buf.put_u16(DROP);
                buf.put_i32(*session_id);
            }
            Self::Heartbeat { session_id, status } => {
                buf.put_u16(HEARTBEAT);
                buf.put_i32(*session_id);
                buf.put_u8(status.as_byte());
            }
            Self::App { session_id, payload } => {
                buf.put_u16(APP);
                buf.put_i32(*session_id);
                buf.put_slice(payload);
            }
        }
        buf.freeze()
    }

    /// Parse one datagram. Unknown types, wrong lengths and invalid status
    /// bytes yield `None`; the caller discards those silently.
    pub fn decode(datagram: &[u8]) -> Option<Self> {
        let mut buf = datagram;
        if buf.remaining() < HEADER_LEN {
            return None;
        }
        let kind = buf.get_u16();
        let session_id = buf.get_i32();

        match kind {
            JOIN_REQUEST | JOIN_RESPONSE | HEARTBEAT => {
                if buf.remaining() != 1 {
                    return None;
                }
                let status = ManagerStatus::from_byte(buf.get_u8())?;
                Some(match kind {
                    JOIN_REQUEST => Self::JoinRequest { session_id, status },
                    JOIN_RESPONSE => Self::JoinResponse { session_id, status },
                    _ => Self::Heartbeat { session_id, status },
                })
            }
            DROP if !buf.has_remaining() => Some(Self::Drop { session_id }),
            APP => Some(Self::App {
                session_id,
                payload: Bytes::copy_from_slice(buf),
            }),
            _ => None,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Self::Drop { .. } => 0,
            Self::App { payload, .. } => payload.len(),
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_message_layout() {
        let msg = LocalMessage::Heartbeat {
            session_id: 0x01020304,
            status: ManagerStatus::IsManager,
        };
        let bytes = msg.encode();
        assert_eq!(&bytes[..], &[0x00, 0x08, 0x01, 0x02, 0x03, 0x04, 0x02]);
        assert_eq!(LocalMessage::decode(&bytes), Some(msg));
    }

    #[test]
    fn test_app_message_keeps_payload() {
        let msg = LocalMessage::App {
            session_id: 9,
            payload: Bytes::from_static(b"\x01hello"),
        };
        let bytes = msg.encode();
        assert_eq!(bytes.len(), HEADER_LEN + 6);
        assert_eq!(LocalMessage::decode(&bytes), Some(msg));

        // Empty payload is still a valid APP message
        let empty = LocalMessage::App { session_id: 9, payload: Bytes::new() };
        assert_eq!(LocalMessage::decode(&empty.encode()), Some(empty));
    }

    #[test]
    fn test_wrong_lengths_discarded() {
        let mut join = LocalMessage::JoinRequest {
            session_id: 3,
            status: ManagerStatus::CanManage,
        }
        .encode()
        .to_vec();
        join.push(0);
        assert_eq!(LocalMessage::decode(&join), None);
        assert_eq!(LocalMessage::decode(&join[..HEADER_LEN]), None);

        let mut drop = LocalMessage::Drop { session_id: 3 }.encode().to_vec();
        assert!(LocalMessage::decode(&drop).is_some());
        drop.push(1);
        assert_eq!(LocalMessage::decode(&drop), None);

        assert_eq!(LocalMessage::decode(&[0, 1, 0]), None);
        // Unknown type
        assert_eq!(LocalMessage::decode(&[0, 16, 0, 0, 0, 3]), None);
        // Invalid status byte
        assert_eq!(LocalMessage::decode(&[0, 8, 0, 0, 0, 3, 9]), None);
    }

    #[test]
    fn test_session_filtering() {
        let heartbeat = LocalMessage::Heartbeat {
            session_id: 0,
            status: ManagerStatus::CanManage,
        };
        assert!(heartbeat.accepted_by(0));
        assert!(!heartbeat.accepted_by(1));

        let app = LocalMessage::App { session_id: 0, payload: Bytes::new() };
        assert!(!app.accepted_by(0));
        let app = LocalMessage::App { session_id: 5, payload: Bytes::new() };
        assert!(app.accepted_by(5));
        assert!(!app.accepted_by(6));
    }
}
