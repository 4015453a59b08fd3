//! Unicast wire formats
//!
//! TCP frames: 4-byte big-endian length (type + payload), 2-byte type,
//! payload.
//!
//! UDP datagrams: 2-byte type, then an 8-byte packet id for CTRL and ACK,
//! then the payload for CTRL and DATA.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::LinkError;

pub const CTRL: u16 = 0;
pub const DATA: u16 = 1;
pub const HEARTBEAT: u16 = 2;
pub const ACK: u16 = 3;

pub const LENGTH_LEN: usize = 4;
pub const TYPE_LEN: usize = 2;
pub const PACKET_ID_LEN: usize = 8;

/// Message kinds carried by TCP frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Control,
    Data,
    Heartbeat,
}

impl MessageKind {
    pub fn from_code(code: u16) -> Result<Self, LinkError> {
        match code {
            CTRL => Ok(Self::Control),
            DATA => Ok(Self::Data),
            HEARTBEAT => Ok(Self::Heartbeat),
            other => Err(LinkError::UnknownMessageType(other)),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Self::Control => CTRL,
            Self::Data => DATA,
            Self::Heartbeat => HEARTBEAT,
        }
    }
}

/// One decoded TCP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub payload: Bytes,
}

pub fn encode_frame(kind: MessageKind, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_LEN + TYPE_LEN + payload.len());
    buf.put_u32((TYPE_LEN + payload.len()) as u32);
    buf.put_u16(kind.code());
    buf.put_slice(payload);
    buf.freeze()
}

/// Incremental TCP frame decoder over a growing read buffer
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    /// Take one complete frame off the front of `buf`, if there is one.
    ///
    /// A declared length beyond the input capacity, or too short to hold
    /// the type, is a fatal framing error.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>, LinkError> {
        if buf.len() < LENGTH_LEN {
            return Ok(None);
        }
        let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let max = self.max_payload + TYPE_LEN;
        if declared > max {
            return Err(LinkError::FrameTooLarge { declared, max });
        }
        if declared < TYPE_LEN {
            return Err(LinkError::Malformed("frame shorter than its type field"));
        }
        if buf.len() < LENGTH_LEN + declared {
            buf.reserve(LENGTH_LEN + declared - buf.len());
            return Ok(None);
        }

        buf.advance(LENGTH_LEN);
        let mut body = buf.split_to(declared).freeze();
        let kind = MessageKind::from_code(body.get_u16())?;
        Ok(Some(Frame { kind, payload: body }))
    }
}

/// One UDP datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    Control { packet_id: u64, payload: Bytes },
    Data(Bytes),
    Heartbeat,
    Ack(u64),
}

impl Datagram {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(TYPE_LEN + PACKET_ID_LEN + self.payload_len());
        match self {
            Self::Control { packet_id, payload } => {
                buf.put_u16(CTRL);
                buf.put_u64(*packet_id);
                buf.put_slice(payload);
            }
            Self::Data(payload) => {
                buf.put_u16(DATA);
                buf.put_slice(payload);
            }
            Self::Heartbeat => buf.put_u16(HEARTBEAT),
            Self::Ack(packet_id) => {
                buf.put_u16(ACK);
                buf.put_u64(*packet_id);
            }
        }
        buf.freeze()
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, LinkError> {
        let mut buf = datagram;
        if buf.remaining() < TYPE_LEN {
            return Err(LinkError::Malformed("datagram shorter than its type field"));
        }
        match buf.get_u16() {
            CTRL => {
                if buf.remaining() < PACKET_ID_LEN {
                    return Err(LinkError::Malformed("control datagram without packet id"));
                }
                let packet_id = buf.get_u64();
                Ok(Self::Control {
                    packet_id,
                    payload: Bytes::copy_from_slice(buf),
                })
            }
            DATA => Ok(Self::Data(Bytes::copy_from_slice(buf))),
            HEARTBEAT => Ok(Self::Heartbeat),
            ACK => {
                if buf.remaining() != PACKET_ID_LEN {
                    return Err(LinkError::Malformed("acknowledgement of wrong length"));
                }
                Ok(Self::Ack(buf.get_u64()))
            }
            other => Err(LinkError::UnknownMessageType(other)),
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Self::Control { payload, .. } | Self::Data(payload) => payload.len(),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(decoder: &FrameDecoder, stream: &[u8]) -> Result<Vec<Frame>, LinkError> {
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        // Byte-at-a-time delivery exercises partial reads
        for byte in stream {
            buf.put_u8(*byte);
            while let Some(frame) = decoder.decode(&mut buf)? {
                frames.push(frame);
            }
        }
        Ok(frames)
    }

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(MessageKind::Data, b"abc");
        assert_eq!(&frame[..], &[0, 0, 0, 5, 0, 1, b'a', b'b', b'c']);
        let heartbeat = encode_frame(MessageKind::Heartbeat, &[]);
        assert_eq!(&heartbeat[..], &[0, 0, 0, 2, 0, 2]);
    }

    #[test]
    fn test_frames_reproduced_up_to_capacity() {
        let capacity = 64;
        let decoder = FrameDecoder::new(capacity);
        let mut stream = Vec::new();
        let mut expected = Vec::new();
        for len in 0..=capacity {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7 + len) as u8).collect();
            let kind = if len % 2 == 0 { MessageKind::Data } else { MessageKind::Control };
            stream.extend_from_slice(&encode_frame(kind, &payload));
            expected.push(Frame { kind, payload: Bytes::from(payload) });
        }

        let frames = feed(&decoder, &stream).unwrap();
        assert_eq!(frames, expected);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let decoder = FrameDecoder::new(16);
        let frame = encode_frame(MessageKind::Data, &[0u8; 17]);
        let mut buf = BytesMut::from(&frame[..LENGTH_LEN]);
        // Rejected from the header alone, before the body arrives
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(LinkError::FrameTooLarge { declared: 19, max: 18 })
        ));
    }

    #[test]
    fn test_bad_frames_are_protocol_violations() {
        let decoder = FrameDecoder::new(16);

        let mut short = BytesMut::from(&[0u8, 0, 0, 1, 0][..]);
        let err = decoder.decode(&mut short).unwrap_err();
        assert!(err.is_protocol_violation());

        let mut unknown = BytesMut::from(&[0u8, 0, 0, 2, 0, 9][..]);
        let err = decoder.decode(&mut unknown).unwrap_err();
        assert!(matches!(err, LinkError::UnknownMessageType(9)));
    }

    #[test]
    fn test_datagram_layouts() {
        let ctrl = Datagram::Control {
            packet_id: 0x0102,
            payload: Bytes::from_static(&[0, 4, 1]),
        };
        let bytes = ctrl.encode();
        assert_eq!(&bytes[..], &[0, 0, 0, 0, 0, 0, 0, 0, 1, 2, 0, 4, 1]);
        assert_eq!(Datagram::decode(&bytes).unwrap(), ctrl);

        assert_eq!(&Datagram::Heartbeat.encode()[..], &[0, 2]);
        assert_eq!(Datagram::decode(&[0, 3, 0, 0, 0, 0, 0, 0, 0, 7]).unwrap(), Datagram::Ack(7));
        assert_eq!(
            Datagram::decode(&[0, 1, 9, 9]).unwrap(),
            Datagram::Data(Bytes::from_static(&[9, 9]))
        );
    }

    #[test]
    fn test_malformed_datagrams() {
        assert!(Datagram::decode(&[0]).is_err());
        assert!(Datagram::decode(&[0, 0, 1, 2, 3]).is_err());
        assert!(Datagram::decode(&[0, 3, 1]).is_err());
        assert!(matches!(
            Datagram::decode(&[0, 42]),
            Err(LinkError::UnknownMessageType(42))
        ));
    }
}
