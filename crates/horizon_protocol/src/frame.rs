//! Length-prefixed binary framing.
//!
//! Frame layout, all integers big-endian:
//!
//! ```text
//! [tag: u16][length: u32][kind: u8][sequence: i64][module: i16][method: i8]
//! [caller identity: i64]            internal requests only
//! [hint length: u8][hint: utf-8]    only when bit 0x80 of kind is set
//! [body]
//! ```
//!
//! `length` counts every byte after the length field. The origin hint flag may
//! only be set on internal requests; frames without a hint keep the plain layout.

use crate::error::FrameError;
use crate::message::{Message, MessageKind, ProtocolFamily, ProtocolId};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Bytes before the length-covered part: the tag and the length field.
pub const PREFIX_LEN: usize = 6;
/// Kind, sequence number, module and method.
pub const HEADER_LEN: usize = 1 + 8 + 2 + 1;
pub const CALLER_IDENTITY_LEN: usize = 8;
/// Frames larger than this are rejected unless configured otherwise.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

const ORIGIN_HINT_FLAG: u8 = 0x80;
const KIND_MASK: u8 = 0x7F;

/// Value of the length field for `message`.
pub fn frame_length(message: &Message) -> usize {
    let mut length = HEADER_LEN + message.body().len();
    if message.carries_caller() {
        length += CALLER_IDENTITY_LEN;
        if let Some(hint) = message.origin_hint() {
            length += 1 + hint.len();
        }
    }
    length
}

/// Appends the frame for `message` to `dst`.
pub fn encode(message: &Message, dst: &mut BytesMut) -> Result<(), FrameError> {
    let hint = if message.carries_caller() {
        message.origin_hint()
    } else {
        None
    };
    if let Some(hint) = hint {
        if hint.len() > u8::MAX as usize {
            return Err(FrameError::OriginHintTooLong(hint.len()));
        }
    }

    let length = frame_length(message);
    let length_field = u32::try_from(length).map_err(|_| FrameError::FrameTooLarge {
        length,
        max: u32::MAX as usize,
    })?;

    dst.reserve(PREFIX_LEN + length);
    dst.put_u16(message.family().tag());
    dst.put_u32(length_field);

    let mut kind = message.kind().as_u8();
    if hint.is_some() {
        kind |= ORIGIN_HINT_FLAG;
    }
    dst.put_u8(kind);
    dst.put_i64(message.sequence_number());
    dst.put_i16(message.protocol_id().module);
    dst.put_i8(message.protocol_id().method);

    if message.carries_caller() {
        dst.put_i64(message.caller_identity());
        if let Some(hint) = hint {
            dst.put_u8(hint.len() as u8);
            dst.put_slice(hint.as_bytes());
        }
    }
    dst.put_slice(message.body());
    Ok(())
}

/// Encodes `message` into a standalone buffer, as used for WebSocket payloads.
pub fn encode_to_bytes(message: &Message) -> Result<Bytes, FrameError> {
    let mut buffer = BytesMut::with_capacity(PREFIX_LEN + frame_length(message));
    encode(message, &mut buffer)?;
    Ok(buffer.freeze())
}

/// Incremental decoder for a byte stream.
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    max_frame_length: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    /// Takes one complete frame off the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; `src` is left untouched
    /// in that case. The header is validated as soon as it is available, so an
    /// unknown tag or an oversized length fails before the body arrives.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Message>, FrameError> {
        if src.len() < PREFIX_LEN {
            return Ok(None);
        }

        let tag = u16::from_be_bytes([src[0], src[1]]);
        let family = ProtocolFamily::from_tag(tag).ok_or(FrameError::UnknownFamily(tag))?;
        let length = u32::from_be_bytes([src[2], src[3], src[4], src[5]]) as usize;
        self.check_length(length)?;

        if src.len() < PREFIX_LEN + length {
            src.reserve(PREFIX_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(PREFIX_LEN);
        let frame = src.split_to(length).freeze();
        decode_payload(family, frame).map(Some)
    }

    /// Decodes a buffer that must hold exactly one frame.
    pub fn decode_frame(&self, frame: &[u8]) -> Result<Message, FrameError> {
        if frame.len() < PREFIX_LEN {
            return Err(FrameError::Truncated {
                needed: PREFIX_LEN,
                have: frame.len(),
            });
        }

        let tag = u16::from_be_bytes([frame[0], frame[1]]);
        let family = ProtocolFamily::from_tag(tag).ok_or(FrameError::UnknownFamily(tag))?;
        let length = u32::from_be_bytes([frame[2], frame[3], frame[4], frame[5]]) as usize;
        self.check_length(length)?;

        let payload = &frame[PREFIX_LEN..];
        if payload.len() != length {
            return Err(FrameError::InvalidHeader(format!(
                "length field says {} bytes, payload has {}",
                length,
                payload.len()
            )));
        }
        decode_payload(family, Bytes::copy_from_slice(payload))
    }

    fn check_length(&self, length: usize) -> Result<(), FrameError> {
        if length < HEADER_LEN {
            return Err(FrameError::FrameTooShort {
                length,
                minimum: HEADER_LEN,
            });
        }
        if length > self.max_frame_length {
            return Err(FrameError::FrameTooLarge {
                length,
                max: self.max_frame_length,
            });
        }
        Ok(())
    }
}

fn decode_payload(family: ProtocolFamily, mut frame: Bytes) -> Result<Message, FrameError> {
    let raw_kind = frame.get_u8();
    let has_hint = raw_kind & ORIGIN_HINT_FLAG != 0;
    let kind = MessageKind::from_u8(raw_kind & KIND_MASK)
        .ok_or(FrameError::UnknownKind(raw_kind & KIND_MASK))?;
    let sequence_number = frame.get_i64();
    let protocol_id = ProtocolId::new(frame.get_i16(), frame.get_i8());

    if family != ProtocolFamily::Internal || kind != MessageKind::Request {
        if has_hint {
            return Err(FrameError::InvalidHeader(format!(
                "origin hint flag on a {family} {kind:?} frame"
            )));
        }
        return Ok(match kind {
            MessageKind::Request => Message::request(family, sequence_number, protocol_id, frame),
            MessageKind::Response => Message::response(family, sequence_number, protocol_id, frame),
            MessageKind::HeartbeatRequest => Message::heartbeat_request(family),
            MessageKind::HeartbeatResponse => Message::heartbeat_response(family),
        });
    }

    ensure_remaining(&frame, CALLER_IDENTITY_LEN)?;
    let caller_identity = frame.get_i64();

    let origin_hint = if has_hint {
        ensure_remaining(&frame, 1)?;
        let hint_len = frame.get_u8() as usize;
        ensure_remaining(&frame, hint_len)?;
        let raw = frame.split_to(hint_len);
        let hint = std::str::from_utf8(&raw)
            .map_err(|e| FrameError::InvalidHeader(format!("origin hint is not utf-8: {e}")))?;
        Some(hint.to_string())
    } else {
        None
    };

    let message = Message::peer_request(sequence_number, protocol_id, caller_identity, frame);
    Ok(match origin_hint {
        Some(hint) => message.with_origin_hint(hint),
        None => message,
    })
}

fn ensure_remaining(frame: &Bytes, needed: usize) -> Result<(), FrameError> {
    if frame.remaining() < needed {
        return Err(FrameError::Truncated {
            needed,
            have: frame.remaining(),
        });
    }
    Ok(())
}
