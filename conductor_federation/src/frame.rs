//! Wire framing for action messages.
//!
//! Frame layout: `[u32 length][u8 version][u16 action][tagged fields...]`,
//! where `length` counts everything after the length prefix. Fields are
//! tag-length-value: a single-byte tag, a big-endian `u32` length, and the
//! value bytes. Unknown tags are skipped so old decoders tolerate new fields.
//! All integers are big-endian two's complement; strings are UTF-8 with a
//! two-byte length prefix inside the field value.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use conductor_core::{
    keys::{FederateId, InterfaceHandle},
    time::Time,
};
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::{Action, ActionMessage, MessageFlags};

pub const WIRE_VERSION: u8 = 1;

/// Frames larger than this are protocol violations, not allocations.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

mod tag {
    pub const SOURCE_ID: u8 = 0x01;
    pub const DEST_ID: u8 = 0x02;
    pub const SOURCE_HANDLE: u8 = 0x03;
    pub const DEST_HANDLE: u8 = 0x04;
    pub const ACTION_TIME: u8 = 0x05;
    pub const TE: u8 = 0x06;
    pub const TDEMIN: u8 = 0x07;
    pub const COUNTER: u8 = 0x08;
    pub const SEQUENCE: u8 = 0x09;
    pub const FLAGS: u8 = 0x0a;
    pub const PAYLOAD: u8 = 0x0b;
    pub const NAME: u8 = 0x0c;
}

/// A frame that decoded to malformed content.
///
/// Violations are data, not errors: the decoder consumes the bad frame and
/// reports it so the route can count violations and eventually tear down,
/// instead of killing the stream on the first corrupt frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),

    #[error("unknown action code {0:#x}")]
    UnknownAction(u16),

    #[error("frame of {0} bytes exceeds the maximum frame size")]
    Oversize(usize),

    #[error("truncated field (tag {tag:#x})")]
    Truncated { tag: u8 },

    #[error("malformed string field (tag {tag:#x})")]
    BadString { tag: u8 },
}

/// Output of the decoder: either a well-formed message or a consumed
/// violation.
#[derive(Debug)]
pub enum Frame {
    Message(ActionMessage),
    Violation(ProtocolViolation),
}

#[derive(Debug, Default)]
pub struct FrameCodec {
    _private: (),
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

fn put_field_i32(dst: &mut BytesMut, tag: u8, value: i32) {
    dst.put_u8(tag);
    dst.put_u32(4);
    dst.put_i32(value);
}

fn put_field_i64(dst: &mut BytesMut, tag: u8, value: i64) {
    dst.put_u8(tag);
    dst.put_u32(8);
    dst.put_i64(value);
}

impl Encoder<ActionMessage> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, msg: ActionMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        dst.put_u32(0); // patched below
        dst.put_u8(WIRE_VERSION);
        dst.put_u16(msg.action.to_wire());

        put_field_i32(dst, tag::SOURCE_ID, msg.source_id.raw());
        put_field_i32(dst, tag::DEST_ID, msg.dest_id.raw());
        put_field_i32(dst, tag::SOURCE_HANDLE, msg.source_handle.raw());
        put_field_i32(dst, tag::DEST_HANDLE, msg.dest_handle.raw());
        put_field_i64(dst, tag::ACTION_TIME, msg.action_time.as_nanos());
        put_field_i64(dst, tag::TE, msg.te.as_nanos());
        put_field_i64(dst, tag::TDEMIN, msg.tdemin.as_nanos());
        put_field_i32(dst, tag::COUNTER, msg.counter);
        put_field_i32(dst, tag::SEQUENCE, msg.sequence);

        dst.put_u8(tag::FLAGS);
        dst.put_u32(2);
        dst.put_u16(msg.flags.bits());

        if !msg.payload.is_empty() {
            dst.put_u8(tag::PAYLOAD);
            dst.put_u32(msg.payload.len() as u32);
            dst.put_slice(&msg.payload);
        }

        if let Some(name) = &msg.name {
            let utf8 = name.as_bytes();
            dst.put_u8(tag::NAME);
            dst.put_u32(2 + utf8.len() as u32);
            dst.put_u16(utf8.len() as u16);
            dst.put_slice(utf8);
        }

        let frame_len = (dst.len() - start - 4) as u32;
        dst[start..start + 4].copy_from_slice(&frame_len.to_be_bytes());
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let frame_len = u32::from_be_bytes(src[..4].try_into().unwrap()) as usize;
        if frame_len > MAX_FRAME_SIZE {
            // Consume what we have; the connection is unrecoverable anyway.
            src.clear();
            return Ok(Some(Frame::Violation(ProtocolViolation::Oversize(
                frame_len,
            ))));
        }
        if src.len() < 4 + frame_len {
            src.reserve(4 + frame_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let mut body = src.split_to(frame_len).freeze();
        Ok(Some(parse_body(&mut body)))
    }
}

fn parse_body(body: &mut Bytes) -> Frame {
    if body.remaining() < 3 {
        return Frame::Violation(ProtocolViolation::Truncated { tag: 0 });
    }
    let version = body.get_u8();
    if version != WIRE_VERSION {
        return Frame::Violation(ProtocolViolation::BadVersion(version));
    }
    let action_code = body.get_u16();
    let Some(action) = Action::from_wire(action_code) else {
        return Frame::Violation(ProtocolViolation::UnknownAction(action_code));
    };

    let mut msg = ActionMessage::new(action, FederateId::INVALID);
    while body.remaining() > 0 {
        if body.remaining() < 5 {
            return Frame::Violation(ProtocolViolation::Truncated { tag: 0 });
        }
        let tag = body.get_u8();
        let len = body.get_u32() as usize;
        if body.remaining() < len {
            return Frame::Violation(ProtocolViolation::Truncated { tag });
        }
        let mut value = body.split_to(len);
        match tag {
            tag::SOURCE_ID if len == 4 => msg.source_id = FederateId::new(value.get_i32()),
            tag::DEST_ID if len == 4 => msg.dest_id = FederateId::new(value.get_i32()),
            tag::SOURCE_HANDLE if len == 4 => {
                msg.source_handle = InterfaceHandle::new(value.get_i32())
            }
            tag::DEST_HANDLE if len == 4 => {
                msg.dest_handle = InterfaceHandle::new(value.get_i32())
            }
            tag::ACTION_TIME if len == 8 => msg.action_time = Time::from_nanos(value.get_i64()),
            tag::TE if len == 8 => msg.te = Time::from_nanos(value.get_i64()),
            tag::TDEMIN if len == 8 => msg.tdemin = Time::from_nanos(value.get_i64()),
            tag::COUNTER if len == 4 => msg.counter = value.get_i32(),
            tag::SEQUENCE if len == 4 => msg.sequence = value.get_i32(),
            tag::FLAGS if len == 2 => msg.flags = MessageFlags::from_bits(value.get_u16()),
            tag::PAYLOAD => msg.payload = value,
            tag::NAME => {
                if len < 2 {
                    return Frame::Violation(ProtocolViolation::BadString { tag });
                }
                let str_len = value.get_u16() as usize;
                if value.remaining() != str_len {
                    return Frame::Violation(ProtocolViolation::BadString { tag });
                }
                match String::from_utf8(value.to_vec()) {
                    Ok(name) => msg.name = Some(name),
                    Err(_) => return Frame::Violation(ProtocolViolation::BadString { tag }),
                }
            }
            // Unknown tag, or a known tag with an unexpected length from some
            // future revision: skip it.
            _ => {}
        }
    }

    Frame::Message(msg)
}
