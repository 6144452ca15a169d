// Compact binary codec
// Big-endian frames: kind byte, then fixed fields, then length-prefixed strings

use tracing::error;

use super::{validate_heartbeat, CodecError, Decoded, MessageCodec};
use crate::net::messages::{ErrorMessage, HeartbeatMessage, MessageType, StatusMessage};

/// identifier u32 + port u16 + host_len u8 + msg_len u16, before the strings
const HEARTBEAT_MIN_LEN: usize = 4 + 2 + 1 + 2;
/// identifier u32 + message_count u32
const STATUS_LEN: usize = 4 + 4;

/// Default wire format.
///
/// ```text
/// heartbeat: 0x01 | identifier u32 | client_port u16 | host_len u8 | host | msg_len u16 | msg
/// status:    0x02 | identifier u32 | message_count u32
/// error:     0xFF | len u16 | reason
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

struct FrameWriter {
    buf: Vec<u8>,
}

impl FrameWriter {
    fn new(kind: MessageType, capacity: usize) -> Self {
        let mut buf = Vec::with_capacity(capacity + 1);
        buf.push(kind.wire_tag());
        FrameWriter { buf }
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

struct FrameReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> FrameReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        FrameReader { buf, cursor: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                need: self.cursor + n,
                have: self.buf.len(),
            });
        }
        let buf: &'a [u8] = self.buf;
        let out = &buf[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(out)
    }

    fn take_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn take_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_str(&mut self, len: usize, field: &'static str) -> Result<String, CodecError> {
        let b = self.take(len)?;
        std::str::from_utf8(b)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8(field))
    }

    /// Read the kind byte; Ok(None) means the frame is the wanted kind.
    fn expect_kind(&mut self, wanted: MessageType) -> Result<Option<MessageType>, CodecError> {
        let tag = self.take_u8()?;
        let found = MessageType::from_wire_tag(tag).ok_or(CodecError::UnknownKind(tag))?;
        Ok(if found == wanted { None } else { Some(found) })
    }

    fn finish(&self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a character.
fn clamp_str(s: &str, max: usize) -> &str {
    let mut end = s.len().min(max);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

impl MessageCodec for BinaryCodec {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn encode_heartbeat(&self, msg: &HeartbeatMessage) -> Vec<u8> {
        if let Err(reason) = validate_heartbeat(msg) {
            error!("encode_heartbeat failed: {}", reason);
            return self.encode_error(&reason);
        }
        let mut w = FrameWriter::new(msg.msg_type, HEARTBEAT_MIN_LEN + msg.client_host.len() + msg.msg.len());
        w.put_u32(msg.identifier);
        w.put_u16(msg.client_port);
        w.put_u8(msg.client_host.len() as u8);
        w.put_bytes(msg.client_host.as_bytes());
        w.put_u16(msg.msg.len() as u16);
        w.put_bytes(msg.msg.as_bytes());
        w.finish()
    }

    fn decode_heartbeat(&self, data: &[u8]) -> Result<Decoded<HeartbeatMessage>, CodecError> {
        let mut r = FrameReader::new(data);
        if let Some(found) = r.expect_kind(MessageType::Heartbeat)? {
            return Ok(Decoded::WrongKind { found });
        }
        let identifier = r.take_u32()?;
        let client_port = r.take_u16()?;
        let host_len = r.take_u8()? as usize;
        let client_host = r.take_str(host_len, "client_host")?;
        let msg_len = r.take_u16()? as usize;
        let msg = r.take_str(msg_len, "msg")?;
        r.finish()?;
        Ok(Decoded::Message(HeartbeatMessage {
            msg_type: MessageType::Heartbeat,
            msg,
            client_host,
            client_port,
            identifier,
        }))
    }

    fn encode_status(&self, msg: &StatusMessage) -> Vec<u8> {
        let mut w = FrameWriter::new(msg.msg_type, STATUS_LEN);
        w.put_u32(msg.identifier);
        w.put_u32(msg.message_count);
        w.finish()
    }

    fn decode_status(&self, data: &[u8]) -> Result<Decoded<StatusMessage>, CodecError> {
        let mut r = FrameReader::new(data);
        if let Some(found) = r.expect_kind(MessageType::Status)? {
            return Ok(Decoded::WrongKind { found });
        }
        let identifier = r.take_u32()?;
        let message_count = r.take_u32()?;
        r.finish()?;
        Ok(Decoded::Message(StatusMessage {
            msg_type: MessageType::Status,
            identifier,
            message_count,
        }))
    }

    fn encode_error(&self, reason: &str) -> Vec<u8> {
        let reason = clamp_str(reason, u16::MAX as usize);
        let mut w = FrameWriter::new(MessageType::Error, 2 + reason.len());
        w.put_u16(reason.len() as u16);
        w.put_bytes(reason.as_bytes());
        w.finish()
    }

    fn decode_error(&self, data: &[u8]) -> Result<Decoded<ErrorMessage>, CodecError> {
        let mut r = FrameReader::new(data);
        if let Some(found) = r.expect_kind(MessageType::Error)? {
            return Ok(Decoded::WrongKind { found });
        }
        let len = r.take_u16()? as usize;
        let error = r.take_str(len, "error")?;
        r.finish()?;
        Ok(Decoded::Message(ErrorMessage::new(error)))
    }
}
