//! Framing helpers shared by the frontend and backend codecs.
//!
//! Every message after the startup packet is `tag: u8`, `len: i32` (counting
//! itself but not the tag) and `len - 4` payload bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use datacave_core::{DatacaveError, Result};

/// Size of the tag + length prefix.
pub const HEADER_LEN: usize = 5;

/// Append a tagged message, back-patching the length once the body is known.
pub(crate) fn put_message(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(tag);
    let start = buf.len();
    buf.put_i32(0);
    body(buf);
    let len = (buf.len() - start) as i32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

pub(crate) fn put_cstring(buf: &mut BytesMut, value: &str) {
    buf.extend_from_slice(value.as_bytes());
    buf.put_u8(0);
}

/// Split one complete tagged message off the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` untouched while the message is still
/// incomplete.
pub(crate) fn split_frame(buf: &mut BytesMut, max_len: usize) -> Result<Option<(u8, Payload)>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let tag = buf[0];
    let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len < 4 {
        return Err(DatacaveError::protocol(format!(
            "invalid length {len} for message {:?}",
            tag as char
        )));
    }
    let len = len as usize;
    if len > max_len {
        return Err(DatacaveError::protocol(format!(
            "message {:?} of {len} bytes exceeds maximum {max_len}",
            tag as char
        )));
    }
    let total = 1 + len;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }
    let mut frame = buf.split_to(total).freeze();
    frame.advance(HEADER_LEN);
    Ok(Some((tag, Payload::new(frame))))
}

/// Bounds-checked reader over a message payload.
#[derive(Debug)]
pub(crate) struct Payload {
    buf: Bytes,
}

impl Payload {
    pub(crate) fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(DatacaveError::protocol(format!(
                "truncated message: expected {n} bytes for {what}, found {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        self.need(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn i16(&mut self) -> Result<i16> {
        self.need(2, "i16")?;
        Ok(self.buf.get_i16())
    }

    pub(crate) fn i32(&mut self) -> Result<i32> {
        self.need(4, "i32")?;
        Ok(self.buf.get_i32())
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        self.need(n, "value")?;
        Ok(self.buf.split_to(n).to_vec())
    }

    pub(crate) fn cstring(&mut self) -> Result<String> {
        let end = self
            .buf
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| DatacaveError::protocol("unterminated string"))?;
        let raw = self.buf.split_to(end);
        self.buf.advance(1);
        String::from_utf8(raw.to_vec()).map_err(|_| DatacaveError::protocol("invalid utf-8 in string"))
    }

    /// Length-prefixed value where -1 encodes NULL.
    pub(crate) fn nullable_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        let len = self.i32()?;
        if len < 0 {
            return Ok(None);
        }
        self.bytes(len as usize).map(Some)
    }

    pub(crate) fn finish(self, what: &str) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(DatacaveError::protocol(format!(
                "{} trailing bytes after {what}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}
