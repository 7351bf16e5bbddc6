use bytes::BytesMut;
use datacave_core::Result;
use datacave_protocol::backend::decode_message;
use datacave_protocol::BackendMessage;

/// Bytes received from the server that do not yet form a whole message.
///
/// Deliveries may split a message anywhere or carry several messages back to
/// back; `push` followed by draining `next_message` yields the same message
/// sequence regardless of how the stream was chunked.
#[derive(Debug)]
pub(crate) struct FrameBuffer {
    tail: BytesMut,
    max_message_len: usize,
}

impl FrameBuffer {
    pub(crate) fn new(max_message_len: usize) -> Self {
        Self {
            tail: BytesMut::with_capacity(8 * 1024),
            max_message_len,
        }
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.tail.extend_from_slice(bytes);
    }

    /// Remove and return the next complete message, if the tail holds one.
    pub(crate) fn next_message(&mut self) -> Result<Option<BackendMessage>> {
        decode_message(&mut self.tail, self.max_message_len)
    }

    pub(crate) fn pending_bytes(&self) -> usize {
        self.tail.len()
    }
}
