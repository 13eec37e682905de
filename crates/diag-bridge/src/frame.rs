//! Batched length-prefixed frame codec
//!
//! Read direction (device → clients), one batch per device read:
//!
//! ```text
//! [4B LE type tag][4B LE message count]{[4B sentinel?][4B LE len][len bytes]}×count
//! ```
//!
//! The sentinel word (all ones) only appears under the remote variant and is
//! consumed without counting as payload. Write direction (client → device)
//! carries no length prefix; the write size is the message boundary:
//!
//! ```text
//! [4B LE type tag][4B sentinel if remote variant][raw message bytes]
//! ```
//!
//! A declared length that does not fit the batch is a fatal framing error.
//! There is no reliable resynchronization point in this format, so the
//! bridge terminates instead of resyncing.

use bytes::BufMut;
use thiserror::Error;

/// Type tag carried by application-data batches. Batches with any other tag
/// are the device's own self-diagnostic traffic and are silently discarded.
pub const USER_SPACE_DATA_TAG: u32 = 0x0000_0020;

/// Per-message sentinel present under the remote variant.
pub const REMOTE_SENTINEL: u32 = 0xFFFF_FFFF;

/// Synthetic "malformed command" frame broadcast to clients when the device
/// structurally rejects a write, mirroring the device's own rejection reply.
pub const BAD_CMD_FRAME: [u8; 4] = [0x13, 0x62, 0xd2, 0x7e];

/// Minimum batch size: type tag plus message count.
pub const BATCH_HEADER_LEN: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("batch truncated: {len} bytes, header needs {BATCH_HEADER_LEN}")]
    ShortBatch { len: usize },

    #[error("message {index} header runs past the end of the batch")]
    TruncatedHeader { index: u32 },

    #[error("message {index} declares {declared} bytes but only {remaining} remain in the batch")]
    Overrun {
        index: u32,
        declared: usize,
        remaining: usize,
    },
}

/// One decoded diagnostic message, borrowing from the batch buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub payload: &'a [u8],
}

/// Bounds-checked cursor over a batch buffer. Every read goes through
/// `take`, which fails instead of allowing an over-read.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if n > self.remaining() {
            return None;
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    fn peek_u32_le(&self) -> Option<u32> {
        let bytes = self.buf.get(self.pos..self.pos + 4)?;
        Some(u32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
    }

    fn u32_le(&mut self) -> Option<u32> {
        let v = self.peek_u32_le()?;
        self.pos += 4;
        Some(v)
    }
}

/// Decode one batch.
///
/// Returns `Ok(None)` when the batch carries a foreign type tag (not an
/// error: the device multiplexes its own traffic over the same handle).
/// Decodes every message before returning, so a framing violation never
/// yields a partial result.
pub fn decode_batch(batch: &[u8], remote_variant: bool) -> Result<Option<Vec<Frame<'_>>>, FrameError> {
    if batch.len() < BATCH_HEADER_LEN {
        return Err(FrameError::ShortBatch { len: batch.len() });
    }

    let mut cursor = Cursor::new(batch);
    let tag = cursor.u32_le().expect("header length checked");
    if tag != USER_SPACE_DATA_TAG {
        tracing::trace!(tag = format_args!("{tag:#010x}"), "discarding non-data batch");
        return Ok(None);
    }
    let count = cursor.u32_le().expect("header length checked");

    // The count is untrusted wire data; cap the pre-allocation by what the
    // buffer could possibly hold (a message costs at least its length word).
    let mut frames = Vec::with_capacity((count as usize).min(batch.len() / 4));
    for index in 0..count {
        if remote_variant && cursor.peek_u32_le() == Some(REMOTE_SENTINEL) {
            cursor.take(4).expect("peeked 4 bytes");
        }
        let declared = cursor
            .u32_le()
            .ok_or(FrameError::TruncatedHeader { index })? as usize;
        let payload = cursor.take(declared).ok_or(FrameError::Overrun {
            index,
            declared,
            remaining: cursor.remaining(),
        })?;
        frames.push(Frame { payload });
    }
    Ok(Some(frames))
}

/// Encode one client message for the device write path: type tag, the
/// sentinel under the remote variant, then the bytes verbatim.
pub fn encode_message(payload: &[u8], remote_variant: bool) -> Vec<u8> {
    let header = if remote_variant { 8 } else { 4 };
    let mut out = Vec::with_capacity(header + payload.len());
    out.put_u32_le(USER_SPACE_DATA_TAG);
    if remote_variant {
        out.put_u32_le(REMOTE_SENTINEL);
    }
    out.put_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn batch(tag: u32, messages: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u32_le(tag);
        out.put_u32_le(messages.len() as u32);
        for msg in messages {
            out.put_u32_le(msg.len() as u32);
            out.put_slice(msg);
        }
        out
    }

    #[test]
    fn decodes_all_messages_in_order() {
        let b = batch(
            USER_SPACE_DATA_TAG,
            &[b"first".as_slice(), b"".as_slice(), b"third-msg".as_slice()],
        );
        let frames = decode_batch(&b, false).unwrap().unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].payload, b"first");
        assert_eq!(frames[1].payload, b"");
        assert_eq!(frames[2].payload, b"third-msg");
    }

    #[test]
    fn foreign_tag_is_discarded_not_an_error() {
        let b = batch(0x0000_0001, &[b"mask data".as_slice()]);
        assert_eq!(decode_batch(&b, false).unwrap(), None);
    }

    #[test]
    fn short_batch_is_fatal() {
        let err = decode_batch(&[0x20, 0, 0], false).unwrap_err();
        assert_eq!(err, FrameError::ShortBatch { len: 3 });
    }

    #[test]
    fn over_length_message_is_fatal_and_yields_nothing() {
        let mut b = Vec::new();
        b.put_u32_le(USER_SPACE_DATA_TAG);
        b.put_u32_le(2);
        b.put_u32_le(4);
        b.put_slice(b"good");
        b.put_u32_le(100); // declares more than remains
        b.put_slice(b"bad");
        let err = decode_batch(&b, false).unwrap_err();
        assert_eq!(
            err,
            FrameError::Overrun {
                index: 1,
                declared: 100,
                remaining: 3,
            }
        );
    }

    #[test]
    fn count_overrunning_buffer_is_fatal() {
        let mut b = Vec::new();
        b.put_u32_le(USER_SPACE_DATA_TAG);
        b.put_u32_le(3); // only one message actually present
        b.put_u32_le(2);
        b.put_slice(b"ok");
        let err = decode_batch(&b, false).unwrap_err();
        assert_eq!(err, FrameError::TruncatedHeader { index: 1 });
    }

    #[test]
    fn huge_declared_count_errors_without_exhausting_memory() {
        // A corrupt header declaring billions of messages must surface the
        // framing error once the buffer runs out, not reserve for the count.
        let mut b = Vec::new();
        b.put_u32_le(USER_SPACE_DATA_TAG);
        b.put_u32_le(u32::MAX);
        b.put_u32_le(2);
        b.put_slice(b"ok");
        let err = decode_batch(&b, false).unwrap_err();
        assert_eq!(err, FrameError::TruncatedHeader { index: 1 });
    }

    #[test]
    fn remote_sentinel_is_skipped_and_not_payload() {
        let mut b = Vec::new();
        b.put_u32_le(USER_SPACE_DATA_TAG);
        b.put_u32_le(2);
        b.put_u32_le(REMOTE_SENTINEL);
        b.put_u32_le(3);
        b.put_slice(b"abc");
        b.put_u32_le(2); // second message without sentinel
        b.put_slice(b"de");
        let frames = decode_batch(&b, true).unwrap().unwrap();
        assert_eq!(frames[0].payload, b"abc");
        assert_eq!(frames[1].payload, b"de");
    }

    #[test]
    fn sentinel_bytes_are_payload_when_not_remote() {
        let mut b = Vec::new();
        b.put_u32_le(USER_SPACE_DATA_TAG);
        b.put_u32_le(1);
        b.put_u32_le(4);
        b.put_u32_le(REMOTE_SENTINEL); // a payload that happens to be all ones
        let frames = decode_batch(&b, false).unwrap().unwrap();
        assert_eq!(frames[0].payload, &REMOTE_SENTINEL.to_le_bytes());
    }

    #[test]
    fn encode_prepends_tag_only() {
        let out = encode_message(b"\x7e\x00", false);
        assert_eq!(&out[..4], &USER_SPACE_DATA_TAG.to_le_bytes());
        assert_eq!(&out[4..], b"\x7e\x00");
    }

    #[test]
    fn encode_prepends_sentinel_under_remote_variant() {
        let out = encode_message(b"xyz", true);
        assert_eq!(&out[..4], &USER_SPACE_DATA_TAG.to_le_bytes());
        assert_eq!(&out[4..8], &REMOTE_SENTINEL.to_le_bytes());
        assert_eq!(&out[8..], b"xyz");
    }

    #[test]
    fn client_payload_survives_encode_byte_exact() {
        let payload: Vec<u8> = (0..=255).collect();
        let out = encode_message(&payload, false);
        assert_eq!(&out[4..], payload.as_slice());
    }
}
