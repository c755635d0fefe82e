//! Frame codec for TCP byte streams.
//!
//! Wire format: magic (4) + command (12, null-padded) + payload length (4,
//! big-endian) + checksum (4) + payload. The checksum is the first four
//! bytes of SHA-512 over the payload, applied once.
//!
//! Decoding never fails on bad input. Frames with a bad checksum, an
//! unknown command, an oversized or undecodable payload are consumed and
//! dropped; garbage before a magic value is skipped. Errors are reserved
//! for the underlying transport.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha512};
use tokio_util::codec::Decoder;

use crate::messages::{Command, Message};
use crate::{ProtocolError, HEADER_SIZE, MAGIC, MAX_PAYLOAD_SIZE};

const MAGIC_RANGE: std::ops::Range<usize> = 0..4;
const COMMAND_RANGE: std::ops::Range<usize> = 4..16;
const LENGTH_RANGE: std::ops::Range<usize> = 16..20;
const CHECKSUM_RANGE: std::ops::Range<usize> = 20..24;

/// Upper bound on capacity reserved ahead of a partial frame. The buffer
/// grows past it only as bytes arrive.
const MAX_RESERVE: usize = 64 * 1024;

/// First four bytes of SHA-512(payload).
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = Sha512::digest(payload);
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest[..4]);
    out
}

/// Write one complete frame for `command` carrying `payload`.
pub fn write_frame(dst: &mut BytesMut, command: Command, payload: &[u8]) {
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(&MAGIC);
    dst.put_slice(&command.wire_name());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(&checksum(payload));
    dst.put_slice(payload);
}

/// Build a complete frame (header + payload) for a message.
pub fn create(message: &Message) -> Bytes {
    let mut payload = BytesMut::new();
    message.encode_payload(&mut payload);
    let mut out = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    write_frame(&mut out, message.command(), &payload);
    out.freeze()
}

/// Extract every complete frame from `buffer`.
///
/// Returns the unconsumed remainder and the decoded messages in arrival
/// order. Feed the remainder back in, extended with new bytes, on the next
/// read.
pub fn parse(mut buffer: BytesMut) -> (BytesMut, Vec<Message>) {
    let mut codec = MessageCodec::new();
    let mut messages = Vec::new();
    while let Ok(Some(message)) = codec.decode(&mut buffer) {
        messages.push(message);
    }
    (buffer, messages)
}

/// Decoder for Message frames on a byte stream.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_payload: usize,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            // Need at least a full header
            if src.len() < HEADER_SIZE {
                return Ok(None);
            }

            // Resynchronise on the next magic value
            if src[MAGIC_RANGE] != MAGIC[..] {
                match find_magic(&src[1..]) {
                    Some(offset) => {
                        tracing::debug!(skipped = offset + 1, "missing magic, resynchronising");
                        src.advance(offset + 1);
                        continue;
                    }
                    None => {
                        tracing::debug!(discarded = src.len(), "no magic in buffer, discarding");
                        src.clear();
                        return Ok(None);
                    }
                }
            }

            let length = u32::from_be_bytes([
                src[LENGTH_RANGE.start],
                src[LENGTH_RANGE.start + 1],
                src[LENGTH_RANGE.start + 2],
                src[LENGTH_RANGE.start + 3],
            ]) as usize;

            // Wait for the whole frame
            let total = HEADER_SIZE + length;
            if src.len() < total {
                if length <= self.max_payload {
                    src.reserve((total - src.len()).min(MAX_RESERVE));
                }
                return Ok(None);
            }

            // From here on the frame is consumed whatever its fate
            let frame = src.split_to(total);
            let header = &frame[..HEADER_SIZE];
            let payload = &frame[HEADER_SIZE..];

            if length > self.max_payload {
                tracing::debug!(
                    length,
                    max = self.max_payload,
                    "payload too large, dropping frame"
                );
                continue;
            }

            if checksum(payload)[..] != header[CHECKSUM_RANGE] {
                tracing::debug!(
                    expected = hex::encode(&header[CHECKSUM_RANGE]),
                    "checksum mismatch, dropping frame"
                );
                continue;
            }

            let Some(command) = Command::from_wire(&header[COMMAND_RANGE]) else {
                tracing::debug!(
                    command = hex::encode(&header[COMMAND_RANGE]),
                    "unknown command, dropping frame"
                );
                continue;
            };

            match Message::decode_payload(command, payload) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => {
                    tracing::debug!(%command, "undecodable payload, dropping frame: {e}");
                    continue;
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }
        if !src.is_empty() {
            tracing::debug!(discarded = src.len(), "stream closed mid-frame");
            src.clear();
        }
        Ok(None)
    }
}

fn find_magic(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(MAGIC.len())
        .position(|window| window == MAGIC.as_slice())
}
