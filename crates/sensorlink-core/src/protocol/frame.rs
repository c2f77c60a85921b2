//! Frame reassembly
//!
//! Accumulates raw transport bytes and yields complete decoded messages.
//! A frame may span any number of reads; corrupt prefixes are skipped and
//! counted, never fatal.

use crate::codec::{self, DecodeResult, Message};

/// Incremental frame reassembler. One per receive loop.
#[derive(Debug, Default)]
pub struct FrameReassembler {
    buffer: Vec<u8>,
    decode_errors: u64,
}

impl FrameReassembler {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and decode every complete frame now available.
    ///
    /// Never blocks. Invalid data is skipped up to the next plausible frame
    /// start and counted in [`FrameReassembler::decode_errors`].
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Message> {
        self.buffer.extend_from_slice(bytes);

        let mut messages = Vec::new();
        let mut pos = 0;
        loop {
            match codec::decode(&self.buffer[pos..]) {
                DecodeResult::Complete { message, consumed } => {
                    messages.push(message);
                    pos += consumed;
                }
                DecodeResult::NeedMore => break,
                DecodeResult::Invalid { skip } => {
                    self.decode_errors += 1;
                    tracing::debug!(skip, "skipping corrupt frame data");
                    pos += skip;
                }
            }
        }
        if pos > 0 {
            self.buffer.drain(..pos);
        }
        messages
    }

    /// Number of corrupt frames skipped so far.
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors
    }

    /// Number of buffered bytes awaiting the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::attributes::Attribute;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_single_frame() {
        let mut reassembler = FrameReassembler::new();
        let messages = reassembler.feed(&codec::encode(&Message::Heartbeat));
        assert_eq!(messages, vec![Message::Heartbeat]);
        assert_eq!(reassembler.buffered(), 0);
    }

    #[test]
    fn test_frame_split_across_reads() {
        let frame = codec::encode(&Message::GetAttributeResponse {
            attribute: Attribute::HeartRate(70),
        });
        let mut reassembler = FrameReassembler::new();
        assert!(reassembler.feed(&frame[..4]).is_empty());
        let messages = reassembler.feed(&frame[4..]);
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let mut stream = codec::encode(&Message::Heartbeat);
        stream.extend_from_slice(&codec::encode(&Message::ListFiles));
        let mut reassembler = FrameReassembler::new();
        let messages = reassembler.feed(&stream);
        assert_eq!(messages, vec![Message::Heartbeat, Message::ListFiles]);
    }

    #[test]
    fn test_resync_after_garbage() {
        let mut stream = vec![0xDE, 0xAD, 0xBE, 0xEF];
        stream.extend_from_slice(&codec::encode(&Message::HeartbeatResponse));
        let mut reassembler = FrameReassembler::new();
        let messages = reassembler.feed(&stream);
        assert_eq!(messages, vec![Message::HeartbeatResponse]);
        assert!(reassembler.decode_errors() > 0);
    }
}
