//! Per-session output buffering.
//!
//! PTY output arrives in 4 KiB reads and is held in a bounded FIFO of
//! timestamped chunks until a client drains it over the HTTP API. The
//! buffer never grows past its capacity; the oldest chunks are evicted
//! first.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One read's worth of PTY output with the time it was observed.
#[derive(Debug, Clone, Serialize)]
pub struct OutputChunk {
    pub timestamp: DateTime<Utc>,
    pub data: String,
}

/// Bounded FIFO of output chunks with oldest-first eviction.
#[derive(Debug)]
pub struct OutputBuffer {
    chunks: VecDeque<OutputChunk>,
    capacity: usize,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// Appends a chunk, evicting from the front when full.
    pub fn push(&mut self, chunk: OutputChunk) {
        while self.chunks.len() >= self.capacity {
            self.chunks.pop_front();
        }
        self.chunks.push_back(chunk);
    }

    /// Returns a copy of the buffered chunks in arrival order.
    pub fn snapshot(&self) -> Vec<OutputChunk> {
        self.chunks.iter().cloned().collect()
    }

    /// Removes and returns all buffered chunks in arrival order.
    pub fn drain(&mut self) -> Vec<OutputChunk> {
        self.chunks.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Stateful UTF-8 decoder that tolerates multi-byte sequences split
/// across read boundaries.
///
/// A 4096-byte PTY read can cut an emoji or CJK character in half;
/// decoding each read independently with `from_utf8_lossy` would inject
/// U+FFFD into the stream. Incomplete trailing bytes are buffered and
/// prepended to the next read instead.
pub struct Utf8Decoder {
    /// Holds at most one incomplete code point (4 bytes).
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self {
            pending: Vec::with_capacity(4),
        }
    }

    /// Decodes `input`, carrying any incomplete trailing sequence over to
    /// the next call. Invalid bytes (not merely incomplete) are skipped.
    pub fn decode(&mut self, input: &[u8]) -> String {
        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(input);

        let mut out = String::with_capacity(data.len());
        let mut rest: &[u8] = &data;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // Safe: from_utf8 just validated this prefix.
                    out.push_str(std::str::from_utf8(&rest[..valid]).unwrap_or(""));
                    match e.error_len() {
                        // Incomplete sequence at the tail: keep it for next time.
                        None => {
                            self.pending = rest[valid..].to_vec();
                            break;
                        }
                        // Genuinely invalid bytes: drop them and continue.
                        Some(skip) => rest = &rest[valid + skip..],
                    }
                }
            }
        }
        out
    }
}

impl Default for Utf8Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(data: &str) -> OutputChunk {
        OutputChunk {
            timestamp: Utc::now(),
            data: data.to_string(),
        }
    }

    #[test]
    fn test_buffer_evicts_oldest_at_capacity() {
        let mut buf = OutputBuffer::new(3);
        for i in 0..5 {
            buf.push(chunk(&format!("c{i}")));
        }
        assert_eq!(buf.len(), 3);
        let data: Vec<String> = buf.snapshot().into_iter().map(|c| c.data).collect();
        assert_eq!(data, vec!["c2", "c3", "c4"]);
    }

    #[test]
    fn test_snapshot_does_not_consume() {
        let mut buf = OutputBuffer::new(10);
        buf.push(chunk("a"));
        assert_eq!(buf.snapshot().len(), 1);
        assert_eq!(buf.snapshot().len(), 1);
    }

    #[test]
    fn test_drain_empties_buffer() {
        let mut buf = OutputBuffer::new(10);
        buf.push(chunk("a"));
        buf.push(chunk("b"));
        assert_eq!(buf.drain().len(), 2);
        assert!(buf.is_empty());
        assert!(buf.drain().is_empty());
    }

    #[test]
    fn test_decoder_passes_ascii_through() {
        let mut dec = Utf8Decoder::new();
        assert_eq!(dec.decode(b"hello"), "hello");
    }

    #[test]
    fn test_decoder_reassembles_split_sequence() {
        // "é" is 0xC3 0xA9; split it across two reads.
        let mut dec = Utf8Decoder::new();
        assert_eq!(dec.decode(&[b'a', 0xC3]), "a");
        assert_eq!(dec.decode(&[0xA9, b'b']), "éb");
    }

    #[test]
    fn test_decoder_skips_invalid_bytes() {
        let mut dec = Utf8Decoder::new();
        // 0xFF can never start a UTF-8 sequence.
        assert_eq!(dec.decode(&[b'x', 0xFF, b'y']), "xy");
    }

    #[test]
    fn test_decoder_split_four_byte_emoji() {
        let emoji = "🦀".as_bytes(); // 4 bytes
        let mut dec = Utf8Decoder::new();
        assert_eq!(dec.decode(&emoji[..2]), "");
        assert_eq!(dec.decode(&emoji[2..]), "🦀");
    }
}
