//! Per-session outbound packet queue
//!
//! Packets are collected during a loop iteration and flushed as one or more
//! frames. Each frame is compressed and encrypted for the session's
//! generation and prefixed with its big-endian length.

use shared::codec::{frame, Encoder, Generation};

/// Upper bound on the plaintext joined into one frame
const FRAME_LIMIT: usize = 0xF000;

#[derive(Debug, Clone)]
pub struct OutboundQueue {
    packets: Vec<Vec<u8>>,
    encoder: Encoder,
}

impl OutboundQueue {
    /// Sessions answer in zlib until login negotiates a generation
    pub fn new() -> Self {
        Self {
            packets: Vec::new(),
            encoder: Encoder::new(Generation::Gen2, 0),
        }
    }

    pub fn set_codec(&mut self, generation: Generation, key: u8) {
        self.encoder = Encoder::new(generation, key);
    }

    pub fn generation(&self) -> Generation {
        self.encoder.generation()
    }

    /// Queues a packet, terminating it with a newline
    pub fn push(&mut self, packet: &[u8]) {
        if packet.is_empty() {
            return;
        }
        let mut owned = packet.to_vec();
        if owned.last() != Some(&b'\n') {
            owned.push(b'\n');
        }
        self.packets.push(owned);
    }

    /// Queues bytes exactly as given
    pub fn push_raw(&mut self, packet: &[u8]) {
        if !packet.is_empty() {
            self.packets.push(packet.to_vec());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Queued packets, oldest first
    pub fn packets(&self) -> &[Vec<u8>] {
        &self.packets
    }

    /// Encodes everything queued into wire bytes and empties the queue
    pub fn flush(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk: Vec<u8> = Vec::new();
        for packet in self.packets.drain(..) {
            if !chunk.is_empty() && chunk.len() + packet.len() > FRAME_LIMIT {
                out.extend(frame(&self.encoder.encode_frame(&chunk)));
                chunk.clear();
            }
            chunk.extend_from_slice(&packet);
        }
        if !chunk.is_empty() {
            out.extend(frame(&self.encoder.encode_frame(&chunk)));
        }
        out
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}
