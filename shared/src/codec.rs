//! Stream cipher and compression for the five protocol generations
//!
//! Inbound frames are decoded by [`Codec`]; the inverse [`Encoder`] is used for
//! outbound traffic and by clients and tests to produce valid inbound bytes.
//!
//! | Generation | Frame body                                     | Per record          |
//! |------------|------------------------------------------------|---------------------|
//! | 1          | plain                                          | -                   |
//! | 2          | zlib                                           | -                   |
//! | 3          | zlib                                           | one byte removed    |
//! | 4          | bzip2, then XOR keystream (4 words)            | -                   |
//! | 5          | tag byte + XOR keystream (tag limit) + by tag  | -                   |

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use log::warn;
use std::io::{Read, Write};

/// Initial keystream iterator for every session
pub const ITERATOR_START: u32 = 0x04A8_0B38;
const ITERATOR_MUL: u32 = 0x0808_8405;

/// Gen 5 frames larger than this are bzip2-compressed on the way out
pub const BZIP2_THRESHOLD: usize = 0x2000;
/// Gen 5 frames larger than this (and not bzip2) are zlib-compressed
pub const ZLIB_THRESHOLD: usize = 55;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Generation {
    Gen1 = 1,
    Gen2 = 2,
    Gen3 = 3,
    Gen4 = 4,
    Gen5 = 5,
}

impl Generation {
    pub fn number(self) -> u8 {
        self as u8
    }
}

/// Compression tag carried in front of every gen 5 frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Uncompressed = 0x02,
    Zlib = 0x04,
    Bzip2 = 0x06,
}

impl Compression {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x02 => Some(Compression::Uncompressed),
            0x04 => Some(Compression::Zlib),
            0x06 => Some(Compression::Bzip2),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Picks the gen 5 compression for an outgoing body of `len` bytes
    pub fn for_len(len: usize) -> Self {
        if len > BZIP2_THRESHOLD {
            Compression::Bzip2
        } else if len > ZLIB_THRESHOLD {
            Compression::Zlib
        } else {
            Compression::Uncompressed
        }
    }
}

/// Number of keystream words a frame with this tag is encrypted with.
/// A negative limit encrypts the whole frame.
pub fn limit_from_tag(tag: u8) -> i32 {
    match tag {
        0x02 => 12,
        0x04 | 0x06 => 4,
        _ => -1,
    }
}

/// Keystream state for one direction of one session
#[derive(Debug, Clone)]
pub struct Cipher {
    key: u8,
    iterator: u32,
    limit: i32,
}

impl Cipher {
    pub fn new(key: u8) -> Self {
        Self {
            key,
            iterator: ITERATOR_START,
            limit: -1,
        }
    }

    /// Restarts the keystream for a freshly negotiated key
    pub fn reset(&mut self, key: u8) {
        self.key = key;
        self.iterator = ITERATOR_START;
        self.limit = -1;
    }

    pub fn key(&self) -> u8 {
        self.key
    }

    pub fn iterator(&self) -> u32 {
        self.iterator
    }

    pub fn set_limit_from_tag(&mut self, tag: u8) {
        self.limit = limit_from_tag(tag);
    }

    fn advance(&mut self) {
        self.iterator = self
            .iterator
            .wrapping_mul(ITERATOR_MUL)
            .wrapping_add(u32::from(self.key));
    }

    /// XORs the buffer with the keystream. The operation is its own inverse.
    pub fn apply(&mut self, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            if i % 4 == 0 {
                if self.limit == 0 {
                    return;
                }
                self.advance();
                if self.limit > 0 {
                    self.limit -= 1;
                }
            }
            *byte ^= self.iterator.to_le_bytes()[i % 4];
        }
    }

    /// Gen 3 record decryption: drops the padding byte chosen by the keystream
    pub fn remove_padding(&mut self, record: &mut Vec<u8>) {
        if record.is_empty() {
            return;
        }
        self.advance();
        let pos = (self.iterator & 0xFFFF) as usize % record.len();
        record.remove(pos);
    }

    /// Gen 3 record encryption: inserts a padding byte where the peer will look
    pub fn insert_padding(&mut self, record: &mut Vec<u8>) {
        self.advance();
        let pos = (self.iterator & 0xFFFF) as usize % (record.len() + 1);
        record.insert(pos, b'*');
    }
}

pub fn zlib_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    match encoder.write_all(data).and_then(|_| encoder.finish()) {
        Ok(out) => out,
        Err(e) => {
            warn!("zlib compression failed: {}", e);
            Vec::new()
        }
    }
}

pub fn zlib_decompress(data: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data).read_to_end(&mut out).ok()?;
    Some(out)
}

pub fn bzip2_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = BzEncoder::new(Vec::new(), bzip2::Compression::default());
    match encoder.write_all(data).and_then(|_| encoder.finish()) {
        Ok(out) => out,
        Err(e) => {
            warn!("bzip2 compression failed: {}", e);
            Vec::new()
        }
    }
}

pub fn bzip2_decompress(data: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    BzDecoder::new(data).read_to_end(&mut out).ok()?;
    Some(out)
}

/// Inbound decoder for one session
#[derive(Debug, Clone)]
pub struct Codec {
    generation: Generation,
    cipher: Cipher,
}

impl Codec {
    /// Sessions start out expecting the zlib login frame
    pub fn new() -> Self {
        Self {
            generation: Generation::Gen2,
            cipher: Cipher::new(0),
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn set_generation(&mut self, generation: Generation) {
        self.generation = generation;
    }

    pub fn reset(&mut self, key: u8) {
        self.cipher.reset(key);
    }

    pub fn key(&self) -> u8 {
        self.cipher.key()
    }

    /// Decodes one length-delimited frame.
    ///
    /// Malformed compressed data decodes to an empty buffer.
    pub fn decode_frame(&mut self, frame: &[u8]) -> Vec<u8> {
        match self.generation {
            Generation::Gen1 => frame.to_vec(),
            Generation::Gen2 | Generation::Gen3 => zlib_decompress(frame).unwrap_or_else(|| {
                warn!("Dropping frame with invalid zlib data ({} bytes)", frame.len());
                Vec::new()
            }),
            Generation::Gen4 => {
                let mut buf = frame.to_vec();
                self.cipher.set_limit_from_tag(Compression::Bzip2.tag());
                self.cipher.apply(&mut buf);
                bzip2_decompress(&buf).unwrap_or_else(|| {
                    warn!("Dropping frame with invalid bzip2 data ({} bytes)", frame.len());
                    Vec::new()
                })
            }
            Generation::Gen5 => {
                let Some((&tag, body)) = frame.split_first() else {
                    return Vec::new();
                };
                let mut buf = body.to_vec();
                self.cipher.set_limit_from_tag(tag);
                self.cipher.apply(&mut buf);
                match Compression::from_tag(tag) {
                    Some(Compression::Uncompressed) => buf,
                    Some(Compression::Zlib) => zlib_decompress(&buf).unwrap_or_else(|| {
                        warn!("Dropping gen 5 frame with invalid zlib data");
                        Vec::new()
                    }),
                    Some(Compression::Bzip2) => bzip2_decompress(&buf).unwrap_or_else(|| {
                        warn!("Dropping gen 5 frame with invalid bzip2 data");
                        Vec::new()
                    }),
                    None => {
                        warn!("Client gave incorrect packet compression type! [{}]", tag);
                        buf
                    }
                }
            }
        }
    }

    /// Gen 3 per-record step, applied after the record is split off the frame
    pub fn decrypt_record(&mut self, record: &mut Vec<u8>) {
        if self.generation == Generation::Gen3 {
            self.cipher.remove_padding(record);
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

/// Produces frame bodies a [`Codec`] with the same generation and key accepts
#[derive(Debug, Clone)]
pub struct Encoder {
    generation: Generation,
    cipher: Cipher,
}

impl Encoder {
    pub fn new(generation: Generation, key: u8) -> Self {
        Self {
            generation,
            cipher: Cipher::new(key),
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Encodes a frame body, choosing the gen 5 compression by size
    pub fn encode_frame(&mut self, plain: &[u8]) -> Vec<u8> {
        self.encode_frame_with(plain, Compression::for_len(plain.len()))
    }

    /// Encodes a frame body; `compression` only matters for gen 5
    pub fn encode_frame_with(&mut self, plain: &[u8], compression: Compression) -> Vec<u8> {
        match self.generation {
            Generation::Gen1 => plain.to_vec(),
            Generation::Gen2 | Generation::Gen3 => zlib_compress(plain),
            Generation::Gen4 => {
                let mut buf = bzip2_compress(plain);
                self.cipher.set_limit_from_tag(Compression::Bzip2.tag());
                self.cipher.apply(&mut buf);
                buf
            }
            Generation::Gen5 => {
                let mut buf = match compression {
                    Compression::Uncompressed => plain.to_vec(),
                    Compression::Zlib => zlib_compress(plain),
                    Compression::Bzip2 => bzip2_compress(plain),
                };
                self.cipher.set_limit_from_tag(compression.tag());
                self.cipher.apply(&mut buf);
                let mut out = Vec::with_capacity(buf.len() + 1);
                out.push(compression.tag());
                out.extend_from_slice(&buf);
                out
            }
        }
    }

    /// Gen 3 per-record step a client performs before joining records
    pub fn encrypt_record(&mut self, record: &mut Vec<u8>) {
        if self.generation == Generation::Gen3 {
            self.cipher.insert_padding(record);
        }
    }
}

/// Prefixes a frame body with its big-endian u16 length
pub fn frame(body: &[u8]) -> Vec<u8> {
    let len = body.len().min(u16::MAX as usize);
    let mut out = Vec::with_capacity(len + 2);
    out.extend_from_slice(&(len as u16).to_be_bytes());
    out.extend_from_slice(&body[..len]);
    out
}
