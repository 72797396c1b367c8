//! Graal "G" integer encoding used by every field of the wire protocol
//!
//! Values are written as groups of 7-bit digits, each biased by +32 so the
//! encoded bytes stay printable and never collide with the newline that
//! terminates a record. Reads past the end of a record yield zero or an empty
//! slice instead of failing, which lets handlers parse short packets safely.

/// Largest value representable by a two-digit GShort
pub const GSHORT_MAX: u32 = 28_767;
/// Largest value representable by a three-digit GInt
pub const GINT_MAX: u32 = 3_682_399;
/// Largest value representable by a four-digit GInt4
pub const GINT4_MAX: u32 = 471_347_295;

/// Builder-style writers for G-encoded fields
///
/// Implemented for `Vec<u8>` so packets are assembled with chained calls:
///
/// ```
/// use shared::gstring::GWrite;
///
/// let mut packet = Vec::new();
/// packet.write_gchar(9).write_gshort(300).write_gstring(b"bob");
/// assert_eq!(packet.len(), 1 + 2 + 1 + 3);
/// ```
pub trait GWrite {
    /// Writes one byte biased by +32, wrapping on overflow
    fn write_gchar(&mut self, value: u8) -> &mut Self;
    /// Writes a two-digit value, clamped to [`GSHORT_MAX`]
    fn write_gshort(&mut self, value: u32) -> &mut Self;
    /// Writes a three-digit value, clamped to [`GINT_MAX`]
    fn write_gint(&mut self, value: u32) -> &mut Self;
    /// Writes a four-digit value, clamped to [`GINT4_MAX`]
    fn write_gint4(&mut self, value: u32) -> &mut Self;
    /// Writes a five-digit value
    fn write_gint5(&mut self, value: u64) -> &mut Self;
    /// Writes raw bytes without a length prefix
    fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self;
    /// Writes a GChar length prefix followed by the bytes (truncated to 223)
    fn write_gstring(&mut self, bytes: &[u8]) -> &mut Self;
}

impl GWrite for Vec<u8> {
    fn write_gchar(&mut self, value: u8) -> &mut Self {
        self.push(value.wrapping_add(32));
        self
    }

    fn write_gshort(&mut self, value: u32) -> &mut Self {
        let v = value.min(GSHORT_MAX);
        self.push((((v >> 7) & 0x7F) + 32) as u8);
        self.push(((v & 0x7F) + 32) as u8);
        self
    }

    fn write_gint(&mut self, value: u32) -> &mut Self {
        let v = value.min(GINT_MAX);
        self.push((((v >> 14) & 0x7F) + 32) as u8);
        self.push((((v >> 7) & 0x7F) + 32) as u8);
        self.push(((v & 0x7F) + 32) as u8);
        self
    }

    fn write_gint4(&mut self, value: u32) -> &mut Self {
        let v = value.min(GINT4_MAX);
        self.push((((v >> 21) & 0x7F) + 32) as u8);
        self.push((((v >> 14) & 0x7F) + 32) as u8);
        self.push((((v >> 7) & 0x7F) + 32) as u8);
        self.push(((v & 0x7F) + 32) as u8);
        self
    }

    fn write_gint5(&mut self, value: u64) -> &mut Self {
        for shift in [28u32, 21, 14, 7, 0] {
            self.push((((value >> shift) & 0x7F) + 32) as u8);
        }
        self
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.extend_from_slice(bytes);
        self
    }

    fn write_gstring(&mut self, bytes: &[u8]) -> &mut Self {
        let len = bytes.len().min(223);
        self.write_gchar(len as u8);
        self.extend_from_slice(&bytes[..len]);
        self
    }
}

/// Cursor over one record
#[derive(Debug, Clone)]
pub struct GReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> GReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// The full record, including bytes already consumed
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn set_position(&mut self, pos: usize) {
        self.pos = pos.min(self.data.len());
    }

    pub fn bytes_left(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.bytes_left() == 0
    }

    fn next_byte(&mut self) -> Option<u8> {
        let byte = self.data.get(self.pos).copied();
        if byte.is_some() {
            self.pos += 1;
        }
        byte
    }

    fn digit(&mut self) -> u64 {
        self.next_byte().map_or(0, |b| u64::from(b.wrapping_sub(32) & 0x7F))
    }

    /// Signed single byte, unbiased
    pub fn read_gchar(&mut self) -> i8 {
        self.next_byte().map_or(0, |b| b.wrapping_sub(32) as i8)
    }

    /// Unsigned single byte, unbiased
    pub fn read_guchar(&mut self) -> u8 {
        self.next_byte().map_or(0, |b| b.wrapping_sub(32))
    }

    pub fn read_gushort(&mut self) -> u16 {
        let hi = self.digit();
        let lo = self.digit();
        ((hi << 7) | lo) as u16
    }

    pub fn read_guint(&mut self) -> u32 {
        let mut value = 0u64;
        for _ in 0..3 {
            value = (value << 7) | self.digit();
        }
        value as u32
    }

    pub fn read_guint4(&mut self) -> u32 {
        let mut value = 0u64;
        for _ in 0..4 {
            value = (value << 7) | self.digit();
        }
        value as u32
    }

    pub fn read_guint5(&mut self) -> u64 {
        let mut value = 0u64;
        for _ in 0..5 {
            value = (value << 7) | self.digit();
        }
        value
    }

    /// Reads up to `len` raw bytes; fewer when the record is short
    pub fn read_chars(&mut self, len: usize) -> &'a [u8] {
        let end = (self.pos + len).min(self.data.len());
        let slice = &self.data[self.pos..end];
        self.pos = end;
        slice
    }

    /// Reads a GChar length prefix and that many bytes
    pub fn read_gstring(&mut self) -> &'a [u8] {
        let len = self.read_guchar() as usize;
        self.read_chars(len)
    }

    /// Reads up to (and consumes) `delim`; returns everything when absent
    pub fn read_until(&mut self, delim: u8) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        match rest.iter().position(|&b| b == delim) {
            Some(idx) => {
                self.pos += idx + 1;
                &rest[..idx]
            }
            None => {
                self.pos = self.data.len();
                rest
            }
        }
    }

    /// Consumes and returns the remainder of the record
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }
}

/// Lossy conversion for names and chat carried as Latin-1 style bytes
pub fn to_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
