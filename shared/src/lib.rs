//! # Shared Protocol Primitives
//!
//! Wire-level building blocks used by both the game server and the test
//! client. Nothing in this crate performs I/O; it only turns bytes into
//! values and back.
//!
//! ## Layers
//!
//! ### Field encoding (`gstring`)
//! Every integer on the wire is a run of 7-bit digits biased by +32. The
//! [`gstring::GWrite`] trait builds packets and [`gstring::GReader`] parses
//! records, returning zero for reads past the end.
//!
//! ### Frame codec (`codec`)
//! Five backward-compatible generations of compression and keystream
//! encryption. [`codec::Codec`] decodes inbound frames, [`codec::Encoder`]
//! produces them.
//!
//! ### Framing (`frame`)
//! Length-prefixed frames and the newline or raw-block records inside them.
//!
//! ### Identifiers (`opcodes`, `props`, `roles`, `versions`)
//! Packet ids, player property ids, connection roles and version codes.

pub mod codec;
pub mod frame;
pub mod gstring;
pub mod opcodes;
pub mod props;
pub mod roles;
pub mod versions;

use gstring::GWrite;

pub use codec::{Codec, Encoder, Generation};
pub use roles::{Role, RoleMask};

/// Starts an outbound packet with its biased opcode
pub fn packet(opcode: u8) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_gchar(opcode);
    out
}
