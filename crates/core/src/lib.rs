//! This crate is used as a utilities library for common byte-level
//! functionality across [Marrow](https://crates.io/crates/marrow) modules.
//!
//! Everything here is format-agnostic: bounds-checked buffer access,
//! LEB128 varints, CRC-32, suffix arrays, and the bit/range helpers the
//! disassemblers build on.

pub mod buffer;
pub mod crc32;
pub mod suffix_array;
pub mod util;
pub mod varint;

pub mod prelude;
