//! On-disk patch structures and versioning constants.
//!
//! Layout (little-endian throughout, packed):
//!
//! | Field | Type | Notes |
//! |-------|------|-------|
//! | [`PatchHeader`] | 24 bytes | magic, versions, old/new size and CRC-32. |
//! | element count | u32 | |
//! | elements | ... | [`PatchElementHeader`] + streams, in new-image order. |
//!
//! Each element's streams appear in fixed order — equivalence src skips,
//! dst skips, copy counts, extra data, raw delta skips, raw delta diffs,
//! reference deltas, then a pool count and per-pool `(tag, targets)` blobs.
//! Every blob is a u32 byte length followed by its bytes.

use marrow_image::types::Offset;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, LittleEndian, U16, U32};

/// Magic signature at the beginning of a patch file.
pub const PATCH_MAGIC: u32 = u32::from_le_bytes(*b"Zucc");

/// A change in major version means a patch definitely cannot be applied by
/// a binary whose major version differs.
pub const MAJOR_VERSION: u16 = 2;

/// A change in minor version indicates possibly breaking changes at the
/// element level.
pub const MINOR_VERSION: u16 = 0;

/// Empty / error value for version numbers.
pub const INVALID_VERSION: u16 = 0xFFFF;

/// Header of an ensemble patch.
#[derive(Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct PatchHeader {
    pub magic: U32<LittleEndian>,
    pub major_version: U16<LittleEndian>,
    pub minor_version: U16<LittleEndian>,
    pub old_size: U32<LittleEndian>,
    pub old_crc: U32<LittleEndian>,
    pub new_size: U32<LittleEndian>,
    pub new_crc: U32<LittleEndian>,
}

/// Header of a single patch element.
#[derive(Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct PatchElementHeader {
    pub old_offset: U32<LittleEndian>,
    pub old_length: U32<LittleEndian>,
    pub new_offset: U32<LittleEndian>,
    pub new_length: U32<LittleEndian>,
    pub exe_type: U32<LittleEndian>,
    pub version: U16<LittleEndian>,
}

const _: () = assert!(core::mem::size_of::<PatchHeader>() == 24);
const _: () = assert!(core::mem::size_of::<PatchElementHeader>() == 22);

/// A raw bytewise correction: `copy_offset` indexes into the concatenation
/// of all equivalences' copied content, and `diff` is the byte to add.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawDeltaUnit {
    pub copy_offset: Offset,
    pub diff: i8,
}
