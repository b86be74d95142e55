//! Core data model for annotated images.
//!
//! An image is addressed by [`Offset`] (file position) and [`Rva`] (runtime
//! relative virtual address). References are `(location, target)` offset
//! pairs whose on-disk width is a per-type constant; types are grouped into
//! pools whose targets are semantically interchangeable. Equivalences tie
//! approximately-matching blocks of an "old" and a "new" image together.

use core::fmt;

use marrow_core::buffer::BufferRegion;

/// An offset into an image. Images larger than 2 GiB are not supported; the
/// upper half of the range is reserved.
pub type Offset = u32;
pub const OFFSET_BOUND: Offset = u32::MAX / 2;
pub const INVALID_OFFSET: Offset = u32::MAX - 1;

/// A virtual address relative to the image base. Same bounds as [`Offset`].
pub type Rva = u32;
pub const RVA_BOUND: Rva = u32::MAX / 2;
pub const INVALID_RVA: Rva = u32::MAX - 1;

/// Identifies an offset within a sorted target pool.
pub type TargetKey = u32;

/// Uniquely identifies a reference type within a disassembler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeTag(pub u8);

/// Raw data carries this tag.
pub const NO_TYPE_TAG: TypeTag = TypeTag(0xFF);

/// Uniquely identifies a target pool within a disassembler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolTag(pub u8);

pub const NO_POOL_TAG: PoolTag = PoolTag(0xFF);

impl TypeTag {
    #[inline]
    #[must_use]
    pub const fn value(self) -> u8 {
        self.0
    }
}

impl PoolTag {
    #[inline]
    #[must_use]
    pub const fn value(self) -> u8 {
        self.0
    }
}

/// Pointer width of an architecture. The numerical values equal the width
/// in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Bitness {
    Bits32 = 4,
    Bits64 = 8,
}

impl Bitness {
    #[inline]
    #[must_use]
    pub const fn width(self) -> u32 {
        self as u32
    }
}

/// Describes one reference type: the number of bytes its body covers, its
/// type tag, and the pool its targets belong to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReferenceTypeTraits {
    pub width: Offset,
    pub type_tag: TypeTag,
    pub pool_tag: PoolTag,
}

impl ReferenceTypeTraits {
    #[inline]
    #[must_use]
    pub const fn new(width: Offset, type_tag: TypeTag, pool_tag: PoolTag) -> Self {
        Self { width, type_tag, pool_tag }
    }
}

/// A reference in an image. The type is implied by the container holding
/// the reference, so only location and target are stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reference {
    pub location: Offset,
    pub target: Offset,
}

/// Extracts references from an image, in strictly ascending location order.
/// Readers are lazy and hold no reference storage of their own.
pub trait ReferenceReader {
    fn next_ref(&mut self) -> Option<Reference>;
}

/// Writes references back into an image.
pub trait ReferenceWriter {
    fn put(&mut self, reference: Reference);
}

/// Produces "new operation bits + old payload bits" composite reference
/// bytes, for architectures where the two share bytes (ARM). The returned
/// slice is valid until the next call to `mix`.
pub trait ReferenceMixer {
    fn mix(&mut self, old_offset: Offset, new_offset: Offset) -> &[u8];
}

/// A reader that produces nothing.
pub struct EmptyReferenceReader;

impl ReferenceReader for EmptyReferenceReader {
    #[inline]
    fn next_ref(&mut self) -> Option<Reference> {
        None
    }
}

/// A writer that ignores everything.
pub struct EmptyReferenceWriter;

impl ReferenceWriter for EmptyReferenceWriter {
    #[inline]
    fn put(&mut self, _reference: Reference) {}
}

/// A block of `length` bytes that approximately matches between the old
/// image (at `src_offset`) and the new image (at `dst_offset`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Equivalence {
    pub src_offset: Offset,
    pub dst_offset: Offset,
    pub length: Offset,
}

impl Equivalence {
    #[inline]
    #[must_use]
    pub const fn src_end(&self) -> Offset {
        self.src_offset + self.length
    }

    #[inline]
    #[must_use]
    pub const fn dst_end(&self) -> Offset {
        self.dst_offset + self.length
    }
}

/// An [`Equivalence`] with its similarity score, used during generation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EquivalenceCandidate {
    pub eq: Equivalence,
    pub similarity: f64,
}

const fn exe_code(tag: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*tag)
}

/// Executable types, as 4-character codes packed little-endian into 32
/// bits. Values are part of the patch format and must never change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ExecutableType {
    NoOp = exe_code(b"NoOp"),
    Win32X86 = exe_code(b"Px86"),
    Win32X64 = exe_code(b"Px64"),
    ElfX86 = exe_code(b"Ex86"),
    ElfX64 = exe_code(b"Ex64"),
    ElfAArch32 = exe_code(b"EA32"),
    ElfAArch64 = exe_code(b"EA64"),
    Dex = exe_code(b"DEX "),
    Ztf = exe_code(b"ZTF "),
}

impl ExecutableType {
    #[inline]
    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Validates a code read from a patch file.
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            c if c == Self::NoOp.code() => Some(Self::NoOp),
            c if c == Self::Win32X86.code() => Some(Self::Win32X86),
            c if c == Self::Win32X64.code() => Some(Self::Win32X64),
            c if c == Self::ElfX86.code() => Some(Self::ElfX86),
            c if c == Self::ElfX64.code() => Some(Self::ElfX64),
            c if c == Self::ElfAArch32.code() => Some(Self::ElfAArch32),
            c if c == Self::ElfAArch64.code() => Some(Self::ElfAArch64),
            c if c == Self::Dex.code() => Some(Self::Dex),
            c if c == Self::Ztf.code() => Some(Self::Ztf),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.code().to_le_bytes() {
            write!(f, "{}", b as char)?;
        }
        Ok(())
    }
}

/// A region of an archive holding a single executable recognized by one
/// disassembler. `exe_type == NoOp` denotes raw data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Element {
    pub region: BufferRegion,
    pub exe_type: ExecutableType,
}

impl Element {
    #[inline]
    #[must_use]
    pub const fn new(region: BufferRegion, exe_type: ExecutableType) -> Self {
        Self { region, exe_type }
    }

    #[inline]
    #[must_use]
    pub const fn raw(region: BufferRegion) -> Self {
        Self { region, exe_type: ExecutableType::NoOp }
    }

    #[inline]
    #[must_use]
    pub const fn begin_offset(&self) -> Offset {
        self.region.offset as Offset
    }

    #[inline]
    #[must_use]
    pub const fn end_offset(&self) -> Offset {
        (self.region.offset + self.region.size) as Offset
    }
}

/// A matched pair of elements of the same executable type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElementMatch {
    pub old_element: Element,
    pub new_element: Element,
}

impl ElementMatch {
    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.old_element.exe_type == self.new_element.exe_type
    }

    #[inline]
    #[must_use]
    pub fn exe_type(&self) -> ExecutableType {
        self.old_element.exe_type
    }
}

impl fmt::Display for ElementMatch {
    /// Renders the match as `"#+#=#+#"`: offset and size in "old", then
    /// offset and size in "new". The element type is omitted.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}+{}={}+{}",
            self.old_element.region.offset,
            self.old_element.region.size,
            self.new_element.region.offset,
            self.new_element.region.size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exe_codes_round_trip() {
        for exe_type in [
            ExecutableType::NoOp,
            ExecutableType::Win32X86,
            ExecutableType::Win32X64,
            ExecutableType::ElfX86,
            ExecutableType::ElfX64,
            ExecutableType::ElfAArch32,
            ExecutableType::ElfAArch64,
            ExecutableType::Dex,
            ExecutableType::Ztf,
        ] {
            assert_eq!(ExecutableType::from_code(exe_type.code()), Some(exe_type));
        }
        assert_eq!(ExecutableType::from_code(0), None);
        assert_eq!(ExecutableType::from_code(u32::MAX), None);
    }

    #[test]
    fn exe_code_layout() {
        // 'P' 'x' '8' '6' packed little-endian.
        assert_eq!(ExecutableType::Win32X86.code(), 0x3638_7850);
        assert_eq!(ExecutableType::Win32X86.to_string(), "Px86");
        assert_eq!(ExecutableType::Dex.to_string(), "DEX ");
    }

    #[test]
    fn element_match_display() {
        let m = ElementMatch {
            old_element: Element::raw(BufferRegion::new(1, 2)),
            new_element: Element::raw(BufferRegion::new(3, 4)),
        };
        assert_eq!(m.to_string(), "1+2=3+4");
    }
}
