//! Relocation table parsing for PE and ELF.
//!
//! Win32 PE stores relocs as "blocks" keyed by the high 20 RVA bits, each
//! followed by 2-byte units packing `(type:4, rva_lo:12)`. ELF stores
//! relocs in SHT_REL / SHT_RELA sections as fixed-size structs; only the
//! architecture's `R_*_RELATIVE` type is of interest, and `r_offset` is the
//! target RVA.

use log::{error, warn};
use marrow_core::buffer::{read_obj, read_u16_le, write_u16_le, BufferRegion};
use marrow_core::util::align_ceil;
use marrow_image::prelude::*;
use marrow_image::translator::{OffsetToRvaCache, RvaToOffsetCache};
use marrow_image::types::Bitness;

use crate::elf::{Elf32Rel, Elf64Rel};
use crate::pe::RelocHeader;

/// Size of one Win32 reloc unit.
pub const RELOC_UNIT_SIZE: u32 = 2;

/// Extracted Win32 reloc unit data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelocUnitWin32 {
    pub type_code: u8,
    pub location: Offset,
    pub target_rva: Rva,
}

/// Parses `image` at `reloc_region` to find the beginning offset of each
/// reloc block. Returns `None` if the table is malformed (bad block size or
/// trailing data).
#[must_use]
pub fn find_reloc_blocks(image: &[u8], reloc_region: BufferRegion) -> Option<Vec<Offset>> {
    debug_assert!(reloc_region.size < OFFSET_BOUND as usize);
    let mut reloc_block_offsets = Vec::new();
    let mut pos = reloc_region.lo();
    let end = reloc_region.hi();
    while end - pos >= core::mem::size_of::<RelocHeader>() {
        reloc_block_offsets.push(pos as Offset);
        let header: RelocHeader = read_obj(image, pos)?;
        let size = header.size.get() as usize;
        // Blocks must hold their header and be 4-byte aligned.
        if size < core::mem::size_of::<RelocHeader>() || size % 4 != 0 || size > end - pos {
            return None;
        }
        pos += size;
    }
    // Trailing data invalidate the table.
    (pos == end).then_some(reloc_block_offsets)
}

/// Parses Win32 PE relocation data and emits a [`RelocUnitWin32`] for each
/// unit lying strictly inside `[lo, hi)`. Encapsulates block transitions.
pub struct RelocRvaReaderWin32<'a> {
    image: &'a [u8],
    end_pos: usize,
    cur_pos: usize,
    cur_block_end: usize,
    rva_hi_bits: Rva,
}

impl<'a> RelocRvaReaderWin32<'a> {
    /// `reloc_block_offsets` should be precomputed by [`find_reloc_blocks`].
    #[must_use]
    pub fn new(
        image: &'a [u8],
        reloc_region: BufferRegion,
        reloc_block_offsets: &[Offset],
        lo: Offset,
        hi: Offset,
    ) -> Self {
        debug_assert!(lo <= hi);
        let lo = reloc_region.inclusive_clamp(lo as usize);
        let hi = reloc_region.inclusive_clamp(hi as usize);
        // Defaults make next_unit() produce nothing.
        let mut reader = Self {
            image,
            end_pos: hi,
            cur_pos: hi,
            cur_block_end: hi,
            rva_hi_bits: 0,
        };
        if reloc_block_offsets.is_empty() {
            return reader;
        }

        // Find the block containing |lo|.
        let block_it = reloc_block_offsets.partition_point(|&block| block as usize <= lo);
        debug_assert!(block_it > 0);
        let block_begin = reloc_block_offsets[block_it - 1] as usize;
        if !reader.load_block(block_begin) {
            return reader; // Nothing left.
        }

        // Skip to |lo|, truncating up to the next unit boundary. This may
        // empty the current block.
        if lo > reader.cur_pos {
            let delta = align_ceil((lo - reader.cur_pos) as u32, RELOC_UNIT_SIZE) as usize;
            reader.cur_pos = (reader.cur_pos + delta).min(reader.cur_block_end);
        }
        reader
    }

    /// Successively visits each reloc unit. Unrolls a nested loop: the outer
    /// over reloc blocks, the inner over units.
    pub fn next_unit(&mut self) -> Option<RelocUnitWin32> {
        while self.cur_block_end - self.cur_pos < RELOC_UNIT_SIZE as usize {
            if !self.load_block(self.cur_block_end) {
                return None;
            }
        }
        if self.end_pos - self.cur_pos < RELOC_UNIT_SIZE as usize {
            return None;
        }
        let location = self.cur_pos as Offset;
        let entry = read_u16_le(self.image, self.cur_pos)?;
        self.cur_pos += RELOC_UNIT_SIZE as usize;
        Some(RelocUnitWin32 {
            type_code: (entry >> 12) as u8,
            location,
            target_rva: self.rva_hi_bits + Rva::from(entry & 0xFFF),
        })
    }

    /// Assuming `block_begin` starts a reloc block, loads its header and
    /// positions the cursor on its units. Returns whether data remain.
    fn load_block(&mut self, block_begin: usize) -> bool {
        let header_end = block_begin + core::mem::size_of::<RelocHeader>();
        if header_end >= self.end_pos || self.end_pos - header_end < RELOC_UNIT_SIZE as usize {
            return false;
        }
        let Some(header) = read_obj::<RelocHeader>(self.image, block_begin) else {
            return false;
        };
        self.rva_hi_bits = header.rva_hi.get();
        let block_size = header.size.get() as usize;
        if block_size < core::mem::size_of::<RelocHeader>() {
            return false;
        }
        if (block_size - core::mem::size_of::<RelocHeader>()) % RELOC_UNIT_SIZE as usize != 0 {
            return false;
        }
        self.cur_pos = header_end;
        self.cur_block_end = block_begin + block_size;
        true
    }
}

/// Reader for Win32 reloc references: filters and translates
/// [`RelocRvaReaderWin32`] output. `offset_bound` is the exclusive upper
/// bound on reloc target offsets, accounting for the width of the abs32
/// references they designate.
pub struct RelocReaderWin32<'a> {
    rva_reader: RelocRvaReaderWin32<'a>,
    reloc_type: u8,
    offset_bound: Offset,
    entry_rva_to_offset: RvaToOffsetCache<'a>,
}

impl<'a> RelocReaderWin32<'a> {
    #[must_use]
    pub fn new(
        rva_reader: RelocRvaReaderWin32<'a>,
        reloc_type: u8,
        offset_bound: Offset,
        translator: &'a AddressTranslator,
    ) -> Self {
        Self {
            rva_reader,
            reloc_type,
            offset_bound,
            entry_rva_to_offset: RvaToOffsetCache::new(translator),
        }
    }
}

impl ReferenceReader for RelocReaderWin32<'_> {
    fn next_ref(&mut self) -> Option<Reference> {
        while let Some(unit) = self.rva_reader.next_unit() {
            if unit.type_code != self.reloc_type {
                continue;
            }
            let target = self.entry_rva_to_offset.convert(unit.target_rva);
            if target == INVALID_OFFSET {
                continue;
            }
            // The target is an abs32 reference that must lie entirely within
            // the image.
            if target >= self.offset_bound {
                continue;
            }
            return Some(Reference { location: unit.location, target });
        }
        None
    }
}

/// Writer for Win32 reloc references. Simpler than the reader: high-order
/// RVA bits are handled by the block structure, so only the low 12 bits are
/// written.
pub struct RelocWriterWin32<'a> {
    reloc_type: u8,
    image: &'a mut [u8],
    reloc_region: BufferRegion,
    reloc_block_offsets: &'a [Offset],
    target_offset_to_rva: OffsetToRvaCache<'a>,
}

impl<'a> RelocWriterWin32<'a> {
    #[must_use]
    pub fn new(
        reloc_type: u8,
        image: &'a mut [u8],
        reloc_region: BufferRegion,
        reloc_block_offsets: &'a [Offset],
        translator: &'a AddressTranslator,
    ) -> Self {
        Self {
            reloc_type,
            image,
            reloc_region,
            reloc_block_offsets,
            target_offset_to_rva: OffsetToRvaCache::new(translator),
        }
    }
}

impl ReferenceWriter for RelocWriterWin32<'_> {
    fn put(&mut self, reference: Reference) {
        debug_assert!(reference.location as usize >= self.reloc_region.lo());
        debug_assert!((reference.location as usize) < self.reloc_region.hi());
        let block_it =
            self.reloc_block_offsets.partition_point(|&block| block <= reference.location);
        let block_begin = self.reloc_block_offsets[block_it - 1] as usize;
        let Some(header) = read_obj::<RelocHeader>(self.image, block_begin) else {
            return;
        };
        let rva_hi_bits = header.rva_hi.get();
        let target_rva = self.target_offset_to_rva.convert(reference.target);
        let rva_lo_bits = target_rva.wrapping_sub(rva_hi_bits) & 0xFFF;
        if target_rva != rva_hi_bits + rva_lo_bits {
            error!("Invalid RVA at {:08X}.", reference.location);
            return;
        }
        write_u16_le(
            self.image,
            reference.location as usize,
            rva_lo_bits as u16 | (u16::from(self.reloc_type) << 12),
        );
    }
}

/// Dimensions of one ELF reloc section: its file region and entry size
/// (which differs between REL and RELA sections).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SectionDimensionsElf {
    pub region: BufferRegion,
    pub entry_size: u32,
}

/// Visits all reloc structs located in `[lo, hi)` (excluding a struct
/// truncated at `lo` but including one truncated at `hi`), emitting valid
/// references of the wanted relocation type. A nested loop unrolled into a
/// generator: the outer loop walks `reloc_section_dims` (sorted by offset),
/// the inner walks successive reloc structs within a section.
pub struct RelocReaderElf<'a> {
    image: &'a [u8],
    bitness: Bitness,
    rel_type: u32,
    reloc_section_dims: &'a [SectionDimensionsElf],
    cur_section: usize,
    hi: Offset,
    cursor: Offset,
    target_rva_to_offset: RvaToOffsetCache<'a>,
}

impl<'a> RelocReaderElf<'a> {
    #[must_use]
    pub fn new(
        image: &'a [u8],
        bitness: Bitness,
        reloc_section_dims: &'a [SectionDimensionsElf],
        rel_type: u32,
        lo: Offset,
        hi: Offset,
        translator: &'a AddressTranslator,
    ) -> Self {
        debug_assert!(!reloc_section_dims.is_empty());
        // Find the reloc section at or right before |lo|.
        let mut cur_section =
            reloc_section_dims.partition_point(|dim| dim.region.offset <= lo as usize);
        cur_section = cur_section.saturating_sub(1);

        // |lo| and |hi| never cut across a reloc reference (the |r_offset|
        // field), but may cut across a reloc struct. Align |cursor| up to
        // exclude a struct cut by |lo|, and |hi| up to include one cut by it.
        let entry_size = reloc_section_dims[cur_section].entry_size;
        let mut cursor = reloc_section_dims[cur_section].region.offset as Offset;
        if cursor < lo {
            cursor += align_ceil(lo - cursor, entry_size);
        }

        let mut hi = hi;
        let end_section =
            reloc_section_dims.partition_point(|dim| dim.region.offset <= hi as usize);
        if end_section > 0 {
            let dim = &reloc_section_dims[end_section - 1];
            if (hi as usize - dim.region.offset) < dim.region.size {
                let region_offset = dim.region.offset as Offset;
                hi = region_offset + align_ceil(hi - region_offset, dim.entry_size);
            }
        }

        Self {
            image,
            bitness,
            rel_type,
            reloc_section_dims,
            cur_section,
            hi,
            cursor,
            target_rva_to_offset: RvaToOffsetCache::new(translator),
        }
    }

    /// Returns the target RVA of a reloc struct at `pos` if its type is the
    /// wanted one, else [`INVALID_RVA`]. RELA entries are handled by the
    /// fact that a REL struct is a prefix of a RELA struct.
    fn relocation_target(&self, pos: usize) -> Rva {
        match self.bitness {
            Bitness::Bits32 => {
                let Some(rel) = read_obj::<Elf32Rel>(self.image, pos) else {
                    return INVALID_RVA;
                };
                // The low byte of |r_info| is the type; the rest names the
                // symbol, which is ignored.
                if rel.r_info.get() & 0xFF == self.rel_type {
                    return rel.r_offset.get();
                }
                INVALID_RVA
            }
            Bitness::Bits64 => {
                let Some(rel) = read_obj::<Elf64Rel>(self.image, pos) else {
                    return INVALID_RVA;
                };
                // The low 4 bytes of |r_info| are the type.
                if (rel.r_info.get() & 0xFFFF_FFFF) as u32 == self.rel_type {
                    let r_offset = rel.r_offset.get();
                    if r_offset & 0xFFFF_FFFF == r_offset {
                        return r_offset as Rva;
                    }
                    warn!("Skipping r_offset whose value exceeds 32-bits.");
                }
                INVALID_RVA
            }
        }
    }
}

impl ReferenceReader for RelocReaderElf<'_> {
    fn next_ref(&mut self) -> Option<Reference> {
        let dims = self.reloc_section_dims;
        let mut entry_size = dims[self.cur_section].entry_size;
        let mut section_end = dims[self.cur_section].region.hi() as Offset;

        while self.cursor + entry_size <= self.hi {
            while self.cursor >= section_end {
                self.cur_section += 1;
                if self.cur_section == dims.len() {
                    return None;
                }
                entry_size = dims[self.cur_section].entry_size;
                self.cursor = dims[self.cur_section].region.offset as Offset;
                if self.cursor + entry_size > self.hi {
                    return None;
                }
                section_end = dims[self.cur_section].region.hi() as Offset;
            }
            let target_rva = self.relocation_target(self.cursor as usize);
            if target_rva == INVALID_RVA {
                self.cursor += entry_size;
                continue;
            }
            let target = self.target_rva_to_offset.convert(target_rva);
            // The target designates an abs32 reference, which must lie
            // entirely within the image.
            if target == INVALID_OFFSET
                || !BufferRegion::new(target as usize, self.bitness.width() as usize)
                    .fits_in(self.image.len())
            {
                self.cursor += entry_size;
                continue;
            }
            let location = self.cursor;
            self.cursor += entry_size;
            return Some(Reference { location, target });
        }
        None
    }
}

/// Writer for ELF reloc references: rewrites `r_offset`, leaving `r_info`
/// (and any addend) alone.
pub struct RelocWriterElf<'a> {
    image: &'a mut [u8],
    bitness: Bitness,
    target_offset_to_rva: OffsetToRvaCache<'a>,
}

impl<'a> RelocWriterElf<'a> {
    #[must_use]
    pub fn new(
        image: &'a mut [u8],
        bitness: Bitness,
        translator: &'a AddressTranslator,
    ) -> Self {
        Self { image, bitness, target_offset_to_rva: OffsetToRvaCache::new(translator) }
    }
}

impl ReferenceWriter for RelocWriterElf<'_> {
    fn put(&mut self, reference: Reference) {
        let rva = self.target_offset_to_rva.convert(reference.target);
        match self.bitness {
            Bitness::Bits32 => {
                marrow_core::buffer::write_u32_le(self.image, reference.location as usize, rva);
            }
            Bitness::Bits64 => {
                marrow_core::buffer::write_u64_le(
                    self.image,
                    reference.location as usize,
                    u64::from(rva),
                );
            }
        }
    }
}
