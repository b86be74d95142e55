//! Disassembler for Windows Portable Executables (PE32 / PE32+).
//!
//! Three reference types are extracted, one pool each:
//! * **reloc** — 2-byte units in the base relocation table (data directory
//!   entry 5), whose targets are the abs32 locations they fix up.
//! * **abs32** — absolute 32/64-bit pointers at the reloc targets.
//! * **rel32** — 4-byte relative displacements found by scanning code
//!   sections for call/jump (and, on x64, RIP-relative) opcodes.

use core::marker::PhantomData;
use core::mem::size_of;

use bitflags::bitflags;
use log::warn;
use marrow_core::buffer::{BufferRegion, BufferSource};
use marrow_core::util::range_is_bounded;
use marrow_image::prelude::*;
use marrow_image::translator::{RvaToOffsetCache, Unit};
use marrow_image::types::Bitness;
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned, LittleEndian, U16, U32, U64};

use crate::abs32::{
    remove_overlapping_abs32, remove_untranslatable_abs32, Abs32Reader, Abs32RvaExtractor,
    Abs32Writer, AbsoluteAddress,
};
use crate::rel32::{Abs32GapFinder, Rel32FinderIntel, Rel32ReaderX86, Rel32WriterX86};
use crate::reloc::{
    find_reloc_blocks, RelocReaderWin32, RelocRvaReaderWin32, RelocWriterWin32,
};
use crate::Disassembler;

pub const NUM_DATA_DIRECTORIES: usize = 16;
pub const INDEX_OF_BASE_RELOCATION_TABLE: usize = 5;

bitflags! {
    /// PE section characteristics (the subset of interest).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SectionCharacteristics: u32 {
        const CNT_CODE = 0x0000_0020;
        const MEM_EXECUTE = 0x2000_0000;
        const MEM_READ = 0x4000_0000;
        const MEM_WRITE = 0x8000_0000;
    }
}

/// Characteristics usually associated with code sections.
pub const CODE_CHARACTERISTICS: SectionCharacteristics =
    SectionCharacteristics::MEM_EXECUTE.union(SectionCharacteristics::MEM_READ);

// On-disk header layouts, following WINNT.h.

#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ImageDosHeader {
    pub e_magic: U16<LittleEndian>, // "MZ".
    pub e_cblp: U16<LittleEndian>,
    pub e_cp: U16<LittleEndian>,
    pub e_crlc: U16<LittleEndian>,
    pub e_cparhdr: U16<LittleEndian>,
    pub e_minalloc: U16<LittleEndian>,
    pub e_maxalloc: U16<LittleEndian>,
    pub e_ss: U16<LittleEndian>,
    pub e_sp: U16<LittleEndian>,
    pub e_csum: U16<LittleEndian>,
    pub e_ip: U16<LittleEndian>,
    pub e_cs: U16<LittleEndian>,
    pub e_lfarlc: U16<LittleEndian>,
    pub e_ovno: U16<LittleEndian>,
    pub e_res: [U16<LittleEndian>; 4],
    pub e_oemid: U16<LittleEndian>,
    pub e_oeminfo: U16<LittleEndian>,
    pub e_res2: [U16<LittleEndian>; 10],
    pub e_lfanew: U32<LittleEndian>,
}

#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ImageFileHeader {
    pub machine: U16<LittleEndian>,
    pub number_of_sections: U16<LittleEndian>,
    pub time_date_stamp: U32<LittleEndian>,
    pub pointer_to_symbol_table: U32<LittleEndian>,
    pub number_of_symbols: U32<LittleEndian>,
    pub size_of_optional_header: U16<LittleEndian>,
    pub characteristics: U16<LittleEndian>,
}

#[derive(Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ImageDataDirectory {
    pub virtual_address: U32<LittleEndian>,
    pub size: U32<LittleEndian>,
}

#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ImageOptionalHeader32 {
    pub magic: U16<LittleEndian>, // 0x10B.
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: U32<LittleEndian>,
    pub size_of_initialized_data: U32<LittleEndian>,
    pub size_of_uninitialized_data: U32<LittleEndian>,
    pub address_of_entry_point: U32<LittleEndian>,
    pub base_of_code: U32<LittleEndian>,
    pub base_of_data: U32<LittleEndian>,
    pub image_base: U32<LittleEndian>,
    pub section_alignment: U32<LittleEndian>,
    pub file_alignment: U32<LittleEndian>,
    pub major_operating_system_version: U16<LittleEndian>,
    pub minor_operating_system_version: U16<LittleEndian>,
    pub major_image_version: U16<LittleEndian>,
    pub minor_image_version: U16<LittleEndian>,
    pub major_subsystem_version: U16<LittleEndian>,
    pub minor_subsystem_version: U16<LittleEndian>,
    pub win32_version_value: U32<LittleEndian>,
    pub size_of_image: U32<LittleEndian>,
    pub size_of_headers: U32<LittleEndian>,
    pub check_sum: U32<LittleEndian>,
    pub subsystem: U16<LittleEndian>,
    pub dll_characteristics: U16<LittleEndian>,
    pub size_of_stack_reserve: U32<LittleEndian>,
    pub size_of_stack_commit: U32<LittleEndian>,
    pub size_of_heap_reserve: U32<LittleEndian>,
    pub size_of_heap_commit: U32<LittleEndian>,
    pub loader_flags: U32<LittleEndian>,
    pub number_of_rva_and_sizes: U32<LittleEndian>,
    // Logically |number_of_rva_and_sizes| entries; accesses are checked
    // against that bound.
    pub data_directory: [ImageDataDirectory; NUM_DATA_DIRECTORIES],
}

#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ImageOptionalHeader64 {
    pub magic: U16<LittleEndian>, // 0x20B.
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: U32<LittleEndian>,
    pub size_of_initialized_data: U32<LittleEndian>,
    pub size_of_uninitialized_data: U32<LittleEndian>,
    pub address_of_entry_point: U32<LittleEndian>,
    pub base_of_code: U32<LittleEndian>,
    pub image_base: U64<LittleEndian>,
    pub section_alignment: U32<LittleEndian>,
    pub file_alignment: U32<LittleEndian>,
    pub major_operating_system_version: U16<LittleEndian>,
    pub minor_operating_system_version: U16<LittleEndian>,
    pub major_image_version: U16<LittleEndian>,
    pub minor_image_version: U16<LittleEndian>,
    pub major_subsystem_version: U16<LittleEndian>,
    pub minor_subsystem_version: U16<LittleEndian>,
    pub win32_version_value: U32<LittleEndian>,
    pub size_of_image: U32<LittleEndian>,
    pub size_of_headers: U32<LittleEndian>,
    pub check_sum: U32<LittleEndian>,
    pub subsystem: U16<LittleEndian>,
    pub dll_characteristics: U16<LittleEndian>,
    pub size_of_stack_reserve: U64<LittleEndian>,
    pub size_of_stack_commit: U64<LittleEndian>,
    pub size_of_heap_reserve: U64<LittleEndian>,
    pub size_of_heap_commit: U64<LittleEndian>,
    pub loader_flags: U32<LittleEndian>,
    pub number_of_rva_and_sizes: U32<LittleEndian>,
    pub data_directory: [ImageDataDirectory; NUM_DATA_DIRECTORIES],
}

#[derive(Clone, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ImageSectionHeader {
    pub name: [u8; 8],
    pub virtual_size: U32<LittleEndian>,
    pub virtual_address: U32<LittleEndian>,
    pub size_of_raw_data: U32<LittleEndian>,
    pub file_offset_of_raw_data: U32<LittleEndian>,
    pub pointer_to_relocations: U32<LittleEndian>,
    pub pointer_to_line_numbers: U32<LittleEndian>,
    pub number_of_relocations: U16<LittleEndian>,
    pub number_of_line_numbers: U16<LittleEndian>,
    pub characteristics: U32<LittleEndian>,
}

/// Header of one base relocation block.
#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct RelocHeader {
    pub rva_hi: U32<LittleEndian>,
    pub size: U32<LittleEndian>,
}

const _: () = assert!(size_of::<ImageDosHeader>() == 0x40);
const _: () = assert!(size_of::<ImageFileHeader>() == 0x14);
const _: () = assert!(size_of::<ImageOptionalHeader32>() == 0xE0);
const _: () = assert!(size_of::<ImageOptionalHeader64>() == 0xF0);
const _: () = assert!(size_of::<ImageSectionHeader>() == 0x28);

/// Decides whether `section` contains code.
#[inline]
#[must_use]
pub fn is_win32_code_section(section: &ImageSectionHeader) -> bool {
    SectionCharacteristics::from_bits_truncate(section.characteristics.get())
        .contains(CODE_CHARACTERISTICS)
}

/// Uniform accessors over the 32-bit and 64-bit optional headers.
pub trait OptionalHeader {
    fn magic(&self) -> u16;
    fn image_base(&self) -> u64;
    fn size_of_image(&self) -> u32;
    fn number_of_rva_and_sizes(&self) -> u32;
    fn data_directory(&self) -> &[ImageDataDirectory];
}

impl OptionalHeader for ImageOptionalHeader32 {
    fn magic(&self) -> u16 {
        self.magic.get()
    }
    fn image_base(&self) -> u64 {
        u64::from(self.image_base.get())
    }
    fn size_of_image(&self) -> u32 {
        self.size_of_image.get()
    }
    fn number_of_rva_and_sizes(&self) -> u32 {
        self.number_of_rva_and_sizes.get()
    }
    fn data_directory(&self) -> &[ImageDataDirectory] {
        &self.data_directory
    }
}

impl OptionalHeader for ImageOptionalHeader64 {
    fn magic(&self) -> u16 {
        self.magic.get()
    }
    fn image_base(&self) -> u64 {
        self.image_base.get()
    }
    fn size_of_image(&self) -> u32 {
        self.size_of_image.get()
    }
    fn number_of_rva_and_sizes(&self) -> u32 {
        self.number_of_rva_and_sizes.get()
    }
    fn data_directory(&self) -> &[ImageDataDirectory] {
        &self.data_directory
    }
}

/// Per-architecture constants for the PE disassembler.
pub trait PeArch {
    const VERSION: u16;
    const BITNESS: Bitness;
    const EXE_TYPE: ExecutableType;
    const MAGIC: u16;
    const RELOC_TYPE: u8;
    const IS_X64: bool;
    const NAME: &'static str;
    type OptionalHeader: OptionalHeader + FromBytes + KnownLayout + Immutable + Unaligned;
}

pub struct Win32X86Traits;

impl PeArch for Win32X86Traits {
    const VERSION: u16 = 1;
    const BITNESS: Bitness = Bitness::Bits32;
    const EXE_TYPE: ExecutableType = ExecutableType::Win32X86;
    const MAGIC: u16 = 0x10B;
    const RELOC_TYPE: u8 = 3; // IMAGE_REL_BASED_HIGHLOW.
    const IS_X64: bool = false;
    const NAME: &'static str = "Windows PE x86";
    type OptionalHeader = ImageOptionalHeader32;
}

pub struct Win32X64Traits;

impl PeArch for Win32X64Traits {
    const VERSION: u16 = 1;
    const BITNESS: Bitness = Bitness::Bits64;
    const EXE_TYPE: ExecutableType = ExecutableType::Win32X64;
    const MAGIC: u16 = 0x20B;
    const RELOC_TYPE: u8 = 10; // IMAGE_REL_BASED_DIR64.
    const IS_X64: bool = true;
    const NAME: &'static str = "Windows PE x64";
    type OptionalHeader = ImageOptionalHeader64;
}

// Decides whether |image| may be a Win32 PE file; on success returns a
// source positioned right after the "PE\0\0" magic.
fn read_win32_header<'a>(image: &'a [u8]) -> Option<BufferSource<'a>> {
    let mut source = BufferSource::new(image);
    if !source.check_bytes(b"MZ") {
        return None;
    }
    let dos_header = source.get_ref::<ImageDosHeader>().ok()?;
    // Reject |e_lfanew| on misalignment or overlap with the DOS header.
    let e_lfanew = dos_header.e_lfanew.get() as usize;
    if e_lfanew & 7 != 0 || e_lfanew < size_of::<ImageDosHeader>() {
        return None;
    }
    let mut source = BufferSource::with_pos(image, e_lfanew);
    source.consume_bytes(b"PE\0\0").then_some(source)
}

/// Win32 PE disassembler, generic over bitness.
pub struct DisassemblerWin32<A: PeArch> {
    sections: Vec<ImageSectionHeader>,
    image_base: u64,
    reloc_dir: ImageDataDirectory,
    translator: AddressTranslator,
    reloc_region: Option<BufferRegion>,
    reloc_block_offsets: Vec<Offset>,
    abs32_locations: Vec<Offset>,
    rel32_locations: Vec<Offset>,
    parsed_size: usize,
    _arch: PhantomData<A>,
}

pub type DisassemblerWin32X86 = DisassemblerWin32<Win32X86Traits>;
pub type DisassemblerWin32X64 = DisassemblerWin32<Win32X64Traits>;

impl<A: PeArch> DisassemblerWin32<A> {
    /// Quick check of whether `image` *may* point to the start of a PE
    /// executable of this architecture.
    #[must_use]
    pub fn quick_detect(image: &[u8]) -> bool {
        read_win32_header(image).is_some()
    }

    /// Parses `image` and extracts all references. Header inconsistencies
    /// are fatal; a malformed relocation table merely disables reloc and
    /// abs32 extraction.
    #[must_use]
    pub fn parse(image: &[u8]) -> Option<Self> {
        let mut disasm = Self::parse_header(image)?;
        disasm.parse_and_store_relocs(image);
        disasm.parse_and_store_abs32(image);
        disasm.parse_and_store_rel32(image);
        Some(disasm)
    }

    fn parse_header(image: &[u8]) -> Option<Self> {
        let mut source = read_win32_header(image)?;

        let data_dir_base =
            size_of::<A::OptionalHeader>() - NUM_DATA_DIRECTORIES * size_of::<ImageDataDirectory>();
        let coff_header = source.get_ref::<ImageFileHeader>().ok()?;
        if (coff_header.size_of_optional_header.get() as usize) < data_dir_base {
            return None;
        }

        // |number_of_rva_and_sizes < NUM_DATA_DIRECTORIES| is possible, so
        // reading the full optional header can reach EOF for a tiny PE file
        // and cause false rejection. This does not occur in practice, and
        // rejection is acceptable for such corner cases.
        let optional_header = source.get_ref::<A::OptionalHeader>().ok()?;
        if optional_header.magic() != A::MAGIC {
            return None;
        }

        let data_dir_size = coff_header.size_of_optional_header.get() as usize - data_dir_base;
        let num_data_dir = data_dir_size / size_of::<ImageDataDirectory>();
        if num_data_dir != optional_header.number_of_rva_and_sizes() as usize
            || num_data_dir * size_of::<ImageDataDirectory>() != data_dir_size
            || num_data_dir > NUM_DATA_DIRECTORIES
        {
            return None;
        }
        if INDEX_OF_BASE_RELOCATION_TABLE >= num_data_dir {
            return None;
        }
        let reloc_dir = optional_header.data_directory()[INDEX_OF_BASE_RELOCATION_TABLE];

        let image_base = optional_header.image_base();

        // |size_of_image| is the loaded size, not the size on disk.
        let rva_bound = optional_header.size_of_image();
        if rva_bound >= RVA_BOUND {
            return None;
        }

        // Exclusive upper bound of all offsets used by the image; updated as
        // sections are visited.
        let mut offset_bound = source.pos() as Offset;

        let sections_count = coff_header.number_of_sections.get() as usize;
        let sections: Vec<ImageSectionHeader> =
            source.get_array::<ImageSectionHeader>(sections_count).ok()?.to_vec();

        let mut units = Vec::with_capacity(sections_count);
        let mut has_text_section = false;
        let mut prev_virtual_address = 0u32;
        for (i, section) in sections.iter().enumerate() {
            let raw_region = BufferRegion::new(
                section.file_offset_of_raw_data.get() as usize,
                section.size_of_raw_data.get() as usize,
            );
            if !raw_region.fits_in(image.len()) {
                return None;
            }
            if !range_is_bounded(
                section.virtual_address.get().into(),
                section.virtual_size.get().into(),
                rva_bound.into(),
            ) {
                return None;
            }

            // PE sections should be sorted by RVA; for robustness we do not
            // rely on this.
            if prev_virtual_address > section.virtual_address.get() {
                warn!("RVA anomaly found for section {i}");
            }
            prev_virtual_address = section.virtual_address.get();

            units.push(Unit {
                offset_begin: section.file_offset_of_raw_data.get(),
                offset_size: section.size_of_raw_data.get(),
                rva_begin: section.virtual_address.get(),
                rva_size: section.virtual_size.get(),
            });

            offset_bound = offset_bound.max(raw_region.hi() as Offset);
            if is_win32_code_section(section) {
                has_text_section = true;
            }
        }

        if offset_bound as usize > image.len() || !has_text_section {
            return None;
        }

        // Any inconsistency (e.g., two offsets mapping to one RVA)
        // invalidates the file.
        let translator = AddressTranslator::new(units).ok()?;

        // The parsed size covers only contents claimed by sections; this may
        // miss digital signatures at the end of the file, which is of minor
        // concern for patching.
        Some(Self {
            sections,
            image_base,
            reloc_dir,
            translator,
            reloc_region: None,
            reloc_block_offsets: Vec::new(),
            abs32_locations: Vec::new(),
            rel32_locations: Vec::new(),
            parsed_size: offset_bound as usize,
            _arch: PhantomData,
        })
    }

    fn parse_and_store_relocs(&mut self, image: &[u8]) {
        let image = &image[..self.parsed_size.min(image.len())];
        let relocs_offset = self.translator.rva_to_offset(self.reloc_dir.virtual_address.get());
        let region =
            BufferRegion::new(relocs_offset as usize, self.reloc_dir.size.get() as usize);
        // Bogus relocs are non-fatal: the image may simply have none.
        if relocs_offset == INVALID_OFFSET || !region.fits_in(image.len()) {
            return;
        }
        if let Some(block_offsets) = find_reloc_blocks(image, region) {
            self.reloc_region = Some(region);
            self.reloc_block_offsets = block_offsets;
        }
    }

    fn parse_and_store_abs32(&mut self, image: &[u8]) {
        let image = &image[..self.parsed_size.min(image.len())];
        // Reloc targets are the preliminary abs32 locations.
        let mut locations = Vec::new();
        {
            let mut reader = self.reloc_reader(image, 0, image.len() as Offset);
            while let Some(reference) = reader.next_ref() {
                locations.push(reference.target);
            }
        }
        locations.sort_unstable();

        // Abs32 targets must translate to offsets.
        let num_untranslatable = remove_untranslatable_abs32(
            image,
            AbsoluteAddress::new(A::BITNESS, self.image_base),
            &self.translator,
            &mut locations,
        );
        if num_untranslatable > 0 {
            warn!("Removed {num_untranslatable} untranslatable abs32 references.");
        }

        // Abs32 bodies must not overlap.
        let num_overlapping = remove_overlapping_abs32(A::BITNESS.width(), &mut locations);
        if num_overlapping > 0 {
            warn!("Removed {num_overlapping} abs32 references with overlapping bodies.");
        }
        self.abs32_locations = locations;
    }

    fn parse_and_store_rel32(&mut self, image: &[u8]) {
        let image = &image[..self.parsed_size.min(image.len())];
        let mut locations = Vec::new();
        {
            let target_rva_checker = RvaToOffsetCache::new(&self.translator);
            for section in &self.sections {
                if !is_win32_code_section(section) {
                    continue;
                }
                let start_rva = section.virtual_address.get();
                let end_rva = start_rva + section.virtual_size.get();

                // |virtual_size < size_of_raw_data| is possible; disassembly
                // must not proceed beyond |virtual_size|, so rel32 location
                // RVAs remain translatable to file offsets.
                let size_to_use =
                    section.virtual_size.get().min(section.size_of_raw_data.get());
                let region = BufferRegion::new(
                    section.file_offset_of_raw_data.get() as usize,
                    size_to_use as usize,
                );
                // Iterate over gaps between abs32 bodies, to avoid collision.
                let mut gap_finder = Abs32GapFinder::new(
                    region,
                    &self.abs32_locations,
                    A::BITNESS.width() as usize,
                );
                let mut rel_finder = Rel32FinderIntel::new(image, &self.translator, A::IS_X64);
                while let Some(gap) = gap_finder.next_gap() {
                    rel_finder.set_region(gap);
                    // Heuristically detect rel32 references; store if valid.
                    while rel_finder.find_next() {
                        let rel32 = rel_finder.rel32();
                        if target_rva_checker.is_valid(rel32.target_rva)
                            && (rel32.can_point_outside_section
                                || (start_rva <= rel32.target_rva
                                    && rel32.target_rva < end_rva))
                        {
                            rel_finder.accept();
                            locations.push(rel32.location);
                        }
                    }
                }
            }
        }
        // Sections are usually sorted by offset, but there is no guarantee.
        locations.sort_unstable();
        self.rel32_locations = locations;
    }

    fn reloc_reader<'a>(
        &'a self,
        image: &'a [u8],
        lo: Offset,
        hi: Offset,
    ) -> Box<dyn ReferenceReader + 'a> {
        let Some(region) = self.reloc_region else {
            return Box::new(EmptyReferenceReader);
        };
        let rva_reader =
            RelocRvaReaderWin32::new(image, region, &self.reloc_block_offsets, lo, hi);
        // Reloc targets are abs32 references; they must fit in the image.
        let offset_bound =
            image.len().saturating_sub(A::BITNESS.width() as usize - 1) as Offset;
        Box::new(RelocReaderWin32::new(
            rva_reader,
            A::RELOC_TYPE,
            offset_bound,
            &self.translator,
        ))
    }
}

/// Reference type tags for Win32 PE.
pub mod win32_type {
    use marrow_image::types::{PoolTag, TypeTag};

    pub const RELOC: TypeTag = TypeTag(0);
    pub const ABS32: TypeTag = TypeTag(1);
    pub const REL32: TypeTag = TypeTag(2);

    pub const RELOC_POOL: PoolTag = PoolTag(0);
    pub const ABS32_POOL: PoolTag = PoolTag(1);
    pub const REL32_POOL: PoolTag = PoolTag(2);
}

impl<A: PeArch> Disassembler for DisassemblerWin32<A> {
    fn exe_type(&self) -> ExecutableType {
        A::EXE_TYPE
    }

    fn description(&self) -> &'static str {
        A::NAME
    }

    fn version(&self) -> u16 {
        A::VERSION
    }

    fn size(&self) -> usize {
        self.parsed_size
    }

    // 2 iterations for the reloc -> abs32 chain.
    fn num_equivalence_iterations(&self) -> u8 {
        2
    }

    fn reference_groups(&self) -> Vec<ReferenceTypeTraits> {
        vec![
            ReferenceTypeTraits::new(2, win32_type::RELOC, win32_type::RELOC_POOL),
            ReferenceTypeTraits::new(A::BITNESS.width(), win32_type::ABS32, win32_type::ABS32_POOL),
            ReferenceTypeTraits::new(4, win32_type::REL32, win32_type::REL32_POOL),
        ]
    }

    fn make_reader<'a>(
        &'a self,
        type_tag: TypeTag,
        image: &'a [u8],
        lo: Offset,
        hi: Offset,
    ) -> Box<dyn ReferenceReader + 'a> {
        match type_tag {
            win32_type::RELOC => self.reloc_reader(image, lo, hi),
            win32_type::ABS32 => {
                let extractor = Abs32RvaExtractor::new(
                    image,
                    AbsoluteAddress::new(A::BITNESS, self.image_base),
                    &self.abs32_locations,
                    lo,
                    hi,
                );
                Box::new(Abs32Reader::new(extractor, &self.translator))
            }
            win32_type::REL32 => {
                Box::new(Rel32ReaderX86::new(image, lo, hi, &self.rel32_locations, &self.translator))
            }
            _ => Box::new(EmptyReferenceReader),
        }
    }

    fn make_writer<'a>(
        &'a self,
        type_tag: TypeTag,
        image: &'a mut [u8],
    ) -> Box<dyn ReferenceWriter + 'a> {
        match type_tag {
            win32_type::RELOC => match self.reloc_region {
                Some(region) => Box::new(RelocWriterWin32::new(
                    A::RELOC_TYPE,
                    image,
                    region,
                    &self.reloc_block_offsets,
                    &self.translator,
                )),
                None => Box::new(EmptyReferenceWriter),
            },
            win32_type::ABS32 => Box::new(Abs32Writer::new(
                image,
                AbsoluteAddress::new(A::BITNESS, self.image_base),
                &self.translator,
            )),
            win32_type::REL32 => Box::new(Rel32WriterX86::new(image, &self.translator)),
            _ => Box::new(EmptyReferenceWriter),
        }
    }

    fn make_mixer<'a>(
        &'a self,
        _type_tag: TypeTag,
        _old_image: &'a [u8],
        _new_image: &'a [u8],
    ) -> Option<Box<dyn ReferenceMixer + 'a>> {
        // Intel stores operation and payload bits in disjoint bytes.
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use marrow_core::buffer::{write_u16_le, write_u32_le};

    // Builds a minimal PE32 with a .text section at RVA 0x1000 (file
    // 0x400..0x500) and a .reloc section at RVA 0x2000 (file 0x500..0x600).
    pub(crate) fn build_pe32() -> Vec<u8> {
        let mut image = vec![0u8; 0x600];
        // DOS header.
        image[0] = b'M';
        image[1] = b'Z';
        write_u32_le(&mut image, 0x3C, 0x40); // e_lfanew.
        // "PE\0\0".
        image[0x40] = b'P';
        image[0x41] = b'E';
        // COFF header at 0x44.
        write_u16_le(&mut image, 0x44, 0x014C); // machine: i386.
        write_u16_le(&mut image, 0x46, 2); // number_of_sections.
        write_u16_le(&mut image, 0x54, 0xE0); // size_of_optional_header.
        // Optional header at 0x58.
        write_u16_le(&mut image, 0x58, 0x10B); // magic.
        write_u32_le(&mut image, 0x58 + 0x1C, 0x0040_0000); // image_base.
        write_u32_le(&mut image, 0x58 + 0x38, 0x3000); // size_of_image.
        write_u32_le(&mut image, 0x58 + 0x5C, 16); // number_of_rva_and_sizes.
        // Data directory entry 5: base relocation table.
        write_u32_le(&mut image, 0x58 + 0x60 + 5 * 8, 0x2000);
        write_u32_le(&mut image, 0x58 + 0x60 + 5 * 8 + 4, 12);
        // Section headers at 0x138.
        let text = 0x138;
        image[text..text + 5].copy_from_slice(b".text");
        write_u32_le(&mut image, text + 8, 0x100); // virtual_size.
        write_u32_le(&mut image, text + 12, 0x1000); // virtual_address.
        write_u32_le(&mut image, text + 16, 0x100); // size_of_raw_data.
        write_u32_le(&mut image, text + 20, 0x400); // file_offset.
        write_u32_le(&mut image, text + 36, 0x6000_0020); // exec | read | code.
        let reloc = 0x160;
        image[reloc..reloc + 6].copy_from_slice(b".reloc");
        write_u32_le(&mut image, reloc + 8, 0x100);
        write_u32_le(&mut image, reloc + 12, 0x2000);
        write_u32_le(&mut image, reloc + 16, 0x100);
        write_u32_le(&mut image, reloc + 20, 0x500);
        write_u32_le(&mut image, reloc + 36, 0x4000_0040); // read | data.

        // .text content: CALL rel32 at 0x400 targeting RVA 0x1015, and an
        // abs32 slot at 0x410 holding VA of RVA 0x1020.
        image[0x400] = 0xE8;
        write_u32_le(&mut image, 0x401, 0x10);
        write_u32_le(&mut image, 0x410, 0x0040_1020);

        // .reloc content: one block, rva_hi 0x1000, entries for RVA 0x1010
        // (type 3) and a type-0 pad.
        write_u32_le(&mut image, 0x500, 0x1000);
        write_u32_le(&mut image, 0x504, 12);
        write_u16_le(&mut image, 0x508, 0x3010);
        write_u16_le(&mut image, 0x50A, 0x0000);
        image
    }

    fn read_all(reader: &mut dyn ReferenceReader) -> Vec<Reference> {
        let mut out = Vec::new();
        while let Some(reference) = reader.next_ref() {
            out.push(reference);
        }
        out
    }

    #[test]
    fn quick_detect_checks_magics() {
        let image = build_pe32();
        assert!(DisassemblerWin32X86::quick_detect(&image));
        assert!(DisassemblerWin32X64::quick_detect(&image)); // Quick check only.
        let mut bad = image.clone();
        bad[1] = b'X';
        assert!(!DisassemblerWin32X86::quick_detect(&bad));
    }

    #[test]
    fn parse_extracts_all_reference_types() {
        let image = build_pe32();
        let disasm = DisassemblerWin32X86::parse(&image).expect("parse");
        assert_eq!(disasm.exe_type(), ExecutableType::Win32X86);
        assert_eq!(disasm.size(), 0x600);

        let relocs = read_all(&mut *disasm.make_reader(win32_type::RELOC, &image, 0, 0x600));
        assert_eq!(relocs, vec![Reference { location: 0x508, target: 0x410 }]);

        let abs32s = read_all(&mut *disasm.make_reader(win32_type::ABS32, &image, 0, 0x600));
        assert_eq!(abs32s, vec![Reference { location: 0x410, target: 0x420 }]);

        let rel32s = read_all(&mut *disasm.make_reader(win32_type::REL32, &image, 0, 0x600));
        assert_eq!(rel32s, vec![Reference { location: 0x401, target: 0x415 }]);
    }

    #[test]
    fn parse_rejects_wrong_magic() {
        let image = build_pe32();
        assert!(DisassemblerWin32X64::parse(&image).is_none());
    }

    #[test]
    fn writers_round_trip_references() {
        let image = build_pe32();
        let disasm = DisassemblerWin32X86::parse(&image).expect("parse");
        let mut copy = image.clone();

        // Redirect each reference type to a new target, then read back.
        {
            let mut writer = disasm.make_writer(win32_type::RELOC, &mut copy);
            writer.put(Reference { location: 0x508, target: 0x414 });
        }
        {
            let mut writer = disasm.make_writer(win32_type::ABS32, &mut copy);
            writer.put(Reference { location: 0x410, target: 0x430 });
        }
        {
            let mut writer = disasm.make_writer(win32_type::REL32, &mut copy);
            writer.put(Reference { location: 0x401, target: 0x418 });
        }
        let relocs = read_all(&mut *disasm.make_reader(win32_type::RELOC, &copy, 0, 0x600));
        assert_eq!(relocs, vec![Reference { location: 0x508, target: 0x414 }]);
        let abs32s = read_all(&mut *disasm.make_reader(win32_type::ABS32, &copy, 0, 0x600));
        assert_eq!(abs32s, vec![Reference { location: 0x410, target: 0x430 }]);
        let rel32s = read_all(&mut *disasm.make_reader(win32_type::REL32, &copy, 0, 0x600));
        assert_eq!(rel32s, vec![Reference { location: 0x401, target: 0x418 }]);
    }
}
