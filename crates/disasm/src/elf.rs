//! Disassemblers for ELF (x86, x64, AArch32, AArch64).
//!
//! Relocation sections of type SHT_REL / SHT_RELA supply reloc references
//! (only the architecture's `R_*_RELATIVE` type); their targets are abs32
//! locations. Executable sections are scanned for rel32 references — via
//! the Intel opcode heuristics, or the ARM translators with per-encoding
//! location tables. NOBITS sections (`.bss`, non-TLS) carry no file data
//! but still feed the address translator.

use core::marker::PhantomData;
use core::mem::size_of;

use bitflags::bitflags;
use log::{info, warn};
use marrow_core::buffer::{BufferRegion, BufferSource};
use marrow_image::prelude::*;
use marrow_image::translator::{RvaToOffsetCache, Unit};
use marrow_image::types::Bitness;
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned, LittleEndian, U16, U32, U64};

use crate::abs32::{
    remove_overlapping_abs32, remove_untranslatable_abs32, Abs32Reader, Abs32RvaExtractor,
    Abs32Writer, AbsoluteAddress,
};
use crate::arm::{
    aarch32, aarch64, AddrA24, AddrImmd14, AddrImmd19, AddrImmd26, AddrT11, AddrT20, AddrT24,
    AddrT8, ArmAddrTraits, Rel32FinderAArch32, Rel32FinderAArch64, Rel32MixerArm,
    Rel32ReaderArm, Rel32WriterArm,
};
use crate::rel32::{Abs32GapFinder, Rel32FinderIntel, Rel32ReaderX86, Rel32WriterX86};
use crate::reloc::{RelocReaderElf, RelocWriterElf, SectionDimensionsElf};
use crate::Disassembler;

// ELF images have no preferred load address; abs32 values are plain RVAs.
const ELF_IMAGE_BASE: u64 = 0;
// Upper bound for section/segment ranges, below the RVA/offset bounds.
const SIZE_BOUND: usize = 0x7FFF_0000;

// Threshold for the heuristic that tells THUMB2 code from ARM code.
const AARCH32_COND_ALWAYS_DENSITY_THRESHOLD: f64 = 0.4;

// e_ident indices.
pub const EI_CLASS: usize = 4;
pub const EI_DATA: usize = 5;
pub const EI_VERSION: usize = 6;

pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;

pub const EM_386: u16 = 3;
pub const EM_ARM: u16 = 40;
pub const EM_X86_64: u16 = 62;
pub const EM_AARCH64: u16 = 183;

pub const SHT_PROGBITS: u32 = 1;
pub const SHT_RELA: u32 = 4;
pub const SHT_NOBITS: u32 = 8;
pub const SHT_REL: u32 = 9;

pub const R_386_RELATIVE: u32 = 8;
pub const R_X86_64_RELATIVE: u32 = 8;
pub const R_ARM_RELATIVE: u32 = 23;
pub const R_AARCH64_RELATIVE: u32 = 0x403;

bitflags! {
    /// ELF section flags (the subset of interest).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SectionFlags: u64 {
        const WRITE = 1 << 0;
        const ALLOC = 1 << 1;
        const EXECINSTR = 1 << 2;
        const TLS = 1 << 10;
    }
}

// On-disk layouts, following linux/elf.h.

#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Elf32Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: U16<LittleEndian>,
    pub e_machine: U16<LittleEndian>,
    pub e_version: U32<LittleEndian>,
    pub e_entry: U32<LittleEndian>,
    pub e_phoff: U32<LittleEndian>,
    pub e_shoff: U32<LittleEndian>,
    pub e_flags: U32<LittleEndian>,
    pub e_ehsize: U16<LittleEndian>,
    pub e_phentsize: U16<LittleEndian>,
    pub e_phnum: U16<LittleEndian>,
    pub e_shentsize: U16<LittleEndian>,
    pub e_shnum: U16<LittleEndian>,
    pub e_shstrndx: U16<LittleEndian>,
}

#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Elf64Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: U16<LittleEndian>,
    pub e_machine: U16<LittleEndian>,
    pub e_version: U32<LittleEndian>,
    pub e_entry: U64<LittleEndian>,
    pub e_phoff: U64<LittleEndian>,
    pub e_shoff: U64<LittleEndian>,
    pub e_flags: U32<LittleEndian>,
    pub e_ehsize: U16<LittleEndian>,
    pub e_phentsize: U16<LittleEndian>,
    pub e_phnum: U16<LittleEndian>,
    pub e_shentsize: U16<LittleEndian>,
    pub e_shnum: U16<LittleEndian>,
    pub e_shstrndx: U16<LittleEndian>,
}

#[derive(Clone, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Elf32Shdr {
    pub sh_name: U32<LittleEndian>,
    pub sh_type: U32<LittleEndian>,
    pub sh_flags: U32<LittleEndian>,
    pub sh_addr: U32<LittleEndian>,
    pub sh_offset: U32<LittleEndian>,
    pub sh_size: U32<LittleEndian>,
    pub sh_link: U32<LittleEndian>,
    pub sh_info: U32<LittleEndian>,
    pub sh_addralign: U32<LittleEndian>,
    pub sh_entsize: U32<LittleEndian>,
}

#[derive(Clone, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Elf64Shdr {
    pub sh_name: U32<LittleEndian>,
    pub sh_type: U32<LittleEndian>,
    pub sh_flags: U64<LittleEndian>,
    pub sh_addr: U64<LittleEndian>,
    pub sh_offset: U64<LittleEndian>,
    pub sh_size: U64<LittleEndian>,
    pub sh_link: U32<LittleEndian>,
    pub sh_info: U32<LittleEndian>,
    pub sh_addralign: U64<LittleEndian>,
    pub sh_entsize: U64<LittleEndian>,
}

#[derive(Clone, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Elf32Phdr {
    pub p_type: U32<LittleEndian>,
    pub p_offset: U32<LittleEndian>,
    pub p_vaddr: U32<LittleEndian>,
    pub p_paddr: U32<LittleEndian>,
    pub p_filesz: U32<LittleEndian>,
    pub p_memsz: U32<LittleEndian>,
    pub p_flags: U32<LittleEndian>,
    pub p_align: U32<LittleEndian>,
}

#[derive(Clone, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Elf64Phdr {
    pub p_type: U32<LittleEndian>,
    pub p_flags: U32<LittleEndian>,
    pub p_offset: U64<LittleEndian>,
    pub p_vaddr: U64<LittleEndian>,
    pub p_paddr: U64<LittleEndian>,
    pub p_filesz: U64<LittleEndian>,
    pub p_memsz: U64<LittleEndian>,
    pub p_align: U64<LittleEndian>,
}

#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Elf32Rel {
    pub r_offset: U32<LittleEndian>,
    pub r_info: U32<LittleEndian>,
}

#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Elf64Rel {
    pub r_offset: U64<LittleEndian>,
    pub r_info: U64<LittleEndian>,
}

#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Elf32Rela {
    pub r_offset: U32<LittleEndian>,
    pub r_info: U32<LittleEndian>,
    pub r_addend: U32<LittleEndian>,
}

#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Elf64Rela {
    pub r_offset: U64<LittleEndian>,
    pub r_info: U64<LittleEndian>,
    pub r_addend: U64<LittleEndian>,
}

const _: () = assert!(size_of::<Elf32Ehdr>() == 52);
const _: () = assert!(size_of::<Elf64Ehdr>() == 64);
const _: () = assert!(size_of::<Elf32Shdr>() == 40);
const _: () = assert!(size_of::<Elf64Shdr>() == 64);
const _: () = assert!(size_of::<Elf32Rel>() == 8);
const _: () = assert!(size_of::<Elf64Rel>() == 16);

/// Uniform accessors over 32/64-bit ELF headers.
pub trait ElfHeader {
    fn e_ident(&self) -> &[u8; 16];
    fn e_type(&self) -> u16;
    fn e_machine(&self) -> u16;
    fn e_version(&self) -> u32;
    fn e_phoff(&self) -> u64;
    fn e_shoff(&self) -> u64;
    fn e_phnum(&self) -> u16;
    fn e_shentsize(&self) -> u16;
    fn e_shnum(&self) -> u16;
    fn e_shstrndx(&self) -> u16;
}

pub trait ElfSectionHeader {
    fn sh_type(&self) -> u32;
    fn sh_flags(&self) -> u64;
    fn sh_addr(&self) -> u64;
    fn sh_offset(&self) -> u64;
    fn sh_size(&self) -> u64;
    fn sh_entsize(&self) -> u64;
}

pub trait ElfProgramHeader {
    fn p_offset(&self) -> u64;
    fn p_filesz(&self) -> u64;
}

macro_rules! elf_header_accessors {
    ($t:ty) => {
        impl ElfHeader for $t {
            fn e_ident(&self) -> &[u8; 16] {
                &self.e_ident
            }
            fn e_type(&self) -> u16 {
                self.e_type.get()
            }
            fn e_machine(&self) -> u16 {
                self.e_machine.get()
            }
            fn e_version(&self) -> u32 {
                self.e_version.get()
            }
            fn e_phoff(&self) -> u64 {
                self.e_phoff.get().into()
            }
            fn e_shoff(&self) -> u64 {
                self.e_shoff.get().into()
            }
            fn e_phnum(&self) -> u16 {
                self.e_phnum.get()
            }
            fn e_shentsize(&self) -> u16 {
                self.e_shentsize.get()
            }
            fn e_shnum(&self) -> u16 {
                self.e_shnum.get()
            }
            fn e_shstrndx(&self) -> u16 {
                self.e_shstrndx.get()
            }
        }
    };
}
elf_header_accessors!(Elf32Ehdr);
elf_header_accessors!(Elf64Ehdr);

macro_rules! elf_section_accessors {
    ($t:ty) => {
        impl ElfSectionHeader for $t {
            fn sh_type(&self) -> u32 {
                self.sh_type.get()
            }
            fn sh_flags(&self) -> u64 {
                self.sh_flags.get().into()
            }
            fn sh_addr(&self) -> u64 {
                self.sh_addr.get().into()
            }
            fn sh_offset(&self) -> u64 {
                self.sh_offset.get().into()
            }
            fn sh_size(&self) -> u64 {
                self.sh_size.get().into()
            }
            fn sh_entsize(&self) -> u64 {
                self.sh_entsize.get().into()
            }
        }
    };
}
elf_section_accessors!(Elf32Shdr);
elf_section_accessors!(Elf64Shdr);

macro_rules! elf_program_accessors {
    ($t:ty) => {
        impl ElfProgramHeader for $t {
            fn p_offset(&self) -> u64 {
                self.p_offset.get().into()
            }
            fn p_filesz(&self) -> u64 {
                self.p_filesz.get().into()
            }
        }
    };
}
elf_program_accessors!(Elf32Phdr);
elf_program_accessors!(Elf64Phdr);

/// Per-architecture constants for the ELF disassembler.
pub trait ElfArch {
    const VERSION: u16;
    const BITNESS: Bitness;
    const CLASS: u8;
    const MACHINE: u16;
    const RELOC_TYPE: u32;
    const EXE_TYPE: ExecutableType;
    const NAME: &'static str;
    type Ehdr: ElfHeader + FromBytes + KnownLayout + Immutable + Unaligned;
    type Shdr: ElfSectionHeader + Clone + FromBytes + KnownLayout + Immutable + Unaligned;
    type Phdr: ElfProgramHeader + Clone + FromBytes + KnownLayout + Immutable + Unaligned;
    const REL_SIZE: u64;
    const RELA_SIZE: u64;
}

pub struct Elf32IntelTraits;

impl ElfArch for Elf32IntelTraits {
    const VERSION: u16 = 1;
    const BITNESS: Bitness = Bitness::Bits32;
    const CLASS: u8 = 1;
    const MACHINE: u16 = EM_386;
    const RELOC_TYPE: u32 = R_386_RELATIVE;
    const EXE_TYPE: ExecutableType = ExecutableType::ElfX86;
    const NAME: &'static str = "ELF x86";
    type Ehdr = Elf32Ehdr;
    type Shdr = Elf32Shdr;
    type Phdr = Elf32Phdr;
    const REL_SIZE: u64 = size_of::<Elf32Rel>() as u64;
    const RELA_SIZE: u64 = size_of::<Elf32Rela>() as u64;
}

pub struct Elf64IntelTraits;

impl ElfArch for Elf64IntelTraits {
    const VERSION: u16 = 1;
    const BITNESS: Bitness = Bitness::Bits64;
    const CLASS: u8 = 2;
    const MACHINE: u16 = EM_X86_64;
    const RELOC_TYPE: u32 = R_X86_64_RELATIVE;
    const EXE_TYPE: ExecutableType = ExecutableType::ElfX64;
    const NAME: &'static str = "ELF x64";
    type Ehdr = Elf64Ehdr;
    type Shdr = Elf64Shdr;
    type Phdr = Elf64Phdr;
    const REL_SIZE: u64 = size_of::<Elf64Rel>() as u64;
    const RELA_SIZE: u64 = size_of::<Elf64Rela>() as u64;
}

pub struct ElfAArch32Traits;

impl ElfArch for ElfAArch32Traits {
    const VERSION: u16 = 1;
    const BITNESS: Bitness = Bitness::Bits32;
    const CLASS: u8 = 1;
    const MACHINE: u16 = EM_ARM;
    const RELOC_TYPE: u32 = R_ARM_RELATIVE;
    const EXE_TYPE: ExecutableType = ExecutableType::ElfAArch32;
    const NAME: &'static str = "ELF ARM";
    type Ehdr = Elf32Ehdr;
    type Shdr = Elf32Shdr;
    type Phdr = Elf32Phdr;
    const REL_SIZE: u64 = size_of::<Elf32Rel>() as u64;
    const RELA_SIZE: u64 = size_of::<Elf32Rela>() as u64;
}

pub struct ElfAArch64Traits;

impl ElfArch for ElfAArch64Traits {
    const VERSION: u16 = 1;
    const BITNESS: Bitness = Bitness::Bits64;
    const CLASS: u8 = 2;
    const MACHINE: u16 = EM_AARCH64;
    const RELOC_TYPE: u32 = R_AARCH64_RELATIVE;
    const EXE_TYPE: ExecutableType = ExecutableType::ElfAArch64;
    const NAME: &'static str = "ELF ARM64";
    type Ehdr = Elf64Ehdr;
    type Shdr = Elf64Shdr;
    type Phdr = Elf64Phdr;
    const REL_SIZE: u64 = size_of::<Elf64Rel>() as u64;
    const RELA_SIZE: u64 = size_of::<Elf64Rela>() as u64;
}

bitflags! {
    // How a section may be used. An empty set means the section is
    // malformed and invalidates the ELF file.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct SectionUse: u8 {
        // Does not invalidate the ELF file, but may or may not be useful.
        const SAFE = 1 << 0;
        // Useful for the address translator.
        const TRANSLATOR = 1 << 1;
        // Contributes to the offset bound estimating the file size.
        const OFFSET_BOUND = 1 << 2;
        // Potentially holds pointers (relocs or code).
        const POINTERS = 1 << 3;
    }
}

// Decides how a section affects parsing.
fn judge_section<S: ElfSectionHeader>(image_size: usize, section: &S) -> SectionUse {
    // On 32-bit hosts the 64-bit fields may not fit in usize; treat as
    // malformed rather than truncate.
    let (Ok(sh_addr), Ok(sh_offset), Ok(sh_size)) = (
        usize::try_from(section.sh_addr()),
        usize::try_from(section.sh_offset()),
        usize::try_from(section.sh_size()),
    ) else {
        return SectionUse::empty();
    };

    // Examine the RVA range: reject if numerical overflow may happen.
    if !BufferRegion::new(sh_addr, sh_size).fits_in(SIZE_BOUND) {
        return SectionUse::empty();
    }

    // Examine the offset range: stricter if the section takes image data.
    let offset_bound =
        if section.sh_type() == SHT_NOBITS { SIZE_BOUND } else { image_size };
    if !BufferRegion::new(sh_offset, sh_size).fits_in(offset_bound) {
        return SectionUse::empty();
    }

    // Empty sections contribute nothing to offset-RVA mapping.
    if sh_size == 0 {
        return SectionUse::SAFE;
    }

    // Sections with |sh_addr == 0| tend to be duplicates (a lookup hazard)
    // and are uninteresting.
    if sh_addr == 0 {
        return SectionUse::SAFE;
    }

    if section.sh_type() == SHT_NOBITS {
        // .tbss sections may carry an offset-RVA map inconsistent with other
        // sections; ignore them.
        if section.sh_flags() & SectionFlags::TLS.bits() != 0 {
            return SectionUse::SAFE;
        }
        // Useful for translation, but with possibly huge virtual size
        // (.bss), so it must not affect the offset bound.
        return SectionUse::SAFE | SectionUse::TRANSLATOR;
    }

    SectionUse::SAFE | SectionUse::TRANSLATOR | SectionUse::OFFSET_BOUND | SectionUse::POINTERS
}

fn is_reloc_section<A: ElfArch>(section: &A::Shdr) -> bool {
    debug_assert!(section.sh_size() > 0);
    // Also validate |sh_entsize|, which gets used later.
    if section.sh_type() == SHT_REL {
        return section.sh_entsize() == A::REL_SIZE;
    }
    if section.sh_type() == SHT_RELA {
        return section.sh_entsize() == A::RELA_SIZE;
    }
    false
}

fn is_exec_section<A: ElfArch>(section: &A::Shdr) -> bool {
    debug_assert!(section.sh_size() > 0);
    section.sh_type() == SHT_PROGBITS
        && section.sh_flags() & SectionFlags::EXECINSTR.bits() != 0
}

/// Dimensions of an executable section: its file region and starting RVA.
#[derive(Clone, Copy, Debug)]
pub struct ExecSectionDims {
    pub region: BufferRegion,
    pub rva: Rva,
}

// Architecture-independent parse results shared by the ELF flavors.
struct ElfImageData {
    translator: AddressTranslator,
    reloc_section_dims: Vec<SectionDimensionsElf>,
    exec_section_dims: Vec<ExecSectionDims>,
    abs32_locations: Vec<Offset>,
    parsed_size: usize,
}

fn quick_detect_impl<A: ElfArch>(image: &[u8]) -> bool {
    let mut source = BufferSource::new(image);
    // The magic bytes are part of |e_ident| and are not consumed here.
    if !source.check_bytes(&[0x7F, b'E', b'L', b'F']) {
        return false;
    }
    let Ok(header) = source.get_ref::<A::Ehdr>() else {
        return false;
    };
    header.e_ident()[EI_CLASS] == A::CLASS
        && header.e_ident()[EI_DATA] == 1 // Only little-endian is supported.
        && (header.e_type() == ET_EXEC || header.e_type() == ET_DYN)
        && header.e_version() == 1
        && header.e_ident()[EI_VERSION] == 1
        && header.e_machine() == A::MACHINE
        && header.e_shentsize() as usize == size_of::<A::Shdr>()
}

fn parse_common<A: ElfArch>(image: &[u8]) -> Option<ElfImageData> {
    // Any offset must fit the offset type.
    if u32::try_from(image.len()).is_err() {
        return None;
    }
    if !quick_detect_impl::<A>(image) {
        return None;
    }
    let mut source = BufferSource::new(image);
    let header = source.get_ref::<A::Ehdr>().ok()?;

    let sections_count = header.e_shnum() as usize;
    let mut source = BufferSource::with_pos(image, usize::try_from(header.e_shoff()).ok()?);
    let sections: Vec<A::Shdr> = source.get_array::<A::Shdr>(sections_count).ok()?.to_vec();
    let section_table_end = source.pos();

    let segments_count = header.e_phnum() as usize;
    let mut source = BufferSource::with_pos(image, usize::try_from(header.e_phoff()).ok()?);
    let segments: Vec<A::Phdr> = source.get_array::<A::Phdr>(segments_count).ok()?.to_vec();
    let segment_table_end = source.pos();

    // Check the section-name string table, even though names are unused: if
    // nonempty, its last byte must be NUL.
    let string_section_id = header.e_shstrndx() as usize;
    if string_section_id >= sections_count {
        return None;
    }
    let names_size = usize::try_from(sections[string_section_id].sh_size()).ok()?;
    if names_size > 0 {
        let names_offset = usize::try_from(sections[string_section_id].sh_offset()).ok()?;
        let names = image.get(names_offset..names_offset.checked_add(names_size)?)?;
        if *names.last()? != 0 {
            return None;
        }
    }

    let mut offset_bound = section_table_end.max(segment_table_end);

    // Visit segments to refine the offset bound.
    for segment in &segments {
        let p_offset = usize::try_from(segment.p_offset()).ok()?;
        let p_filesz = usize::try_from(segment.p_filesz()).ok()?;
        let segment_end = p_offset.checked_add(p_filesz)?;
        if !BufferRegion::new(p_offset, p_filesz).fits_in(image.len()) {
            return None;
        }
        offset_bound = offset_bound.max(segment_end);
    }

    // Visit and validate each section; build address translation units.
    let mut units = Vec::with_capacity(sections_count);
    let mut judgements = Vec::with_capacity(sections_count);
    for section in &sections {
        let judgement = judge_section(image.len(), section);
        judgements.push(judgement);
        if !judgement.contains(SectionUse::SAFE) {
            return None;
        }
        let sh_offset = section.sh_offset() as Offset;
        let sh_size = section.sh_size() as u32;
        let sh_addr = section.sh_addr() as Rva;
        if judgement.contains(SectionUse::TRANSLATOR) {
            units.push(Unit {
                offset_begin: sh_offset,
                offset_size: sh_size,
                rva_begin: sh_addr,
                rva_size: sh_size,
            });
        }
        if judgement.contains(SectionUse::OFFSET_BOUND) {
            offset_bound = offset_bound.max(sh_offset as usize + sh_size as usize);
        }
    }

    // Any inconsistency (e.g., two offsets mapping to one RVA) invalidates
    // the ELF file.
    let translator = AddressTranslator::new(units).ok()?;

    if offset_bound > image.len() {
        return None;
    }
    let parsed_size = offset_bound;
    let image = &image[..parsed_size];

    // Extract the headers of interest.
    let mut reloc_section_dims = Vec::new();
    let mut exec_section_dims = Vec::new();
    for (section, judgement) in sections.iter().zip(&judgements) {
        if !judgement.contains(SectionUse::POINTERS) {
            continue;
        }
        if is_reloc_section::<A>(section) {
            reloc_section_dims.push(SectionDimensionsElf {
                region: BufferRegion::new(
                    section.sh_offset() as usize,
                    section.sh_size() as usize,
                ),
                entry_size: section.sh_entsize() as u32,
            });
        } else if is_exec_section::<A>(section) {
            exec_section_dims.push(ExecSectionDims {
                region: BufferRegion::new(
                    section.sh_offset() as usize,
                    section.sh_size() as usize,
                ),
                rva: section.sh_addr() as Rva,
            });
        }
    }
    reloc_section_dims.sort_by_key(|dim| dim.region.offset);
    exec_section_dims.sort_by_key(|dim| dim.region.offset);

    // Reloc targets are the preliminary abs32 locations.
    let mut abs32_locations = Vec::new();
    if !reloc_section_dims.is_empty() {
        let mut reader = RelocReaderElf::new(
            image,
            A::BITNESS,
            &reloc_section_dims,
            A::RELOC_TYPE,
            0,
            parsed_size as Offset,
            &translator,
        );
        while let Some(reference) = reader.next_ref() {
            abs32_locations.push(reference.target);
        }
    }
    abs32_locations.sort_unstable();

    // Abs32 targets must translate to offsets.
    let num_untranslatable = remove_untranslatable_abs32(
        image,
        AbsoluteAddress::new(A::BITNESS, ELF_IMAGE_BASE),
        &translator,
        &mut abs32_locations,
    );
    if num_untranslatable > 0 {
        warn!("Removed {num_untranslatable} untranslatable abs32 references.");
    }

    // Abs32 bodies must not overlap.
    let num_overlapping =
        remove_overlapping_abs32(A::BITNESS.width(), &mut abs32_locations);
    if num_overlapping > 0 {
        warn!("Removed {num_overlapping} abs32 references with overlapping bodies.");
    }

    Some(ElfImageData {
        translator,
        reloc_section_dims,
        exec_section_dims,
        abs32_locations,
        parsed_size,
    })
}

impl ElfImageData {
    // Determines whether target |offset| is in an executable section, by
    // binary search (exec sections can be numerous in pathological cases).
    fn is_target_offset_in_exec_section(&self, offset: Offset) -> bool {
        let pos = self
            .exec_section_dims
            .partition_point(|dim| dim.region.offset <= offset as usize);
        match self.exec_section_dims[..pos].last() {
            Some(dim) => (offset as usize) - dim.region.offset < dim.region.size,
            None => false,
        }
    }

    fn make_reloc_reader<'a>(
        &'a self,
        bitness: Bitness,
        reloc_type: u32,
        image: &'a [u8],
        lo: Offset,
        hi: Offset,
    ) -> Box<dyn ReferenceReader + 'a> {
        if self.reloc_section_dims.is_empty() {
            return Box::new(EmptyReferenceReader);
        }
        Box::new(RelocReaderElf::new(
            image,
            bitness,
            &self.reloc_section_dims,
            reloc_type,
            lo,
            hi,
            &self.translator,
        ))
    }

    fn make_abs32_reader<'a>(
        &'a self,
        bitness: Bitness,
        image: &'a [u8],
        lo: Offset,
        hi: Offset,
    ) -> Box<dyn ReferenceReader + 'a> {
        let extractor = Abs32RvaExtractor::new(
            image,
            AbsoluteAddress::new(bitness, ELF_IMAGE_BASE),
            &self.abs32_locations,
            lo,
            hi,
        );
        Box::new(Abs32Reader::new(extractor, &self.translator))
    }
}

/// Reference type tags shared by the Intel ELF flavors.
pub mod elf_intel_type {
    use marrow_image::types::{PoolTag, TypeTag};

    pub const RELOC: TypeTag = TypeTag(0);
    pub const ABS32: TypeTag = TypeTag(1);
    pub const REL32: TypeTag = TypeTag(2);

    pub const RELOC_POOL: PoolTag = PoolTag(0);
    pub const ABS32_POOL: PoolTag = PoolTag(1);
    pub const REL32_POOL: PoolTag = PoolTag(2);
}

/// Reference type tags for ELF AArch32.
pub mod elf_aarch32_type {
    use marrow_image::types::{PoolTag, TypeTag};

    pub const RELOC: TypeTag = TypeTag(0);
    pub const ABS32: TypeTag = TypeTag(1);
    pub const REL32_A24: TypeTag = TypeTag(2);
    pub const REL32_T8: TypeTag = TypeTag(3);
    pub const REL32_T11: TypeTag = TypeTag(4);
    pub const REL32_T20: TypeTag = TypeTag(5);
    pub const REL32_T24: TypeTag = TypeTag(6);

    pub const RELOC_POOL: PoolTag = PoolTag(0);
    pub const ABS32_POOL: PoolTag = PoolTag(1);
    pub const REL32_POOL: PoolTag = PoolTag(2);
}

/// Reference type tags for ELF AArch64.
pub mod elf_aarch64_type {
    use marrow_image::types::{PoolTag, TypeTag};

    pub const RELOC: TypeTag = TypeTag(0);
    pub const ABS32: TypeTag = TypeTag(1);
    pub const REL32_IMMD14: TypeTag = TypeTag(2);
    pub const REL32_IMMD19: TypeTag = TypeTag(3);
    pub const REL32_IMMD26: TypeTag = TypeTag(4);

    pub const RELOC_POOL: PoolTag = PoolTag(0);
    pub const ABS32_POOL: PoolTag = PoolTag(1);
    pub const REL32_POOL: PoolTag = PoolTag(2);
}

/// ELF disassembler for Intel architectures, generic over bitness.
pub struct DisassemblerElfIntel<A: ElfArch> {
    data: ElfImageData,
    rel32_locations: Vec<Offset>,
    is_x64: bool,
    _arch: PhantomData<A>,
}

pub type DisassemblerElfX86 = DisassemblerElfIntel<Elf32IntelTraits>;
pub type DisassemblerElfX64 = DisassemblerElfIntel<Elf64IntelTraits>;

impl<A: ElfArch> DisassemblerElfIntel<A> {
    #[must_use]
    pub fn quick_detect(image: &[u8]) -> bool {
        quick_detect_impl::<A>(image)
    }

    #[must_use]
    pub fn parse(image: &[u8]) -> Option<Self> {
        let data = parse_common::<A>(image)?;
        let is_x64 = A::BITNESS == Bitness::Bits64;
        let mut disasm = Self { data, rel32_locations: Vec::new(), is_x64, _arch: PhantomData };
        disasm.parse_exec_sections(image);
        Some(disasm)
    }

    fn parse_exec_sections(&mut self, image: &[u8]) {
        let image = &image[..self.data.parsed_size.min(image.len())];
        let mut locations = Vec::new();
        {
            let target_rva_checker = RvaToOffsetCache::new(&self.data.translator);
            for dims in &self.data.exec_section_dims {
                let start_rva = dims.rva;
                let end_rva = start_rva + dims.region.size as u32;
                let mut gap_finder = Abs32GapFinder::new(
                    dims.region,
                    &self.data.abs32_locations,
                    A::BITNESS.width() as usize,
                );
                let mut rel_finder =
                    Rel32FinderIntel::new(image, &self.data.translator, self.is_x64);
                while let Some(gap) = gap_finder.next_gap() {
                    rel_finder.set_region(gap);
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
        locations.sort_unstable();
        self.rel32_locations = locations;
    }
}

impl<A: ElfArch> Disassembler for DisassemblerElfIntel<A> {
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
        self.data.parsed_size
    }

    // 2 iterations for the reloc -> abs32 chain.
    fn num_equivalence_iterations(&self) -> u8 {
        2
    }

    fn reference_groups(&self) -> Vec<ReferenceTypeTraits> {
        vec![
            // Reloc references cover the |r_offset| field only.
            ReferenceTypeTraits::new(
                A::BITNESS.width(),
                elf_intel_type::RELOC,
                elf_intel_type::RELOC_POOL,
            ),
            ReferenceTypeTraits::new(
                A::BITNESS.width(),
                elf_intel_type::ABS32,
                elf_intel_type::ABS32_POOL,
            ),
            // Rel32 width is 4 bytes even on x64.
            ReferenceTypeTraits::new(4, elf_intel_type::REL32, elf_intel_type::REL32_POOL),
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
            elf_intel_type::RELOC => {
                self.data.make_reloc_reader(A::BITNESS, A::RELOC_TYPE, image, lo, hi)
            }
            elf_intel_type::ABS32 => self.data.make_abs32_reader(A::BITNESS, image, lo, hi),
            elf_intel_type::REL32 => Box::new(Rel32ReaderX86::new(
                image,
                lo,
                hi,
                &self.rel32_locations,
                &self.data.translator,
            )),
            _ => Box::new(EmptyReferenceReader),
        }
    }

    fn make_writer<'a>(
        &'a self,
        type_tag: TypeTag,
        image: &'a mut [u8],
    ) -> Box<dyn ReferenceWriter + 'a> {
        match type_tag {
            elf_intel_type::RELOC => {
                Box::new(RelocWriterElf::new(image, A::BITNESS, &self.data.translator))
            }
            elf_intel_type::ABS32 => Box::new(Abs32Writer::new(
                image,
                AbsoluteAddress::new(A::BITNESS, ELF_IMAGE_BASE),
                &self.data.translator,
            )),
            elf_intel_type::REL32 => {
                Box::new(Rel32WriterX86::new(image, &self.data.translator))
            }
            _ => Box::new(EmptyReferenceWriter),
        }
    }

    fn make_mixer<'a>(
        &'a self,
        _type_tag: TypeTag,
        _old_image: &'a [u8],
        _new_image: &'a [u8],
    ) -> Option<Box<dyn ReferenceMixer + 'a>> {
        None
    }
}

/// ELF disassembler for AArch32.
pub struct DisassemblerElfAArch32 {
    data: ElfImageData,
    rel32_locations_table: [Vec<Offset>; aarch32::NUM_ADDR_TYPES],
}

impl DisassemblerElfAArch32 {
    #[must_use]
    pub fn quick_detect(image: &[u8]) -> bool {
        quick_detect_impl::<ElfAArch32Traits>(image)
    }

    #[must_use]
    pub fn parse(image: &[u8]) -> Option<Self> {
        let data = parse_common::<ElfAArch32Traits>(image)?;
        let mut disasm = Self { data, rel32_locations_table: Default::default() };
        disasm.parse_exec_sections(image);
        Some(disasm)
    }

    /// Heuristically distinguishes THUMB2 from ARM mode, under the naive
    /// assumption that an executable section is entirely one or the other.
    /// 32-bit ARM instructions (little-endian) look like `?? ?? ?? X?`,
    /// where X encodes conditional execution; X = 0xE ("always") dominates
    /// in ARM code, and its density is the main discriminator.
    #[must_use]
    fn is_exec_section_thumb2(image: &[u8], dims: &ExecSectionDims) -> bool {
        // ARM mode requires 4-byte alignment.
        if dims.rva % 4 != 0 || dims.region.size % 4 != 0 {
            return true;
        }
        let mut num = 0usize;
        let mut den = 0usize;
        let mut pos = dims.region.lo();
        while pos < dims.region.hi() {
            if image[pos + 3] & 0xF0 == 0xE0 {
                num += 1;
            }
            den += 1;
            pos += 4;
        }
        if den > 0 {
            info!("Section scan: {num} / {den} => {:.2}%", num as f64 * 100.0 / den as f64);
        }
        (num as f64) < den as f64 * AARCH32_COND_ALWAYS_DENSITY_THRESHOLD
    }

    fn parse_exec_sections(&mut self, image: &[u8]) {
        let image = &image[..self.data.parsed_size.min(image.len())];
        let mut tables: [Vec<Offset>; aarch32::NUM_ADDR_TYPES] = Default::default();
        {
            let rva_to_offset = RvaToOffsetCache::new(&self.data.translator);
            for dims in &self.data.exec_section_dims {
                let is_thumb2 = Self::is_exec_section_thumb2(image, dims);
                let mut gap_finder =
                    Abs32GapFinder::new(dims.region, &self.data.abs32_locations, 4);
                let mut rel_finder =
                    Rel32FinderAArch32::new(image, &self.data.translator, is_thumb2);
                while let Some(gap) = gap_finder.next_gap() {
                    rel_finder.set_region(gap);
                    while rel_finder.find_next() {
                        let Some(rel32) = rel_finder.rel32() else {
                            break;
                        };
                        let target_offset = rva_to_offset.convert(rel32.target_rva);
                        if target_offset != INVALID_OFFSET
                            // Reject illegal offsets, which arise from, e.g.,
                            // misidentified ARM vs. THUMB2 mode, or data
                            // misidentified as code.
                            && self.data.is_target_offset_in_exec_section(target_offset)
                        {
                            rel_finder.accept();
                            tables[rel32.addr_type as usize].push(rel32.location);
                        }
                    }
                }
            }
        }
        for table in &mut tables {
            table.sort_unstable();
        }
        self.rel32_locations_table = tables;
    }

    fn arm_reader<'a, T: ArmAddrTraits + 'a>(
        &'a self,
        image: &'a [u8],
        lo: Offset,
        hi: Offset,
    ) -> Box<dyn ReferenceReader + 'a> {
        Box::new(Rel32ReaderArm::<T>::new(
            &self.data.translator,
            image,
            &self.rel32_locations_table[T::ADDR_TYPE as usize],
            lo,
            hi,
        ))
    }
}

impl Disassembler for DisassemblerElfAArch32 {
    fn exe_type(&self) -> ExecutableType {
        ExecutableType::ElfAArch32
    }

    fn description(&self) -> &'static str {
        ElfAArch32Traits::NAME
    }

    fn version(&self) -> u16 {
        ElfAArch32Traits::VERSION
    }

    fn size(&self) -> usize {
        self.data.parsed_size
    }

    fn num_equivalence_iterations(&self) -> u8 {
        2
    }

    fn reference_groups(&self) -> Vec<ReferenceTypeTraits> {
        use elf_aarch32_type::*;
        vec![
            ReferenceTypeTraits::new(4, RELOC, RELOC_POOL),
            ReferenceTypeTraits::new(4, ABS32, ABS32_POOL),
            ReferenceTypeTraits::new(4, REL32_A24, REL32_POOL),
            ReferenceTypeTraits::new(2, REL32_T8, REL32_POOL),
            ReferenceTypeTraits::new(2, REL32_T11, REL32_POOL),
            ReferenceTypeTraits::new(4, REL32_T20, REL32_POOL),
            ReferenceTypeTraits::new(4, REL32_T24, REL32_POOL),
        ]
    }

    fn make_reader<'a>(
        &'a self,
        type_tag: TypeTag,
        image: &'a [u8],
        lo: Offset,
        hi: Offset,
    ) -> Box<dyn ReferenceReader + 'a> {
        use elf_aarch32_type::*;
        match type_tag {
            RELOC => self.data.make_reloc_reader(
                Bitness::Bits32,
                ElfAArch32Traits::RELOC_TYPE,
                image,
                lo,
                hi,
            ),
            ABS32 => self.data.make_abs32_reader(Bitness::Bits32, image, lo, hi),
            REL32_A24 => self.arm_reader::<AddrA24>(image, lo, hi),
            REL32_T8 => self.arm_reader::<AddrT8>(image, lo, hi),
            REL32_T11 => self.arm_reader::<AddrT11>(image, lo, hi),
            REL32_T20 => self.arm_reader::<AddrT20>(image, lo, hi),
            REL32_T24 => self.arm_reader::<AddrT24>(image, lo, hi),
            _ => Box::new(EmptyReferenceReader),
        }
    }

    fn make_writer<'a>(
        &'a self,
        type_tag: TypeTag,
        image: &'a mut [u8],
    ) -> Box<dyn ReferenceWriter + 'a> {
        use elf_aarch32_type::*;
        match type_tag {
            RELOC => Box::new(RelocWriterElf::new(image, Bitness::Bits32, &self.data.translator)),
            ABS32 => Box::new(Abs32Writer::new(
                image,
                AbsoluteAddress::new(Bitness::Bits32, ELF_IMAGE_BASE),
                &self.data.translator,
            )),
            REL32_A24 => Box::new(Rel32WriterArm::<AddrA24>::new(&self.data.translator, image)),
            REL32_T8 => Box::new(Rel32WriterArm::<AddrT8>::new(&self.data.translator, image)),
            REL32_T11 => Box::new(Rel32WriterArm::<AddrT11>::new(&self.data.translator, image)),
            REL32_T20 => Box::new(Rel32WriterArm::<AddrT20>::new(&self.data.translator, image)),
            REL32_T24 => Box::new(Rel32WriterArm::<AddrT24>::new(&self.data.translator, image)),
            _ => Box::new(EmptyReferenceWriter),
        }
    }

    fn make_mixer<'a>(
        &'a self,
        type_tag: TypeTag,
        old_image: &'a [u8],
        new_image: &'a [u8],
    ) -> Option<Box<dyn ReferenceMixer + 'a>> {
        use elf_aarch32_type::*;
        match type_tag {
            REL32_A24 => Some(Box::new(Rel32MixerArm::<AddrA24>::new(old_image, new_image))),
            REL32_T8 => Some(Box::new(Rel32MixerArm::<AddrT8>::new(old_image, new_image))),
            REL32_T11 => Some(Box::new(Rel32MixerArm::<AddrT11>::new(old_image, new_image))),
            REL32_T20 => Some(Box::new(Rel32MixerArm::<AddrT20>::new(old_image, new_image))),
            REL32_T24 => Some(Box::new(Rel32MixerArm::<AddrT24>::new(old_image, new_image))),
            _ => None,
        }
    }
}

/// ELF disassembler for AArch64.
pub struct DisassemblerElfAArch64 {
    data: ElfImageData,
    rel32_locations_table: [Vec<Offset>; aarch64::NUM_ADDR_TYPES],
}

impl DisassemblerElfAArch64 {
    #[must_use]
    pub fn quick_detect(image: &[u8]) -> bool {
        quick_detect_impl::<ElfAArch64Traits>(image)
    }

    #[must_use]
    pub fn parse(image: &[u8]) -> Option<Self> {
        let data = parse_common::<ElfAArch64Traits>(image)?;
        let mut disasm = Self { data, rel32_locations_table: Default::default() };
        disasm.parse_exec_sections(image);
        Some(disasm)
    }

    fn parse_exec_sections(&mut self, image: &[u8]) {
        let image = &image[..self.data.parsed_size.min(image.len())];
        let mut tables: [Vec<Offset>; aarch64::NUM_ADDR_TYPES] = Default::default();
        {
            let rva_to_offset = RvaToOffsetCache::new(&self.data.translator);
            for dims in &self.data.exec_section_dims {
                let mut gap_finder =
                    Abs32GapFinder::new(dims.region, &self.data.abs32_locations, 8);
                let mut rel_finder = Rel32FinderAArch64::new(image, &self.data.translator);
                while let Some(gap) = gap_finder.next_gap() {
                    rel_finder.set_region(gap);
                    while rel_finder.find_next() {
                        let Some(rel32) = rel_finder.rel32() else {
                            break;
                        };
                        let target_offset = rva_to_offset.convert(rel32.target_rva);
                        if target_offset != INVALID_OFFSET
                            && self.data.is_target_offset_in_exec_section(target_offset)
                        {
                            rel_finder.accept();
                            tables[rel32.addr_type as usize].push(rel32.location);
                        }
                    }
                }
            }
        }
        for table in &mut tables {
            table.sort_unstable();
        }
        self.rel32_locations_table = tables;
    }

    fn arm_reader<'a, T: ArmAddrTraits + 'a>(
        &'a self,
        image: &'a [u8],
        lo: Offset,
        hi: Offset,
    ) -> Box<dyn ReferenceReader + 'a> {
        Box::new(Rel32ReaderArm::<T>::new(
            &self.data.translator,
            image,
            &self.rel32_locations_table[T::ADDR_TYPE as usize],
            lo,
            hi,
        ))
    }
}

impl Disassembler for DisassemblerElfAArch64 {
    fn exe_type(&self) -> ExecutableType {
        ExecutableType::ElfAArch64
    }

    fn description(&self) -> &'static str {
        ElfAArch64Traits::NAME
    }

    fn version(&self) -> u16 {
        ElfAArch64Traits::VERSION
    }

    fn size(&self) -> usize {
        self.data.parsed_size
    }

    fn num_equivalence_iterations(&self) -> u8 {
        2
    }

    fn reference_groups(&self) -> Vec<ReferenceTypeTraits> {
        use elf_aarch64_type::*;
        vec![
            ReferenceTypeTraits::new(8, RELOC, RELOC_POOL),
            ReferenceTypeTraits::new(8, ABS32, ABS32_POOL),
            ReferenceTypeTraits::new(4, REL32_IMMD14, REL32_POOL),
            ReferenceTypeTraits::new(4, REL32_IMMD19, REL32_POOL),
            ReferenceTypeTraits::new(4, REL32_IMMD26, REL32_POOL),
        ]
    }

    fn make_reader<'a>(
        &'a self,
        type_tag: TypeTag,
        image: &'a [u8],
        lo: Offset,
        hi: Offset,
    ) -> Box<dyn ReferenceReader + 'a> {
        use elf_aarch64_type::*;
        match type_tag {
            RELOC => self.data.make_reloc_reader(
                Bitness::Bits64,
                ElfAArch64Traits::RELOC_TYPE,
                image,
                lo,
                hi,
            ),
            ABS32 => self.data.make_abs32_reader(Bitness::Bits64, image, lo, hi),
            REL32_IMMD14 => self.arm_reader::<AddrImmd14>(image, lo, hi),
            REL32_IMMD19 => self.arm_reader::<AddrImmd19>(image, lo, hi),
            REL32_IMMD26 => self.arm_reader::<AddrImmd26>(image, lo, hi),
            _ => Box::new(EmptyReferenceReader),
        }
    }

    fn make_writer<'a>(
        &'a self,
        type_tag: TypeTag,
        image: &'a mut [u8],
    ) -> Box<dyn ReferenceWriter + 'a> {
        use elf_aarch64_type::*;
        match type_tag {
            RELOC => Box::new(RelocWriterElf::new(image, Bitness::Bits64, &self.data.translator)),
            ABS32 => Box::new(Abs32Writer::new(
                image,
                AbsoluteAddress::new(Bitness::Bits64, ELF_IMAGE_BASE),
                &self.data.translator,
            )),
            REL32_IMMD14 => {
                Box::new(Rel32WriterArm::<AddrImmd14>::new(&self.data.translator, image))
            }
            REL32_IMMD19 => {
                Box::new(Rel32WriterArm::<AddrImmd19>::new(&self.data.translator, image))
            }
            REL32_IMMD26 => {
                Box::new(Rel32WriterArm::<AddrImmd26>::new(&self.data.translator, image))
            }
            _ => Box::new(EmptyReferenceWriter),
        }
    }

    fn make_mixer<'a>(
        &'a self,
        type_tag: TypeTag,
        old_image: &'a [u8],
        new_image: &'a [u8],
    ) -> Option<Box<dyn ReferenceMixer + 'a>> {
        use elf_aarch64_type::*;
        match type_tag {
            REL32_IMMD14 => {
                Some(Box::new(Rel32MixerArm::<AddrImmd14>::new(old_image, new_image)))
            }
            REL32_IMMD19 => {
                Some(Box::new(Rel32MixerArm::<AddrImmd19>::new(old_image, new_image)))
            }
            REL32_IMMD26 => {
                Some(Box::new(Rel32MixerArm::<AddrImmd26>::new(old_image, new_image)))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use marrow_core::buffer::{write_u16_le, write_u32_le};

    // Builds a minimal ELF32 x86 with a null section, a .text section at
    // RVA 0x1000 (file 0x100..0x140), and a .rel section at RVA 0x2000
    // (file 0x140..0x150) holding two Elf32_Rel entries.
    pub(crate) fn build_elf_x86() -> Vec<u8> {
        let mut image = vec![0u8; 0x150];
        image[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        image[EI_CLASS] = 1;
        image[EI_DATA] = 1;
        image[EI_VERSION] = 1;
        write_u16_le(&mut image, 16, ET_EXEC);
        write_u16_le(&mut image, 18, EM_386);
        write_u32_le(&mut image, 20, 1); // e_version.
        write_u32_le(&mut image, 32, 52); // e_shoff.
        write_u16_le(&mut image, 46, 40); // e_shentsize.
        write_u16_le(&mut image, 48, 3); // e_shnum.
        write_u16_le(&mut image, 50, 0); // e_shstrndx: the null section.

        let write_shdr =
            |image: &mut [u8], i: usize, ty: u32, flags: u32, addr: u32, off: u32, size: u32, entsize: u32| {
                let base = 52 + i * 40;
                write_u32_le(image, base + 4, ty);
                write_u32_le(image, base + 8, flags);
                write_u32_le(image, base + 12, addr);
                write_u32_le(image, base + 16, off);
                write_u32_le(image, base + 20, size);
                write_u32_le(image, base + 36, entsize);
            };
        // Section 0: null. Section 1: .text. Section 2: .rel.dyn.
        write_shdr(&mut image, 1, SHT_PROGBITS, 0x6, 0x1000, 0x100, 0x40, 0);
        write_shdr(&mut image, 2, SHT_REL, 0x2, 0x2000, 0x140, 16, 8);

        // .text: CALL rel32 at 0x100 targeting RVA 0x1008, abs32 slot at
        // 0x110 holding RVA 0x1020.
        image[0x100] = 0xE8;
        write_u32_le(&mut image, 0x101, 3);
        write_u32_le(&mut image, 0x110, 0x1020);

        // .rel.dyn: R_386_RELATIVE at RVA 0x1010, then an entry of another
        // type that must be skipped.
        write_u32_le(&mut image, 0x140, 0x1010);
        write_u32_le(&mut image, 0x144, R_386_RELATIVE);
        write_u32_le(&mut image, 0x148, 0x1014);
        write_u32_le(&mut image, 0x14C, 7); // R_386_JMP_SLOT.
        image
    }

    // Builds a minimal ELF64 AArch64 with a .text section at RVA 0x1000
    // (file 0x100..0x110) holding a B and a BL instruction.
    fn build_elf_aarch64() -> Vec<u8> {
        let mut image = vec![0u8; 0x110];
        image[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        image[EI_CLASS] = 2;
        image[EI_DATA] = 1;
        image[EI_VERSION] = 1;
        write_u16_le(&mut image, 16, ET_DYN);
        write_u16_le(&mut image, 18, EM_AARCH64);
        write_u32_le(&mut image, 20, 1); // e_version.
        image[40..48].copy_from_slice(&64u64.to_le_bytes()); // e_shoff.
        write_u16_le(&mut image, 58, 64); // e_shentsize.
        write_u16_le(&mut image, 60, 2); // e_shnum.
        write_u16_le(&mut image, 62, 0); // e_shstrndx.

        // Section 1: .text.
        let base = 64 + 64;
        write_u32_le(&mut image, base + 4, SHT_PROGBITS);
        image[base + 8..base + 16].copy_from_slice(&0x6u64.to_le_bytes()); // flags.
        image[base + 16..base + 24].copy_from_slice(&0x1000u64.to_le_bytes()); // addr.
        image[base + 24..base + 32].copy_from_slice(&0x100u64.to_le_bytes()); // offset.
        image[base + 32..base + 40].copy_from_slice(&0x10u64.to_le_bytes()); // size.

        // B +8 at RVA 0x1000 (-> 0x1008), BL -4 at RVA 0x1008 (-> 0x1004).
        write_u32_le(&mut image, 0x100, 0x1400_0002);
        write_u32_le(&mut image, 0x108, 0x97FF_FFFF);
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
    fn quick_detect_matches_arch() {
        let image = build_elf_x86();
        assert!(DisassemblerElfX86::quick_detect(&image));
        assert!(!DisassemblerElfX64::quick_detect(&image));
        assert!(!DisassemblerElfAArch32::quick_detect(&image));
    }

    #[test]
    fn elf_x86_extracts_all_reference_types() {
        let image = build_elf_x86();
        let disasm = DisassemblerElfX86::parse(&image).expect("parse");
        assert_eq!(disasm.exe_type(), ExecutableType::ElfX86);
        assert_eq!(disasm.size(), 0x150);

        let relocs =
            read_all(&mut *disasm.make_reader(elf_intel_type::RELOC, &image, 0, 0x150));
        assert_eq!(relocs, vec![Reference { location: 0x140, target: 0x110 }]);

        let abs32s =
            read_all(&mut *disasm.make_reader(elf_intel_type::ABS32, &image, 0, 0x150));
        assert_eq!(abs32s, vec![Reference { location: 0x110, target: 0x120 }]);

        let rel32s =
            read_all(&mut *disasm.make_reader(elf_intel_type::REL32, &image, 0, 0x150));
        assert_eq!(rel32s, vec![Reference { location: 0x101, target: 0x108 }]);
    }

    #[test]
    fn elf_x86_writers_round_trip() {
        let image = build_elf_x86();
        let disasm = DisassemblerElfX86::parse(&image).expect("parse");
        let mut copy = image.clone();
        {
            let mut writer = disasm.make_writer(elf_intel_type::ABS32, &mut copy);
            writer.put(Reference { location: 0x110, target: 0x130 });
        }
        {
            let mut writer = disasm.make_writer(elf_intel_type::REL32, &mut copy);
            writer.put(Reference { location: 0x101, target: 0x10C });
        }
        let abs32s =
            read_all(&mut *disasm.make_reader(elf_intel_type::ABS32, &copy, 0, 0x150));
        assert_eq!(abs32s, vec![Reference { location: 0x110, target: 0x130 }]);
        let rel32s =
            read_all(&mut *disasm.make_reader(elf_intel_type::REL32, &copy, 0, 0x150));
        assert_eq!(rel32s, vec![Reference { location: 0x101, target: 0x10C }]);
    }

    #[test]
    fn elf_aarch64_extracts_branches() {
        let image = build_elf_aarch64();
        let disasm = DisassemblerElfAArch64::parse(&image).expect("parse");
        let rel32s = read_all(&mut *disasm.make_reader(
            elf_aarch64_type::REL32_IMMD26,
            &image,
            0,
            0x110,
        ));
        assert_eq!(
            rel32s,
            vec![
                Reference { location: 0x100, target: 0x108 },
                Reference { location: 0x108, target: 0x104 },
            ]
        );
    }

    #[test]
    fn thumb2_classifier_uses_cond_always_density() {
        // 8 instructions, all with 0xE? in the top byte: ARM mode.
        let mut image = vec![0u8; 0x40];
        for i in 0..8 {
            write_u32_le(&mut image, 0x20 + i * 4, 0xE1A0_0000);
        }
        let arm_dims = ExecSectionDims { region: BufferRegion::new(0x20, 0x20), rva: 0x1000 };
        assert!(!DisassemblerElfAArch32::is_exec_section_thumb2(&image, &arm_dims));

        // All zeroes: condition nibble never 0xE, classified THUMB2.
        let zeroes = vec![0u8; 0x40];
        assert!(DisassemblerElfAArch32::is_exec_section_thumb2(&zeroes, &arm_dims));

        // Misaligned sections default to THUMB2.
        let odd_dims = ExecSectionDims { region: BufferRegion::new(0x20, 0x1E), rva: 0x1002 };
        assert!(DisassemblerElfAArch32::is_exec_section_thumb2(&image, &odd_dims));
    }
}
