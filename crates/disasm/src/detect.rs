//! Executable detection: tries each known format against a byte range and
//! scans archives for embedded elements.

use marrow_core::buffer::BufferRegion;
use marrow_image::types::{Element, ExecutableType};

use crate::elf::{
    DisassemblerElfAArch32, DisassemblerElfAArch64, DisassemblerElfX64, DisassemblerElfX86,
};
use crate::noop::DisassemblerNoOp;
use crate::pe::{DisassemblerWin32X64, DisassemblerWin32X86};
use crate::Disassembler;

/// Minimal size for a detected program, to eliminate pathological cases.
pub const MIN_PROGRAM_SIZE: usize = 16;

/// Attempts to detect an executable at the start of `image`. Returns the
/// corresponding disassembler, or `None`. Unlike
/// [`make_disassembler_of_type`], this never falls back to no-op.
#[must_use]
pub fn make_disassembler(image: &[u8]) -> Option<Box<dyn Disassembler>> {
    macro_rules! try_format {
        ($disasm:ty) => {
            if <$disasm>::quick_detect(image) {
                if let Some(disasm) = <$disasm>::parse(image) {
                    if disasm.size() >= MIN_PROGRAM_SIZE {
                        return Some(Box::new(disasm));
                    }
                }
            }
        };
    }
    try_format!(DisassemblerWin32X86);
    try_format!(DisassemblerWin32X64);
    try_format!(DisassemblerElfX86);
    try_format!(DisassemblerElfX64);
    try_format!(DisassemblerElfAArch32);
    try_format!(DisassemblerElfAArch64);
    None
}

/// Attempts to create a disassembler of the given type over `image`.
#[must_use]
pub fn make_disassembler_of_type(
    image: &[u8],
    exe_type: ExecutableType,
) -> Option<Box<dyn Disassembler>> {
    match exe_type {
        ExecutableType::Win32X86 => {
            DisassemblerWin32X86::parse(image).map(|d| Box::new(d) as Box<dyn Disassembler>)
        }
        ExecutableType::Win32X64 => {
            DisassemblerWin32X64::parse(image).map(|d| Box::new(d) as Box<dyn Disassembler>)
        }
        ExecutableType::ElfX86 => {
            DisassemblerElfX86::parse(image).map(|d| Box::new(d) as Box<dyn Disassembler>)
        }
        ExecutableType::ElfX64 => {
            DisassemblerElfX64::parse(image).map(|d| Box::new(d) as Box<dyn Disassembler>)
        }
        ExecutableType::ElfAArch32 => {
            DisassemblerElfAArch32::parse(image).map(|d| Box::new(d) as Box<dyn Disassembler>)
        }
        ExecutableType::ElfAArch64 => {
            DisassemblerElfAArch64::parse(image).map(|d| Box::new(d) as Box<dyn Disassembler>)
        }
        ExecutableType::NoOp => {
            DisassemblerNoOp::parse(image).map(|d| Box::new(d) as Box<dyn Disassembler>)
        }
        // Recognized in the patch format but unsupported here.
        ExecutableType::Dex | ExecutableType::Ztf => None,
    }
}

/// Returns the disassembler version for `exe_type`, or `None` if the type
/// is unsupported (so patches naming it fail their version check).
#[must_use]
pub fn disassembler_version_of(exe_type: ExecutableType) -> Option<u16> {
    match exe_type {
        ExecutableType::Win32X86
        | ExecutableType::Win32X64
        | ExecutableType::ElfX86
        | ExecutableType::ElfX64
        | ExecutableType::ElfAArch32
        | ExecutableType::ElfAArch64 => Some(1),
        ExecutableType::NoOp => Some(DisassemblerNoOp::VERSION),
        ExecutableType::Dex | ExecutableType::Ztf => None,
    }
}

/// Attempts to detect an element at the start of `image`.
#[must_use]
pub fn detect_element(image: &[u8]) -> Option<Element> {
    let disasm = make_disassembler(image)?;
    Some(Element::new(BufferRegion::new(0, disasm.size()), disasm.exe_type()))
}

/// Scans through an image and iteratively detects elements: at each byte
/// offset, detection is attempted; on success the element is emitted and
/// the scan skips past it, otherwise the scan advances one byte.
pub struct ElementFinder<'a> {
    image: &'a [u8],
    pos: usize,
}

impl<'a> ElementFinder<'a> {
    #[must_use]
    pub fn new(image: &'a [u8]) -> Self {
        Self { image, pos: 0 }
    }

    pub fn next_element(&mut self) -> Option<Element> {
        while self.pos < self.image.len() {
            if let Some(mut element) = detect_element(&self.image[self.pos..]) {
                element.region.offset += self.pos;
                self.pos = element.end_offset() as usize;
                return Some(element);
            }
            self.pos += 1;
        }
        None
    }
}

impl Iterator for ElementFinder<'_> {
    type Item = Element;

    fn next(&mut self) -> Option<Element> {
        self.next_element()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_pe_embedded_at_offset() {
        let pe = crate::pe::tests::build_pe32();
        let mut archive = vec![0xAAu8; 0x20];
        archive.extend_from_slice(&pe);
        archive.extend_from_slice(&[0xBB; 0x10]);

        let elements: Vec<Element> = ElementFinder::new(&archive).collect();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].exe_type, ExecutableType::Win32X86);
        assert_eq!(elements[0].region.offset, 0x20);
        assert_eq!(elements[0].region.size, pe.len());
    }

    #[test]
    fn detects_elf_and_respects_min_size() {
        let elf = crate::elf::tests::build_elf_x86();
        assert_eq!(
            detect_element(&elf).map(|e| e.exe_type),
            Some(ExecutableType::ElfX86)
        );
        // Arbitrary data detects nothing.
        assert_eq!(detect_element(&[0u8; 64]), None);
    }

    #[test]
    fn version_lookup_rejects_unsupported_types() {
        assert_eq!(disassembler_version_of(ExecutableType::NoOp), Some(1));
        assert_eq!(disassembler_version_of(ExecutableType::Dex), None);
        assert_eq!(disassembler_version_of(ExecutableType::Ztf), None);
    }
}
