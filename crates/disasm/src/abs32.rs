//! Absolute 32/64-bit pointer (abs32) handling.
//!
//! Abs32 locations are harvested from relocation targets. The word at each
//! location is a virtual address; subtracting the image base yields an RVA,
//! which the address translator maps to the target offset.

use marrow_core::buffer::{read_u32_le, read_u64_le, write_u32_le, write_u64_le};
use marrow_image::prelude::*;
use marrow_image::translator::{OffsetToRvaCache, RvaToOffsetCache};
use marrow_image::types::Bitness;

/// An abs32 address (32-bit or 64-bit), with accessors to translate from /
/// to RVA and to read / write the represented value in an image.
#[derive(Clone, Debug)]
pub struct AbsoluteAddress {
    bitness: Bitness,
    image_base: u64,
    value: u64,
}

impl AbsoluteAddress {
    #[must_use]
    pub fn new(bitness: Bitness, image_base: u64) -> Self {
        debug_assert!(bitness == Bitness::Bits64 || image_base < 0x1_0000_0000);
        Self { bitness, image_base, value: image_base }
    }

    /// Translates `rva` into the stored address. Fails on invalid `rva` or
    /// overflow.
    pub fn set_from_rva(&mut self, rva: Rva) -> bool {
        if rva >= RVA_BOUND {
            return false;
        }
        let value = self.image_base.wrapping_add(u64::from(rva));
        // Overflow manifests as wrap-around below the base; 32-bit values
        // wrap within the low word.
        let effective = match self.bitness {
            Bitness::Bits32 => value & 0xFFFF_FFFF,
            Bitness::Bits64 => value,
        };
        if effective < self.image_base {
            return false;
        }
        self.value = value;
        true
    }

    /// Returns the RVA for the stored address, or [`INVALID_RVA`] if it does
    /// not correspond to one.
    #[must_use]
    pub fn to_rva(&self) -> Rva {
        if self.value < self.image_base {
            return INVALID_RVA;
        }
        let raw_rva = self.value - self.image_base;
        if raw_rva >= u64::from(RVA_BOUND) {
            return INVALID_RVA;
        }
        raw_rva as Rva
    }

    /// Reads the raw address at `image[offset]` into the store. The result
    /// is not guaranteed to represent a valid RVA.
    pub fn read(&mut self, offset: Offset, image: &[u8]) -> bool {
        let read = match self.bitness {
            Bitness::Bits32 => read_u32_le(image, offset as usize).map(u64::from),
            Bitness::Bits64 => read_u64_le(image, offset as usize),
        };
        match read {
            Some(value) => {
                self.value = value;
                true
            }
            None => false,
        }
    }

    /// Writes the stored address to `image[offset]`.
    pub fn write(&self, offset: Offset, image: &mut [u8]) -> bool {
        match self.bitness {
            Bitness::Bits32 => write_u32_le(image, offset as usize, self.value as u32),
            Bitness::Bits64 => write_u64_le(image, offset as usize, self.value),
        }
    }

    #[inline]
    #[must_use]
    pub fn width(&self) -> u32 {
        self.bitness.width()
    }
}

/// Unit of data extracted by [`Abs32RvaExtractor`]: a location and its
/// (potentially out-of-bound) target RVA.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Abs32Unit {
    pub location: Offset,
    pub target_rva: Rva,
}

/// Visits abs32 locations in `[lo, hi)`, rejecting invalid reads and
/// non-existent RVAs. `lo` and `hi` must not straddle a reference body.
pub struct Abs32RvaExtractor<'a> {
    image: &'a [u8],
    addr: AbsoluteAddress,
    locations: &'a [Offset],
    cur: usize,
    end: usize,
}

impl<'a> Abs32RvaExtractor<'a> {
    #[must_use]
    pub fn new(
        image: &'a [u8],
        addr: AbsoluteAddress,
        locations: &'a [Offset],
        lo: Offset,
        hi: Offset,
    ) -> Self {
        debug_assert!(lo <= hi);
        let find_and_check = |offset: Offset| {
            let it = locations.partition_point(|&loc| loc < offset);
            // |offset| must not straddle a reference body.
            debug_assert!(it == 0 || offset - locations[it - 1] >= addr.width());
            it
        };
        let cur = find_and_check(lo);
        let end = find_and_check(hi);
        Self { image, addr, locations, cur, end }
    }

    pub fn next_unit(&mut self) -> Option<Abs32Unit> {
        while self.cur < self.end {
            let location = self.locations[self.cur];
            self.cur += 1;
            if !self.addr.read(location, self.image) {
                continue;
            }
            let target_rva = self.addr.to_rva();
            if target_rva == INVALID_RVA {
                continue;
            }
            return Some(Abs32Unit { location, target_rva });
        }
        None
    }
}

/// Reader for abs32 references; filters and translates extractor output.
pub struct Abs32Reader<'a> {
    extractor: Abs32RvaExtractor<'a>,
    target_rva_to_offset: RvaToOffsetCache<'a>,
}

impl<'a> Abs32Reader<'a> {
    #[must_use]
    pub fn new(extractor: Abs32RvaExtractor<'a>, translator: &'a AddressTranslator) -> Self {
        Self { extractor, target_rva_to_offset: RvaToOffsetCache::new(translator) }
    }
}

impl ReferenceReader for Abs32Reader<'_> {
    fn next_ref(&mut self) -> Option<Reference> {
        while let Some(unit) = self.extractor.next_unit() {
            let target = self.target_rva_to_offset.convert(unit.target_rva);
            if target != INVALID_OFFSET {
                return Some(Reference { location: unit.location, target });
            }
        }
        None
    }
}

/// Writer for abs32 references.
pub struct Abs32Writer<'a> {
    image: &'a mut [u8],
    addr: AbsoluteAddress,
    target_offset_to_rva: OffsetToRvaCache<'a>,
}

impl<'a> Abs32Writer<'a> {
    #[must_use]
    pub fn new(
        image: &'a mut [u8],
        addr: AbsoluteAddress,
        translator: &'a AddressTranslator,
    ) -> Self {
        Self { image, addr, target_offset_to_rva: OffsetToRvaCache::new(translator) }
    }
}

impl ReferenceWriter for Abs32Writer<'_> {
    fn put(&mut self, reference: Reference) {
        let target_rva = self.target_offset_to_rva.convert(reference.target);
        if target_rva != INVALID_RVA && self.addr.set_from_rva(target_rva) {
            self.addr.write(reference.location, self.image);
        }
    }
}

/// Removes from `locations` every element whose target cannot be translated
/// to an offset. Returns the number of elements removed.
pub fn remove_untranslatable_abs32(
    image: &[u8],
    addr: AbsoluteAddress,
    translator: &AddressTranslator,
    locations: &mut Vec<Offset>,
) -> usize {
    let hi = image.len().min(OFFSET_BOUND as usize) as Offset;
    let extractor = Abs32RvaExtractor::new(image, addr, locations, 0, hi);
    let mut reader = Abs32Reader::new(extractor, translator);
    let mut kept = Vec::with_capacity(locations.len());
    while let Some(reference) = reader.next_ref() {
        kept.push(reference.location);
    }
    let num_removed = locations.len() - kept.len();
    *locations = kept;
    num_removed
}

/// Given sorted `locations`, removes every element whose body (of `width`
/// bytes) overlaps the body of a previous element. Returns the number of
/// elements removed.
pub fn remove_overlapping_abs32(width: u32, locations: &mut Vec<Offset>) -> usize {
    let before = locations.len();
    let mut next_free: u64 = 0;
    locations.retain(|&location| {
        if u64::from(location) < next_free {
            return false;
        }
        next_free = u64::from(location) + u64::from(width);
        true
    });
    before - locations.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use marrow_image::translator::Unit;

    fn identity_translator(size: u32) -> AddressTranslator {
        AddressTranslator::new(vec![Unit {
            offset_begin: 0,
            offset_size: size,
            rva_begin: 0,
            rva_size: size,
        }])
        .unwrap()
    }

    #[test]
    fn absolute_address_round_trip_32() {
        let mut addr = AbsoluteAddress::new(Bitness::Bits32, 0x0040_0000);
        assert!(addr.set_from_rva(0x1234));
        assert_eq!(addr.to_rva(), 0x1234);
        let mut image = vec![0u8; 8];
        assert!(addr.write(2, &mut image));
        assert_eq!(read_u32_le(&image, 2), Some(0x0040_1234));
        let mut other = AbsoluteAddress::new(Bitness::Bits32, 0x0040_0000);
        assert!(other.read(2, &image));
        assert_eq!(other.to_rva(), 0x1234);
    }

    #[test]
    fn absolute_address_rejects_below_base() {
        let mut addr = AbsoluteAddress::new(Bitness::Bits32, 0x0040_0000);
        let image = vec![1u8, 0, 0, 0];
        assert!(addr.read(0, &image));
        assert_eq!(addr.to_rva(), INVALID_RVA);
    }

    #[test]
    fn reader_skips_untranslatable_targets() {
        // Image: abs32 values at offsets 0 and 4; value at 4 exceeds image.
        let mut image = vec![0u8; 16];
        write_u32_le(&mut image, 0, 8); // RVA 8 -> offset 8.
        write_u32_le(&mut image, 4, 0x100); // RVA 0x100: out of image.
        let translator = identity_translator(16);
        let locations = vec![0u32, 4];
        let extractor = Abs32RvaExtractor::new(
            &image,
            AbsoluteAddress::new(Bitness::Bits32, 0),
            &locations,
            0,
            16,
        );
        let mut reader = Abs32Reader::new(extractor, &translator);
        assert_eq!(reader.next_ref(), Some(Reference { location: 0, target: 8 }));
        assert_eq!(reader.next_ref(), None);
    }

    #[test]
    fn remove_overlapping_keeps_first_of_each_cluster() {
        let mut locations = vec![0u32, 2, 4, 9, 10, 14];
        let removed = remove_overlapping_abs32(4, &mut locations);
        assert_eq!(locations, vec![0, 4, 9, 14]);
        assert_eq!(removed, 2);
    }

    #[test]
    fn remove_untranslatable_filters_in_place() {
        let mut image = vec![0u8; 16];
        write_u32_le(&mut image, 0, 8);
        write_u32_le(&mut image, 4, 0x100);
        write_u32_le(&mut image, 8, 12);
        let translator = identity_translator(16);
        let mut locations = vec![0u32, 4, 8];
        let removed = remove_untranslatable_abs32(
            &image,
            AbsoluteAddress::new(Bitness::Bits32, 0),
            &translator,
            &mut locations,
        );
        assert_eq!(removed, 1);
        assert_eq!(locations, vec![0, 8]);
    }
}
