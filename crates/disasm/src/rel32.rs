//! Rel32 reference discovery and rewriting for x86 / x64.
//!
//! Rel32 locations are found by a naive opcode scan over code sections,
//! restricted to the gaps between abs32 reference bodies so the two never
//! collide. Errors are tolerated: every candidate is validated against the
//! address translator (and section bounds) before being accepted.

use marrow_core::buffer::{read_u32_le, write_u32_le, BufferRegion};
use marrow_image::prelude::*;
use marrow_image::translator::{OffsetToRvaCache, RvaToOffsetCache};

/// Visits the non-empty contiguous gaps in `region` that lie outside the
/// bodies of `abs32_locations` (each spanning `abs32_width` bytes). Gaps
/// can then be scanned for rel32 references with bodies guaranteed not to
/// overlap any abs32 body.
pub struct Abs32GapFinder<'a> {
    region_end: usize,
    cur_lo: usize,
    abs32_locations: &'a [Offset],
    abs32_cur: usize,
    abs32_width: usize,
}

impl<'a> Abs32GapFinder<'a> {
    /// `abs32_locations` is a sorted list of non-overlapping abs32 locations
    /// in the image, and `region` (given in image offsets) is the search
    /// window.
    #[must_use]
    pub fn new(region: BufferRegion, abs32_locations: &'a [Offset], abs32_width: usize) -> Self {
        debug_assert!(abs32_width > 0);
        let begin_offset = region.lo();
        // First abs32 location at or after the region start; the previous
        // location's body may straddle the region start.
        let abs32_cur =
            abs32_locations.partition_point(|&loc| (loc as usize) < begin_offset);
        let mut cur_lo = region.lo();
        if abs32_cur > 0 {
            cur_lo = cur_lo.max(abs32_locations[abs32_cur - 1] as usize + abs32_width);
        }
        Self { region_end: region.hi(), cur_lo, abs32_locations, abs32_cur, abs32_width }
    }

    /// Returns the next gap, or `None` when exhausted.
    pub fn next_gap(&mut self) -> Option<BufferRegion> {
        while self.abs32_cur < self.abs32_locations.len()
            && (self.abs32_locations[self.abs32_cur] as usize) < self.region_end
        {
            let hi = self.abs32_locations[self.abs32_cur] as usize;
            let gap = BufferRegion::new(self.cur_lo, hi - self.cur_lo);
            self.cur_lo = hi + self.abs32_width;
            self.abs32_cur += 1;
            if gap.size > 0 {
                return Some(gap);
            }
        }
        // Final segment.
        if self.cur_lo < self.region_end {
            let gap = BufferRegion::new(self.cur_lo, self.region_end - self.cur_lo);
            self.cur_lo = self.region_end;
            return Some(gap);
        }
        None
    }
}

/// A rel32 candidate found by [`Rel32FinderIntel`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rel32Intel {
    pub location: Offset,
    pub target_rva: Rva,
    /// Some instructions (RIP-relative loads on x64) may legitimately point
    /// outside their section; for the rest, the section-bound heuristic
    /// applies.
    pub can_point_outside_section: bool,
}

/// Scans regions of an image for successive x86 / x64 rel32 references by
/// looking for opcodes that take one, disregarding instruction alignment.
///
/// Usage, combined with [`Abs32GapFinder`]:
/// ```text
/// while let Some(gap) = gap_finder.next_gap() {
///     finder.set_region(gap);
///     while finder.find_next() {
///         if validate(finder.rel32()) {
///             finder.accept();
///         }
///     }
/// }
/// ```
pub struct Rel32FinderIntel<'a> {
    image: &'a [u8],
    offset_to_rva: OffsetToRvaCache<'a>,
    x64: bool,
    region_lo: usize,
    region_hi: usize,
    accept_pos: usize,
    rel32: Rel32Intel,
}

impl<'a> Rel32FinderIntel<'a> {
    #[must_use]
    pub fn new(image: &'a [u8], translator: &'a AddressTranslator, x64: bool) -> Self {
        Self {
            image,
            offset_to_rva: OffsetToRvaCache::new(translator),
            x64,
            region_lo: 0,
            region_hi: 0,
            accept_pos: 0,
            rel32: Rel32Intel::default(),
        }
    }

    /// Assigns the scan region (in image offsets) for subsequent
    /// [`find_next`](Self::find_next) calls.
    pub fn set_region(&mut self, region: BufferRegion) {
        self.region_lo = region.lo();
        self.region_hi = region.hi();
        self.accept_pos = region.lo();
    }

    /// Scans for the next rel32 candidate; the result is cached for
    /// [`rel32`](Self::rel32). Returns whether one was found.
    pub fn find_next(&mut self) -> bool {
        let mut cursor = self.region_lo;
        while cursor < self.region_hi {
            if self.region_hi - cursor >= 5 {
                // JMP rel32; CALL rel32.
                if self.image[cursor] == 0xE8 || self.image[cursor] == 0xE9 {
                    self.set_result(cursor, 1, false);
                    return true;
                }
            }
            if self.region_hi - cursor >= 6 {
                if self.image[cursor] == 0x0F && self.image[cursor + 1] & 0xF0 == 0x80 {
                    // Jcc long form.
                    self.set_result(cursor, 2, false);
                    return true;
                }
                if self.x64 {
                    // FF 15: CALL QWORD PTR [rip+disp32]
                    // FF 25: JMP  QWORD PTR [rip+disp32]
                    // 89/8B/8D with ModR/M 00xxx101: MOV/LEA r32, [rip+disp32]
                    let b0 = self.image[cursor];
                    let b1 = self.image[cursor + 1];
                    if (b0 == 0xFF && (b1 == 0x15 || b1 == 0x25))
                        || ((b0 == 0x89 || b0 == 0x8B || b0 == 0x8D) && b1 & 0xC7 == 0x05)
                    {
                        self.set_result(cursor, 2, true);
                        return true;
                    }
                }
            }
            cursor += 1;
        }
        self.region_lo = self.region_hi;
        false
    }

    /// Skips past the accepted candidate body, so the next scan resumes
    /// after it. Without this, the next scan resumes at the following byte.
    pub fn accept(&mut self) {
        self.region_lo = self.accept_pos;
    }

    /// The cached result from the last successful find.
    #[inline]
    #[must_use]
    pub fn rel32(&self) -> Rel32Intel {
        self.rel32
    }

    fn set_result(&mut self, cursor: usize, opcode_size: usize, can_point_outside: bool) {
        let location = (cursor + opcode_size) as Offset;
        let location_rva = self.offset_to_rva.convert(location);
        debug_assert_ne!(location_rva, INVALID_RVA);
        let disp = read_u32_le(self.image, location as usize).unwrap_or(0);
        let target_rva = location_rva.wrapping_add(4).wrapping_add(disp);
        self.rel32 = Rel32Intel { location, target_rva, can_point_outside_section: can_point_outside };
        self.region_lo = cursor + 1;
        self.accept_pos = cursor + opcode_size + 4;
    }
}

/// Reader emitting x86 / x64 rel32 references from a pre-validated sorted
/// location list, restricted to `[lo, hi)`.
pub struct Rel32ReaderX86<'a> {
    image: &'a [u8],
    target_rva_to_offset: RvaToOffsetCache<'a>,
    location_offset_to_rva: OffsetToRvaCache<'a>,
    locations: &'a [Offset],
    current: usize,
    hi: Offset,
}

impl<'a> Rel32ReaderX86<'a> {
    #[must_use]
    pub fn new(
        image: &'a [u8],
        lo: Offset,
        hi: Offset,
        locations: &'a [Offset],
        translator: &'a AddressTranslator,
    ) -> Self {
        debug_assert!(lo as usize <= image.len());
        debug_assert!(hi as usize <= image.len());
        let current = locations.partition_point(|&loc| loc < lo);
        Self {
            image,
            target_rva_to_offset: RvaToOffsetCache::new(translator),
            location_offset_to_rva: OffsetToRvaCache::new(translator),
            locations,
            current,
            hi,
        }
    }
}

impl ReferenceReader for Rel32ReaderX86<'_> {
    fn next_ref(&mut self) -> Option<Reference> {
        while self.current < self.locations.len() && self.locations[self.current] < self.hi {
            let location = self.locations[self.current];
            self.current += 1;
            let location_rva = self.location_offset_to_rva.convert(location);
            let disp = read_u32_le(self.image, location as usize)?;
            let target_rva = location_rva.wrapping_add(4).wrapping_add(disp);
            let target = self.target_rva_to_offset.convert(target_rva);
            // Locations are valid by construction.
            debug_assert_ne!(target, INVALID_OFFSET);
            return Some(Reference { location, target });
        }
        None
    }
}

/// Writer for x86 / x64 rel32 references.
pub struct Rel32WriterX86<'a> {
    image: &'a mut [u8],
    target_offset_to_rva: OffsetToRvaCache<'a>,
    location_offset_to_rva: OffsetToRvaCache<'a>,
}

impl<'a> Rel32WriterX86<'a> {
    #[must_use]
    pub fn new(image: &'a mut [u8], translator: &'a AddressTranslator) -> Self {
        Self {
            image,
            target_offset_to_rva: OffsetToRvaCache::new(translator),
            location_offset_to_rva: OffsetToRvaCache::new(translator),
        }
    }
}

impl ReferenceWriter for Rel32WriterX86<'_> {
    fn put(&mut self, reference: Reference) {
        let target_rva = self.target_offset_to_rva.convert(reference.target);
        let location_rva = self.location_offset_to_rva.convert(reference.location);
        // Subtraction underflow is okay.
        let code = target_rva.wrapping_sub(location_rva.wrapping_add(4));
        write_u32_le(self.image, reference.location as usize, code);
    }
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
    fn gap_finder_emits_gaps_between_bodies() {
        // Region [4, 26), abs32 locations {2, 6, 15, 20, 27}, width 4:
        // bodies cover [2,6) [6,10) [15,19) [20,24) [27,31), so the gaps
        // inside the region are [10,15), [19,20), [24,26).
        let locations = vec![2u32, 6, 15, 20, 27];
        let mut finder = Abs32GapFinder::new(BufferRegion::new(4, 22), &locations, 4);
        assert_eq!(finder.next_gap(), Some(BufferRegion::new(10, 5)));
        assert_eq!(finder.next_gap(), Some(BufferRegion::new(19, 1)));
        assert_eq!(finder.next_gap(), Some(BufferRegion::new(24, 2)));
        assert_eq!(finder.next_gap(), None);
    }

    #[test]
    fn gap_finder_without_abs32_yields_whole_region() {
        let mut finder = Abs32GapFinder::new(BufferRegion::new(3, 9), &[], 4);
        assert_eq!(finder.next_gap(), Some(BufferRegion::new(3, 9)));
        assert_eq!(finder.next_gap(), None);
    }

    #[test]
    fn finder_detects_call_and_jmp() {
        // E8 <rel32=2>, padding, E9 <rel32=-12>.
        let mut image = vec![0x90u8; 32];
        image[0] = 0xE8;
        write_u32_le(&mut image, 1, 2);
        image[10] = 0xE9;
        write_u32_le(&mut image, 11, (-12i32) as u32);
        let translator = identity_translator(32);
        let mut finder = Rel32FinderIntel::new(&image, &translator, false);
        finder.set_region(BufferRegion::new(0, 32));

        assert!(finder.find_next());
        // Target = location_rva(1) + 4 + 2 = 7.
        assert_eq!(
            finder.rel32(),
            Rel32Intel { location: 1, target_rva: 7, can_point_outside_section: false }
        );
        finder.accept();

        assert!(finder.find_next());
        // Target = 11 + 4 - 12 = 3.
        assert_eq!(finder.rel32().location, 11);
        assert_eq!(finder.rel32().target_rva, 3);
        finder.accept();

        assert!(!finder.find_next());
    }

    #[test]
    fn finder_detects_jcc_long_form() {
        let mut image = vec![0x90u8; 16];
        image[2] = 0x0F;
        image[3] = 0x84; // JE rel32.
        write_u32_le(&mut image, 4, 0);
        let translator = identity_translator(16);
        let mut finder = Rel32FinderIntel::new(&image, &translator, false);
        finder.set_region(BufferRegion::new(0, 16));
        assert!(finder.find_next());
        assert_eq!(finder.rel32().location, 4);
        assert_eq!(finder.rel32().target_rva, 8);
    }

    #[test]
    fn finder_x64_rip_relative_forms() {
        let mut image = vec![0x90u8; 24];
        image[0] = 0xFF;
        image[1] = 0x15; // CALL [rip+disp32].
        write_u32_le(&mut image, 2, 4);
        image[8] = 0x8D;
        image[9] = 0x0D; // LEA ecx, [rip+disp32].
        write_u32_le(&mut image, 10, 0);
        let translator = identity_translator(24);
        let mut finder = Rel32FinderIntel::new(&image, &translator, true);
        finder.set_region(BufferRegion::new(0, 24));

        assert!(finder.find_next());
        assert_eq!(
            finder.rel32(),
            Rel32Intel { location: 2, target_rva: 10, can_point_outside_section: true }
        );
        finder.accept();

        assert!(finder.find_next());
        assert_eq!(finder.rel32().location, 10);
        assert!(finder.rel32().can_point_outside_section);
        finder.accept();
        assert!(!finder.find_next());

        // x86 mode must not recognize these forms.
        let mut x86_finder = Rel32FinderIntel::new(&image, &translator, false);
        x86_finder.set_region(BufferRegion::new(0, 24));
        assert!(!x86_finder.find_next());
    }

    #[test]
    fn reject_resumes_at_next_byte() {
        // E8 whose "displacement" contains another E8 that a reject should
        // then find.
        let mut image = vec![0u8; 16];
        image[0] = 0xE8;
        image[2] = 0xE8;
        let translator = identity_translator(16);
        let mut finder = Rel32FinderIntel::new(&image, &translator, false);
        finder.set_region(BufferRegion::new(0, 16));
        assert!(finder.find_next());
        assert_eq!(finder.rel32().location, 1);
        // Without accept(), the scan resumes right after the opcode byte.
        assert!(finder.find_next());
        assert_eq!(finder.rel32().location, 3);
    }

    #[test]
    fn reader_and_writer_round_trip() {
        let mut image = vec![0x90u8; 32];
        image[0] = 0xE8;
        write_u32_le(&mut image, 1, 2);
        let translator = identity_translator(32);
        let locations = vec![1u32];
        {
            let mut reader = Rel32ReaderX86::new(&image, 0, 32, &locations, &translator);
            assert_eq!(reader.next_ref(), Some(Reference { location: 1, target: 7 }));
            assert_eq!(reader.next_ref(), None);
        }
        {
            let mut writer = Rel32WriterX86::new(&mut image, &translator);
            writer.put(Reference { location: 1, target: 20 });
        }
        assert_eq!(read_u32_le(&image, 1), Some(15)); // 20 - (1 + 4).
        let mut reader = Rel32ReaderX86::new(&image, 0, 32, &locations, &translator);
        assert_eq!(reader.next_ref(), Some(Reference { location: 1, target: 20 }));
    }
}
