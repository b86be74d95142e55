//! Bidirectional translation between file offsets and RVAs.
//!
//! Executable sections provide `{offset start, offset size, RVA start, RVA
//! size}` units. `RVA size > offset size` is allowed and yields "dangling
//! RVAs" (e.g., `.bss`) that exist at runtime but have no file backing.
//! Dangling RVAs are represented in the offset domain by "fake offsets":
//! the RVA shifted up by an exclusive upper bound of all real offsets.
//! Image data must never be read at fake offsets; they exist only as
//! reference targets.

use core::cell::Cell;

use marrow_core::util::range_is_bounded;
use snafu::prelude::*;

use crate::types::{Offset, Rva, INVALID_OFFSET, INVALID_RVA, OFFSET_BOUND, RVA_BOUND};

/// Error conditions for translator construction.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// A unit's offset or RVA range overflows its bound.
    #[snafu(display("Unit range overflows!"))]
    Overflow,
    /// Two units overlap with inconsistent offset-to-RVA deltas.
    #[snafu(display("Inconsistent overlapping units!"))]
    BadOverlap,
    /// Two overlapping units disagree on dangling RVAs.
    #[snafu(display("Inconsistent dangling RVAs in overlapping units!"))]
    BadOverlapDanglingRva,
    /// Fake offsets for dangling RVAs would not fit below the offset bound.
    #[snafu(display("Fake offset range too large!"))]
    FakeOffsetBeginTooLarge,
}
pub type Result<T> = core::result::Result<T, Error>;

/// A basic unit of address translation. Roughly a section, but units may be
/// merged during construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Unit {
    pub offset_begin: Offset,
    pub offset_size: Offset,
    pub rva_begin: Rva,
    pub rva_size: Rva,
}

impl Unit {
    #[inline]
    #[must_use]
    pub const fn offset_end(&self) -> Offset {
        self.offset_begin + self.offset_size
    }

    #[inline]
    #[must_use]
    pub const fn rva_end(&self) -> Rva {
        self.rva_begin + self.rva_size
    }

    /// A unit with no RVA range is empty; `offset_size` is clamped to
    /// `rva_size` during construction, so an untrimmed unit with
    /// `rva_size == 0` and `offset_size > 0` is empty too.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.rva_size == 0
    }

    #[inline]
    #[must_use]
    pub const fn covers_offset(&self, offset: Offset) -> bool {
        offset >= self.offset_begin && offset - self.offset_begin < self.offset_size
    }

    #[inline]
    #[must_use]
    pub const fn covers_rva(&self, rva: Rva) -> bool {
        rva >= self.rva_begin && rva - self.rva_begin < self.rva_size
    }

    #[inline]
    #[must_use]
    pub const fn covers_dangling_rva(&self, rva: Rva) -> bool {
        self.covers_rva(rva) && rva - self.rva_begin >= self.offset_size
    }

    #[inline]
    #[must_use]
    pub const fn has_dangling_rva(&self) -> bool {
        self.rva_size > self.offset_size
    }

    /// Assumes `offset` is covered (cannot be a fake offset).
    #[inline]
    #[must_use]
    pub const fn offset_to_rva_unchecked(&self, offset: Offset) -> Rva {
        offset - self.offset_begin + self.rva_begin
    }

    /// Assumes `rva` is covered (may be dangling, yielding a fake offset).
    #[inline]
    #[must_use]
    pub const fn rva_to_offset_unchecked(&self, rva: Rva, fake_offset_begin: Offset) -> Offset {
        let delta = rva - self.rva_begin;
        if delta < self.offset_size {
            delta + self.offset_begin
        } else {
            fake_offset_begin + rva
        }
    }
}

/// A utility to translate between offsets and RVAs in an image. Built once
/// from a unit list; immutable thereafter.
#[derive(Debug, Default)]
pub struct AddressTranslator {
    // Offset ranges are non-empty and disjoint; likewise RVA ranges.
    units_sorted_by_offset: Vec<Unit>,
    units_sorted_by_rva: Vec<Unit>,
    // Conversion factor between dangling RVAs and fake offsets.
    fake_offset_begin: Offset,
}

impl AddressTranslator {
    /// Consumes `units`, validating and merging overlapping entries.
    pub fn new(mut units: Vec<Unit>) -> Result<Self> {
        for unit in &mut units {
            ensure!(
                range_is_bounded(
                    unit.offset_begin.into(),
                    unit.offset_size.into(),
                    OFFSET_BOUND.into()
                ) && range_is_bounded(
                    unit.rva_begin.into(),
                    unit.rva_size.into(),
                    RVA_BOUND.into()
                ),
                OverflowSnafu
            );
            // If |rva_size < offset_size|, shrink the offset range; the
            // excess file data has no RVA and is of no use here. The other
            // direction (|rva_size > offset_size|) is the dangling-RVA case
            // and is kept.
            unit.offset_size = unit.offset_size.min(unit.rva_size);
        }

        units.retain(|unit| !unit.is_empty());

        units.sort_by_key(|unit| (unit.rva_begin, unit.rva_size));
        units.dedup();

        // Scan for RVA overlaps, validate, and merge wherever possible.
        // |slow| absorbs every unit that overlaps (or touches, if
        // compatible); |fast| explores candidates.
        if units.len() > 1 {
            let mut slow = 0usize;
            for fast in 1..units.len() {
                let f = units[fast];
                let s = units[slow];
                debug_assert!(f.rva_begin >= s.rva_begin);
                if s.rva_end() < f.rva_begin {
                    // Disjoint: advance.
                    slow += 1;
                    units[slow] = f;
                    continue;
                }

                // Touching ranges may merge; overlapping ranges must.
                let merge_is_optional = s.rva_end() == f.rva_begin;

                // A merge requires identical offset-to-RVA deltas.
                if f.offset_begin < s.offset_begin
                    || f.offset_begin - s.offset_begin != f.rva_begin - s.rva_begin
                {
                    if merge_is_optional {
                        slow += 1;
                        units[slow] = f;
                        continue;
                    }
                    return BadOverlapSnafu.fail();
                }

                // Dangling RVAs must be consistent: if a unit dangles, its
                // offset-backed range must extend at least as far as the
                // other unit's.
                if (f.has_dangling_rva() && f.offset_end() < s.offset_end())
                    || (s.has_dangling_rva() && s.offset_end() < f.offset_end())
                {
                    if merge_is_optional {
                        slow += 1;
                        units[slow] = f;
                        continue;
                    }
                    return BadOverlapDanglingRvaSnafu.fail();
                }

                // Merge |fast| into |slow|, spanning the union.
                units[slow].rva_size = s.rva_size.max(f.rva_end() - s.rva_begin);
                units[slow].offset_size = s.offset_size.max(f.offset_end() - s.offset_begin);
            }
            units.truncate(slow + 1);
        }

        // After resolving RVA overlaps, any offset overlap is an error.
        units.sort_by_key(|unit| unit.offset_begin);
        for pair in units.windows(2) {
            ensure!(pair[0].offset_end() <= pair[1].offset_begin, BadOverlapSnafu);
        }

        // Fake offsets start at the exclusive upper bound of real offsets;
        // the pessimistic combined range must still fit below the offset
        // bound. This limits image size to half of |OFFSET_BOUND|.
        let mut offset_bound: Offset = 0;
        let mut rva_bound: Rva = 0;
        for unit in &units {
            offset_bound = offset_bound.max(unit.offset_end());
            rva_bound = rva_bound.max(unit.rva_end());
        }
        ensure!(
            range_is_bounded(offset_bound.into(), rva_bound.into(), OFFSET_BOUND.into()),
            FakeOffsetBeginTooLargeSnafu
        );

        let units_sorted_by_offset = units.clone();
        units.sort_by_key(|unit| unit.rva_begin);
        Ok(Self {
            units_sorted_by_offset,
            units_sorted_by_rva: units,
            fake_offset_begin: offset_bound,
        })
    }

    /// Returns the (possibly dangling) RVA corresponding to `offset`, or
    /// [`INVALID_RVA`] if not found.
    #[must_use]
    pub fn offset_to_rva(&self, offset: Offset) -> Rva {
        if offset >= self.fake_offset_begin {
            // Fake offset: shift back into RVA space, then confirm it is
            // indeed a dangling RVA of some unit.
            let rva = offset - self.fake_offset_begin;
            return match self.rva_to_unit(rva) {
                Some(unit) if unit.has_dangling_rva() && unit.covers_dangling_rva(rva) => rva,
                _ => INVALID_RVA,
            };
        }
        match self.offset_to_unit(offset) {
            Some(unit) => unit.offset_to_rva_unchecked(offset),
            None => INVALID_RVA,
        }
    }

    /// Returns the (possibly fake) offset corresponding to `rva`, or
    /// [`INVALID_OFFSET`] if `rva` is non-existent.
    #[must_use]
    pub fn rva_to_offset(&self, rva: Rva) -> Offset {
        match self.rva_to_unit(rva) {
            Some(unit) => unit.rva_to_offset_unchecked(rva, self.fake_offset_begin),
            None => INVALID_OFFSET,
        }
    }

    #[inline]
    #[must_use]
    pub const fn fake_offset_begin(&self) -> Offset {
        self.fake_offset_begin
    }

    #[inline]
    #[must_use]
    pub fn units_sorted_by_offset(&self) -> &[Unit] {
        &self.units_sorted_by_offset
    }

    #[inline]
    #[must_use]
    pub fn units_sorted_by_rva(&self) -> &[Unit] {
        &self.units_sorted_by_rva
    }

    fn offset_to_unit(&self, offset: Offset) -> Option<&Unit> {
        // Last unit with |offset_begin <= offset|, if any.
        let pos =
            self.units_sorted_by_offset.partition_point(|unit| unit.offset_begin <= offset);
        let unit = self.units_sorted_by_offset[..pos].last()?;
        unit.covers_offset(offset).then_some(unit)
    }

    fn rva_to_unit(&self, rva: Rva) -> Option<&Unit> {
        let pos = self.units_sorted_by_rva.partition_point(|unit| unit.rva_begin <= rva);
        let unit = self.units_sorted_by_rva[..pos].last()?;
        unit.covers_rva(rva).then_some(unit)
    }
}

/// An adaptor for [`AddressTranslator::offset_to_rva`] that caches the last
/// hit unit, for clustered queries. Lifetime is tied to the translator.
pub struct OffsetToRvaCache<'a> {
    translator: &'a AddressTranslator,
    cached_unit: Cell<Option<&'a Unit>>,
}

impl<'a> OffsetToRvaCache<'a> {
    #[must_use]
    pub fn new(translator: &'a AddressTranslator) -> Self {
        Self { translator, cached_unit: Cell::new(None) }
    }

    #[must_use]
    pub fn convert(&self, offset: Offset) -> Rva {
        if offset >= self.translator.fake_offset_begin {
            // The translator handles the fake-offset special case.
            return self.translator.offset_to_rva(offset);
        }
        if let Some(unit) = self.cached_unit.get() {
            if unit.covers_offset(offset) {
                return unit.offset_to_rva_unchecked(offset);
            }
        }
        match self.translator.offset_to_unit(offset) {
            Some(unit) => {
                self.cached_unit.set(Some(unit));
                unit.offset_to_rva_unchecked(offset)
            }
            None => INVALID_RVA,
        }
    }
}

/// An adaptor for [`AddressTranslator::rva_to_offset`] that caches the last
/// hit unit, for clustered queries. Lifetime is tied to the translator.
pub struct RvaToOffsetCache<'a> {
    translator: &'a AddressTranslator,
    cached_unit: Cell<Option<&'a Unit>>,
}

impl<'a> RvaToOffsetCache<'a> {
    #[must_use]
    pub fn new(translator: &'a AddressTranslator) -> Self {
        Self { translator, cached_unit: Cell::new(None) }
    }

    fn lookup(&self, rva: Rva) -> Option<&'a Unit> {
        if let Some(unit) = self.cached_unit.get() {
            if unit.covers_rva(rva) {
                return Some(unit);
            }
        }
        let unit = self.translator.rva_to_unit(rva)?;
        self.cached_unit.set(Some(unit));
        Some(unit)
    }

    /// Returns whether `rva` exists in the image.
    #[must_use]
    pub fn is_valid(&self, rva: Rva) -> bool {
        rva != INVALID_RVA && self.lookup(rva).is_some()
    }

    #[must_use]
    pub fn convert(&self, rva: Rva) -> Offset {
        match self.lookup(rva) {
            Some(unit) => unit.rva_to_offset_unchecked(rva, self.translator.fake_offset_begin),
            None => INVALID_OFFSET,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(offset_begin: Offset, offset_size: Offset, rva_begin: Rva, rva_size: Rva) -> Unit {
        Unit { offset_begin, offset_size, rva_begin, rva_size }
    }

    #[test]
    fn simple_round_trip() {
        let translator =
            AddressTranslator::new(vec![unit(0x400, 0x100, 0x1000, 0x100)]).unwrap();
        assert_eq!(translator.offset_to_rva(0x400), 0x1000);
        assert_eq!(translator.offset_to_rva(0x4FF), 0x10FF);
        assert_eq!(translator.rva_to_offset(0x1000), 0x400);
        assert_eq!(translator.rva_to_offset(0x10FF), 0x4FF);
        assert_eq!(translator.offset_to_rva(0x3FF), INVALID_RVA);
        assert_eq!(translator.rva_to_offset(0x1100), INVALID_OFFSET);
        // Idempotence over every covered offset.
        for offset in 0x400..0x500 {
            let rva = translator.offset_to_rva(offset);
            assert_ne!(rva, INVALID_RVA);
            assert_eq!(translator.rva_to_offset(rva), offset);
        }
    }

    #[test]
    fn dangling_rva_uses_fake_offsets() {
        // 0x80 bytes of file data backing 0x100 bytes of RVA (.bss tail).
        let translator =
            AddressTranslator::new(vec![unit(0x200, 0x80, 0x1000, 0x100)]).unwrap();
        let fake_begin = translator.fake_offset_begin();
        assert_eq!(fake_begin, 0x280);

        // Dangling RVA maps to a fake offset, and back.
        let fake = translator.rva_to_offset(0x1080);
        assert_eq!(fake, fake_begin + 0x1080);
        assert_eq!(translator.offset_to_rva(fake), 0x1080);

        // Backed RVA still maps to a real offset.
        assert_eq!(translator.rva_to_offset(0x107F), 0x27F);
        // A fake offset pointing into the backed part is invalid.
        assert_eq!(translator.offset_to_rva(fake_begin + 0x1000), INVALID_RVA);
    }

    #[test]
    fn mismatched_delta_overlap_is_rejected() {
        // Units [offset 0..100, rva 0..100] and [offset 50..150, rva
        // 200..300] have deltas 0 and 150; RVA ranges are disjoint so the
        // RVA pass keeps both, but the offset ranges overlap.
        let result =
            AddressTranslator::new(vec![unit(0, 100, 0, 100), unit(50, 100, 200, 100)]);
        assert_eq!(result.unwrap_err(), Error::BadOverlap);
    }

    #[test]
    fn overlapping_rva_with_same_delta_merges() {
        let translator = AddressTranslator::new(vec![
            unit(0x100, 0x80, 0x1000, 0x80),
            unit(0x140, 0x80, 0x1040, 0x80),
        ])
        .unwrap();
        assert_eq!(translator.units_sorted_by_offset().len(), 1);
        assert_eq!(translator.units_sorted_by_offset()[0], unit(0x100, 0xC0, 0x1000, 0xC0));
    }

    #[test]
    fn overlapping_rva_with_different_delta_is_rejected() {
        let result = AddressTranslator::new(vec![
            unit(0x100, 0x80, 0x1000, 0x80),
            unit(0x200, 0x80, 0x1040, 0x80),
        ]);
        assert_eq!(result.unwrap_err(), Error::BadOverlap);
    }

    #[test]
    fn touching_rva_with_different_delta_is_kept_separate() {
        let translator = AddressTranslator::new(vec![
            unit(0x100, 0x80, 0x1000, 0x80),
            unit(0x400, 0x80, 0x1080, 0x80),
        ])
        .unwrap();
        assert_eq!(translator.units_sorted_by_offset().len(), 2);
        assert_eq!(translator.rva_to_offset(0x1080), 0x400);
        assert_eq!(translator.offset_to_rva(0x17F), 0x107F);
    }

    #[test]
    fn empty_units_are_dropped() {
        let translator = AddressTranslator::new(vec![
            unit(0x100, 0x80, 0x1000, 0x80),
            unit(0x300, 0x10, 0x2000, 0),
        ])
        .unwrap();
        assert_eq!(translator.units_sorted_by_offset().len(), 1);
    }

    #[test]
    fn overflowing_unit_is_rejected() {
        let result = AddressTranslator::new(vec![unit(OFFSET_BOUND - 1, 2, 0x1000, 2)]);
        assert_eq!(result.unwrap_err(), Error::Overflow);
    }

    #[test]
    fn caches_agree_with_translator() {
        let translator = AddressTranslator::new(vec![
            unit(0x100, 0x80, 0x1000, 0x100),
            unit(0x400, 0x80, 0x2000, 0x80),
        ])
        .unwrap();
        let to_rva = OffsetToRvaCache::new(&translator);
        let to_offset = RvaToOffsetCache::new(&translator);
        for offset in [0x100, 0x17F, 0x400, 0x47F, 0x99, 0x180] {
            assert_eq!(to_rva.convert(offset), translator.offset_to_rva(offset));
        }
        for rva in [0x1000, 0x10FF, 0x2000, 0x207F, 0x999, 0x2080] {
            assert_eq!(to_offset.convert(rva), translator.rva_to_offset(rva));
            assert_eq!(to_offset.is_valid(rva), translator.rva_to_offset(rva) != INVALID_OFFSET);
        }
    }
}
