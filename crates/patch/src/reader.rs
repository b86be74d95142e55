//! Read-side of the patch container.
//!
//! The source types are lightweight (copyable) visitors over the patch's
//! varint streams. Each shares three core functions by convention:
//! `read_from` (consume and validate framing), `next` (decode one item, or
//! `None` on exhaustion/corruption), and `done` (whether all items were
//! consumed). Callers must treat a `None` from `next` before `done` as a
//! malformed patch.

use std::collections::BTreeMap;

use marrow_core::buffer::BufferSource;
use marrow_core::crc32::crc32;
use marrow_core::util::range_is_bounded;
use marrow_core::varint::zigzag_decode;
use marrow_disasm::detect::disassembler_version_of;
use marrow_image::types::{
    Element, ElementMatch, Equivalence, ExecutableType, Offset, PoolTag,
};
use snafu::prelude::*;

use crate::format::{PatchElementHeader, PatchHeader, RawDeltaUnit, MAJOR_VERSION, PATCH_MAGIC};
use crate::{
    BadElementSnafu, BadEquivalencesSnafu, BadExeTypeSnafu, BadMagicSnafu, BadPoolTagSnafu,
    BadVersionSnafu, Result, TrailingDataSnafu,
};

// Reads a length-prefixed blob as a sub-source.
fn parse_buffer<'a>(source: &mut BufferSource<'a>) -> Result<BufferSource<'a>> {
    let size = source.get_u32_le()?;
    let region = source.get_region(size as usize)?;
    Ok(BufferSource::new(region))
}

// Checked accumulate helper: the running total must stay within u32.
fn checked_offset(value: i64) -> Option<Offset> {
    Offset::try_from(value).ok()
}

/// Source for equivalences.
#[derive(Clone, Copy, Debug, Default)]
pub struct EquivalenceSource<'a> {
    src_skip: BufferSource<'a>,
    dst_skip: BufferSource<'a>,
    copy_count: BufferSource<'a>,

    previous_src_offset: i64,
    previous_dst_offset: i64,
}

impl<'a> EquivalenceSource<'a> {
    pub(crate) fn read_from(source: &mut BufferSource<'a>) -> Result<Self> {
        Ok(Self {
            src_skip: parse_buffer(source)?,
            dst_skip: parse_buffer(source)?,
            copy_count: parse_buffer(source)?,
            previous_src_offset: 0,
            previous_dst_offset: 0,
        })
    }

    pub fn next(&mut self) -> Option<Equivalence> {
        if self.src_skip.is_empty() || self.dst_skip.is_empty() || self.copy_count.is_empty() {
            return None;
        }
        let length = self.copy_count.get_uleb128().ok()?;
        let src_offset_diff = zigzag_decode(self.src_skip.get_uleb128().ok()?);
        let src_offset = checked_offset(self.previous_src_offset + i64::from(src_offset_diff))?;
        self.previous_src_offset = i64::from(src_offset) + i64::from(length);
        checked_offset(self.previous_src_offset)?;

        let dst_offset_diff = self.dst_skip.get_uleb128().ok()?;
        let dst_offset = checked_offset(self.previous_dst_offset + i64::from(dst_offset_diff))?;
        self.previous_dst_offset = i64::from(dst_offset) + i64::from(length);
        checked_offset(self.previous_dst_offset)?;

        // The result is unsafe until the element-level validation pass has
        // succeeded.
        Some(Equivalence { src_offset, dst_offset, length })
    }

    #[must_use]
    pub fn done(&self) -> bool {
        self.src_skip.is_empty() && self.dst_skip.is_empty() && self.copy_count.is_empty()
    }
}

/// Source for extra data.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExtraDataSource<'a> {
    extra_data: BufferSource<'a>,
}

impl<'a> ExtraDataSource<'a> {
    pub(crate) fn read_from(source: &mut BufferSource<'a>) -> Result<Self> {
        Ok(Self { extra_data: parse_buffer(source)? })
    }

    /// Returns the next `size` bytes of extra data.
    pub fn next(&mut self, size: usize) -> Option<&'a [u8]> {
        self.extra_data.get_region(size).ok()
    }

    #[must_use]
    pub fn done(&self) -> bool {
        self.extra_data.is_empty()
    }

    #[must_use]
    pub(crate) fn size(&self) -> usize {
        self.extra_data.remaining()
    }
}

/// Source for raw deltas.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawDeltaSource<'a> {
    raw_delta_skip: BufferSource<'a>,
    raw_delta_diff: BufferSource<'a>,

    copy_offset_compensation: i64,
}

impl<'a> RawDeltaSource<'a> {
    pub(crate) fn read_from(source: &mut BufferSource<'a>) -> Result<Self> {
        Ok(Self {
            raw_delta_skip: parse_buffer(source)?,
            raw_delta_diff: parse_buffer(source)?,
            copy_offset_compensation: 0,
        })
    }

    pub fn next(&mut self) -> Option<RawDeltaUnit> {
        if self.raw_delta_skip.is_empty() || self.raw_delta_diff.is_empty() {
            return None;
        }
        let copy_offset_diff = self.raw_delta_skip.get_uleb128().ok()?;
        let copy_offset =
            checked_offset(self.copy_offset_compensation + i64::from(copy_offset_diff))?;
        let diff = self.raw_delta_diff.get_u8().ok()? as i8;
        // A zero diff would be meaningless; reject it.
        if diff == 0 {
            return None;
        }
        // Compensation for the next offset accounts for delta encoding and
        // the -1 bias.
        self.copy_offset_compensation = i64::from(copy_offset) + 1;
        Some(RawDeltaUnit { copy_offset, diff })
    }

    #[must_use]
    pub fn done(&self) -> bool {
        self.raw_delta_skip.is_empty() && self.raw_delta_diff.is_empty()
    }
}

/// Source for reference target key deltas.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReferenceDeltaSource<'a> {
    source: BufferSource<'a>,
}

impl<'a> ReferenceDeltaSource<'a> {
    pub(crate) fn read_from(source: &mut BufferSource<'a>) -> Result<Self> {
        Ok(Self { source: parse_buffer(source)? })
    }

    pub fn next(&mut self) -> Option<i32> {
        if self.source.is_empty() {
            return None;
        }
        self.source.get_uleb128().ok().map(zigzag_decode)
    }

    #[must_use]
    pub fn done(&self) -> bool {
        self.source.is_empty()
    }
}

/// Source for one pool's extra targets.
#[derive(Clone, Copy, Debug, Default)]
pub struct TargetSource<'a> {
    extra_targets: BufferSource<'a>,

    target_compensation: i64,
}

impl<'a> TargetSource<'a> {
    pub(crate) fn read_from(source: &mut BufferSource<'a>) -> Result<Self> {
        Ok(Self { extra_targets: parse_buffer(source)?, target_compensation: 0 })
    }

    pub fn next(&mut self) -> Option<Offset> {
        if self.extra_targets.is_empty() {
            return None;
        }
        let target_diff = self.extra_targets.get_uleb128().ok()?;
        let target = checked_offset(self.target_compensation + i64::from(target_diff))?;
        self.target_compensation = i64::from(target) + 1;
        // The caller must still check that this is a valid offset for its
        // image.
        Some(target)
    }

    #[must_use]
    pub fn done(&self) -> bool {
        self.extra_targets.is_empty()
    }
}

/// Structured view over one patch element's streams.
#[derive(Debug)]
pub struct PatchElementReader<'a> {
    element_match: ElementMatch,
    equivalences: EquivalenceSource<'a>,
    extra_data: ExtraDataSource<'a>,
    raw_delta: RawDeltaSource<'a>,
    reference_delta: ReferenceDeltaSource<'a>,
    extra_targets: BTreeMap<u8, TargetSource<'a>>,
}

impl<'a> PatchElementReader<'a> {
    fn read_from(source: &mut BufferSource<'a>) -> Result<Self> {
        let element_match = parse_element_match(source)?;
        let equivalences = EquivalenceSource::read_from(source)?;
        let extra_data = ExtraDataSource::read_from(source)?;

        let mut reader = Self {
            element_match,
            equivalences,
            extra_data,
            raw_delta: RawDeltaSource::default(),
            reference_delta: ReferenceDeltaSource::default(),
            extra_targets: BTreeMap::new(),
        };
        reader.validate_equivalences_and_extra_data()?;
        reader.raw_delta = RawDeltaSource::read_from(source)?;
        reader.reference_delta = ReferenceDeltaSource::read_from(source)?;

        let pool_count = source.get_u32_le()?;
        for _ in 0..pool_count {
            let pool_tag = source.get_u8()?;
            ensure!(PoolTag(pool_tag) != marrow_image::types::NO_POOL_TAG, BadPoolTagSnafu);
            let target_source = TargetSource::read_from(source)?;
            // One extra-target list per pool.
            ensure!(
                reader.extra_targets.insert(pool_tag, target_source).is_none(),
                BadPoolTagSnafu
            );
        }
        Ok(reader)
    }

    // Checks that every equivalence lies in bounds, in ascending dst order
    // with no dst overlap, and that the gaps left over in the new element
    // account for exactly the extra data present.
    fn validate_equivalences_and_extra_data(&self) -> Result<()> {
        let mut equivalences = self.equivalences;
        let old_region_size = self.element_match.old_element.region.size;
        let new_region_size = self.element_match.new_element.region.size;

        let mut total_length: u64 = 0;
        let mut prev_dst_end: Offset = 0;
        while !equivalences.done() {
            let equivalence = equivalences.next().context(BadEquivalencesSnafu)?;
            ensure!(
                range_is_bounded(
                    equivalence.src_offset.into(),
                    equivalence.length.into(),
                    old_region_size as u64
                ) && range_is_bounded(
                    equivalence.dst_offset.into(),
                    equivalence.length.into(),
                    new_region_size as u64
                ),
                BadEquivalencesSnafu
            );
            ensure!(prev_dst_end <= equivalence.dst_offset, BadEquivalencesSnafu);
            prev_dst_end = equivalence.dst_end();
            total_length += u64::from(equivalence.length);
        }
        ensure!(
            total_length <= new_region_size as u64
                && self.extra_data.size() as u64 == new_region_size as u64 - total_length,
            BadEquivalencesSnafu
        );
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn element_match(&self) -> &ElementMatch {
        &self.element_match
    }

    #[inline]
    #[must_use]
    pub fn old_element(&self) -> Element {
        self.element_match.old_element
    }

    #[inline]
    #[must_use]
    pub fn new_element(&self) -> Element {
        self.element_match.new_element
    }

    // The accessors below return fresh copies of the cached sources, so
    // each caller iterates from the start.

    #[must_use]
    pub fn equivalence_source(&self) -> EquivalenceSource<'a> {
        self.equivalences
    }

    #[must_use]
    pub fn extra_data_source(&self) -> ExtraDataSource<'a> {
        self.extra_data
    }

    #[must_use]
    pub fn raw_delta_source(&self) -> RawDeltaSource<'a> {
        self.raw_delta
    }

    #[must_use]
    pub fn reference_delta_source(&self) -> ReferenceDeltaSource<'a> {
        self.reference_delta
    }

    /// Returns the extra-target source for `pool_tag`, or an empty source
    /// if the patch carries none for that pool.
    #[must_use]
    pub fn extra_target_source(&self, pool_tag: PoolTag) -> TargetSource<'a> {
        self.extra_targets.get(&pool_tag.value()).copied().unwrap_or_default()
    }
}

fn parse_element_match(source: &mut BufferSource<'_>) -> Result<ElementMatch> {
    let header = source.get_value::<PatchElementHeader>()?;
    let exe_type =
        ExecutableType::from_code(header.exe_type.get()).context(BadExeTypeSnafu)?;
    let expected_version = disassembler_version_of(exe_type);
    ensure!(expected_version == Some(header.version.get()), BadVersionSnafu);
    ensure!(header.old_length.get() != 0 && header.new_length.get() != 0, BadElementSnafu);

    // Offsets and lengths may still exceed the archive bounds; that is
    // checked at the ensemble level.
    use marrow_core::buffer::BufferRegion;
    Ok(ElementMatch {
        old_element: Element::new(
            BufferRegion::new(header.old_offset.get() as usize, header.old_length.get() as usize),
            exe_type,
        ),
        new_element: Element::new(
            BufferRegion::new(header.new_offset.get() as usize, header.new_length.get() as usize),
            exe_type,
        ),
    })
}

/// Structured view over a whole ensemble patch.
#[derive(Debug)]
pub struct EnsemblePatchReader<'a> {
    header: PatchHeader,
    elements: Vec<PatchElementReader<'a>>,
}

impl<'a> EnsemblePatchReader<'a> {
    /// Parses and validates `data` as an ensemble patch.
    pub fn from_bytes(data: &'a [u8]) -> Result<Self> {
        let mut source = BufferSource::new(data);
        let header = source.get_value::<PatchHeader>()?;
        ensure!(header.magic.get() == PATCH_MAGIC, BadMagicSnafu);
        ensure!(header.major_version.get() == MAJOR_VERSION, BadVersionSnafu);

        let element_count = source.get_u32_le()?;
        let mut elements = Vec::new();
        let mut current_dst_offset: usize = 0;
        for _ in 0..element_count {
            let element = PatchElementReader::read_from(&mut source)?;
            ensure!(
                element.old_element().region.fits_in(header.old_size.get() as usize)
                    && element.new_element().region.fits_in(header.new_size.get() as usize),
                BadElementSnafu
            );
            // Elements must tile the new image: adjacent, no gaps.
            ensure!(element.new_element().region.offset == current_dst_offset, BadElementSnafu);
            current_dst_offset = element.new_element().region.hi();
            elements.push(element);
        }
        ensure!(current_dst_offset == header.new_size.get() as usize, BadElementSnafu);
        ensure!(source.is_empty(), TrailingDataSnafu);

        Ok(Self { header, elements })
    }

    #[inline]
    #[must_use]
    pub fn header(&self) -> &PatchHeader {
        &self.header
    }

    #[inline]
    #[must_use]
    pub fn elements(&self) -> &[PatchElementReader<'a>] {
        &self.elements
    }

    /// Checks the old image against the expected size and CRC-32.
    #[must_use]
    pub fn check_old_file(&self, old_image: &[u8]) -> bool {
        old_image.len() == self.header.old_size.get() as usize
            && crc32(old_image) == self.header.old_crc.get()
    }

    /// Checks the new image against the expected size and CRC-32.
    #[must_use]
    pub fn check_new_file(&self, new_image: &[u8]) -> bool {
        new_image.len() == self.header.new_size.get() as usize
            && crc32(new_image) == self.header.new_crc.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{
        EnsemblePatchWriter, EquivalenceSink, ExtraDataSink, PatchElementWriter, RawDeltaSink,
        ReferenceDeltaSink, TargetSink,
    };
    use crate::Error;
    use marrow_core::buffer::BufferRegion;

    // Builds a valid raw-mode patch: old = 4 bytes, new = 6 bytes, one
    // equivalence [0,4) -> [1,4), extra data for the gaps, one raw delta,
    // and one pool of extra targets.
    fn build_test_patch() -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let old_image = vec![0x10u8, 0x20, 0x30, 0x40];
        let new_image = vec![0xAAu8, 0x10, 0x21, 0x30, 0x40, 0xBB];

        let element_match = ElementMatch {
            old_element: Element::raw(BufferRegion::new(0, old_image.len())),
            new_element: Element::raw(BufferRegion::new(0, new_image.len())),
        };
        let mut element = PatchElementWriter::new(element_match);

        let mut equivalences = EquivalenceSink::new();
        equivalences.put_next(&Equivalence { src_offset: 0, dst_offset: 1, length: 4 });
        element.set_equivalence_sink(equivalences);

        let mut extra_data = ExtraDataSink::new();
        extra_data.put_next(&[0xAA]);
        extra_data.put_next(&[0xBB]);
        element.set_extra_data_sink(extra_data);

        let mut raw_delta = RawDeltaSink::new();
        raw_delta.put_next(RawDeltaUnit { copy_offset: 1, diff: 1 });
        element.set_raw_delta_sink(raw_delta);

        element.set_reference_delta_sink(ReferenceDeltaSink::new());

        let mut targets = TargetSink::new();
        targets.put_next(2);
        targets.put_next(5);
        element.set_target_sink(PoolTag(0), targets);

        let mut writer = EnsemblePatchWriter::new(&old_image, &new_image);
        writer.add_element(element);
        (old_image, new_image, writer.to_bytes().unwrap())
    }

    #[test]
    fn round_trip_through_reader() {
        let (old_image, new_image, patch) = build_test_patch();
        let reader = EnsemblePatchReader::from_bytes(&patch).unwrap();
        assert!(reader.check_old_file(&old_image));
        assert!(reader.check_new_file(&new_image));
        assert_eq!(reader.elements().len(), 1);

        let element = &reader.elements()[0];
        let mut equivalences = element.equivalence_source();
        assert_eq!(
            equivalences.next(),
            Some(Equivalence { src_offset: 0, dst_offset: 1, length: 4 })
        );
        assert_eq!(equivalences.next(), None);
        assert!(equivalences.done());

        let mut extra_data = element.extra_data_source();
        assert_eq!(extra_data.next(1), Some(&[0xAA][..]));
        assert_eq!(extra_data.next(1), Some(&[0xBB][..]));
        assert!(extra_data.done());

        let mut raw_delta = element.raw_delta_source();
        assert_eq!(raw_delta.next(), Some(RawDeltaUnit { copy_offset: 1, diff: 1 }));
        assert_eq!(raw_delta.next(), None);
        assert!(raw_delta.done());

        let mut targets = element.extra_target_source(PoolTag(0));
        assert_eq!(targets.next(), Some(2));
        assert_eq!(targets.next(), Some(5));
        assert!(targets.done());
        // A pool without extra targets yields an empty source.
        assert!(element.extra_target_source(PoolTag(1)).done());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let (_, _, mut patch) = build_test_patch();
        patch[0] = b'X';
        assert_eq!(EnsemblePatchReader::from_bytes(&patch).unwrap_err(), Error::BadMagic);
    }

    #[test]
    fn wrong_major_version_is_rejected() {
        let (_, _, mut patch) = build_test_patch();
        patch[4] = MAJOR_VERSION as u8 + 1;
        assert_eq!(EnsemblePatchReader::from_bytes(&patch).unwrap_err(), Error::BadVersion);
    }

    #[test]
    fn trailing_data_is_rejected() {
        let (_, _, mut patch) = build_test_patch();
        patch.push(0);
        assert_eq!(EnsemblePatchReader::from_bytes(&patch).unwrap_err(), Error::TrailingData);
    }

    #[test]
    fn truncated_patch_is_rejected() {
        let (_, _, patch) = build_test_patch();
        for len in [0, 10, 24, 30, patch.len() - 1] {
            assert!(EnsemblePatchReader::from_bytes(&patch[..len]).is_err(), "len = {len}");
        }
    }

    #[test]
    fn crc_gate_detects_corruption() {
        let (mut old_image, _, patch) = build_test_patch();
        let reader = EnsemblePatchReader::from_bytes(&patch).unwrap();
        old_image[0] ^= 1;
        assert!(!reader.check_old_file(&old_image));
    }

    #[test]
    fn zero_raw_delta_diff_is_rejected() {
        // Hand-build a raw delta stream holding a zero diff.
        let mut source_bytes = Vec::new();
        source_bytes.extend_from_slice(&1u32.to_le_bytes());
        source_bytes.push(0); // skip varint.
        source_bytes.extend_from_slice(&1u32.to_le_bytes());
        source_bytes.push(0); // diff == 0: invalid.
        let mut source = BufferSource::new(&source_bytes);
        let mut raw_delta = RawDeltaSource::read_from(&mut source).unwrap();
        assert_eq!(raw_delta.next(), None);
        assert!(!raw_delta.done());
    }

    #[test]
    fn equivalence_bounds_are_validated() {
        let old_image = vec![0u8; 4];
        let new_image = vec![0u8; 4];
        let element_match = ElementMatch {
            old_element: Element::raw(BufferRegion::new(0, 4)),
            new_element: Element::raw(BufferRegion::new(0, 4)),
        };
        let mut element = PatchElementWriter::new(element_match);
        let mut equivalences = EquivalenceSink::new();
        // Out of bounds in old image.
        equivalences.put_next(&Equivalence { src_offset: 2, dst_offset: 0, length: 4 });
        element.set_equivalence_sink(equivalences);
        element.set_extra_data_sink(ExtraDataSink::new());
        element.set_raw_delta_sink(RawDeltaSink::new());
        element.set_reference_delta_sink(ReferenceDeltaSink::new());
        let mut writer = EnsemblePatchWriter::new(&old_image, &new_image);
        writer.add_element(element);
        let patch = writer.to_bytes().unwrap();
        assert_eq!(
            EnsemblePatchReader::from_bytes(&patch).unwrap_err(),
            Error::BadEquivalences
        );
    }
}
