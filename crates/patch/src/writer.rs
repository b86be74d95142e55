//! Write-side of the patch container.
//!
//! Each sink receives elements of one "main type", delta-encodes them into
//! internal byte storage, and serializes that storage as a length-prefixed
//! blob. The sinks share three core functions by convention rather than by
//! trait, since their `put_next` signatures differ: `put_next`,
//! `serialized_size`, and `write_to`.

use std::collections::BTreeMap;

use marrow_core::buffer::BufferSink;
use marrow_core::crc32::crc32;
use marrow_core::varint::{encode_i32, encode_u32};
use marrow_disasm::detect::disassembler_version_of;
use marrow_image::types::{ElementMatch, Equivalence, Offset, PoolTag, NO_POOL_TAG};

use crate::format::{PatchElementHeader, PatchHeader, RawDeltaUnit, MAJOR_VERSION, MINOR_VERSION, PATCH_MAGIC};
use crate::{BadElementSnafu, Error, Result};
use snafu::prelude::*;
use zerocopy::{U16, U32};

fn serialize_buffer(buffer: &[u8], sink: &mut BufferSink) -> Result<()> {
    // The blob length is a plain u32 (not a varint) so sizes can be
    // precomputed cheaply.
    sink.put_u32_le(u32::try_from(buffer.len()).map_err(|_| Error::Truncated)?)?;
    sink.put_range(buffer)?;
    Ok(())
}

const fn serialized_buffer_size(buffer: &[u8]) -> usize {
    core::mem::size_of::<u32>() + buffer.len()
}

/// Sink for equivalences, given in increasing `dst_offset` order.
#[derive(Default)]
pub struct EquivalenceSink {
    // Offset in source, delta-encoded from the end of the last equivalence,
    // stored as signed varint.
    src_skip: Vec<u8>,
    // Offset in destination, delta-encoded from the end of the last
    // equivalence, stored as unsigned varint.
    dst_skip: Vec<u8>,
    // Length, stored as unsigned varint.
    copy_count: Vec<u8>,

    src_offset: Offset, // Last offset in source.
    dst_offset: Offset, // Last offset in destination.
}

impl EquivalenceSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_next(&mut self, equivalence: &Equivalence) {
        debug_assert!(equivalence.dst_offset >= self.dst_offset);
        // The unsigned subtraction may wrap; the wrapped value is exactly
        // what the signed varint must carry.
        encode_i32(
            equivalence.src_offset.wrapping_sub(self.src_offset) as i32,
            &mut self.src_skip,
        );
        encode_u32(equivalence.dst_offset - self.dst_offset, &mut self.dst_skip);
        encode_u32(equivalence.length, &mut self.copy_count);
        self.src_offset = equivalence.src_end();
        self.dst_offset = equivalence.dst_end();
    }

    #[must_use]
    pub fn serialized_size(&self) -> usize {
        serialized_buffer_size(&self.src_skip)
            + serialized_buffer_size(&self.dst_skip)
            + serialized_buffer_size(&self.copy_count)
    }

    pub fn write_to(&self, sink: &mut BufferSink) -> Result<()> {
        serialize_buffer(&self.src_skip, sink)?;
        serialize_buffer(&self.dst_skip, sink)?;
        serialize_buffer(&self.copy_count, sink)
    }
}

/// Sink for the bytes in new-image gaps between equivalences.
#[derive(Default)]
pub struct ExtraDataSink {
    extra_data: Vec<u8>,
}

impl ExtraDataSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_next(&mut self, region: &[u8]) {
        self.extra_data.extend_from_slice(region);
    }

    #[must_use]
    pub fn serialized_size(&self) -> usize {
        serialized_buffer_size(&self.extra_data)
    }

    pub fn write_to(&self, sink: &mut BufferSink) -> Result<()> {
        serialize_buffer(&self.extra_data, sink)
    }
}

/// Sink for raw deltas, given in increasing `copy_offset` order.
#[derive(Default)]
pub struct RawDeltaSink {
    raw_delta_skip: Vec<u8>, // Copy offset, delta-encoded with bias -1.
    raw_delta_diff: Vec<u8>, // Bytewise difference.

    // Compensation for the next copy offset, accounting for delta encoding
    // and the -1 bias: a run of single-byte deltas encodes as zeros.
    copy_offset_compensation: Offset,
}

impl RawDeltaSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_next(&mut self, delta: RawDeltaUnit) {
        debug_assert!(delta.copy_offset >= self.copy_offset_compensation);
        encode_u32(delta.copy_offset - self.copy_offset_compensation, &mut self.raw_delta_skip);
        self.copy_offset_compensation = delta.copy_offset + 1;
        self.raw_delta_diff.push(delta.diff as u8);
    }

    #[must_use]
    pub fn serialized_size(&self) -> usize {
        serialized_buffer_size(&self.raw_delta_skip) + serialized_buffer_size(&self.raw_delta_diff)
    }

    pub fn write_to(&self, sink: &mut BufferSink) -> Result<()> {
        serialize_buffer(&self.raw_delta_skip, sink)?;
        serialize_buffer(&self.raw_delta_diff, sink)
    }
}

/// Sink for reference target key deltas.
#[derive(Default)]
pub struct ReferenceDeltaSink {
    reference_delta: Vec<u8>,
}

impl ReferenceDeltaSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_next(&mut self, diff: i32) {
        encode_i32(diff, &mut self.reference_delta);
    }

    #[must_use]
    pub fn serialized_size(&self) -> usize {
        serialized_buffer_size(&self.reference_delta)
    }

    pub fn write_to(&self, sink: &mut BufferSink) -> Result<()> {
        serialize_buffer(&self.reference_delta, sink)
    }
}

/// Sink for one pool's extra targets, given in increasing order.
#[derive(Default)]
pub struct TargetSink {
    // Targets, delta-encoded with bias -1, stored as unsigned varints.
    extra_targets: Vec<u8>,

    target_compensation: Offset,
}

impl TargetSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_next(&mut self, target: Offset) {
        debug_assert!(target >= self.target_compensation);
        encode_u32(target - self.target_compensation, &mut self.extra_targets);
        self.target_compensation = target + 1;
    }

    #[must_use]
    pub fn serialized_size(&self) -> usize {
        serialized_buffer_size(&self.extra_targets)
    }

    pub fn write_to(&self, sink: &mut BufferSink) -> Result<()> {
        serialize_buffer(&self.extra_targets, sink)
    }
}

/// Accumulates the streams for one patch element. All streams must be set
/// before `serialized_size` or `write_to` are called.
pub struct PatchElementWriter {
    element_match: ElementMatch,
    equivalences: Option<EquivalenceSink>,
    extra_data: Option<ExtraDataSink>,
    raw_delta: Option<RawDeltaSink>,
    reference_delta: Option<ReferenceDeltaSink>,
    extra_targets: BTreeMap<u8, TargetSink>,
}

impl PatchElementWriter {
    #[must_use]
    pub fn new(element_match: ElementMatch) -> Self {
        Self {
            element_match,
            equivalences: None,
            extra_data: None,
            raw_delta: None,
            reference_delta: None,
            extra_targets: BTreeMap::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn element_match(&self) -> &ElementMatch {
        &self.element_match
    }

    pub fn set_equivalence_sink(&mut self, equivalences: EquivalenceSink) {
        self.equivalences = Some(equivalences);
    }

    pub fn set_extra_data_sink(&mut self, extra_data: ExtraDataSink) {
        self.extra_data = Some(extra_data);
    }

    pub fn set_raw_delta_sink(&mut self, raw_delta: RawDeltaSink) {
        self.raw_delta = Some(raw_delta);
    }

    pub fn set_reference_delta_sink(&mut self, reference_delta: ReferenceDeltaSink) {
        self.reference_delta = Some(reference_delta);
    }

    /// Sets the extra-target sink for the pool identified by `pool_tag`.
    pub fn set_target_sink(&mut self, pool_tag: PoolTag, extra_targets: TargetSink) {
        debug_assert!(pool_tag != NO_POOL_TAG);
        self.extra_targets.insert(pool_tag.value(), extra_targets);
    }

    #[must_use]
    pub fn serialized_size(&self) -> usize {
        let sink_sizes = [
            self.equivalences.as_ref().map_or(0, EquivalenceSink::serialized_size),
            self.extra_data.as_ref().map_or(0, ExtraDataSink::serialized_size),
            self.raw_delta.as_ref().map_or(0, RawDeltaSink::serialized_size),
            self.reference_delta.as_ref().map_or(0, ReferenceDeltaSink::serialized_size),
        ];
        let mut size = core::mem::size_of::<PatchElementHeader>()
            + sink_sizes.iter().sum::<usize>()
            + core::mem::size_of::<u32>();
        for target_sink in self.extra_targets.values() {
            size += target_sink.serialized_size() + 1;
        }
        size
    }

    pub fn write_to(&self, sink: &mut BufferSink) -> Result<()> {
        ensure!(self.element_match.is_valid(), BadElementSnafu);
        let exe_type = self.element_match.exe_type();
        let version = disassembler_version_of(exe_type).context(BadElementSnafu)?;
        let element_header = PatchElementHeader {
            old_offset: U32::new(
                u32::try_from(self.element_match.old_element.region.offset)
                    .map_err(|_| Error::BadElement)?,
            ),
            old_length: U32::new(
                u32::try_from(self.element_match.old_element.region.size)
                    .map_err(|_| Error::BadElement)?,
            ),
            new_offset: U32::new(
                u32::try_from(self.element_match.new_element.region.offset)
                    .map_err(|_| Error::BadElement)?,
            ),
            new_length: U32::new(
                u32::try_from(self.element_match.new_element.region.size)
                    .map_err(|_| Error::BadElement)?,
            ),
            exe_type: U32::new(exe_type.code()),
            version: U16::new(version),
        };
        sink.put_value(&element_header)?;

        let equivalences = self.equivalences.as_ref().context(BadElementSnafu)?;
        let extra_data = self.extra_data.as_ref().context(BadElementSnafu)?;
        let raw_delta = self.raw_delta.as_ref().context(BadElementSnafu)?;
        let reference_delta = self.reference_delta.as_ref().context(BadElementSnafu)?;
        equivalences.write_to(sink)?;
        extra_data.write_to(sink)?;
        raw_delta.write_to(sink)?;
        reference_delta.write_to(sink)?;

        sink.put_u32_le(u32::try_from(self.extra_targets.len()).map_err(|_| Error::Truncated)?)?;
        for (&pool_tag, target_sink) in &self.extra_targets {
            sink.put_u8(pool_tag)?;
            target_sink.write_to(sink)?;
        }
        Ok(())
    }
}

/// Writes an ensemble patch: the header, the element count, then the
/// elements, which must be added ordered by their new-image offset and
/// exactly tile the new image.
pub struct EnsemblePatchWriter {
    header: PatchHeader,
    elements: Vec<PatchElementWriter>,
    current_dst_offset: Offset,
}

impl EnsemblePatchWriter {
    #[must_use]
    pub fn new(old_image: &[u8], new_image: &[u8]) -> Self {
        Self {
            header: PatchHeader {
                magic: U32::new(PATCH_MAGIC),
                major_version: U16::new(MAJOR_VERSION),
                minor_version: U16::new(MINOR_VERSION),
                old_size: U32::new(old_image.len() as u32),
                old_crc: U32::new(crc32(old_image)),
                new_size: U32::new(new_image.len() as u32),
                new_crc: U32::new(crc32(new_image)),
            },
            elements: Vec::new(),
            current_dst_offset: 0,
        }
    }

    pub fn reserve_elements(&mut self, count: usize) {
        self.elements.reserve(count);
    }

    pub fn add_element(&mut self, patch_element: PatchElementWriter) {
        debug_assert_eq!(
            patch_element.element_match().new_element.begin_offset(),
            self.current_dst_offset
        );
        self.current_dst_offset = patch_element.element_match().new_element.end_offset();
        self.elements.push(patch_element);
    }

    #[must_use]
    pub fn serialized_size(&self) -> usize {
        core::mem::size_of::<PatchHeader>()
            + core::mem::size_of::<u32>()
            + self.elements.iter().map(PatchElementWriter::serialized_size).sum::<usize>()
    }

    pub fn write_to(&self, sink: &mut BufferSink) -> Result<()> {
        debug_assert_eq!(self.current_dst_offset, self.header.new_size.get());
        sink.put_value(&self.header)?;
        sink.put_u32_le(u32::try_from(self.elements.len()).map_err(|_| Error::Truncated)?)?;
        for element in &self.elements {
            element.write_to(sink)?;
        }
        Ok(())
    }

    /// Serializes the whole patch into a freshly allocated buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; self.serialized_size()];
        let mut sink = BufferSink::new(&mut buffer);
        self.write_to(&mut sink)?;
        debug_assert_eq!(sink.remaining(), 0);
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equivalence_sink_delta_encodes() {
        let mut sink = EquivalenceSink::new();
        sink.put_next(&Equivalence { src_offset: 3, dst_offset: 1, length: 2 });
        sink.put_next(&Equivalence { src_offset: 1, dst_offset: 5, length: 4 });
        // src skips: +3 (zigzag 6), then 1 - 5 = -4 (zigzag 7).
        assert_eq!(sink.src_skip, vec![6, 7]);
        // dst skips: 1, then 5 - 3 = 2.
        assert_eq!(sink.dst_skip, vec![1, 2]);
        assert_eq!(sink.copy_count, vec![2, 4]);
    }

    #[test]
    fn raw_delta_sink_biases_skips() {
        let mut sink = RawDeltaSink::new();
        sink.put_next(RawDeltaUnit { copy_offset: 0, diff: 1 });
        sink.put_next(RawDeltaUnit { copy_offset: 1, diff: -1 });
        sink.put_next(RawDeltaUnit { copy_offset: 5, diff: 3 });
        // Consecutive single-byte deltas encode as zeros.
        assert_eq!(sink.raw_delta_skip, vec![0, 0, 3]);
        assert_eq!(sink.raw_delta_diff, vec![1, 0xFF, 3]);
    }

    #[test]
    fn target_sink_biases_deltas() {
        let mut sink = TargetSink::new();
        sink.put_next(2);
        sink.put_next(3);
        sink.put_next(7);
        assert_eq!(sink.extra_targets, vec![2, 0, 3]);
    }

    #[test]
    fn serialized_sizes_match_output() {
        let mut equivalences = EquivalenceSink::new();
        equivalences.put_next(&Equivalence { src_offset: 0, dst_offset: 0, length: 8 });
        let mut buffer = vec![0u8; equivalences.serialized_size()];
        let mut sink = BufferSink::new(&mut buffer);
        equivalences.write_to(&mut sink).unwrap();
        assert_eq!(sink.remaining(), 0);
    }
}
