//! Patch generation: element matching, per-element equivalence search, and
//! stream emission.

use std::collections::BTreeMap;

use log::{error, info};
use marrow_core::buffer::BufferRegion;
use marrow_core::suffix_array::induced_suffix_sort;
use marrow_disasm::detect::make_disassembler_of_type;
use marrow_image::types::{
    Element, ElementMatch, ExecutableType, Offset, PoolTag, ReferenceMixer, TypeTag,
};
use marrow_patch::writer::{
    EnsemblePatchWriter, EquivalenceSink, ExtraDataSink, PatchElementWriter, RawDeltaSink,
    ReferenceDeltaSink, TargetSink,
};
use marrow_patch::format::RawDeltaUnit;

use crate::affinity::TargetsAffinity;
use crate::encoded_view::EncodedView;
use crate::equivalence::{
    EquivalenceMap, OffsetMapper, MIN_EQUIVALENCE_SIMILARITY, MIN_LABEL_AFFINITY,
};
use crate::index::{ImageIndex, ReferenceSet, TargetPool};
use crate::matcher::{EnsembleMatcher, HeuristicEnsembleMatcher, ImposedEnsembleMatcher};
use crate::Status;

/// Returns the targets of `new_targets` absent from `projected_old_targets`
/// (both sorted and unique), in sorted order.
#[must_use]
pub fn find_extra_targets(
    projected_old_targets: &TargetPool,
    new_targets: &TargetPool,
) -> Vec<Offset> {
    let old = projected_old_targets.targets();
    let mut extra_targets = Vec::new();
    let mut old_pos = 0usize;
    for &target in new_targets.targets() {
        while old_pos < old.len() && old[old_pos] < target {
            old_pos += 1;
        }
        if old_pos == old.len() || old[old_pos] != target {
            extra_targets.push(target);
        }
    }
    extra_targets
}

/// Builds the equivalence map between two annotated images.
///
/// Label matching between "old" and "new" guides equivalence construction,
/// but the equivalence map is what induces label matching. The circularity
/// is resolved by alternating, `num_iterations` times:
/// * associate targets based on the previous map (a no-op on the first
///   iteration, where the map is empty);
/// * construct a refined map from the new associations.
#[must_use]
pub fn create_equivalence_map(
    old_image_index: &ImageIndex,
    new_image_index: &ImageIndex,
    num_iterations: u8,
) -> EquivalenceMap {
    let pool_count = old_image_index.pool_count();
    let mut targets_affinities: Vec<TargetsAffinity> = Vec::new();
    targets_affinities.resize_with(pool_count, TargetsAffinity::new);

    let mut equivalence_map = EquivalenceMap::new();
    for _ in 0..num_iterations {
        let mut old_view = EncodedView::new(old_image_index);
        let mut new_view = EncodedView::new(new_image_index);

        // Associate targets from "old" to "new" per pool, then label
        // strongly associated pairs in both views.
        for (&pool_tag, old_targets) in old_image_index.target_pools() {
            let affinity = &mut targets_affinities[pool_tag.value() as usize];
            affinity.infer_from_similarities(
                &equivalence_map,
                old_targets.targets(),
                new_image_index.pool(pool_tag).targets(),
            );
            let (label_bound, old_labels, new_labels) =
                affinity.assign_labels(MIN_LABEL_AFFINITY);
            old_view.set_labels(pool_tag, old_labels, label_bound);
            new_view.set_labels(pool_tag, new_labels, label_bound);
        }

        // Build the equivalence map, where references whose targets were
        // associated above now compare equal in the encoded views.
        let old_text = old_view.projected();
        let new_text = new_view.projected();
        let old_sa = induced_suffix_sort(&old_text, old_view.cardinality());
        equivalence_map.build(
            &old_sa,
            &old_text,
            &new_text,
            old_image_index,
            new_image_index,
            &targets_affinities,
            MIN_EQUIVALENCE_SIMILARITY,
        );
    }

    equivalence_map
}

/// Emits the equivalences and the new-image bytes in the gaps between them.
pub fn generate_equivalences_and_extra_data(
    new_image: &[u8],
    equivalence_map: &EquivalenceMap,
    patch_element: &mut PatchElementWriter,
) {
    // Two passes over the map, to reduce write churn.
    let mut equivalences_sink = EquivalenceSink::new();
    for candidate in equivalence_map.candidates() {
        equivalences_sink.put_next(&candidate.eq);
    }
    patch_element.set_equivalence_sink(equivalences_sink);

    let mut extra_data_sink = ExtraDataSink::new();
    let mut dst_offset = 0usize;
    for candidate in equivalence_map.candidates() {
        extra_data_sink.put_next(&new_image[dst_offset..candidate.eq.dst_offset as usize]);
        dst_offset = candidate.eq.dst_end() as usize;
        debug_assert!(dst_offset <= new_image.len());
    }
    extra_data_sink.put_next(&new_image[dst_offset..]);
    patch_element.set_extra_data_sink(extra_data_sink);
}

type MixerMap<'a> = BTreeMap<TypeTag, Box<dyn ReferenceMixer + 'a>>;

/// Emits bytewise corrections for all differences within equivalences.
/// Reference bytes are skipped on architectures without a mixer for their
/// type (the reference-delta stream covers the whole width); with a mixer,
/// the correction targets the mixed bytes, so only operation-bit changes
/// are stored.
pub fn generate_raw_delta(
    old_image: &[u8],
    new_image: &[u8],
    equivalence_map: &EquivalenceMap,
    new_image_index: &ImageIndex,
    reference_mixers: &mut MixerMap,
    patch_element: &mut PatchElementWriter,
) {
    let mut raw_delta_sink = RawDeltaSink::new();

    // Visit equivalences in new-image order; emit differences against the
    // "copy offset", the position within the concatenation of all copied
    // regions.
    let mut base_copy_offset: Offset = 0;
    for candidate in equivalence_map.candidates() {
        let equivalence = candidate.eq;
        let mut i: Offset = 0;
        while i < equivalence.length {
            if new_image_index.is_reference(equivalence.dst_offset + i) {
                debug_assert!(new_image_index.is_token(equivalence.dst_offset + i));
                let type_tag = new_image_index.lookup_type(equivalence.dst_offset + i);
                let width = new_image_index.refs(type_tag).width();
                if let Some(mixer) = reference_mixers.get_mut(&type_tag) {
                    let mixed = mixer
                        .mix(equivalence.src_offset + i, equivalence.dst_offset + i)
                        .to_vec();
                    for (j, &mixed_byte) in mixed.iter().enumerate() {
                        let diff = mixed_byte.wrapping_sub(
                            old_image[(equivalence.src_offset + i) as usize + j],
                        ) as i8;
                        if diff != 0 {
                            raw_delta_sink.put_next(RawDeltaUnit {
                                copy_offset: base_copy_offset + i + j as Offset,
                                diff,
                            });
                        }
                    }
                }
                i += width;
                debug_assert!(i <= equivalence.length);
            } else {
                let diff = new_image[(equivalence.dst_offset + i) as usize]
                    .wrapping_sub(old_image[(equivalence.src_offset + i) as usize])
                    as i8;
                if diff != 0 {
                    raw_delta_sink
                        .put_next(RawDeltaUnit { copy_offset: base_copy_offset + i, diff });
                }
                i += 1;
            }
        }
        base_copy_offset += equivalence.length;
    }
    patch_element.set_raw_delta_sink(raw_delta_sink);
}

/// Emits the target key delta of every new reference covered by an
/// equivalence, relative to the projected estimate from the matching old
/// reference. By construction, each reference body lies either completely
/// inside an equivalence or completely outside.
pub fn generate_references_delta(
    src_refs: &ReferenceSet,
    dst_refs: &ReferenceSet,
    projected_target_pool: &TargetPool,
    offset_mapper: &OffsetMapper,
    equivalence_map: &EquivalenceMap,
    reference_delta_sink: &mut ReferenceDeltaSink,
) {
    let ref_width = src_refs.width();
    let dst_references = dst_refs.references();
    let src_references = src_refs.references();
    let mut dst_pos = 0usize;

    for candidate in equivalence_map.candidates() {
        let equivalence = candidate.eq;
        // Catch the destination cursor up to this equivalence.
        while dst_pos < dst_references.len()
            && dst_references[dst_pos].location < equivalence.dst_offset
        {
            dst_pos += 1;
        }
        if dst_pos == dst_references.len() {
            break;
        }
        if dst_references[dst_pos].location >= equivalence.dst_end() {
            continue;
        }
        // Straddle check.
        debug_assert!(dst_references[dst_pos].location + ref_width <= equivalence.dst_end());

        let src_loc =
            equivalence.src_offset + (dst_references[dst_pos].location - equivalence.dst_offset);
        let mut src_pos =
            src_references.partition_point(|reference| reference.location < src_loc);
        while dst_pos < dst_references.len()
            && dst_references[dst_pos].location + ref_width <= equivalence.dst_end()
        {
            // Local offsets of the matched references agree.
            debug_assert_eq!(
                src_references[src_pos].location - equivalence.src_offset,
                dst_references[dst_pos].location - equivalence.dst_offset
            );
            let old_offset = src_references[src_pos].target;
            let new_estimated_offset = offset_mapper.extended_forward_project(old_offset);
            let new_estimated_key =
                projected_target_pool.key_for_nearest_offset(new_estimated_offset);
            let new_offset = dst_references[dst_pos].target;
            let new_key = projected_target_pool.key_for_offset(new_offset);

            reference_delta_sink.put_next(new_key.wrapping_sub(new_estimated_key) as i32);
            dst_pos += 1;
            src_pos += 1;
        }
        if dst_pos == dst_references.len() {
            break;
        }
        // Straddle check.
        debug_assert!(dst_references[dst_pos].location >= equivalence.dst_end());
    }
}

/// Emits `extra_targets` for `pool_tag`.
pub fn generate_extra_targets(
    extra_targets: &[Offset],
    pool_tag: PoolTag,
    patch_element: &mut PatchElementWriter,
) {
    let mut target_sink = TargetSink::new();
    for &target in extra_targets {
        target_sink.put_next(target);
    }
    patch_element.set_target_sink(pool_tag, target_sink);
}

/// Generates raw patch data from `old_image` to `new_image`, using a
/// precomputed suffix array over the old image's raw projection.
pub fn generate_raw_element(
    old_sa: &[u32],
    old_text: &[u32],
    old_image: &[u8],
    new_image: &[u8],
    patch_element: &mut PatchElementWriter,
) {
    let old_image_index = ImageIndex::new(old_image);
    let new_image_index = ImageIndex::new(new_image);
    let new_view = EncodedView::new(&new_image_index);

    let mut equivalences = EquivalenceMap::new();
    equivalences.build(
        old_sa,
        old_text,
        &new_view.projected(),
        &old_image_index,
        &new_image_index,
        &[],
        MIN_EQUIVALENCE_SIMILARITY,
    );

    patch_element.set_reference_delta_sink(ReferenceDeltaSink::new());
    generate_equivalences_and_extra_data(new_image, &equivalences, patch_element);
    let mut reference_mixers = MixerMap::new();
    generate_raw_delta(
        old_image,
        new_image,
        &equivalences,
        &new_image_index,
        &mut reference_mixers,
        patch_element,
    );
}

/// Generates patch data of type `exe_type` from `old_image` to `new_image`.
/// Returns false on non-fatal failure (the caller falls back to raw
/// patching).
pub fn generate_executable_element(
    exe_type: ExecutableType,
    old_image: &[u8],
    new_image: &[u8],
    patch_element: &mut PatchElementWriter,
) -> bool {
    let (Some(old_disasm), Some(new_disasm)) = (
        make_disassembler_of_type(old_image, exe_type),
        make_disassembler_of_type(new_image, exe_type),
    ) else {
        error!("Failed to create disassembler.");
        return false;
    };
    debug_assert_eq!(old_disasm.exe_type(), new_disasm.exe_type());

    let mut old_image_index = ImageIndex::new(old_image);
    let mut new_image_index = ImageIndex::new(new_image);
    if !old_image_index.initialize(&*old_disasm) || !new_image_index.initialize(&*new_disasm) {
        error!("Failed to create image index: overlapping references found?");
        return false;
    }
    debug_assert_eq!(old_image_index.pool_count(), new_image_index.pool_count());

    let equivalences = create_equivalence_map(
        &old_image_index,
        &new_image_index,
        new_disasm.num_equivalence_iterations(),
    );
    let offset_mapper = OffsetMapper::from_equivalence_map(
        &equivalences,
        old_image.len() as Offset,
        new_image.len() as Offset,
    );

    let mut reference_delta_sink = ReferenceDeltaSink::new();
    for (&pool_tag, old_targets) in old_image_index.target_pools() {
        let mut projected_old_targets = old_targets.clone();
        projected_old_targets.filter_and_project(&offset_mapper);
        let extra_targets =
            find_extra_targets(&projected_old_targets, new_image_index.pool(pool_tag));
        projected_old_targets.insert_targets(extra_targets.iter().copied());

        generate_extra_targets(&extra_targets, pool_tag, patch_element);
        for &type_tag in old_targets.types() {
            generate_references_delta(
                old_image_index.refs(type_tag),
                new_image_index.refs(type_tag),
                &projected_old_targets,
                &offset_mapper,
                &equivalences,
                &mut reference_delta_sink,
            );
        }
    }
    patch_element.set_reference_delta_sink(reference_delta_sink);

    let mut reference_mixers = MixerMap::new();
    for traits in old_disasm.reference_groups() {
        if let Some(mixer) = old_disasm.make_mixer(traits.type_tag, old_image, new_image) {
            reference_mixers.insert(traits.type_tag, mixer);
        }
    }

    generate_equivalences_and_extra_data(new_image, &equivalences, patch_element);
    generate_raw_delta(
        old_image,
        new_image,
        &equivalences,
        &new_image_index,
        &mut reference_mixers,
        patch_element,
    );
    true
}

fn generate_buffer_common(
    old_image: &[u8],
    new_image: &[u8],
    matcher: &mut dyn EnsembleMatcher,
    patch_writer: &mut EnsemblePatchWriter,
) -> Status {
    if !matcher.run_match(old_image, new_image) {
        info!("Matching failed, generating raw patch.");
        return generate_buffer_raw(old_image, new_image, patch_writer);
    }

    let matches = matcher.matches().to_vec();
    info!(
        "Matching: Found {} nontrivial matches and {} identical matches.",
        matches.len(),
        matcher.num_identical()
    );
    if matches.is_empty() {
        info!("No nontrivial matches, generating raw patch.");
        return generate_buffer_raw(old_image, new_image, patch_writer);
    }

    // Keyed by "new" offsets, so elements and gap results computed
    // separately still serialize in new-image order.
    let mut patch_element_map: BTreeMap<usize, PatchElementWriter> = BTreeMap::new();

    let mut covered_new_regions: Vec<BufferRegion> = Vec::new();
    let mut covered_new_bytes = 0usize;

    // Process matched elements first; non-fatal failures become gaps.
    for element_match in &matches {
        let new_region = element_match.new_element.region;
        info!("--- Match [{:#X}, {:#X})", new_region.lo(), new_region.hi());

        let old_sub_image = &old_image[element_match.old_element.region.lo()
            ..element_match.old_element.region.hi()];
        let new_sub_image = &new_image[new_region.lo()..new_region.hi()];
        let mut patch_element = PatchElementWriter::new(*element_match);
        if generate_executable_element(
            element_match.exe_type(),
            old_sub_image,
            new_sub_image,
            &mut patch_element,
        ) {
            patch_element_map.insert(new_region.lo(), patch_element);
            covered_new_regions.push(new_region);
            covered_new_bytes += new_region.size;
        } else {
            info!("Fall back to raw patching.");
        }
    }

    if covered_new_bytes < new_image.len() {
        // Process the "gaps" — new-image bytes not covered by any matched
        // element — patching each against the entire old image. All gaps
        // share one raw suffix array, kept apart from the per-element ones
        // to bound peak memory.
        let entire_old_element = Element::raw(BufferRegion::new(0, old_image.len()));
        let old_image_index = ImageIndex::new(old_image);
        let old_view_raw = EncodedView::new(&old_image_index);
        let old_text_raw = old_view_raw.projected();
        let old_sa_raw = induced_suffix_sort(&old_text_raw, 256);

        let mut gap_lo = 0usize;
        // Sentinel pointing at the end of the new image simplifies gap
        // iteration.
        covered_new_regions.push(BufferRegion::new(new_image.len(), 0));

        for covered in &covered_new_regions {
            let gap_hi = covered.lo();
            debug_assert!(gap_hi >= gap_lo);
            let gap_size = gap_hi - gap_lo;
            if gap_size > 0 {
                info!("--- Gap   [{gap_lo:#X}, {gap_hi:#X})");
                let gap_match = ElementMatch {
                    old_element: entire_old_element,
                    new_element: Element::raw(BufferRegion::new(gap_lo, gap_size)),
                };
                let mut patch_element = PatchElementWriter::new(gap_match);
                generate_raw_element(
                    &old_sa_raw,
                    &old_text_raw,
                    old_image,
                    &new_image[gap_lo..gap_hi],
                    &mut patch_element,
                );
                patch_element_map.insert(gap_lo, patch_element);
            }
            gap_lo = covered.hi();
        }
    }

    // Emit all elements sorted by "new" offset.
    for (_, patch_element) in patch_element_map {
        patch_writer.add_element(patch_element);
    }

    Status::Success
}

/// Generates an ensemble patch using the default element detection and
/// matching heuristics.
pub fn generate_buffer(
    old_image: &[u8],
    new_image: &[u8],
    patch_writer: &mut EnsemblePatchWriter,
) -> Status {
    let mut matcher = HeuristicEnsembleMatcher::new();
    generate_buffer_common(old_image, new_image, &mut matcher, patch_writer)
}

/// Same as [`generate_buffer`], but if `imposed_matches` is non-empty it
/// overrides the heuristics. The string is formatted as
/// `"#+#=#+#,#+#=#+#,..."` (e.g., `"1+2=3+4"`), each match holding the
/// offset and size in "old", then the offset and size in "new".
pub fn generate_buffer_imposed(
    old_image: &[u8],
    new_image: &[u8],
    imposed_matches: &str,
    patch_writer: &mut EnsemblePatchWriter,
) -> Status {
    if imposed_matches.is_empty() {
        return generate_buffer(old_image, new_image, patch_writer);
    }
    let mut matcher = ImposedEnsembleMatcher::new(imposed_matches);
    generate_buffer_common(old_image, new_image, &mut matcher, patch_writer)
}

/// Generates a raw patch, treating both images as opaque data.
pub fn generate_buffer_raw(
    old_image: &[u8],
    new_image: &[u8],
    patch_writer: &mut EnsemblePatchWriter,
) -> Status {
    let old_image_index = ImageIndex::new(old_image);
    let old_view = EncodedView::new(&old_image_index);
    let old_text = old_view.projected();
    let old_sa = induced_suffix_sort(&old_text, old_view.cardinality());

    let element_match = ElementMatch {
        old_element: Element::raw(BufferRegion::new(0, old_image.len())),
        new_element: Element::raw(BufferRegion::new(0, new_image.len())),
    };
    let mut patch_element = PatchElementWriter::new(element_match);
    generate_raw_element(&old_sa, &old_text, old_image, new_image, &mut patch_element);
    patch_writer.add_element(patch_element);
    Status::Success
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_extra_targets_is_set_difference() {
        let old = TargetPool::with_targets(vec![2, 4, 6]);
        let new = TargetPool::with_targets(vec![1, 2, 5, 6, 9]);
        assert_eq!(find_extra_targets(&old, &new), vec![1, 5, 9]);
        assert_eq!(find_extra_targets(&new, &old), vec![4]);
        assert_eq!(find_extra_targets(&new, &new), Vec::<Offset>::new());
    }
}
