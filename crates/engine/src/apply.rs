//! Patch application: reconstructs the new image from a validated patch,
//! in three passes per element — copy equivalences and extra data, apply
//! bytewise corrections, then correct reference targets.

use std::collections::BTreeMap;

use log::error;
use marrow_disasm::detect::make_disassembler_of_type;
use marrow_image::types::{ExecutableType, Offset, PoolTag, ReferenceTypeTraits};
use marrow_patch::reader::{EnsemblePatchReader, PatchElementReader};

use crate::equivalence::OffsetMapper;
use crate::index::TargetPool;
use crate::Status;

/// Reconstructs the preliminary new element: walks equivalences in dst
/// order, copying the interleaved extra data and the old-image blocks.
pub fn apply_equivalence_and_extra_data(
    old_image: &[u8],
    patch_element: &PatchElementReader,
    new_image: &mut [u8],
) -> bool {
    let mut equiv_source = patch_element.equivalence_source();
    let mut extra_data_source = patch_element.extra_data_source();
    let mut dst_pos = 0usize;

    while let Some(equivalence) = equiv_source.next() {
        let next_dst_pos = equivalence.dst_offset as usize;
        if next_dst_pos < dst_pos {
            error!("Out of order equivalence.");
            return false;
        }
        let gap = next_dst_pos - dst_pos;
        let Some(extra_data) = extra_data_source.next(gap) else {
            error!("Error reading extra_data.");
            return false;
        };
        new_image[dst_pos..next_dst_pos].copy_from_slice(extra_data);
        dst_pos = next_dst_pos;

        let src = equivalence.src_offset as usize..equivalence.src_end() as usize;
        new_image[dst_pos..dst_pos + equivalence.length as usize]
            .copy_from_slice(&old_image[src]);
        dst_pos += equivalence.length as usize;
    }
    let gap = new_image.len() - dst_pos;
    let Some(extra_data) = extra_data_source.next(gap) else {
        error!("Error reading extra_data.");
        return false;
    };
    new_image[dst_pos..].copy_from_slice(extra_data);
    if !equiv_source.done() || !extra_data_source.done() {
        error!("Found trailing equivalence or extra_data.");
        return false;
    }
    true
}

/// Applies the bytewise corrections, walking equivalences and raw deltas in
/// lockstep: each delta's copy offset selects a byte within the cumulative
/// equivalence coverage.
pub fn apply_raw_delta(patch_element: &PatchElementReader, new_image: &mut [u8]) -> bool {
    let mut equiv_source = patch_element.equivalence_source();
    let mut raw_delta_source = patch_element.raw_delta_source();
    let mut equivalence = equiv_source.next();
    let mut base_copy_offset: Offset = 0;
    while let Some(delta) = raw_delta_source.next() {
        // Advance to the equivalence containing this copy offset.
        while let Some(current) = equivalence {
            if base_copy_offset + current.length <= delta.copy_offset {
                base_copy_offset += current.length;
                equivalence = equiv_source.next();
            } else {
                break;
            }
        }
        let Some(current) = equivalence else {
            error!("Error reading equivalences.");
            return false;
        };
        if delta.copy_offset < base_copy_offset {
            error!("Out of order raw delta.");
            return false;
        }
        // Invert the byte diff.
        let pos = (current.dst_offset + (delta.copy_offset - base_copy_offset)) as usize;
        new_image[pos] = new_image[pos].wrapping_add(delta.diff as u8);
    }
    if !raw_delta_source.done() {
        error!("Found trailing raw_delta.");
        return false;
    }
    true
}

/// Corrects reference targets in the preliminary new element: for each old
/// reference within an equivalence, looks up the projected target estimate
/// and adds the patch's key delta to find the actual target.
pub fn apply_references_correction(
    exe_type: ExecutableType,
    old_image: &[u8],
    patch_element: &PatchElementReader,
    new_image: &mut [u8],
) -> bool {
    let (Some(old_disasm), Some(new_disasm)) = (
        make_disassembler_of_type(old_image, exe_type),
        make_disassembler_of_type(new_image, exe_type),
    ) else {
        error!("Failed to create disassembler.");
        return false;
    };
    if old_disasm.size() != old_image.len() || new_disasm.size() != new_image.len() {
        error!("Disassembler and element size mismatch.");
        return false;
    }

    let mut reference_delta_source = patch_element.reference_delta_source();
    let mut pool_groups: BTreeMap<PoolTag, Vec<ReferenceTypeTraits>> = BTreeMap::new();
    for traits in old_disasm.reference_groups() {
        pool_groups.entry(traits.pool_tag).or_default().push(traits);
    }

    let offset_mapper = OffsetMapper::from_source(
        &mut patch_element.equivalence_source(),
        old_image.len() as Offset,
        new_image.len() as Offset,
    );

    for (pool_tag, sub_groups) in &pool_groups {
        // Load "old" targets, then filter and project them to "new".
        let mut targets = TargetPool::new();
        for traits in sub_groups {
            let mut reader = old_disasm.make_reader(
                traits.type_tag,
                old_image,
                0,
                old_image.len() as Offset,
            );
            targets.insert_targets_from_reader(&mut *reader);
        }
        targets.filter_and_project(&offset_mapper);

        // Load extra targets from the patch.
        let mut target_source = patch_element.extra_target_source(*pool_tag);
        let mut extra_targets = Vec::new();
        while let Some(target) = target_source.next() {
            extra_targets.push(target);
        }
        if !target_source.done() {
            error!("Found trailing extra_targets.");
            return false;
        }
        targets.insert_targets(extra_targets);

        // Correct all new references of this pool's types.
        for traits in sub_groups {
            let mut writer = new_disasm.make_writer(traits.type_tag, new_image);
            let mut equiv_source = patch_element.equivalence_source();
            while let Some(equivalence) = equiv_source.next() {
                let mut reader = old_disasm.make_reader(
                    traits.type_tag,
                    old_image,
                    equivalence.src_offset,
                    equivalence.src_end(),
                );
                while let Some(mut reference) = reader.next_ref() {
                    debug_assert!(reference.location >= equivalence.src_offset);
                    debug_assert!(reference.location < equivalence.src_end());

                    let projected_target =
                        offset_mapper.extended_forward_project(reference.target);
                    let expected_key = targets.key_for_nearest_offset(projected_target);
                    let Some(delta) = reference_delta_source.next() else {
                        error!("Error reading reference_delta.");
                        return false;
                    };
                    let key = i64::from(expected_key) + i64::from(delta);
                    if !targets.key_is_valid(key) {
                        error!("Invalid reference_delta.");
                        return false;
                    }
                    reference.target = targets.offset_for_key(key as u32);
                    reference.location =
                        reference.location - equivalence.src_offset + equivalence.dst_offset;
                    writer.put(reference);
                }
            }
        }
    }
    if !reference_delta_source.done() {
        error!("Found trailing reference_delta.");
        return false;
    }
    true
}

/// Applies one patch element onto `new_image` (its new-element region).
pub fn apply_element(
    exe_type: ExecutableType,
    old_image: &[u8],
    patch_element: &PatchElementReader,
    new_image: &mut [u8],
) -> bool {
    apply_equivalence_and_extra_data(old_image, patch_element, new_image)
        && apply_raw_delta(patch_element, new_image)
        && apply_references_correction(exe_type, old_image, patch_element, new_image)
}

/// Applies `patch` to `old_image`, writing into the preallocated
/// `new_image`, whose size must equal the patch's declared new size.
pub fn apply_buffer(
    old_image: &[u8],
    patch: &EnsemblePatchReader,
    new_image: &mut [u8],
) -> Status {
    if new_image.len() != patch.header().new_size.get() as usize {
        error!("Invalid output buffer size.");
        return Status::InvalidParam;
    }
    if !patch.check_old_file(old_image) {
        error!("Invalid old_image.");
        return Status::InvalidOldImage;
    }

    for patch_element in patch.elements() {
        let element_match = patch_element.element_match();
        let old_region = element_match.old_element.region;
        let new_region = element_match.new_element.region;
        let old_sub_image = &old_image[old_region.lo()..old_region.hi()];
        let new_sub_image = &mut new_image[new_region.lo()..new_region.hi()];
        if !apply_element(element_match.exe_type(), old_sub_image, patch_element, new_sub_image)
        {
            return Status::Fatal;
        }
    }

    if !patch.check_new_file(new_image) {
        error!("Invalid new_image.");
        return Status::InvalidNewImage;
    }
    Status::Success
}
