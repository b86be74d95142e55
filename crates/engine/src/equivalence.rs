//! Equivalence discovery between annotated images — the algorithmic heart
//! of generation — and the offset mapper derived from the result.
//!
//! An equivalence asserts that a block of the old image approximately
//! matches a block of the new image. Candidates are seeded by suffix-array
//! lookups over the encoded views, grown in both directions while a
//! similarity score stays above a running penalty, and finally pruned so no
//! two survive overlapping in the new image.

use marrow_image::types::{Equivalence, EquivalenceCandidate, Offset, OFFSET_BOUND};

use crate::affinity::TargetsAffinity;
use crate::index::ImageIndex;
use marrow_core::suffix_array::suffix_lower_bound;

/// Fatal mismatch score: terminates extension immediately.
pub const MISMATCH_FATAL: f64 = f64::NEG_INFINITY;

/// Minimum accumulated similarity for an equivalence to be kept.
pub const MIN_EQUIVALENCE_SIMILARITY: f64 = 12.0;

/// Minimum affinity for a target pair to receive a label.
pub const MIN_LABEL_AFFINITY: f64 = 64.0;

// Seed selection can exhibit O(n^2) behavior if it runs to completion, so a
// quota bounds the total length of equivalences it may trial per seed. The
// quota is rarely hit in regular use, and the effect on patch size when it
// is hit is small.
const SEED_SELECTION_TOTAL_VISIT_LENGTH_QUOTA: u64 = 1 << 18; // 256 KiB.

// The quota alone is insufficient: backward exploration can still succeed
// often enough to restore O(n^2) behavior, so it is capped as well.
const BACKWARDS_EXTEND_LIMIT: Offset = 1 << 16; // 64 KiB.

/// Similarity score between a token (raw byte or first byte of a reference)
/// at `src` in the old image and one at `dst` in the new image.
/// `targets_affinities` holds one entry per pool and evaluates similarity
/// between reference targets.
#[must_use]
pub fn token_similarity(
    old_image_index: &ImageIndex,
    new_image_index: &ImageIndex,
    targets_affinities: &[TargetsAffinity],
    src: Offset,
    dst: Offset,
) -> f64 {
    debug_assert!(old_image_index.is_token(src));
    debug_assert!(new_image_index.is_token(dst));

    let old_type = old_image_index.lookup_type(src);
    let new_type = new_image_index.lookup_type(dst);
    if old_type != new_type {
        return MISMATCH_FATAL;
    }

    // Raw comparison.
    if !old_image_index.is_reference(src) && !new_image_index.is_reference(dst) {
        return if old_image_index.raw_value(src) == new_image_index.raw_value(dst) {
            1.0
        } else {
            -1.5
        };
    }

    let old_ref_set = old_image_index.refs(old_type);
    let new_ref_set = new_image_index.refs(new_type);
    let old_reference = old_ref_set.at(src);
    let new_reference = new_ref_set.at(dst);
    let pool_tag = old_ref_set.pool_tag();

    let affinity = targets_affinities[pool_tag.value() as usize].affinity_between(
        old_image_index.pool(pool_tag).key_for_offset(old_reference.target),
        new_image_index.pool(pool_tag).key_for_offset(new_reference.target),
    );

    // Neither target is associated: a weak match.
    if affinity == 0.0 {
        return 0.5 * f64::from(old_ref_set.width());
    }

    // At least one target is associated, so values are compared.
    if affinity > 0.0 {
        f64::from(old_ref_set.width())
    } else {
        -2.0
    }
}

/// Similarity score of the whole region described by `equivalence`.
#[must_use]
pub fn equivalence_similarity(
    old_image_index: &ImageIndex,
    new_image_index: &ImageIndex,
    targets_affinities: &[TargetsAffinity],
    equivalence: &Equivalence,
) -> f64 {
    let mut similarity = 0.0;
    for k in 0..equivalence.length {
        // Non-tokens are scored with their nearest previous token.
        if !new_image_index.is_token(equivalence.dst_offset + k) {
            continue;
        }
        similarity += token_similarity(
            old_image_index,
            new_image_index,
            targets_affinities,
            equivalence.src_offset + k,
            equivalence.dst_offset + k,
        );
        if similarity == MISMATCH_FATAL {
            return MISMATCH_FATAL;
        }
    }
    similarity
}

/// Extends `candidate` forward while the similarity gain outweighs the
/// running penalty, and returns the best extension found.
#[must_use]
pub fn extend_equivalence_forward(
    old_image_index: &ImageIndex,
    new_image_index: &ImageIndex,
    targets_affinities: &[TargetsAffinity],
    candidate: &EquivalenceCandidate,
    min_similarity: f64,
) -> EquivalenceCandidate {
    let mut equivalence = candidate.eq;
    let mut best_k = equivalence.length;
    let mut current_similarity = candidate.similarity;
    let mut best_similarity = current_similarity;
    let mut current_penalty = min_similarity;
    let mut k = best_k;
    while equivalence.src_offset + k < old_image_index.size() as Offset
        && equivalence.dst_offset + k < new_image_index.size() as Offset
    {
        // Mismatched types terminate the extension.
        if old_image_index.lookup_type(equivalence.src_offset + k)
            != new_image_index.lookup_type(equivalence.dst_offset + k)
        {
            break;
        }

        if !new_image_index.is_token(equivalence.dst_offset + k) {
            // Non-tokens are joined with the nearest previous token: skip
            // until the unit is covered, keeping |best_k| in step.
            if best_k == k {
                best_k = k + 1;
            }
            k += 1;
            continue;
        }

        let similarity = token_similarity(
            old_image_index,
            new_image_index,
            targets_affinities,
            equivalence.src_offset + k,
            equivalence.dst_offset + k,
        );
        current_similarity += similarity;
        current_penalty = current_penalty.max(0.0) - similarity;

        if current_similarity < 0.0 || current_penalty >= min_similarity {
            break;
        }
        if current_similarity >= best_similarity {
            best_similarity = current_similarity;
            best_k = k + 1;
        }
        k += 1;
    }
    equivalence.length = best_k;
    EquivalenceCandidate { eq: equivalence, similarity: best_similarity }
}

/// Extends `candidate` backward, with a reach cap, and returns the best
/// extension found.
#[must_use]
pub fn extend_equivalence_backward(
    old_image_index: &ImageIndex,
    new_image_index: &ImageIndex,
    targets_affinities: &[TargetsAffinity],
    candidate: &EquivalenceCandidate,
    min_similarity: f64,
) -> EquivalenceCandidate {
    let mut equivalence = candidate.eq;
    let mut best_k: Offset = 0;
    let mut current_similarity = candidate.similarity;
    let mut best_similarity = current_similarity;
    let mut current_penalty = 0.0f64;
    let k_min = equivalence
        .dst_offset
        .min(equivalence.src_offset)
        .min(BACKWARDS_EXTEND_LIMIT);
    for k in 1..=k_min {
        if old_image_index.lookup_type(equivalence.src_offset - k)
            != new_image_index.lookup_type(equivalence.dst_offset - k)
        {
            break;
        }
        // Non-tokens are joined with the nearest previous token: skip until
        // the next token.
        if !new_image_index.is_token(equivalence.dst_offset - k) {
            continue;
        }

        let similarity = token_similarity(
            old_image_index,
            new_image_index,
            targets_affinities,
            equivalence.src_offset - k,
            equivalence.dst_offset - k,
        );
        current_similarity += similarity;
        current_penalty = current_penalty.max(0.0) - similarity;

        if current_similarity < 0.0 || current_penalty >= min_similarity {
            break;
        }
        if current_similarity >= best_similarity {
            best_similarity = current_similarity;
            best_k = k;
        }
    }

    equivalence.dst_offset -= best_k;
    equivalence.src_offset -= best_k;
    equivalence.length += best_k;
    EquivalenceCandidate { eq: equivalence, similarity: best_similarity }
}

/// Grows a seed at `(src, dst)` into a maximal candidate equivalence.
#[must_use]
pub fn visit_equivalence_seed(
    old_image_index: &ImageIndex,
    new_image_index: &ImageIndex,
    targets_affinities: &[TargetsAffinity],
    src: Offset,
    dst: Offset,
    min_similarity: f64,
) -> EquivalenceCandidate {
    let candidate = EquivalenceCandidate {
        eq: Equivalence { src_offset: src, dst_offset: dst, length: 0 },
        similarity: 0.0,
    };
    if !old_image_index.is_token(src) {
        return candidate;
    }
    let candidate = extend_equivalence_forward(
        old_image_index,
        new_image_index,
        targets_affinities,
        &candidate,
        min_similarity,
    );
    if candidate.similarity < min_similarity {
        return candidate; // Not worth exploring any more.
    }
    extend_equivalence_backward(
        old_image_index,
        new_image_index,
        targets_affinities,
        &candidate,
        min_similarity,
    )
}

/// Container of equivalences sorted by `dst_offset`, with no dst overlaps
/// after pruning. Only used during generation.
#[derive(Default)]
pub struct EquivalenceMap {
    candidates: Vec<EquivalenceCandidate>,
}

impl EquivalenceMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Initializes the map with `candidates`, sorting by destination.
    #[must_use]
    pub fn from_candidates(mut candidates: Vec<EquivalenceCandidate>) -> Self {
        candidates.sort_by_key(|candidate| candidate.eq.dst_offset);
        Self { candidates }
    }

    /// Finds relevant equivalences between the old image (projected as
    /// `old_text`, with suffix array `old_sa`) and the new image (projected
    /// as `new_text`). Not symmetric: results may overlap in the old image
    /// but never in the new image. Maximizes accumulated similarity within
    /// each equivalence while maximizing new-image coverage.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        &mut self,
        old_sa: &[u32],
        old_text: &[u32],
        new_text: &[u32],
        old_image_index: &ImageIndex,
        new_image_index: &ImageIndex,
        targets_affinities: &[TargetsAffinity],
        min_similarity: f64,
    ) {
        debug_assert_eq!(old_sa.len(), old_text.len());

        self.create_candidates(
            old_sa,
            old_text,
            new_text,
            old_image_index,
            new_image_index,
            targets_affinities,
            min_similarity,
        );
        self.sort_by_destination();
        self.prune(old_image_index, new_image_index, targets_affinities, min_similarity);

        let mut coverage: u64 = 0;
        let mut current_offset: Offset = 0;
        for candidate in &self.candidates {
            debug_assert!(candidate.eq.dst_offset >= current_offset);
            coverage += u64::from(candidate.eq.length);
            current_offset = candidate.eq.dst_end();
        }
        log::info!("Equivalence count: {}", self.candidates.len());
        log::info!(
            "Coverage / extra / total: {} / {} / {}",
            coverage,
            new_text.len() as u64 - coverage,
            new_text.len()
        );
    }

    // Heuristically discovers candidates, in ascending new-image order.
    // Results are unsorted and may overlap in the new image.
    #[allow(clippy::too_many_arguments)]
    fn create_candidates(
        &mut self,
        old_sa: &[u32],
        old_text: &[u32],
        new_text: &[u32],
        old_image_index: &ImageIndex,
        new_image_index: &ImageIndex,
        targets_affinities: &[TargetsAffinity],
        min_similarity: f64,
    ) {
        self.candidates.clear();

        let mut dst_offset: Offset = 0;
        while (dst_offset as usize) < new_text.len() {
            if !new_image_index.is_token(dst_offset) {
                dst_offset += 1;
                continue;
            }
            let found =
                suffix_lower_bound(old_sa, old_text, &new_text[dst_offset as usize..]);

            let mut next_dst_offset = dst_offset + 1;
            let mut best_similarity = min_similarity;
            let mut best_candidate = EquivalenceCandidate {
                eq: Equivalence { src_offset: 0, dst_offset: 0, length: 0 },
                similarity: 0.0,
            };

            // Probe the lexicographic neighborhood of the match: forward,
            // then backward, stopping at the first non-improving seed and
            // bounding the total visited length.
            let mut total_visit_length: u64 = 0;
            for &src in &old_sa[found..] {
                let candidate = visit_equivalence_seed(
                    old_image_index,
                    new_image_index,
                    targets_affinities,
                    src,
                    dst_offset,
                    min_similarity,
                );
                if candidate.similarity > best_similarity {
                    best_similarity = candidate.similarity;
                    next_dst_offset = candidate.eq.dst_end();
                    total_visit_length += u64::from(candidate.eq.length);
                    best_candidate = candidate;
                    if total_visit_length > SEED_SELECTION_TOTAL_VISIT_LENGTH_QUOTA {
                        break;
                    }
                } else {
                    break;
                }
            }
            let mut total_visit_length: u64 = 0;
            for &src in old_sa[..found].iter().rev() {
                let candidate = visit_equivalence_seed(
                    old_image_index,
                    new_image_index,
                    targets_affinities,
                    src,
                    dst_offset,
                    min_similarity,
                );
                if candidate.similarity > best_similarity {
                    best_similarity = candidate.similarity;
                    next_dst_offset = candidate.eq.dst_end();
                    total_visit_length += u64::from(candidate.eq.length);
                    best_candidate = candidate;
                    if total_visit_length > SEED_SELECTION_TOTAL_VISIT_LENGTH_QUOTA {
                        break;
                    }
                } else {
                    break;
                }
            }
            if best_candidate.similarity >= min_similarity {
                self.candidates.push(best_candidate);
            }

            dst_offset = next_dst_offset;
        }
    }

    fn sort_by_destination(&mut self) {
        // Destinations are distinct; no tiebreaker is needed.
        self.candidates.sort_by_key(|candidate| candidate.eq.dst_offset);
    }

    // Visits candidates (sorted by dst) and removes all destination
    // overlaps. Low-similarity candidates are shrunk first and may be
    // removed entirely.
    fn prune(
        &mut self,
        old_image_index: &ImageIndex,
        new_image_index: &ImageIndex,
        targets_affinities: &[TargetsAffinity],
        min_similarity: f64,
    ) {
        let candidates = &mut self.candidates;
        let mut current = 0usize;
        while current < candidates.len() {
            if candidates[current].similarity < min_similarity {
                current += 1; // Will be discarded at the end anyway.
                continue;
            }

            // A "reaper" is a better overlapping candidate after |current|
            // that truncates it; everything strictly between is zeroed.
            // Handling this case explicitly avoids O(n^2) behavior.
            let mut next_is_reaper = false;

            // Look ahead to resolve overlaps, until a better candidate is
            // found.
            let mut next = current + 1;
            while next < candidates.len() {
                debug_assert!(candidates[next].eq.dst_offset >= candidates[current].eq.dst_offset);
                if candidates[next].eq.dst_offset >= candidates[current].eq.dst_end() {
                    break; // No more overlap.
                }
                if candidates[current].similarity < candidates[next].similarity {
                    // |next| is better: it reaps |current|.
                    let delta = candidates[current].eq.dst_end() - candidates[next].eq.dst_offset;
                    candidates[current].eq.length -= delta;
                    let shrunk = candidates[current].eq;
                    candidates[current].similarity = equivalence_similarity(
                        old_image_index,
                        new_image_index,
                        targets_affinities,
                        &shrunk,
                    );
                    next_is_reaper = true;
                    break;
                }
                next += 1;
            }

            if next_is_reaper {
                // Discard all candidates strictly between |current| and
                // |next|.
                for reduced in &mut candidates[current + 1..next] {
                    reduced.eq.length = 0;
                    reduced.similarity = 0.0;
                }
                current = next;
            } else {
                // Shrink all overlapping candidates following |current|;
                // they are all no better, since no reaper was found.
                let current_dst_end = candidates[current].eq.dst_end();
                for reduced in current + 1..next {
                    let delta = current_dst_end - candidates[reduced].eq.dst_offset;
                    let eq = &mut candidates[reduced].eq;
                    eq.length -= eq.length.min(delta);
                    eq.src_offset += delta;
                    eq.dst_offset += delta;
                    let shrunk = candidates[reduced].eq;
                    candidates[reduced].similarity = equivalence_similarity(
                        old_image_index,
                        new_image_index,
                        targets_affinities,
                        &shrunk,
                    );
                    debug_assert_eq!(shrunk.dst_offset, current_dst_end);
                }
                current += 1;
            }
        }

        candidates.retain(|candidate| candidate.similarity >= min_similarity);
    }

    #[inline]
    #[must_use]
    pub fn candidates(&self) -> &[EquivalenceCandidate] {
        &self.candidates
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Container of pruned equivalences mapping old-image offsets to new-image
/// offsets. Pruning crops smaller equivalences so that covered bytes map
/// one-to-one.
pub struct OffsetMapper {
    // No "old" blocks overlap (nor "new" blocks); sorted by "old" offset.
    equivalences: Vec<Equivalence>,
    old_image_size: Offset,
    new_image_size: Offset,
}

impl OffsetMapper {
    /// From a list already sorted by `src_offset` and pruned. Useful for
    /// tests.
    #[must_use]
    pub fn from_equivalences(
        equivalences: Vec<Equivalence>,
        old_image_size: Offset,
        new_image_size: Offset,
    ) -> Self {
        debug_assert!(new_image_size > 0);
        debug_assert!(equivalences
            .windows(2)
            .all(|pair| pair[0].src_offset < pair[1].src_offset));
        Self { equivalences, old_image_size, new_image_size }
    }

    /// From a patch's equivalence stream. Useful at apply time.
    #[must_use]
    pub fn from_source(
        source: &mut marrow_patch::reader::EquivalenceSource,
        old_image_size: Offset,
        new_image_size: Offset,
    ) -> Self {
        debug_assert!(new_image_size > 0);
        let mut equivalences = Vec::new();
        while let Some(equivalence) = source.next() {
            equivalences.push(equivalence);
        }
        Self::prune_equivalences_and_sort_by_source(&mut equivalences);
        Self { equivalences, old_image_size, new_image_size }
    }

    /// From an [`EquivalenceMap`]. Useful at generation time.
    #[must_use]
    pub fn from_equivalence_map(
        equivalence_map: &EquivalenceMap,
        old_image_size: Offset,
        new_image_size: Offset,
    ) -> Self {
        debug_assert!(new_image_size > 0);
        let mut equivalences: Vec<Equivalence> =
            equivalence_map.candidates().iter().map(|candidate| candidate.eq).collect();
        Self::prune_equivalences_and_sort_by_source(&mut equivalences);
        Self { equivalences, old_image_size, new_image_size }
    }

    /// Naive extended forward projection of `offset` through `unit`:
    /// follows the unit's delta with signed arithmetic, then clamps the
    /// result to `[0, new_image_size)`. `unit` need not cover `offset`.
    #[must_use]
    pub fn naive_extended_forward_project(&self, unit: &Equivalence, offset: Offset) -> Offset {
        let projected = i64::from(offset) - i64::from(unit.src_offset) + i64::from(unit.dst_offset);
        projected.clamp(0, i64::from(self.new_image_size) - 1) as Offset
    }

    /// Returns a new-image offset corresponding to old-image `offset`.
    /// Covered offsets use the delta of the covering equivalence;
    /// non-covered (but in-image) offsets use the delta of the nearest
    /// "old" block; fake offsets shift by the image size difference.
    /// Assumes the equivalence list is non-empty.
    #[must_use]
    pub fn extended_forward_project(&self, offset: Offset) -> Offset {
        debug_assert!(!self.equivalences.is_empty());
        if offset < self.old_image_size {
            // Find the equivalence whose "old" block is nearest to
            // |offset|, favoring the lower block in case of a tie.
            let mut pos =
                self.equivalences.partition_point(|equivalence| equivalence.src_offset <= offset);
            // |offset - src_end()| is one less than the distance to the
            // previous block, hence the strict comparison.
            if pos != 0
                && (pos == self.equivalences.len()
                    || offset < self.equivalences[pos - 1].src_end()
                    || offset - self.equivalences[pos - 1].src_end()
                        < self.equivalences[pos].src_offset - offset)
            {
                pos -= 1;
            }
            return self.naive_extended_forward_project(&self.equivalences[pos], offset);
        }
        // Fake offsets.
        let delta = offset - self.old_image_size;
        if delta < OFFSET_BOUND - self.new_image_size {
            self.new_image_size + delta
        } else {
            OFFSET_BOUND - 1
        }
    }

    /// Given sorted `offsets`, projects in place every offset covered by a
    /// pruned equivalence, and removes the rest.
    pub fn forward_project_all(&self, offsets: &mut Vec<Offset>) {
        debug_assert!(offsets.windows(2).all(|pair| pair[0] <= pair[1]));
        let mut current = 0usize;
        for offset in offsets.iter_mut() {
            while current < self.equivalences.len()
                && self.equivalences[current].src_end() <= *offset
            {
                current += 1;
            }
            if current < self.equivalences.len()
                && self.equivalences[current].src_offset <= *offset
            {
                *offset = *offset - self.equivalences[current].src_offset
                    + self.equivalences[current].dst_offset;
            } else {
                *offset = marrow_image::types::INVALID_OFFSET;
            }
        }
        offsets.retain(|&offset| offset != marrow_image::types::INVALID_OFFSET);
    }

    #[inline]
    #[must_use]
    pub fn equivalences(&self) -> &[Equivalence] {
        &self.equivalences
    }

    /// Sorts `equivalences` by `src_offset` and removes all source
    /// overlaps, so every covered source byte ends up covered by exactly
    /// one equivalence: the largest pre-pruning coverer, ties broken by
    /// minimal `src_offset`. Empty equivalences are removed.
    pub fn prune_equivalences_and_sort_by_source(equivalences: &mut Vec<Equivalence>) {
        // Ascending |src_offset| (required below), then descending |length|
        // (reduces churn), then ascending |dst_offset| (total order).
        equivalences.sort_by(|a, b| {
            (a.src_offset, core::cmp::Reverse(a.length), a.dst_offset).cmp(&(
                b.src_offset,
                core::cmp::Reverse(b.length),
                b.dst_offset,
            ))
        });

        let mut current = 0usize;
        while current < equivalences.len() {
            if equivalences[current].length == 0 {
                current += 1;
                continue;
            }
            let current_src_end = equivalences[current].src_end();

            // A "reaper" is a longer overlapping equivalence after
            // |current| that truncates it; everything strictly between
            // would be truncated to nothing and is discarded. Handling this
            // explicitly avoids O(n^2) behavior.
            let mut next_is_reaper = false;
            let mut next = current + 1;
            while next < equivalences.len() {
                debug_assert!(equivalences[next].src_offset >= equivalences[current].src_offset);
                if equivalences[next].src_offset >= current_src_end {
                    break; // No more overlap.
                }
                if equivalences[current].length < equivalences[next].length {
                    // |next| is better: it reaps |current|.
                    let delta = current_src_end - equivalences[next].src_offset;
                    equivalences[current].length -= delta;
                    next_is_reaper = true;
                    break;
                }
                next += 1;
            }

            if next_is_reaper {
                for reduced in &mut equivalences[current + 1..next] {
                    reduced.length = 0;
                }
                current = next;
            } else {
                // Shrink every equivalence overlapping |current|; all are
                // no longer than it, since no reaper was found.
                for reduced in &mut equivalences[current + 1..next] {
                    let delta = current_src_end - reduced.src_offset;
                    // Cap so the length stays non-negative; the capped
                    // delta also keeps |dst_offset| from overflowing when
                    // the range becomes empty.
                    let capped_delta = reduced.length.min(delta);
                    reduced.length -= capped_delta;
                    // Truncate while preserving the |src_offset| order.
                    reduced.src_offset = current_src_end;
                    reduced.dst_offset += capped_delta;
                }
                current += 1;
            }
        }

        equivalences.retain(|equivalence| equivalence.length > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoded_view::EncodedView;
    use marrow_core::suffix_array::induced_suffix_sort;

    fn eq(src_offset: Offset, dst_offset: Offset, length: Offset) -> Equivalence {
        Equivalence { src_offset, dst_offset, length }
    }

    fn build_raw_map(old_image: &[u8], new_image: &[u8], min_similarity: f64) -> Vec<Equivalence> {
        let old_index = ImageIndex::new(old_image);
        let new_index = ImageIndex::new(new_image);
        let old_view = EncodedView::new(&old_index);
        let new_view = EncodedView::new(&new_index);
        let old_text = old_view.projected();
        let new_text = new_view.projected();
        let old_sa = induced_suffix_sort(&old_text, old_view.cardinality());
        let mut map = EquivalenceMap::new();
        map.build(&old_sa, &old_text, &new_text, &old_index, &new_index, &[], min_similarity);
        map.candidates().iter().map(|candidate| candidate.eq).collect()
    }

    #[test]
    fn identical_raw_images_yield_single_cover() {
        let image: Vec<u8> = (0..64u8).collect();
        let equivalences = build_raw_map(&image, &image, 12.0);
        assert_eq!(equivalences, vec![eq(0, 0, 64)]);
    }

    #[test]
    fn shifted_content_is_found() {
        // New image embeds the old content at offset 3.
        let old: Vec<u8> = (0..40u8).map(|b| b.wrapping_mul(7).wrapping_add(1)).collect();
        let mut new = vec![0u8; 3];
        new.extend_from_slice(&old);
        let equivalences = build_raw_map(&old, &new, 12.0);
        assert!(equivalences.contains(&eq(0, 3, 40)), "{equivalences:?}");
    }

    #[test]
    fn results_are_dst_sorted_and_disjoint() {
        let old: Vec<u8> = (0..128u8).collect();
        // Two separated copies of different old chunks.
        let mut new = Vec::new();
        new.extend_from_slice(&old[64..96]);
        new.extend_from_slice(&[0xEE; 5]);
        new.extend_from_slice(&old[0..32]);
        let equivalences = build_raw_map(&old, &new, 12.0);
        assert!(!equivalences.is_empty());
        for pair in equivalences.windows(2) {
            assert!(pair[0].dst_end() <= pair[1].dst_offset, "{equivalences:?}");
        }
    }

    #[test]
    fn no_equivalence_below_min_similarity() {
        let old = vec![0x11u8; 8];
        let new = vec![0x22u8; 8];
        // Nothing matches: the map must stay empty (the engine itself never
        // fails; empty is a valid result).
        let equivalences = build_raw_map(&old, &new, 12.0);
        assert!(equivalences.is_empty());
    }

    #[test]
    fn prune_removes_source_overlaps() {
        let mut equivalences = vec![eq(0, 100, 10), eq(4, 200, 6), eq(8, 300, 14)];
        OffsetMapper::prune_equivalences_and_sort_by_source(&mut equivalences);
        // eq(8, ...) is longer, so it reaps eq(0, ...) at 8 and discards
        // the middle one.
        assert_eq!(equivalences, vec![eq(0, 100, 8), eq(8, 300, 14)]);

        // No two equivalences share any source byte.
        for pair in equivalences.windows(2) {
            assert!(pair[0].src_end() <= pair[1].src_offset);
        }
    }

    #[test]
    fn prune_shrinks_shorter_followers() {
        let mut equivalences = vec![eq(0, 100, 10), eq(6, 200, 4)];
        OffsetMapper::prune_equivalences_and_sort_by_source(&mut equivalences);
        // The follower is consumed entirely.
        assert_eq!(equivalences, vec![eq(0, 100, 10)]);

        let mut equivalences = vec![eq(0, 100, 10), eq(6, 200, 8)];
        OffsetMapper::prune_equivalences_and_sort_by_source(&mut equivalences);
        // The follower loses its overlapped front.
        assert_eq!(equivalences, vec![eq(0, 100, 10), eq(10, 204, 4)]);
    }

    #[test]
    fn extended_forward_project_covers_and_extends() {
        let mapper = OffsetMapper::from_equivalences(
            vec![eq(10, 0, 10), eq(30, 20, 10)],
            100,
            50,
        );
        // Covered offsets follow their equivalence's delta.
        assert_eq!(mapper.extended_forward_project(10), 0);
        assert_eq!(mapper.extended_forward_project(19), 9);
        assert_eq!(mapper.extended_forward_project(35), 25);
        // Non-covered offsets use the nearest block: 24 is closer to
        // [10, 20) (distance 5) than to [30, 40) (distance 6).
        assert_eq!(mapper.extended_forward_project(24), 14);
        // 26 is closer to [30, 40).
        assert_eq!(mapper.extended_forward_project(26), 16);
        // Before the first block, clamped into the new image.
        assert_eq!(mapper.extended_forward_project(5), 0);
        // Past the last block: delta of the last equivalence.
        assert_eq!(mapper.extended_forward_project(45), 35);
        // Clamped to the new image end.
        assert_eq!(mapper.extended_forward_project(99), 49);
        // Fake offsets shift by the image size difference.
        assert_eq!(mapper.extended_forward_project(100), 50);
        assert_eq!(mapper.extended_forward_project(107), 57);
    }

    #[test]
    fn forward_project_all_drops_uncovered() {
        let mapper = OffsetMapper::from_equivalences(
            vec![eq(10, 0, 10), eq(30, 20, 10)],
            100,
            50,
        );
        let mut offsets = vec![5, 10, 15, 25, 30, 39, 40];
        mapper.forward_project_all(&mut offsets);
        assert_eq!(offsets, vec![0, 5, 20, 29]);
    }
}
