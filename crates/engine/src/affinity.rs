//! Affinity between old and new targets of one pool, inferred from the
//! current equivalence map. Only used during generation.

use marrow_image::types::{Offset, TargetKey};

use crate::equivalence::EquivalenceMap;

const NO_LABEL: u32 = 0;

#[derive(Clone, Copy, Default)]
struct Association {
    other: TargetKey,
    affinity: f64,
}

/// Computes and stores target associations for a single pool. For each
/// association, `affinity == 0.0` means none is defined; otherwise the
/// forward entry at `old_key` and the backward entry at `new_key` mirror
/// each other, enabling lookup from either side.
#[derive(Default)]
pub struct TargetsAffinity {
    forward_association: Vec<Association>,
    backward_association: Vec<Association>,
}

impl TargetsAffinity {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Infers affinities between `old_targets` and `new_targets` (both
    /// sorted targets of the same pool) using the similarities described by
    /// `equivalences`, replacing previous state.
    pub fn infer_from_similarities(
        &mut self,
        equivalences: &EquivalenceMap,
        old_targets: &[Offset],
        new_targets: &[Offset],
    ) {
        self.forward_association.clear();
        self.forward_association.resize(old_targets.len(), Association::default());
        self.backward_association.clear();
        self.backward_association.resize(new_targets.len(), Association::default());

        if old_targets.is_empty() || new_targets.is_empty() {
            return;
        }

        let mut new_key = 0usize;
        for candidate in equivalences.candidates() {
            // Candidates are sorted by |dst_offset|.
            debug_assert!(candidate.similarity > 0.0);
            while new_key < new_targets.len() && new_targets[new_key] < candidate.eq.dst_offset {
                new_key += 1;
            }

            // Visit each new target covered by the equivalence and find or
            // update its associated old target.
            while new_key < new_targets.len() && new_targets[new_key] < candidate.eq.dst_end() {
                if self.backward_association[new_key].affinity >= candidate.similarity {
                    new_key += 1;
                    continue;
                }

                debug_assert!(new_targets[new_key] >= candidate.eq.dst_offset);
                let old_target =
                    new_targets[new_key] - candidate.eq.dst_offset + candidate.eq.src_offset;
                // Multiple new targets may compete for one old target; the
                // heuristic maximizes similarity, with ties won by the lower
                // new target offset (first-come, first-served).
                if let Ok(old_key) = old_targets.binary_search(&old_target) {
                    if candidate.similarity > self.forward_association[old_key].affinity {
                        // Reset the two previous associations, if any.
                        if self.forward_association[old_key].affinity > 0.0 {
                            let other = self.forward_association[old_key].other as usize;
                            self.backward_association[other] = Association::default();
                        }
                        if self.backward_association[new_key].affinity > 0.0 {
                            let other = self.backward_association[new_key].other as usize;
                            self.forward_association[other] = Association::default();
                        }
                        self.forward_association[old_key] = Association {
                            other: new_key as TargetKey,
                            affinity: candidate.similarity,
                        };
                        self.backward_association[new_key] = Association {
                            other: old_key as TargetKey,
                            affinity: candidate.similarity,
                        };
                    }
                }
                new_key += 1;
            }
        }
    }

    /// Assigns labels (>= 1) to associated target pairs whose affinity is
    /// at least `min_affinity`; unassociated targets get label 0. Returns
    /// `(label_bound, old_labels, new_labels)`, where `label_bound` is the
    /// exclusive upper bound on assigned labels.
    #[must_use]
    pub fn assign_labels(&self, min_affinity: f64) -> (usize, Vec<u32>, Vec<u32>) {
        let mut old_labels = vec![NO_LABEL; self.forward_association.len()];
        let mut new_labels = vec![NO_LABEL; self.backward_association.len()];

        let mut label = NO_LABEL + 1;
        for (old_key, association) in self.forward_association.iter().enumerate() {
            if association.affinity >= min_affinity {
                old_labels[old_key] = label;
                debug_assert_eq!(new_labels[association.other as usize], NO_LABEL);
                new_labels[association.other as usize] = label;
                label += 1;
            }
        }
        (label as usize, old_labels, new_labels)
    }

    /// Affinity between the targets at `old_key` and `new_key`: positive if
    /// they are associated with each other, negative if either is claimed
    /// by a different association, and 0 if neither is associated.
    #[must_use]
    pub fn affinity_between(&self, old_key: TargetKey, new_key: TargetKey) -> f64 {
        let forward = self.forward_association[old_key as usize];
        let backward = self.backward_association[new_key as usize];
        if forward.affinity > 0.0 && forward.other == new_key {
            debug_assert_eq!(backward.other, old_key);
            debug_assert_eq!(forward.affinity, backward.affinity);
            return forward.affinity;
        }
        -forward.affinity.max(backward.affinity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marrow_image::types::{Equivalence, EquivalenceCandidate};

    fn map_of(candidates: Vec<EquivalenceCandidate>) -> EquivalenceMap {
        EquivalenceMap::from_candidates(candidates)
    }

    #[test]
    fn empty_equivalences_leave_all_unassociated() {
        let mut affinity = TargetsAffinity::new();
        affinity.infer_from_similarities(&map_of(vec![]), &[10, 20], &[15, 25]);
        let (bound, old_labels, new_labels) = affinity.assign_labels(1.0);
        assert_eq!(bound, 1);
        assert_eq!(old_labels, vec![0, 0]);
        assert_eq!(new_labels, vec![0, 0]);
        assert_eq!(affinity.affinity_between(0, 0), 0.0);
    }

    #[test]
    fn association_follows_equivalence_delta() {
        // Equivalence maps old [8, 24) onto new [0, 16): new target 4
        // corresponds to old target 12.
        let mut affinity = TargetsAffinity::new();
        let equivalences = map_of(vec![EquivalenceCandidate {
            eq: Equivalence { src_offset: 8, dst_offset: 0, length: 16 },
            similarity: 80.0,
        }]);
        affinity.infer_from_similarities(&equivalences, &[12, 100], &[4, 200]);
        assert_eq!(affinity.affinity_between(0, 0), 80.0);
        // Cross pairs are incompatible.
        assert!(affinity.affinity_between(0, 1) < 0.0);
        assert!(affinity.affinity_between(1, 0) < 0.0);
        assert_eq!(affinity.affinity_between(1, 1), 0.0);

        let (bound, old_labels, new_labels) = affinity.assign_labels(64.0);
        assert_eq!(bound, 2);
        assert_eq!(old_labels, vec![1, 0]);
        assert_eq!(new_labels, vec![1, 0]);
    }

    #[test]
    fn better_similarity_steals_association() {
        // Two new targets compete for old target 12; the second pair comes
        // from a higher-similarity equivalence and wins.
        let mut affinity = TargetsAffinity::new();
        let equivalences = map_of(vec![
            EquivalenceCandidate {
                eq: Equivalence { src_offset: 8, dst_offset: 0, length: 12 },
                similarity: 20.0,
            },
            EquivalenceCandidate {
                eq: Equivalence { src_offset: 4, dst_offset: 12, length: 16 },
                similarity: 90.0,
            },
        ]);
        // Via the first equivalence, new target 4 -> old 12 (affinity 20);
        // via the second, new target 20 -> 20 - 12 + 4 = 12 (affinity 90).
        affinity.infer_from_similarities(&equivalences, &[12], &[4, 20]);
        assert_eq!(affinity.affinity_between(0, 1), 90.0);
        assert!(affinity.affinity_between(0, 0) < 0.0);

        let (_, old_labels, new_labels) = affinity.assign_labels(64.0);
        assert_eq!(old_labels, vec![1]);
        assert_eq!(new_labels, vec![0, 1]);
    }

    #[test]
    fn labels_respect_min_affinity() {
        let mut affinity = TargetsAffinity::new();
        let equivalences = map_of(vec![EquivalenceCandidate {
            eq: Equivalence { src_offset: 0, dst_offset: 0, length: 32 },
            similarity: 63.0,
        }]);
        affinity.infer_from_similarities(&equivalences, &[8], &[8]);
        assert_eq!(affinity.affinity_between(0, 0), 63.0);
        // Below the label threshold: association exists but is unlabeled.
        let (bound, old_labels, new_labels) = affinity.assign_labels(64.0);
        assert_eq!(bound, 1);
        assert_eq!(old_labels, vec![0]);
        assert_eq!(new_labels, vec![0]);
    }
}
