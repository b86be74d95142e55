//! Projection of an annotated image onto an abstract alphabet, for
//! suffix-array search.
//!
//! Generation performs semantics-aware matching: same-typed reference
//! targets in "old" and "new" can be associated, and associated targets get
//! an identifier called a "label" (0 = unassociated). Each offset projects
//! to:
//! * the raw byte value (0-255) for non-references;
//! * a padding marker (256) for the trailing bytes of a reference body;
//! * a value (>= 257) derived from the target's label and the reference's
//!   type, for the first byte of a reference.
//!
//! References with associated targets therefore compare equal under the
//! projection, which is what lets the equivalence search treat them as
//! matching content.

use marrow_image::types::{Offset, PoolTag, NO_TYPE_TAG};

use crate::index::ImageIndex;

/// Projection of all trailing reference-body bytes.
pub const REFERENCE_PADDING_PROJECTION: u32 = 256;
/// Smallest projection of a reference's first byte.
pub const BASE_REFERENCE_PROJECTION: u32 = 257;

#[derive(Default)]
struct PoolInfo {
    // Translates a pool's target key to its label.
    labels: Vec<u32>,
    bound: usize,
}

/// Adapts an [`ImageIndex`] to appear as encoded data under a higher level
/// of abstraction than raw bytes.
pub struct EncodedView<'a> {
    image_index: &'a ImageIndex<'a>,
    pool_infos: Vec<PoolInfo>,
}

impl<'a> EncodedView<'a> {
    /// `image_index` must remain valid for the lifetime of the view.
    #[must_use]
    pub fn new(image_index: &'a ImageIndex<'a>) -> Self {
        let mut pool_infos = Vec::new();
        pool_infos.resize_with(image_index.pool_count(), PoolInfo::default);
        Self { image_index, pool_infos }
    }

    /// Projects `location` to a scalar describing the content at a higher
    /// level of abstraction.
    #[must_use]
    pub fn projection(&self, location: Offset) -> u32 {
        let type_tag = self.image_index.lookup_type(location);
        if type_tag == NO_TYPE_TAG {
            // The projection is the identity on raw content.
            return u32::from(self.image_index.raw_value(location));
        }

        let ref_set = self.image_index.refs(type_tag);
        let reference = ref_set.at(location);
        debug_assert!(location >= reference.location);
        debug_assert!(location < reference.location + ref_set.width());

        if location != reference.location {
            // Trailing bytes of a reference all project to the same value.
            return REFERENCE_PADDING_PROJECTION;
        }

        let pool_tag = ref_set.pool_tag();
        let target_pool = self.image_index.pool(pool_tag);
        let pool_info = &self.pool_infos[pool_tag.value() as usize];
        debug_assert_eq!(target_pool.len(), pool_info.labels.len());
        let label = pool_info.labels[target_pool.key_for_offset(reference.target) as usize];

        // Project on (label, type), shifted to avoid colliding with raw
        // content and padding.
        let projection =
            u64::from(label) * self.image_index.type_count() as u64 + u64::from(type_tag.value());
        (projection + u64::from(BASE_REFERENCE_PROJECTION)) as u32
    }

    /// Materializes the projection of the whole image, as input for suffix
    /// sorting and suffix comparisons.
    #[must_use]
    pub fn projected(&self) -> Vec<u32> {
        (0..self.size() as Offset).map(|location| self.projection(location)).collect()
    }

    #[inline]
    #[must_use]
    pub fn is_token(&self, location: Offset) -> bool {
        self.image_index.is_token(location)
    }

    /// Upper bound on values returned by [`projection`](Self::projection).
    #[must_use]
    pub fn cardinality(&self) -> usize {
        let max_bound = self.pool_infos.iter().map(|info| info.bound).max().unwrap_or(0);
        max_bound * self.image_index.type_count() + BASE_REFERENCE_PROJECTION as usize
    }

    /// Associates `labels` (keyed by target key, all `< bound`) to the
    /// targets of `pool`, replacing any previous association.
    pub fn set_labels(&mut self, pool: PoolTag, labels: Vec<u32>, bound: usize) {
        debug_assert_eq!(labels.len(), self.image_index.pool(pool).len());
        debug_assert!(labels.iter().all(|&label| (label as usize) < bound));
        self.pool_infos[pool.value() as usize].labels = labels;
        self.pool_infos[pool.value() as usize].bound = bound;
    }

    #[inline]
    #[must_use]
    pub fn image_index(&self) -> &'a ImageIndex<'a> {
        self.image_index
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.image_index.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_image_projects_to_bytes() {
        let image = vec![5u8, 255, 0, 42];
        let index = ImageIndex::new(&image);
        let view = EncodedView::new(&index);
        assert_eq!(view.projected(), vec![5, 255, 0, 42]);
        assert_eq!(view.cardinality(), 257);
        assert!(view.is_token(0));
    }
}
