//! Annotated image storage: per-byte type tags, reference sets per type,
//! and target pools per pool tag.
//!
//! The memory overhead of storing all references is relatively high, so
//! these containers are only used during patch generation (and briefly
//! during reference correction at apply time, for target pools).

use std::collections::BTreeMap;

use marrow_core::util::range_is_bounded;
use marrow_disasm::Disassembler;
use marrow_image::prelude::*;

use crate::equivalence::OffsetMapper;

/// Ordered container of the distinct targets shared by one pool, with the
/// reference types associated to it. Supports key <-> offset translation,
/// where a key is the index of a target in the sorted sequence.
#[derive(Clone, Debug, Default)]
pub struct TargetPool {
    types: Vec<TypeTag>,
    targets: Vec<Offset>, // Sorted and unique.
}

impl TargetPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Initializes the pool with `targets`, which must be sorted and unique.
    #[must_use]
    pub fn with_targets(targets: Vec<Offset>) -> Self {
        debug_assert!(targets.windows(2).all(|pair| pair[0] < pair[1]));
        Self { types: Vec::new(), targets }
    }

    /// Adds `type_tag` as a reference type associated with this pool.
    pub fn add_type(&mut self, type_tag: TypeTag) {
        self.types.push(type_tag);
    }

    /// Inserts new targets; invalidates all previous key lookups. Sorting
    /// and deduplication happen after every batch, which favors peak-memory
    /// reduction over insertion speed.
    pub fn insert_targets(&mut self, targets: impl IntoIterator<Item = Offset>) {
        self.targets.extend(targets);
        self.targets.sort_unstable();
        self.targets.dedup();
    }

    /// Inserts the targets of all references produced by `reader`.
    pub fn insert_targets_from_reader(&mut self, reader: &mut dyn ReferenceReader) {
        while let Some(reference) = reader.next_ref() {
            self.targets.push(reference.target);
        }
        self.targets.sort_unstable();
        self.targets.dedup();
    }

    /// Returns the key of the target at `offset`, which must be present.
    #[must_use]
    pub fn key_for_offset(&self, offset: Offset) -> TargetKey {
        let pos = self.targets.partition_point(|&target| target < offset);
        debug_assert!(self.targets.get(pos) == Some(&offset));
        pos as TargetKey
    }

    /// Returns the key of the target nearest to `offset`. If the two
    /// bracketing targets are equidistant, prefers the lower key.
    #[must_use]
    pub fn key_for_nearest_offset(&self, offset: Offset) -> TargetKey {
        let mut pos = self.targets.partition_point(|&target| target < offset);
        if pos > 0
            && (pos == self.targets.len() || self.targets[pos] - offset >= offset - self.targets[pos - 1])
        {
            pos -= 1;
        }
        pos as TargetKey
    }

    #[inline]
    #[must_use]
    pub fn offset_for_key(&self, key: TargetKey) -> Offset {
        self.targets[key as usize]
    }

    #[inline]
    #[must_use]
    pub fn key_is_valid(&self, key: i64) -> bool {
        key >= 0 && (key as usize) < self.targets.len()
    }

    /// Transforms "old" targets into "new" targets through `offset_mapper`,
    /// dropping targets not covered by any equivalence. The result is sorted
    /// and unique.
    pub fn filter_and_project(&mut self, offset_mapper: &OffsetMapper) {
        offset_mapper.forward_project_all(&mut self.targets);
        self.targets.sort_unstable();
    }

    #[inline]
    #[must_use]
    pub fn types(&self) -> &[TypeTag] {
        &self.types
    }

    #[inline]
    #[must_use]
    pub fn targets(&self) -> &[Offset] {
        &self.targets
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Container of the distinct references of one type, sorted by location.
#[derive(Debug)]
pub struct ReferenceSet {
    traits: ReferenceTypeTraits,
    references: Vec<Reference>,
}

impl ReferenceSet {
    #[must_use]
    pub fn new(traits: ReferenceTypeTraits) -> Self {
        Self { traits, references: Vec::new() }
    }

    /// Drains `reader`, which must emit references in ascending location
    /// order, into this set.
    pub fn init_from_reader(&mut self, reader: &mut dyn ReferenceReader) {
        debug_assert!(self.references.is_empty());
        while let Some(reference) = reader.next_ref() {
            self.references.push(reference);
        }
        debug_assert!(self
            .references
            .windows(2)
            .all(|pair| pair[0].location < pair[1].location));
    }

    /// Looks up the reference whose body spans `offset`, which must be
    /// covered by some reference in this set.
    #[must_use]
    pub fn at(&self, offset: Offset) -> Reference {
        let pos = self.references.partition_point(|reference| reference.location <= offset);
        debug_assert!(pos > 0);
        let reference = self.references[pos - 1];
        debug_assert!(offset < reference.location + self.width());
        reference
    }

    #[inline]
    #[must_use]
    pub fn traits(&self) -> &ReferenceTypeTraits {
        &self.traits
    }

    #[inline]
    #[must_use]
    pub fn type_tag(&self) -> TypeTag {
        self.traits.type_tag
    }

    #[inline]
    #[must_use]
    pub fn pool_tag(&self) -> PoolTag {
        self.traits.pool_tag
    }

    #[inline]
    #[must_use]
    pub fn width(&self) -> Offset {
        self.traits.width
    }

    #[inline]
    #[must_use]
    pub fn references(&self) -> &[Reference] {
        &self.references
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.references.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }
}

/// Annotations of one image: its bytes, a per-byte type tag array, the
/// reference sets keyed by type tag, and the target pools keyed by pool
/// tag. Invariant: a byte is either raw (`NO_TYPE_TAG`) or covered by
/// exactly one reference, whose type it carries.
pub struct ImageIndex<'a> {
    image: &'a [u8],
    // Random-access lookup of reference type for each image byte.
    type_tags: Vec<TypeTag>,
    reference_sets: BTreeMap<TypeTag, ReferenceSet>,
    target_pools: BTreeMap<PoolTag, TargetPool>,
}

impl<'a> ImageIndex<'a> {
    #[must_use]
    pub fn new(image: &'a [u8]) -> Self {
        Self {
            image,
            type_tags: vec![NO_TYPE_TAG; image.len()],
            reference_sets: BTreeMap::new(),
            target_pools: BTreeMap::new(),
        }
    }

    /// Inserts all references read from `disasm`. Must be called at most
    /// once. Returns false (leaving the index invalid) if any two reference
    /// bodies overlap.
    pub fn initialize(&mut self, disasm: &dyn Disassembler) -> bool {
        let groups = disasm.reference_groups();
        // First pass: build the pool-to-type mapping and collect targets.
        for traits in &groups {
            debug_assert!(traits.pool_tag != NO_POOL_TAG);
            let pool = self.target_pools.entry(traits.pool_tag).or_default();
            pool.add_type(traits.type_tag);
            let mut reader =
                disasm.make_reader(traits.type_tag, self.image, 0, self.image.len() as Offset);
            pool.insert_targets_from_reader(&mut *reader);
        }
        // Second pass: store references per type and paint the type array,
        // checking for overlap.
        for traits in &groups {
            if !self.insert_references(traits, disasm) {
                return false;
            }
        }
        true
    }

    fn insert_references(&mut self, traits: &ReferenceTypeTraits, disasm: &dyn Disassembler) -> bool {
        debug_assert!(traits.type_tag != NO_TYPE_TAG);
        let mut set = ReferenceSet::new(*traits);
        {
            let mut reader =
                disasm.make_reader(traits.type_tag, self.image, 0, self.image.len() as Offset);
            set.init_from_reader(&mut *reader);
        }
        for reference in set.references() {
            debug_assert!(range_is_bounded(
                reference.location.into(),
                traits.width.into(),
                self.image.len() as u64
            ));
            let body = reference.location as usize..(reference.location + traits.width) as usize;
            if self.type_tags[body.clone()].iter().any(|&tag| tag != NO_TYPE_TAG) {
                return false;
            }
            self.type_tags[body].fill(traits.type_tag);
        }
        self.reference_sets.insert(traits.type_tag, set);
        true
    }

    /// Array size needed to accommodate all type tag values.
    #[must_use]
    pub fn type_count(&self) -> usize {
        match self.reference_sets.keys().next_back() {
            Some(tag) => tag.value() as usize + 1,
            None => 0,
        }
    }

    /// Array size needed to accommodate all pool tag values.
    #[must_use]
    pub fn pool_count(&self) -> usize {
        match self.target_pools.keys().next_back() {
            Some(tag) => tag.value() as usize + 1,
            None => 0,
        }
    }

    /// Whether `location` is a raw value or the first byte of a reference.
    #[must_use]
    pub fn is_token(&self, location: Offset) -> bool {
        let type_tag = self.lookup_type(location);
        if type_tag == NO_TYPE_TAG {
            return true;
        }
        // Only the first byte of a reference is a token.
        self.refs(type_tag).at(location).location == location
    }

    /// Whether `location` is part of a reference.
    #[inline]
    #[must_use]
    pub fn is_reference(&self, location: Offset) -> bool {
        self.lookup_type(location) != NO_TYPE_TAG
    }

    /// The type tag of the reference covering `location`, or `NO_TYPE_TAG`.
    #[inline]
    #[must_use]
    pub fn lookup_type(&self, location: Offset) -> TypeTag {
        self.type_tags[location as usize]
    }

    #[inline]
    #[must_use]
    pub fn raw_value(&self, location: Offset) -> u8 {
        self.image[location as usize]
    }

    #[inline]
    #[must_use]
    pub fn image(&self) -> &'a [u8] {
        self.image
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.image.len()
    }

    #[inline]
    #[must_use]
    pub fn refs(&self, type_tag: TypeTag) -> &ReferenceSet {
        &self.reference_sets[&type_tag]
    }

    #[inline]
    #[must_use]
    pub fn pool(&self, pool_tag: PoolTag) -> &TargetPool {
        &self.target_pools[&pool_tag]
    }

    #[inline]
    #[must_use]
    pub fn reference_sets(&self) -> &BTreeMap<TypeTag, ReferenceSet> {
        &self.reference_sets
    }

    #[inline]
    #[must_use]
    pub fn target_pools(&self) -> &BTreeMap<PoolTag, TargetPool> {
        &self.target_pools
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_pool_key_lookups() {
        let pool = TargetPool::with_targets(vec![10, 20, 30]);
        assert_eq!(pool.key_for_offset(10), 0);
        assert_eq!(pool.key_for_offset(30), 2);
        assert_eq!(pool.offset_for_key(1), 20);

        assert_eq!(pool.key_for_nearest_offset(0), 0);
        assert_eq!(pool.key_for_nearest_offset(14), 0);
        // Equidistant: prefer the lower key.
        assert_eq!(pool.key_for_nearest_offset(15), 0);
        assert_eq!(pool.key_for_nearest_offset(16), 1);
        assert_eq!(pool.key_for_nearest_offset(99), 2);

        assert!(pool.key_is_valid(0));
        assert!(pool.key_is_valid(2));
        assert!(!pool.key_is_valid(3));
        assert!(!pool.key_is_valid(-1));
    }

    #[test]
    fn target_pool_insert_dedups() {
        let mut pool = TargetPool::new();
        pool.insert_targets([30u32, 10, 20, 10]);
        assert_eq!(pool.targets(), &[10, 20, 30]);
        pool.insert_targets([20u32, 40]);
        assert_eq!(pool.targets(), &[10, 20, 30, 40]);
    }

    #[test]
    fn reference_set_lookup_by_covered_offset() {
        let traits = ReferenceTypeTraits::new(4, TypeTag(0), PoolTag(0));
        let mut set = ReferenceSet::new(traits);
        struct FixedReader(Vec<Reference>, usize);
        impl ReferenceReader for FixedReader {
            fn next_ref(&mut self) -> Option<Reference> {
                let reference = self.0.get(self.1).copied();
                self.1 += 1;
                reference
            }
        }
        let refs = vec![
            Reference { location: 4, target: 100 },
            Reference { location: 12, target: 200 },
        ];
        set.init_from_reader(&mut FixedReader(refs, 0));
        assert_eq!(set.at(4).target, 100);
        assert_eq!(set.at(7).target, 100);
        assert_eq!(set.at(12).target, 200);
        assert_eq!(set.at(15).target, 200);
    }

    #[test]
    fn image_index_paints_reference_bodies() {
        use marrow_disasm::pe::{win32_type, DisassemblerWin32X86};

        let image = crate::testing::build_pe32();
        let disasm = DisassemblerWin32X86::parse(&image).expect("parse");
        let mut index = ImageIndex::new(&image);
        assert!(index.initialize(&disasm));

        assert_eq!(index.type_count(), 3);
        assert_eq!(index.pool_count(), 3);

        // Reloc body at [0x508, 0x50A).
        assert_eq!(index.lookup_type(0x508), win32_type::RELOC);
        assert_eq!(index.lookup_type(0x509), win32_type::RELOC);
        assert_eq!(index.lookup_type(0x50A), NO_TYPE_TAG);
        // Abs32 body at [0x410, 0x414), rel32 body at [0x401, 0x405).
        assert_eq!(index.lookup_type(0x410), win32_type::ABS32);
        assert_eq!(index.lookup_type(0x403), win32_type::REL32);

        // Tokens: raw bytes and first bytes of references only.
        assert!(index.is_token(0x400));
        assert!(index.is_token(0x401));
        assert!(!index.is_token(0x402));
        assert!(index.is_token(0x410));
        assert!(!index.is_token(0x413));

        // Reference-set non-overlap: each byte has exactly one owner, and
        // bodies are consistent with their sets.
        for set in index.reference_sets().values() {
            for reference in set.references() {
                for i in 0..set.width() {
                    assert_eq!(index.lookup_type(reference.location + i), set.type_tag());
                }
            }
        }

        // Pools aggregate the targets of their types.
        assert_eq!(index.pool(win32_type::ABS32_POOL).targets(), &[0x420]);
        assert_eq!(index.pool(win32_type::RELOC_POOL).targets(), &[0x410]);
        assert_eq!(index.pool(win32_type::REL32_POOL).targets(), &[0x415]);
    }

}
