//! Format-aware parsers that identify the references inside an executable
//! image: relocation table entries, absolute pointers (abs32), and relative
//! displacements (rel32).
//!
//! Each format implements [`Disassembler`], which exposes a uniform view:
//! a list of reference groups (one per reference type, aggregated by pool),
//! and factories for readers, writers, and — on architectures where
//! operation and payload bits share bytes — mixers. Disassemblers parse
//! eagerly and keep only derived metadata (sections, address translator,
//! sorted location lists), never a borrow of the image, so writers can take
//! the image mutably.

use marrow_image::types::{
    ExecutableType, Offset, ReferenceMixer, ReferenceReader, ReferenceTypeTraits,
    ReferenceWriter, TypeTag,
};

pub mod abs32;
pub mod arm;
pub mod detect;
pub mod elf;
pub mod noop;
pub mod pe;
pub mod rel32;
pub mod reloc;

pub mod prelude;

/// Uniform interface over the supported executable formats.
///
/// `image` arguments passed to the factories must be the same image (or a
/// same-sized copy being patched) that `parse` accepted; `lo`/`hi` restrict
/// readers to references whose bodies lie entirely within `[lo, hi)`.
pub trait Disassembler {
    /// The executable type handled by this disassembler.
    fn exe_type(&self) -> ExecutableType;

    /// Human-readable description of the executable type.
    fn description(&self) -> &'static str;

    /// Version of this disassembler, stored in patches to reject
    /// format-incompatible input.
    fn version(&self) -> u16;

    /// Size of the recognized executable: the image prefix claimed by the
    /// parsed sections. Content beyond this is not patched format-aware.
    fn size(&self) -> usize;

    /// Number of equivalence-map refinement iterations to run; roughly the
    /// maximum length of reference indirection chains (reloc -> abs32).
    fn num_equivalence_iterations(&self) -> u8;

    /// All reference types, aggregated by pool.
    fn reference_groups(&self) -> Vec<ReferenceTypeTraits>;

    /// Returns a reader over references of one type whose bodies lie in
    /// `[lo, hi)`, emitted in ascending location order.
    fn make_reader<'a>(
        &'a self,
        type_tag: TypeTag,
        image: &'a [u8],
        lo: Offset,
        hi: Offset,
    ) -> Box<dyn ReferenceReader + 'a>;

    /// Returns a writer that overwrites references of one type in `image`.
    fn make_writer<'a>(
        &'a self,
        type_tag: TypeTag,
        image: &'a mut [u8],
    ) -> Box<dyn ReferenceWriter + 'a>;

    /// Returns a mixer for one reference type, or `None` where bytewise
    /// diffing can treat operation and payload bytes independently.
    fn make_mixer<'a>(
        &'a self,
        type_tag: TypeTag,
        old_image: &'a [u8],
        new_image: &'a [u8],
    ) -> Option<Box<dyn ReferenceMixer + 'a>>;
}
