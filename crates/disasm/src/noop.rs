//! The no-op disassembler: accepts any file and finds no references. Used
//! for raw-mode patching and for the gaps between matched elements.

use marrow_image::prelude::*;

use crate::Disassembler;

pub struct DisassemblerNoOp {
    size: usize,
}

impl DisassemblerNoOp {
    pub const VERSION: u16 = 1;

    #[must_use]
    pub fn parse(image: &[u8]) -> Option<Self> {
        Some(Self { size: image.len() })
    }
}

impl Disassembler for DisassemblerNoOp {
    fn exe_type(&self) -> ExecutableType {
        ExecutableType::NoOp
    }

    fn description(&self) -> &'static str {
        "(Unknown)"
    }

    fn version(&self) -> u16 {
        Self::VERSION
    }

    fn size(&self) -> usize {
        self.size
    }

    // 1 iteration, since no references are present.
    fn num_equivalence_iterations(&self) -> u8 {
        1
    }

    fn reference_groups(&self) -> Vec<ReferenceTypeTraits> {
        Vec::new()
    }

    fn make_reader<'a>(
        &'a self,
        _type_tag: TypeTag,
        _image: &'a [u8],
        _lo: Offset,
        _hi: Offset,
    ) -> Box<dyn ReferenceReader + 'a> {
        Box::new(EmptyReferenceReader)
    }

    fn make_writer<'a>(
        &'a self,
        _type_tag: TypeTag,
        _image: &'a mut [u8],
    ) -> Box<dyn ReferenceWriter + 'a> {
        Box::new(EmptyReferenceWriter)
    }

    fn make_mixer<'a>(
        &'a self,
        _type_tag: TypeTag,
        _old_image: &'a [u8],
        _new_image: &'a [u8],
    ) -> Option<Box<dyn ReferenceMixer + 'a>> {
        None
    }
}
