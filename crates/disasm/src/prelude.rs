//! Convenience re-exports for the most commonly used items.

pub use crate::detect::{
    detect_element, disassembler_version_of, make_disassembler, make_disassembler_of_type,
    ElementFinder, MIN_PROGRAM_SIZE,
};
pub use crate::noop::DisassemblerNoOp;
pub use crate::Disassembler;
