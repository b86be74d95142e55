//! Convenience re-exports for the most commonly used items.

pub use crate::translator::AddressTranslator;
pub use crate::types::*;
