//! Vocabulary types shared by everything that reasons about executable
//! images: offsets and RVAs, typed references and their tags, equivalences,
//! executable type codes, embedded elements, and the offset/RVA address
//! translator.

pub mod translator;
pub mod types;

pub mod prelude;
