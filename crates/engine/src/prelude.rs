//! Convenience re-exports for the most commonly used items.

pub use crate::apply::apply_buffer;
pub use crate::gen::{generate_buffer, generate_buffer_imposed, generate_buffer_raw};
pub use crate::index::{ImageIndex, ReferenceSet, TargetPool};
pub use crate::matcher::{EnsembleMatcher, HeuristicEnsembleMatcher, ImposedEnsembleMatcher};
pub use crate::Status;
