//! Convenience re-exports for the most commonly used items.

pub use crate::format::{PatchHeader, PatchElementHeader, RawDeltaUnit, MAJOR_VERSION, PATCH_MAGIC};
pub use crate::reader::{
    EnsemblePatchReader, EquivalenceSource, ExtraDataSource, PatchElementReader, RawDeltaSource,
    ReferenceDeltaSource, TargetSource,
};
pub use crate::writer::{
    EnsemblePatchWriter, EquivalenceSink, ExtraDataSink, PatchElementWriter, RawDeltaSink,
    ReferenceDeltaSink, TargetSink,
};
pub use crate::{Error, Result};
