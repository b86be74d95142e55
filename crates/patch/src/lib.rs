//! The patch container: a 24-byte header followed by patch elements, each
//! holding varint-encoded streams of equivalences, extra data, raw deltas,
//! reference deltas, and per-pool extra targets.
//!
//! A patch is written once through the sink types in [`writer`] and read
//! through the source types in [`reader`]; streams are decoded strictly in
//! their declared order. The container applies no compression of its own
//! beyond varints — the stream is designed to be fed to a generic
//! compressor externally.

use snafu::prelude::*;

pub mod format;
pub mod reader;
pub mod writer;

pub mod prelude;

/// Error conditions for reading or writing patches.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The patch data end before a read completes.
    #[snafu(display("Patch data truncated!"))]
    Truncated,
    /// The header magic is not `Zucc`.
    #[snafu(display("Invalid patch magic!"))]
    BadMagic,
    /// The major version does not match this binary's.
    #[snafu(display("Unsupported patch version!"))]
    BadVersion,
    /// An element names an unknown executable type.
    #[snafu(display("Invalid executable type!"))]
    BadExeType,
    /// An element's geometry is inconsistent (empty ranges, out of image
    /// bounds, or not tiling the new image).
    #[snafu(display("Invalid patch element!"))]
    BadElement,
    /// Equivalences are malformed (out of bounds, out of order, or the
    /// extra data size disagrees).
    #[snafu(display("Invalid equivalence stream!"))]
    BadEquivalences,
    /// A per-pool extra-target list names an invalid or duplicate pool.
    #[snafu(display("Invalid pool tag!"))]
    BadPoolTag,
    /// Data remain after the last element.
    #[snafu(display("Patch not fully consumed!"))]
    TrailingData,
}

pub type Result<T> = core::result::Result<T, Error>;

impl From<marrow_core::buffer::Error> for Error {
    #[inline]
    fn from(_: marrow_core::buffer::Error) -> Self {
        Self::Truncated
    }
}
