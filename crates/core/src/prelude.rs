//! Convenience re-exports for the most commonly used items.

pub use crate::buffer::{BufferRegion, BufferSink, BufferSource};
pub use crate::crc32::crc32;
pub use crate::suffix_array::{induced_suffix_sort, suffix_lower_bound};
pub use crate::{buffer, util, varint};
