//! 384-bit identifier algebra.

mod bitmap;
mod range;

pub(crate) use self::bitmap::byte_array;
pub use self::{
    bitmap::{Bitmap, BitmapError, NUM_BITS, NUM_BYTES},
    range::Range,
};
