use super::Bitmap;
use std::fmt;

/// Closed interval `[start, end]` of bitmaps.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Range {
    pub start: Bitmap,
    pub end: Bitmap,
}

impl Range {
    pub fn new(start: Bitmap, end: Bitmap) -> Self {
        Self { start, end }
    }

    /// The whole 384-bit space.
    pub fn max_range() -> Self {
        Self::new(Bitmap::ZERO, Bitmap::MAX)
    }

    pub fn contains(&self, bitmap: &Bitmap) -> bool {
        self.start <= *bitmap && *bitmap <= self.end
    }

    /// Splits the range into `num` contiguous pieces of near-equal size and returns the n-th
    /// (1-indexed). The first piece starts at `start` and the last one ends at `end`.
    ///
    /// Panics if `num < 1`, `n < 1` or `n > num`.
    pub fn interval_p(&self, n: usize, num: usize) -> Range {
        assert!(
            num >= 1 && n >= 1 && n <= num,
            "invalid interval {} of {}",
            n,
            num
        );

        let start = self.interval_start(n, num);
        let end = if n < num {
            self.interval_start(n + 1, num) - Bitmap::from(1u128)
        } else {
            self.end
        };

        Range::new(start, end)
    }

    // start + size*(n-1) + (rem*(n-1)) % num, where size and rem are the quotient and
    // remainder of (end - start) / num.
    fn interval_start(&self, n: usize, num: usize) -> Bitmap {
        let (size, rem) = (self.end - self.start).div_rem_u64(num as u64);
        let offset = size
            .checked_mul_u64((n - 1) as u64)
            .expect("interval offset overflowed");
        let rem = (rem as u128 * (n - 1) as u128) % num as u128;

        self.start + offset + Bitmap::from(rem)
    }
}

impl fmt::Debug for Range {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}, {}]", self.start.hex_short(), self.end.hex_short())
    }
}
