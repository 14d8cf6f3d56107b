use rand::{
    distributions::{Distribution, Standard},
    Rng,
};
use serde::{Deserialize, Serialize};
use std::{
    convert::{TryFrom, TryInto},
    fmt,
    ops::{Add, BitAnd, BitOr, BitXor, Not, Sub},
    str::FromStr,
};
use thiserror::Error;

/// Length of a bitmap in bytes.
pub const NUM_BYTES: usize = 48;

/// Length of a bitmap in bits.
pub const NUM_BITS: usize = NUM_BYTES * 8;

/// Number of bytes rendered by [`Bitmap::hex_short`].
const SHORT_HEX_BYTES: usize = 4;

/// 384-bit value used for node ids, blob hashes and XOR distances.
///
/// Ordering is lexicographic over the bytes, which is the same as comparing the values as
/// big-endian unsigned integers.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Bitmap(#[serde(with = "byte_array")] [u8; NUM_BYTES]);

impl Bitmap {
    /// All bits zero.
    pub const ZERO: Bitmap = Bitmap([0; NUM_BYTES]);

    /// All bits one.
    pub const MAX: Bitmap = Bitmap([0xff; NUM_BYTES]);

    /// Cryptographically secure random bitmap.
    pub fn rand() -> Self {
        rand::thread_rng().gen()
    }

    /// Random bitmap between `low` and `high` (inclusive).
    ///
    /// Samples the whole space and folds the sample down by repeatedly subtracting
    /// `high - low`. The result is slightly biased towards the low end of the range and this
    /// bias is part of the observable behavior.
    pub fn rand_in_range(low: Bitmap, high: Bitmap) -> Self {
        let diff = high - low;
        if diff.is_zero() {
            return low;
        }

        let mut sample = Self::rand();
        while sample > diff {
            sample = sample - diff;
        }

        sample + low
    }

    pub fn from_hex(hex: &str) -> Result<Self, BitmapError> {
        let bytes = hex::decode(hex)?;
        Self::try_from(bytes.as_slice())
    }

    /// Parse a possibly shortened hex string. Missing leading digits are treated as zeros.
    pub fn from_short_hex(hex: &str) -> Result<Self, BitmapError> {
        if hex.len() > NUM_BYTES * 2 {
            return Err(BitmapError::Length(hex.len() / 2));
        }

        Self::from_hex(&format!("{:0>width$}", hex, width = NUM_BYTES * 2))
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Hex of the first few bytes, enough to tell ids apart in logs.
    pub fn hex_short(&self) -> String {
        hex::encode(&self.0[..SHORT_HEX_BYTES])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|byte| *byte == 0)
    }

    /// Number of leading zero bits. The zero bitmap has `NUM_BITS` of them.
    pub fn prefix_len(&self) -> usize {
        let mut bits = 0;

        for byte in self.0 {
            bits += byte.leading_zeros() as usize;

            if byte != 0 {
                break;
            }
        }

        bits
    }

    /// Returns true if `x` is closer to `self` than `y` is.
    pub fn closer(&self, x: &Bitmap, y: &Bitmap) -> bool {
        (*x ^ *self) < (*y ^ *self)
    }

    /// Value of bit `n`, where bit 0 is the most significant one.
    ///
    /// Panics if `n` is out of bounds.
    pub fn get(&self, n: usize) -> bool {
        self.0[n / 8] & (1 << (7 - n % 8)) != 0
    }

    /// Copy with bit `n` set to `one`.
    ///
    /// Panics if `n` is out of bounds.
    pub fn set(mut self, n: usize, one: bool) -> Self {
        set_bit(&mut self.0, n, one);
        self
    }

    /// Copy with the first `n` bits forced to `one`.
    pub fn prefix(mut self, n: usize, one: bool) -> Self {
        for i in 0..n.min(NUM_BITS) {
            set_bit(&mut self.0, i, one);
        }
        self
    }

    /// Copy with the last `n` bits forced to `one`.
    pub fn suffix(mut self, n: usize, one: bool) -> Self {
        for i in NUM_BITS - n.min(NUM_BITS)..NUM_BITS {
            set_bit(&mut self.0, i, one);
        }
        self
    }

    pub fn checked_add(&self, other: &Bitmap) -> Option<Bitmap> {
        let mut out = [0u8; NUM_BYTES];
        let mut carry = 0u16;

        for i in (0..NUM_BYTES).rev() {
            let sum = self.0[i] as u16 + other.0[i] as u16 + carry;
            out[i] = sum as u8;
            carry = sum >> 8;
        }

        (carry == 0).then_some(Bitmap(out))
    }

    pub fn checked_sub(&self, other: &Bitmap) -> Option<Bitmap> {
        let mut out = [0u8; NUM_BYTES];
        let mut borrow = 0i16;

        for i in (0..NUM_BYTES).rev() {
            let mut diff = self.0[i] as i16 - other.0[i] as i16 - borrow;
            borrow = 0;
            if diff < 0 {
                diff += 256;
                borrow = 1;
            }
            out[i] = diff as u8;
        }

        (borrow == 0).then_some(Bitmap(out))
    }

    pub(crate) fn checked_mul_u64(&self, factor: u64) -> Option<Bitmap> {
        let mut out = [0u8; NUM_BYTES];
        let mut carry = 0u128;

        for i in (0..NUM_BYTES).rev() {
            let product = self.0[i] as u128 * factor as u128 + carry;
            out[i] = product as u8;
            carry = product >> 8;
        }

        (carry == 0).then_some(Bitmap(out))
    }

    /// Quotient and remainder of the division by `divisor`.
    ///
    /// Panics if `divisor` is zero.
    pub(crate) fn div_rem_u64(&self, divisor: u64) -> (Bitmap, u64) {
        assert!(divisor != 0, "bitmap division by zero");

        let divisor = divisor as u128;
        let mut out = [0u8; NUM_BYTES];
        let mut rem = 0u128;

        for (byte, dst) in self.0.iter().zip(out.iter_mut()) {
            let acc = (rem << 8) | *byte as u128;
            *dst = (acc / divisor) as u8;
            rem = acc % divisor;
        }

        (Bitmap(out), rem as u64)
    }
}

fn set_bit(bytes: &mut [u8; NUM_BYTES], n: usize, one: bool) {
    let mask = 1 << (7 - n % 8);
    if one {
        bytes[n / 8] |= mask;
    } else {
        bytes[n / 8] &= !mask;
    }
}

#[derive(Debug, Error)]
pub enum BitmapError {
    #[error("invalid bitmap length ({0} bytes)")]
    Length(usize),
    #[error("invalid hex string")]
    Hex(#[from] hex::FromHexError),
}

impl AsRef<[u8]> for Bitmap {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Bitmap> for [u8; NUM_BYTES] {
    fn from(bitmap: Bitmap) -> [u8; NUM_BYTES] {
        bitmap.0
    }
}

impl From<[u8; NUM_BYTES]> for Bitmap {
    fn from(bytes: [u8; NUM_BYTES]) -> Bitmap {
        Self(bytes)
    }
}

impl From<u128> for Bitmap {
    fn from(value: u128) -> Bitmap {
        let mut bytes = [0u8; NUM_BYTES];
        bytes[NUM_BYTES - 16..].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }
}

impl<'a> TryFrom<&'a [u8]> for Bitmap {
    type Error = BitmapError;

    fn try_from(slice: &'a [u8]) -> Result<Self, Self::Error> {
        Ok(Self(
            slice
                .try_into()
                .map_err(|_| BitmapError::Length(slice.len()))?,
        ))
    }
}

impl FromStr for Bitmap {
    type Err = BitmapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl BitXor for Bitmap {
    type Output = Self;

    fn bitxor(mut self, rhs: Self) -> Self {
        for (src, dst) in rhs.0.iter().zip(self.0.iter_mut()) {
            *dst ^= *src;
        }

        self
    }
}

impl BitAnd for Bitmap {
    type Output = Self;

    fn bitand(mut self, rhs: Self) -> Self {
        for (src, dst) in rhs.0.iter().zip(self.0.iter_mut()) {
            *dst &= *src;
        }

        self
    }
}

impl BitOr for Bitmap {
    type Output = Self;

    fn bitor(mut self, rhs: Self) -> Self {
        for (src, dst) in rhs.0.iter().zip(self.0.iter_mut()) {
            *dst |= *src;
        }

        self
    }
}

impl Not for Bitmap {
    type Output = Self;

    fn not(mut self) -> Self {
        for byte in self.0.iter_mut() {
            *byte = !*byte;
        }

        self
    }
}

/// Panics on overflow.
impl Add for Bitmap {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        self.checked_add(&rhs).expect("bitmap addition overflowed")
    }
}

/// Panics if `rhs` is greater than `self`.
impl Sub for Bitmap {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self.checked_sub(&rhs).expect("bitmap subtraction went negative")
    }
}

impl Distribution<Bitmap> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Bitmap {
        let mut bytes = [0u8; NUM_BYTES];
        rng.fill_bytes(&mut bytes);
        Bitmap(bytes)
    }
}

impl fmt::LowerHex for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }

        Ok(())
    }
}

impl fmt::Display for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self)
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self)
    }
}

/// Serialize/deserialize fixed size byte arrays as bencode byte strings.
pub(crate) mod byte_array {
    use serde::{
        de::{Deserialize, Deserializer, Error},
        ser::{Serialize, Serializer},
    };
    use serde_bytes::{ByteBuf, Bytes};
    use std::convert::TryInto;

    pub(crate) fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        s: S,
    ) -> Result<S::Ok, S::Error> {
        Bytes::new(bytes.as_ref()).serialize(s)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        d: D,
    ) -> Result<[u8; N], D::Error> {
        let buf = ByteBuf::deserialize(d)?;
        let buf = buf.into_vec();
        let len = buf.len();

        buf.try_into().map_err(|_| {
            let expected = format!("{}", N);
            D::Error::invalid_length(len, &expected.as_ref())
        })
    }
}
