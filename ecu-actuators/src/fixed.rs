//! Fixed-point arithmetic for controller gains.
//!
//! [`Fixed`] is a signed Q15.16 number: the raw `i32` holds the value
//! multiplied by `2^16`. Products with integer process values are widened to
//! `i64` and saturate there, so an out-of-range product pins at the limit
//! with the correct sign.

use core::num::NonZeroU32;
use core::ops::Neg;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Fixed(i32);

impl Fixed {
    pub const SHIFT: u32 = 16;
    pub const ZERO: Fixed = Fixed(0);
    pub const ONE: Fixed = Fixed(1 << Self::SHIFT);

    pub const fn to_bits(self) -> i32 {
        self.0
    }

    /// `num / den` rounded to nearest, saturating at the `i32` range.
    pub fn from_ratio(num: i64, den: NonZeroU32) -> Self {
        let den = i64::from(den.get());
        let scaled = num << Self::SHIFT;
        let half = den / 2;
        let rounded = if scaled >= 0 {
            (scaled + half) / den
        } else {
            (scaled - half) / den
        };
        Self(rounded.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32)
    }

    /// Product with an integer, still carrying the `2^16` scale.
    #[inline]
    pub fn mul_raw(self, value: i64) -> i64 {
        i64::from(self.0).saturating_mul(value)
    }

    /// Drops the fixed-point scale from an accumulated raw value.
    #[inline]
    pub fn descale(raw: i64) -> i64 {
        raw >> Self::SHIFT
    }

    #[inline]
    pub fn upscale(value: i64) -> i64 {
        value << Self::SHIFT
    }
}

/// `NonZeroU32` for a value known to be non-zero; zero maps to one.
pub(crate) const fn non_zero(value: u32) -> NonZeroU32 {
    match NonZeroU32::new(value) {
        Some(v) => v,
        None => NonZeroU32::MIN,
    }
}

impl Neg for Fixed {
    type Output = Fixed;

    fn neg(self) -> Self::Output {
        Fixed(self.0.saturating_neg())
    }
}
