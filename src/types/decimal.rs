//! Fixed-point decimal with 18 digits of precision.
//!
//! Values are stored as the raw on-chain integer (`value * 10^18`), so they
//! round-trip through `eth_call` results without any conversion. All
//! arithmetic reproduces the protocol's integer math: multiplication and
//! division truncate, while [`Decimal::pow`] uses the rounding `decMul`
//! step of the chain's exponentiation routine.

use std::{
    fmt,
    ops::{Add, AddAssign, Div, Mul, Sub, SubAssign},
    str::FromStr,
};

use alloy::primitives::U256;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::Error;

const PRECISION: u32 = 18;
const ONE_RAW: U256 = U256::from_limbs([1_000_000_000_000_000_000, 0, 0, 0]);
const HALF_RAW: U256 = U256::from_limbs([500_000_000_000_000_000, 0, 0, 0]);

/// Unsigned 18-decimal fixed-point number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Decimal(U256);

impl Decimal {
    pub const ZERO: Decimal = Decimal(U256::ZERO);
    pub const ONE: Decimal = Decimal(ONE_RAW);
    /// Result of dividing by zero. Used for the nominal ratio of debt-free positions.
    pub const INFINITY: Decimal = Decimal(U256::MAX);

    /// Wrap a raw on-chain value (already scaled by 10^18).
    pub const fn from_raw(raw: U256) -> Self {
        Decimal(raw)
    }

    /// Build from a raw scaled value that fits into 128 bits. Usable in constants.
    pub const fn from_raw_u128(raw: u128) -> Self {
        Decimal(U256::from_limbs([raw as u64, (raw >> 64) as u64, 0, 0]))
    }

    /// The raw on-chain representation.
    pub const fn raw(&self) -> U256 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_infinite(&self) -> bool {
        self.0 == U256::MAX
    }

    /// `self * multiplier / divider` with a single truncation at the end.
    ///
    /// Division by zero yields [`Decimal::INFINITY`], as does an intermediate
    /// product that does not fit into 256 bits.
    pub fn mul_div(self, multiplier: Decimal, divider: Decimal) -> Decimal {
        if divider.is_zero() {
            return Decimal::INFINITY;
        }
        match self.0.checked_mul(multiplier.0) {
            Some(product) => Decimal(product / divider.0),
            None => Decimal::INFINITY,
        }
    }

    /// Raise to an integer power using exponentiation by squaring.
    ///
    /// Every intermediate product is rounded half-up to 18 digits, which is
    /// what the chain's `_decPow` does. Base-rate decay relies on this being
    /// bit-for-bit identical.
    pub fn pow(self, exponent: u64) -> Decimal {
        if exponent == 0 {
            return Decimal::ONE;
        }

        let mut x = self.0;
        let mut y = ONE_RAW;
        let mut n = exponent;

        while n > 1 {
            if n % 2 == 0 {
                x = dec_mul(x, x);
                n /= 2;
            } else {
                y = dec_mul(x, y);
                x = dec_mul(x, x);
                n = (n - 1) / 2;
            }
        }

        Decimal(dec_mul(x, y))
    }

    /// Subtraction clamped at zero.
    pub fn saturating_sub(self, rhs: Decimal) -> Decimal {
        Decimal(self.0.saturating_sub(rhs.0))
    }

    pub fn checked_sub(self, rhs: Decimal) -> Option<Decimal> {
        self.0.checked_sub(rhs.0).map(Decimal)
    }
}

/// Rounding fixed-point product; saturates to [`Decimal::INFINITY`] like `mul_div`.
fn dec_mul(x: U256, y: U256) -> U256 {
    x.checked_mul(y)
        .and_then(|product| product.checked_add(HALF_RAW))
        .map_or(U256::MAX, |product| product / ONE_RAW)
}

impl From<u64> for Decimal {
    fn from(value: u64) -> Self {
        Decimal(U256::from(value) * ONE_RAW)
    }
}

impl Add for Decimal {
    type Output = Decimal;

    fn add(self, rhs: Decimal) -> Decimal {
        Decimal(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Decimal {
    fn add_assign(&mut self, rhs: Decimal) {
        *self = *self + rhs;
    }
}

impl Sub for Decimal {
    type Output = Decimal;

    /// Panics on underflow, like unsigned integer subtraction. Use
    /// [`Decimal::saturating_sub`] when the result may go negative.
    fn sub(self, rhs: Decimal) -> Decimal {
        match self.0.checked_sub(rhs.0) {
            Some(raw) => Decimal(raw),
            None => panic!("Decimal subtraction underflow: {self} - {rhs}"),
        }
    }
}

impl SubAssign for Decimal {
    fn sub_assign(&mut self, rhs: Decimal) {
        *self = *self - rhs;
    }
}

impl Mul for Decimal {
    type Output = Decimal;

    fn mul(self, rhs: Decimal) -> Decimal {
        self.mul_div(rhs, Decimal::ONE)
    }
}

impl Div for Decimal {
    type Output = Decimal;

    fn div(self, rhs: Decimal) -> Decimal {
        self.mul_div(Decimal::ONE, rhs)
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            return f.write_str("∞");
        }

        let integer = self.0 / ONE_RAW;
        let fraction = self.0 % ONE_RAW;

        if fraction.is_zero() {
            return write!(f, "{integer}");
        }

        let digits = format!("{:0>width$}", fraction.to_string(), width = PRECISION as usize);
        write!(f, "{integer}.{}", digits.trim_end_matches('0'))
    }
}

impl fmt::Debug for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Decimal {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidDecimal(s.to_string());

        let (integer, fraction) = match s.split_once('.') {
            Some((integer, fraction)) => (integer, fraction),
            None => (s, ""),
        };

        let all_digits = |part: &str| part.chars().all(|c| c.is_ascii_digit());
        if integer.is_empty() || !all_digits(integer) || !all_digits(fraction) {
            return Err(invalid());
        }
        if fraction.len() > PRECISION as usize {
            return Err(invalid());
        }

        let padded = format!("{integer}{fraction:0<width$}", width = PRECISION as usize);
        U256::from_str_radix(&padded, 10)
            .map(Decimal)
            .map_err(|_| invalid())
    }
}

impl Serialize for Decimal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Decimal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(d("1").raw(), ONE_RAW);
        assert_eq!(d("0.5").to_string(), "0.5");
        assert_eq!(d("1800").to_string(), "1800");
        assert_eq!(d("0.000000000000000001").raw(), U256::from(1u64));
        assert_eq!(d("12.340").to_string(), "12.34");
        assert_eq!(Decimal::INFINITY.to_string(), "∞");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Decimal>().is_err());
        assert!("-1".parse::<Decimal>().is_err());
        assert!("1.2.3".parse::<Decimal>().is_err());
        assert!(".5".parse::<Decimal>().is_err());
        assert!("0.0000000000000000001".parse::<Decimal>().is_err());
    }

    #[test]
    fn test_mul_truncates() {
        let third = Decimal::ONE / Decimal::from(3u64);
        assert_eq!(third.to_string(), "0.333333333333333333");
        assert_eq!((third * Decimal::from(3u64)).to_string(), "0.999999999999999999");
    }

    #[test]
    fn test_div_by_zero_is_infinite() {
        assert!((Decimal::ONE / Decimal::ZERO).is_infinite());
        assert!(Decimal::from(5u64)
            .mul_div(Decimal::from(100u64), Decimal::ZERO)
            .is_infinite());
    }

    #[test]
    fn test_pow_matches_dec_pow() {
        assert_eq!(d("0.5").pow(0), Decimal::ONE);
        assert_eq!(d("0.5").pow(1), d("0.5"));
        assert_eq!(d("0.5").pow(3), d("0.125"));
        assert_eq!(Decimal::from(2u64).pow(10), Decimal::from(1024u64));
    }

    #[test]
    fn test_minute_decay_factor_powers_are_exact() {
        let factor = d("0.999037758833783");
        // half-life of 720 minutes, off by the chain's own rounding
        assert_eq!(factor.pow(720).raw(), U256::from(499_999_999_999_860_089u64));
        assert_eq!(factor.pow(43_200).raw(), U256::from(1u64));
        assert_eq!(factor.pow(525_600_000), Decimal::ZERO);
    }

    #[test]
    fn test_pow_saturates_on_overflow() {
        assert!(Decimal::from(10u64).pow(80).is_infinite());
        assert!(Decimal::INFINITY.pow(2).is_infinite());
        assert_eq!(Decimal::ZERO.pow(80), Decimal::ZERO);
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&d("1.5")).unwrap();
        assert_eq!(json, "\"1.5\"");
        let back: Decimal = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d("1.5"));
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn test_sub_underflow_panics() {
        let _ = Decimal::ONE - Decimal::from(2u64);
    }
}
