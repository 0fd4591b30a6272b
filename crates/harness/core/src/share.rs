//! XOR secret sharing of floating point vectors.
//!
//! A vector `v` is split into `(share0, share1)` such that the raw bit
//! patterns satisfy `share0[i] ^ share1[i] == v[i]`. Share 1 is a nonce drawn
//! per element, share 0 is the source masked with that nonce. Both shares are
//! valid (finite) floats at the configured width so they can travel through
//! the engine's decimal text input files.

use std::fmt;

use half::f16;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Nonces are drawn uniformly from `[-NONCE_RANGE, NONCE_RANGE]`, which
/// matches the scale of embedding values.
pub const NONCE_RANGE: f64 = 3.0;

/// Maximum number of draws per element before giving up.
pub const MAX_NONCE_ATTEMPTS: usize = 64;

/// Error for share creation and recombination.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShareError {
    #[error("unsupported bit width {0}, expected 16, 32 or 64")]
    UnsupportedBitWidth(u32),
    #[error("element {index} is not a finite {width}-bit float")]
    NonFiniteElement { index: usize, width: u32 },
    #[error("no finite nonce for element {index} after {attempts} draws")]
    NonceExhausted { index: usize, attempts: usize },
    #[error("cannot combine a {left}-bit share with a {right}-bit share")]
    WidthMismatch { left: u32, right: u32 },
    #[error("cannot combine shares of length {left} and {right}")]
    LengthMismatch { left: usize, right: usize },
    #[error("invalid share value on line {line}: {value:?}")]
    InvalidValue { line: usize, value: String },
}

/// Floating point width the shares are computed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum BitWidth {
    /// IEEE 754 binary16.
    Half,
    /// IEEE 754 binary32.
    Single,
    /// IEEE 754 binary64.
    Double,
}

impl BitWidth {
    /// Returns the width in bits.
    pub fn bits(&self) -> u32 {
        match self {
            BitWidth::Half => 16,
            BitWidth::Single => 32,
            BitWidth::Double => 64,
        }
    }

    fn mask(&self) -> u64 {
        match self {
            BitWidth::Half => u16::MAX as u64,
            BitWidth::Single => u32::MAX as u64,
            BitWidth::Double => u64::MAX,
        }
    }

    /// Narrows `value` to this width and returns its raw bit pattern.
    pub fn to_bits(&self, value: f64) -> u64 {
        match self {
            BitWidth::Half => f16::from_f64(value).to_bits() as u64,
            BitWidth::Single => (value as f32).to_bits() as u64,
            BitWidth::Double => value.to_bits(),
        }
    }

    /// Interprets the low bits of `bits` as a float of this width.
    pub fn from_bits(&self, bits: u64) -> f64 {
        let bits = bits & self.mask();
        match self {
            BitWidth::Half => f16::from_bits(bits as u16).to_f64(),
            BitWidth::Single => f32::from_bits(bits as u32) as f64,
            BitWidth::Double => f64::from_bits(bits),
        }
    }

    fn is_finite_bits(&self, bits: u64) -> bool {
        match self {
            BitWidth::Half => f16::from_bits(bits as u16).is_finite(),
            BitWidth::Single => f32::from_bits(bits as u32).is_finite(),
            BitWidth::Double => f64::from_bits(bits).is_finite(),
        }
    }

    /// Shortest decimal text that parses back to exactly `bits`.
    fn format_bits(&self, bits: u64) -> String {
        match self {
            BitWidth::Half => f16::from_bits(bits as u16).to_string(),
            BitWidth::Single => f32::from_bits(bits as u32).to_string(),
            BitWidth::Double => f64::from_bits(bits).to_string(),
        }
    }

    fn parse_bits(&self, text: &str) -> Option<u64> {
        match self {
            BitWidth::Half => text
                .parse::<f32>()
                .ok()
                .map(|v| f16::from_f32(v).to_bits() as u64),
            BitWidth::Single => text.parse::<f32>().ok().map(|v| v.to_bits() as u64),
            BitWidth::Double => text.parse::<f64>().ok().map(f64::to_bits),
        }
    }
}

impl TryFrom<u32> for BitWidth {
    type Error = ShareError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            16 => Ok(BitWidth::Half),
            32 => Ok(BitWidth::Single),
            64 => Ok(BitWidth::Double),
            other => Err(ShareError::UnsupportedBitWidth(other)),
        }
    }
}

impl From<BitWidth> for u32 {
    fn from(value: BitWidth) -> Self {
        value.bits()
    }
}

impl fmt::Display for BitWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}

/// One half of a secret-split vector, stored as raw bit patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    width: BitWidth,
    bits: Vec<u64>,
}

impl Share {
    /// Returns the width of the share's elements.
    pub fn width(&self) -> BitWidth {
        self.width
    }

    /// Returns the number of elements.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Returns `true` if the share has no elements.
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Returns the raw bit patterns.
    pub fn bits(&self) -> &[u64] {
        &self.bits
    }

    /// Returns the elements widened to `f64`.
    pub fn values(&self) -> Vec<f64> {
        self.bits.iter().map(|b| self.width.from_bits(*b)).collect()
    }

    /// Elementwise XOR of the bit patterns of two shares.
    pub fn xor(&self, other: &Share) -> Result<Share, ShareError> {
        if self.width != other.width {
            return Err(ShareError::WidthMismatch {
                left: self.width.bits(),
                right: other.width.bits(),
            });
        }
        if self.len() != other.len() {
            return Err(ShareError::LengthMismatch {
                left: self.len(),
                right: other.len(),
            });
        }

        Ok(Share {
            width: self.width,
            bits: self
                .bits
                .iter()
                .zip(&other.bits)
                .map(|(a, b)| a ^ b)
                .collect(),
        })
    }

    /// Renders the share as one exact decimal value per line.
    pub fn to_text(&self) -> String {
        let mut out = String::with_capacity(self.len() * 24);
        for bits in &self.bits {
            out.push_str(&self.width.format_bits(*bits));
            out.push('\n');
        }
        out
    }

    /// Parses a share written by [`Share::to_text`]. Blank lines are ignored.
    pub fn from_text(width: BitWidth, text: &str) -> Result<Share, ShareError> {
        let mut bits = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value = width
                .parse_bits(line)
                .ok_or_else(|| ShareError::InvalidValue {
                    line: idx + 1,
                    value: line.to_string(),
                })?;
            bits.push(value);
        }
        Ok(Share { width, bits })
    }
}

/// The two complementary shares of one vector.
///
/// `share0` goes to the verifying party (role 0), `share1` to the
/// subject-hosting party (role 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharePair {
    pub share0: Share,
    pub share1: Share,
}

impl SharePair {
    /// Recombines both shares into the (narrowed) source vector.
    pub fn reconstruct(&self) -> Result<Vec<f64>, ShareError> {
        Ok(self.share0.xor(&self.share1)?.values())
    }

    /// Returns the share for the given role id.
    pub fn for_role(&self, role: crate::Role) -> &Share {
        match role {
            crate::Role::Server => &self.share0,
            crate::Role::Client => &self.share1,
        }
    }
}

/// Splits `vector` into two shares at the given width.
///
/// Each source element is narrowed to `width` first, so the round trip law
/// `share0 ^ share1 == vector` is exact at that width. Nonce draws whose XOR
/// with the source element is not a finite float are redrawn, at most
/// [`MAX_NONCE_ATTEMPTS`] times per element.
pub fn create_shares<R: Rng + ?Sized>(
    vector: &[f64],
    width: BitWidth,
    rng: &mut R,
) -> Result<SharePair, ShareError> {
    let mut nonce = Vec::with_capacity(vector.len());
    let mut masked = Vec::with_capacity(vector.len());

    for (index, value) in vector.iter().enumerate() {
        let source = width.to_bits(*value);
        if !width.is_finite_bits(source) {
            return Err(ShareError::NonFiniteElement {
                index,
                width: width.bits(),
            });
        }

        let n = draw_nonce(source, width, rng).ok_or(ShareError::NonceExhausted {
            index,
            attempts: MAX_NONCE_ATTEMPTS,
        })?;

        nonce.push(n);
        masked.push(source ^ n);
    }

    Ok(SharePair {
        share0: Share {
            width,
            bits: masked,
        },
        share1: Share { width, bits: nonce },
    })
}

fn draw_nonce<R: Rng + ?Sized>(source: u64, width: BitWidth, rng: &mut R) -> Option<u64> {
    for attempt in 0..MAX_NONCE_ATTEMPTS {
        let x = width.to_bits(rng.random_range(-NONCE_RANGE..=NONCE_RANGE));
        let n = source ^ x;
        if width.is_finite_bits(n) {
            return Some(n);
        }
        tracing::trace!(attempt, "nonce is not a finite float, redrawing");
    }
    None
}
