//! Proof-of-work targets and difficulty.
//!
//! Targets and hashes are compared as unsigned 256-bit integers. Difficulty is
//! carried as `f64` because miners and operators think in fractional
//! difficulties, but conversion to a target is exact: every finite `f64` is
//! `mantissa * 2^exponent`, so `diff1 / difficulty` is computed as an integer
//! division in 512-bit space with no rounding beyond the final floor.

use bitcoin::pow::{CompactTarget, Target};
use ruint::aliases::{U256, U512};
use thiserror::Error;

/// Difficulty values that cannot be turned into a target.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum DifficultyError {
    #[error("difficulty must be finite and positive, got {0}")]
    OutOfDomain(f64),
}

fn widen(value: U256) -> U512 {
    U512::from_le_slice(&value.to_le_bytes::<32>())
}

fn narrow_saturating(value: U512) -> U256 {
    let bytes = value.to_le_bytes::<64>();
    if bytes[32..].iter().any(|b| *b != 0) {
        U256::MAX
    } else {
        U256::from_le_slice(&bytes[..32])
    }
}

/// Split a positive finite float into `(mantissa, exponent)` with
/// `value == mantissa * 2^exponent`.
fn decompose(value: f64) -> (u64, i32) {
    let bits = value.to_bits();
    let biased = ((bits >> 52) & 0x7ff) as i32;
    let fraction = bits & ((1u64 << 52) - 1);
    if biased == 0 {
        (fraction, -1074)
    } else {
        (fraction | (1u64 << 52), biased - 1075)
    }
}

/// Share target for a difficulty: `diff1 / difficulty`, floored.
///
/// Saturates to `U256::MAX` for difficulties so small that the quotient
/// exceeds 256 bits.
pub fn target_from_difficulty(difficulty: f64, diff1: U256) -> Result<U256, DifficultyError> {
    if !difficulty.is_finite() || difficulty <= 0.0 {
        return Err(DifficultyError::OutOfDomain(difficulty));
    }

    let (mantissa, exponent) = decompose(difficulty);
    let diff1 = widen(diff1);
    let mantissa = U512::from(mantissa);

    let quotient = if exponent >= 0 {
        // diff1 < 2^256 and mantissa >= 1, so beyond 256 bits of shift the
        // quotient is zero.
        let shift = exponent as usize;
        if shift > 256 {
            U512::ZERO
        } else {
            diff1 / (mantissa << shift)
        }
    } else {
        let shift = (-exponent) as usize;
        if shift + 256 >= 512 {
            return Ok(U256::MAX);
        }
        (diff1 << shift) / mantissa
    };

    Ok(narrow_saturating(quotient))
}

/// Network target decoded from compact `nbits`.
pub fn target_from_nbits(nbits: u32) -> U256 {
    let target = Target::from_compact(CompactTarget::from_consensus(nbits));
    U256::from_le_bytes(target.to_le_bytes())
}

/// Interpret a double-SHA256 digest as a little-endian integer.
pub fn hash_to_u256(hash: &[u8; 32]) -> U256 {
    U256::from_le_bytes(*hash)
}

/// True when the hash satisfies the target.
pub fn meets_target(hash: &[u8; 32], target: U256) -> bool {
    hash_to_u256(hash) <= target
}

/// Lossy conversion for reporting.
pub fn to_f64(value: U256) -> f64 {
    value
        .as_limbs()
        .iter()
        .rev()
        .fold(0.0, |acc, &limb| acc * 18_446_744_073_709_551_616.0 + limb as f64)
}

/// Human-readable difficulty that a hash achieved: `diff1 / hash`.
///
/// Reporting only; never used to accept or reject.
pub fn difficulty_of_hash(hash: &[u8; 32], diff1: U256) -> f64 {
    let value = hash_to_u256(hash);
    if value.is_zero() {
        return f64::INFINITY;
    }
    to_f64(diff1) / to_f64(value)
}

/// Human-readable difficulty of a target.
pub fn difficulty_of_target(target: U256, diff1: U256) -> f64 {
    if target.is_zero() {
        return f64::INFINITY;
    }
    to_f64(diff1) / to_f64(target)
}
