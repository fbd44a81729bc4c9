//! Exact samplers for the discrete Laplace and discrete Gaussian
//! distributions, after Canonne, Kamath and Steinke, [The Discrete Gaussian
//! for Differential Privacy][cks20].
//!
//! [cks20]: https://arxiv.org/abs/2004.00010
//!
//! All acceptance tests compare integer products against uniformly sampled
//! integers, so the output distributions are mathematically exact. A
//! floating-point shortcut anywhere in this module would silently bias the
//! samples and void the privacy guarantee.

use crate::{Result, TopDownError};
use num_bigint::{BigInt, BigUint};
use num_integer::Integer;
use num_rational::{BigRational, Ratio};
use num_traits::{One, ToPrimitive, Zero};
use rand::RngCore;

/// A non-negative rational noise parameter.
pub type Rational = Ratio<BigUint>;

/// Converts a positive finite float to an exact rational.
///
/// Every finite `f64` is a dyadic rational, so the conversion is lossless.
/// Fails with a parameter error for zero, negative, infinite or NaN input.
pub fn rational_from_f64(value: f64) -> Result<Rational> {
    if !value.is_finite() || value <= 0.0 {
        return Err(TopDownError::Parameter(format!(
            "noise parameter must be a positive finite number, got {value}"
        )));
    }
    let exact = BigRational::from_float(value)
        .ok_or_else(|| TopDownError::Parameter(format!("unrepresentable parameter {value}")))?;
    Ok(Ratio::new(
        exact.numer().magnitude().clone(),
        exact.denom().magnitude().clone(),
    ))
}

/// Uniform integer in `[0, upper)` by rejection from whole random bytes.
fn sample_uniform_below(upper: &BigUint, rng: &mut dyn RngCore) -> BigUint {
    debug_assert!(!upper.is_zero());
    let byte_len = upper.to_bytes_be().len();
    let max = BigUint::from_bytes_be(&vec![u8::MAX; byte_len]);
    // Largest multiple of `upper` that fits; everything at or above it is
    // rejected so the fold below is unbiased.
    let threshold = &max - (&max % upper);
    let mut buffer = vec![0u8; byte_len];
    loop {
        rng.fill_bytes(&mut buffer);
        let sample = BigUint::from_bytes_be(&buffer);
        if sample < threshold {
            return sample % upper;
        }
    }
}

/// One fair coin flip.
fn sample_standard_bernoulli(rng: &mut dyn RngCore) -> bool {
    let mut buffer = [0u8; 1];
    rng.fill_bytes(&mut buffer);
    buffer[0] & 1 == 1
}

/// Bernoulli(`prob`) for `prob` in `[0, 1]`.
fn sample_bernoulli(prob: &Rational, rng: &mut dyn RngCore) -> bool {
    if prob.denom().is_one() {
        // 0 or 1 exactly.
        return !prob.numer().is_zero();
    }
    let sample = sample_uniform_below(prob.denom(), rng);
    *prob.numer() > sample
}

/// Bernoulli(exp(-gamma)) for `gamma` in `[0, 1]`.
fn sample_bernoulli_exp1(gamma: &Rational, rng: &mut dyn RngCore) -> bool {
    let mut k = BigUint::one();
    loop {
        let prob = Ratio::new(gamma.numer().clone(), gamma.denom() * &k);
        if sample_bernoulli(&prob, rng) {
            k += BigUint::one();
        } else {
            return k.is_odd();
        }
    }
}

/// Bernoulli(exp(-gamma)) for any `gamma >= 0`, by splitting off whole
/// units of the exponent.
fn sample_bernoulli_exp(gamma: &Rational, rng: &mut dyn RngCore) -> bool {
    let one = Rational::one();
    let mut gamma = gamma.clone();
    while gamma > one {
        if !sample_bernoulli_exp1(&one, rng) {
            return false;
        }
        gamma = gamma - &one;
    }
    sample_bernoulli_exp1(&gamma, rng)
}

/// Geometric sample counting Bernoulli(exp(-gamma)) successes.
fn sample_geometric_exp_slow(gamma: &Rational, rng: &mut dyn RngCore) -> BigUint {
    let mut k = BigUint::zero();
    while sample_bernoulli_exp(gamma, rng) {
        k += BigUint::one();
    }
    k
}

/// Geometric sample with parameter `1 - exp(-gamma)` in time independent of
/// the magnitude of `gamma`.
fn sample_geometric_exp_fast(gamma: &Rational, rng: &mut dyn RngCore) -> BigUint {
    if gamma.is_zero() {
        return BigUint::zero();
    }
    let numer = gamma.numer();
    let denom = gamma.denom();

    let mut u = sample_uniform_below(denom, rng);
    while !sample_bernoulli_exp(&Ratio::new(u.clone(), denom.clone()), rng) {
        u = sample_uniform_below(denom, rng);
    }
    let v = sample_geometric_exp_slow(&Rational::one(), rng);
    (v * denom + u) / numer
}

/// Draws from the discrete Laplace distribution with the given scale `t`:
/// mass proportional to `exp(-|k| / t)` on every integer `k`.
pub fn sample_discrete_laplace(scale: &Rational, rng: &mut dyn RngCore) -> BigInt {
    debug_assert!(!scale.numer().is_zero());
    let inv_scale = Ratio::new(scale.denom().clone(), scale.numer().clone());
    loop {
        let positive = sample_standard_bernoulli(rng);
        let magnitude = sample_geometric_exp_fast(&inv_scale, rng);
        if positive {
            return BigInt::from(magnitude);
        } else if !magnitude.is_zero() {
            return -BigInt::from(magnitude);
        }
        // A zero with a negative sign is the double-counted origin; retry.
    }
}

/// Draws from the discrete Gaussian distribution with the given variance:
/// mass proportional to `exp(-k^2 / (2 sigma^2))` on every integer `k`.
///
/// Proposes from a discrete Laplace with scale `floor(sigma) + 1` and
/// accepts with probability `exp(-(|k| t - sigma^2)^2 / (2 sigma^2 t^2))`.
pub fn sample_discrete_gaussian(sigma_squared: &Rational, rng: &mut dyn RngCore) -> BigInt {
    debug_assert!(!sigma_squared.numer().is_zero());
    // floor(sigma) = isqrt(floor(sigma^2)), exactly.
    let t = (sigma_squared.numer() / sigma_squared.denom()).sqrt() + BigUint::one();
    let scale = Rational::from_integer(t.clone());
    let denominator = Ratio::new(
        sigma_squared.numer() * BigUint::from(2u8) * &t * &t,
        sigma_squared.denom().clone(),
    );

    loop {
        let candidate = sample_discrete_laplace(&scale, rng);
        let shifted = Rational::from_integer(candidate.magnitude() * &t);
        let diff = if shifted >= *sigma_squared {
            shifted - sigma_squared
        } else {
            sigma_squared - shifted
        };
        let gamma = &diff * &diff / &denominator;
        if sample_bernoulli_exp(&gamma, rng) {
            return candidate;
        }
    }
}

/// Converts a sampled noise value to `i64`, which only fails for
/// astronomically large noise scales.
pub fn noise_to_i64(value: BigInt) -> Result<i64> {
    value.to_i64().ok_or_else(|| {
        TopDownError::Parameter("sampled noise magnitude exceeds 64 bits".into())
    })
}
