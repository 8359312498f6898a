//! Safe-prime group arithmetic over `BigUint`.

use num_bigint::{BigUint, RandBigInt};
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::Rng;

use super::error::ElGamalError;

const LOG_TARGET: &str = "legit_crowd::elgamal::group";

const SMALL_PRIMES: [u32; 53] = [
    3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89, 97,
    101, 103, 107, 109, 113, 127, 131, 137, 139, 149, 151, 157, 163, 167, 173, 179, 181, 191, 193,
    197, 199, 211, 223, 227, 229, 233, 239, 241, 251,
];

const GENERATOR_ATTEMPTS: usize = 1_000;

/// Miller-Rabin probable prime test with `rounds` random bases.
///
/// Small factors are rejected by trial division before any modular exponentiation.
pub fn is_probable_prime<R: Rng + ?Sized>(n: &BigUint, rounds: u32, rng: &mut R) -> bool {
    let two = BigUint::from(2u32);
    if *n < two {
        return false;
    }
    for &small in SMALL_PRIMES.iter() {
        let small = BigUint::from(small);
        if *n == small {
            return true;
        }
        if (n % &small).is_zero() {
            return false;
        }
    }
    if n.is_even() {
        return *n == two;
    }

    let n_minus_one = n - 1u32;
    let mut d = n_minus_one.clone();
    let mut s = 0u32;
    while d.is_even() {
        d >>= 1;
        s += 1;
    }

    'witness: for _ in 0..rounds.max(1) {
        let a = rng.gen_biguint_range(&two, &n_minus_one);
        let mut x = a.modpow(&d, n);
        if x.is_one() || x == n_minus_one {
            continue;
        }
        for _ in 1..s {
            x = x.modpow(&two, n);
            if x == n_minus_one {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

/// Cheap screen for a safe-prime candidate: neither `q` nor `2q + 1` may have a small factor.
fn passes_sieve(q: &BigUint) -> bool {
    SMALL_PRIMES.iter().all(|&small| {
        let q_mod = (q % small).to_u32_digits().first().copied().unwrap_or(0);
        let p_mod = (2 * q_mod + 1) % small;
        (q_mod != 0 || *q == BigUint::from(small)) && p_mod != 0
    })
}

/// Search for a safe prime `p = 2q + 1` of exactly `bits` bits.
///
/// Gives up with [`ElGamalError::KeyGeneration`] after `max_attempts` candidates.
pub fn generate_safe_prime<R: Rng + ?Sized>(
    bits: u64,
    rounds: u32,
    max_attempts: usize,
    rng: &mut R,
) -> Result<BigUint, ElGamalError> {
    if bits < 16 {
        return Err(ElGamalError::KeySizeTooSmall(bits));
    }

    for attempt in 1..=max_attempts {
        let mut q = rng.gen_biguint(bits - 1);
        q.set_bit(bits - 2, true);
        q.set_bit(0, true);

        if !passes_sieve(&q) {
            continue;
        }
        // a single round first; the full budget only runs on survivors
        if !is_probable_prime(&q, 1, rng) {
            continue;
        }
        let p: BigUint = (&q << 1u32) + 1u32;
        if p.bits() != bits {
            continue;
        }
        if is_probable_prime(&p, rounds, rng) && is_probable_prime(&q, rounds, rng) {
            tracing::debug!(target: LOG_TARGET, bits, attempt, "found safe prime");
            return Ok(p);
        }
    }

    tracing::warn!(target: LOG_TARGET, bits, max_attempts, "safe prime search exhausted");
    Err(ElGamalError::KeyGeneration {
        bits,
        attempts: max_attempts,
    })
}

/// Pick a generator of the quadratic-residue subgroup of `Z_p^*`.
pub fn find_generator<R: Rng + ?Sized>(p: &BigUint, rng: &mut R) -> Result<BigUint, ElGamalError> {
    let two = BigUint::from(2u32);
    let p_minus_one = p - 1u32;
    for _ in 0..GENERATOR_ATTEMPTS {
        let r = rng.gen_biguint_range(&two, p);
        let g = r.modpow(&two, p);
        if g.is_one() || g == two {
            continue;
        }
        if (&p_minus_one % &g).is_zero() {
            continue;
        }
        let Some(g_inv) = mod_inverse(&g, p) else {
            continue;
        };
        if (&p_minus_one % &g_inv).is_zero() {
            continue;
        }
        return Ok(g);
    }
    Err(ElGamalError::GeneratorNotFound(GENERATOR_ATTEMPTS))
}

/// Modular inverse via the extended Euclidean algorithm; `None` when `value` is not a unit.
pub fn mod_inverse(value: &BigUint, modulus: &BigUint) -> Option<BigUint> {
    if modulus.is_zero() {
        return None;
    }
    let value = value % modulus;
    if value.is_zero() {
        return None;
    }

    let (mut old_r, mut r) = (value, modulus.clone());
    // Bezout coefficients tracked as (magnitude, negative) pairs to stay unsigned
    let (mut old_s, mut old_neg) = (BigUint::one(), false);
    let (mut s, mut s_neg) = (BigUint::zero(), false);

    while !r.is_zero() {
        let (quotient, remainder) = old_r.div_rem(&r);
        old_r = std::mem::replace(&mut r, remainder);

        let product = &quotient * &s;
        let (next, next_neg) = signed_sub(&old_s, old_neg, &product, s_neg);
        old_s = std::mem::replace(&mut s, next);
        old_neg = std::mem::replace(&mut s_neg, next_neg);
    }

    if !old_r.is_one() {
        return None;
    }
    let reduced = &old_s % modulus;
    if old_neg && !reduced.is_zero() {
        Some(modulus - reduced)
    } else {
        Some(reduced)
    }
}

fn signed_sub(a: &BigUint, a_neg: bool, b: &BigUint, b_neg: bool) -> (BigUint, bool) {
    // a - b with explicit signs
    match (a_neg, b_neg) {
        (false, true) => (a + b, false),
        (true, false) => (a + b, true),
        (false, false) => {
            if a >= b {
                (a - b, false)
            } else {
                (b - a, true)
            }
        }
        (true, true) => {
            if b >= a {
                (b - a, false)
            } else {
                (a - b, true)
            }
        }
    }
}

/// Uniform sample from `[0, upper)`.
pub fn random_below<R: Rng + ?Sized>(upper: &BigUint, rng: &mut R) -> BigUint {
    rng.gen_biguint_below(upper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn miller_rabin_classifies_known_values() {
        let mut rng = StdRng::seed_from_u64(7);
        for prime in [2u64, 3, 257, 65_537, 2_147_483_647, 1_000_000_007] {
            assert!(is_probable_prime(&BigUint::from(prime), 20, &mut rng), "{prime}");
        }
        // 561 and 41041 are Carmichael numbers
        for composite in [0u64, 1, 4, 561, 41_041, 1_000_000_008, 4_294_967_297] {
            assert!(!is_probable_prime(&BigUint::from(composite), 20, &mut rng), "{composite}");
        }
    }

    #[test]
    fn safe_prime_has_requested_size_and_prime_half() {
        let mut rng = StdRng::seed_from_u64(11);
        let p = generate_safe_prime(64, 20, 1_000_000, &mut rng).unwrap();
        assert_eq!(p.bits(), 64);
        let q: BigUint = (&p - 1u32) >> 1u32;
        assert!(is_probable_prime(&p, 20, &mut rng));
        assert!(is_probable_prime(&q, 20, &mut rng));
    }

    #[test]
    fn safe_prime_search_is_bounded() {
        let mut rng = StdRng::seed_from_u64(3);
        let err = generate_safe_prime(256, 20, 1, &mut rng);
        assert!(matches!(err, Err(ElGamalError::KeyGeneration { attempts: 1, .. })));
    }

    #[test]
    fn tiny_key_sizes_are_rejected() {
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(
            generate_safe_prime(8, 20, 10, &mut rng),
            Err(ElGamalError::KeySizeTooSmall(8))
        );
    }

    #[test]
    fn inverse_multiplies_to_one() {
        let modulus = BigUint::from(1_000_000_007u64);
        for value in [1u64, 2, 3, 12_345, 999_999_999] {
            let value = BigUint::from(value);
            let inverse = mod_inverse(&value, &modulus).unwrap();
            assert!(((&value * &inverse) % &modulus).is_one());
        }
    }

    #[test]
    fn inverse_of_non_unit_is_none() {
        let modulus = BigUint::from(12u32);
        assert!(mod_inverse(&BigUint::from(4u32), &modulus).is_none());
        assert!(mod_inverse(&BigUint::zero(), &modulus).is_none());
        assert_eq!(
            mod_inverse(&BigUint::from(5u32), &modulus),
            Some(BigUint::from(5u32))
        );
    }

    #[test]
    fn generator_lies_in_quadratic_residue_subgroup() {
        let mut rng = StdRng::seed_from_u64(5);
        let p = generate_safe_prime(64, 20, 1_000_000, &mut rng).unwrap();
        let g = find_generator(&p, &mut rng).unwrap();
        let q: BigUint = (&p - 1u32) >> 1u32;
        assert!(g.modpow(&q, &p).is_one());
        assert!(!g.is_one());
    }
}
