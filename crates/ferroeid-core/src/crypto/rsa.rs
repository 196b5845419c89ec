//! RSA private-key engine: CRT, blinding, fault check, key generation.
//!
//! Private operations run as two half-size Montgomery exponentiations
//! (modulo p and q) recombined with Garner's formula. Each half blinds its
//! exponent with a random multiple of `prime - 1` and is verified by
//! re-raising the result to the public exponent and comparing — in constant
//! time — against the input residue, so a single injected fault surfaces as
//! [`CryptoError::FaultDetected`] instead of a usable faulty signature.
//!
//! Key generation fixes the public exponent at 65537. The supported modulus
//! sizes are a runtime policy ([`key_size_supported`]); nothing in the
//! pipeline is compile-time sized.

use rand::RngCore;

use super::bn::Bn;
use super::mont::MontCtx;
use super::{ct_eq, CryptoError};

/// The only public exponent the card will generate or honor: 2^16 + 1.
pub const PUBLIC_EXPONENT: u32 = 65537;

/// Bytes of exponent-blinding randomness per exponentiation.
pub const EXP_BLIND_BYTES: usize = 3;

/// PKCS#1 v1.5 DigestInfo prefix for SHA-1 (OID 1.3.14.3.2.26).
pub const SHA1_DIGEST_INFO: [u8; 15] = [
    0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2B, 0x0E, 0x03, 0x02, 0x1A, 0x05, 0x00, 0x04, 0x14,
];

/// Runtime policy for on-card RSA modulus sizes.
pub fn key_size_supported(bits: usize) -> bool {
    matches!(bits, 512 | 768 | 1024 | 1536 | 2048)
}

/// CRT private key material as stored in a key file.
#[derive(Debug, Clone)]
pub struct RsaCrtKey {
    /// First prime.
    pub p: Bn,
    /// Second prime.
    pub q: Bn,
    /// `d mod (p - 1)`.
    pub dp: Bn,
    /// `d mod (q - 1)`.
    pub dq: Bn,
    /// `q^-1 mod p`.
    pub qinv: Bn,
}

impl RsaCrtKey {
    /// Recomputed public modulus `p * q`.
    pub fn modulus(&self) -> Bn {
        self.p.mul(&self.q)
    }

    /// Modulus length in bytes (twice the prime width).
    pub fn modulus_bytes(&self) -> usize {
        self.p.byte_len() + self.q.byte_len()
    }
}

/// One blinded, fault-checked exponentiation modulo a prime.
///
/// `tamper` flips a byte of the intermediate before the verification step;
/// it exists so tests can demonstrate the fault check and is never set on
/// the production path.
fn blinded_exp(
    c: &Bn,
    prime: &Bn,
    d: &Bn,
    rng: &mut dyn RngCore,
    tamper: bool,
) -> Result<Bn, CryptoError> {
    let ctx = MontCtx::new(prime).ok_or(CryptoError::InvalidKey)?;
    let residue = c.rem(prime);

    // exponent blinding: d' = d + r * (prime - 1)
    let mut rbytes = [0u8; EXP_BLIND_BYTES];
    rng.fill_bytes(&mut rbytes);
    let blind = Bn::from_bytes_be(&rbytes).mul(&prime.sub(&Bn::one()));
    let d_blind = d.add(&blind);

    let mut m = ctx.pow(&residue, &d_blind);
    if tamper {
        let mut bytes = m.to_bytes_be(prime.byte_len());
        bytes[0] ^= 0x40;
        m = Bn::from_bytes_be(&bytes);
    }

    // single-fault check: m^e must reproduce the input residue
    let check = ctx.pow(&m, &Bn::from_u32(PUBLIC_EXPONENT));
    let width = prime.byte_len();
    if !ct_eq(&check.to_bytes_be(width), &residue.to_bytes_be(width)) {
        return Err(CryptoError::FaultDetected);
    }
    Ok(m)
}

fn crt_combine(key: &RsaCrtKey, m_p: &Bn, m_q: &Bn) -> Bn {
    // Garner: m = m_q + q * (qInv * (m_p - m_q) mod p)
    let diff = m_p.mod_sub(&m_q.rem(&key.p), &key.p);
    let h = key.qinv.mod_mul(&diff, &key.p);
    m_q.add(&key.q.mul(&h))
}

/// RSA private-key operation (sign / decipher) on a raw integer.
///
/// `msg` must be below the modulus; the caller applies and strips padding.
pub fn private_op(key: &RsaCrtKey, msg: &Bn, rng: &mut dyn RngCore) -> Result<Bn, CryptoError> {
    if *msg >= key.modulus() {
        return Err(CryptoError::BadLength);
    }
    let m_p = blinded_exp(msg, &key.p, &key.dp, rng, false)?;
    let m_q = blinded_exp(msg, &key.q, &key.dq, rng, false)?;
    Ok(crt_combine(key, &m_p, &m_q))
}

/// PKCS#1 v1.5 type-1 padding (signatures): `00 01 FF.. 00 || t`.
///
/// `None` when `t` is too long for the `k`-byte modulus (needs 11 bytes of
/// overhead).
pub fn pkcs1_type1_pad(t: &[u8], k: usize) -> Option<Vec<u8>> {
    if t.len() + 11 > k {
        return None;
    }
    let mut out = vec![0xFF; k];
    out[0] = 0x00;
    out[1] = 0x01;
    out[k - t.len() - 1] = 0x00;
    out[k - t.len()..].copy_from_slice(t);
    Some(out)
}

/// PKCS#1 v1.5 type-2 unpadding (encryption): expects
/// `00 02 || >= 8 nonzero bytes || 00 || payload` over the full block.
pub fn pkcs1_type2_strip(block: &[u8]) -> Option<Vec<u8>> {
    if block.len() < 12 || block[0] != 0x00 || block[1] != 0x02 {
        return None;
    }
    let sep = block[2..].iter().position(|&b| b == 0)? + 2;
    if sep < 10 {
        // fewer than 8 bytes of nonzero random padding
        return None;
    }
    Some(block[sep + 1..].to_vec())
}

/// Miller–Rabin witness budget for a `bits`-wide prime.
///
/// Scales inversely with the size: 3 rounds at 1024 bits, 6 at 512, 12 at
/// 256.
fn witness_rounds(bits: usize) -> usize {
    (3072 / bits).max(3)
}

const SMALL_PRIMES: [u32; 53] = [
    3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89, 97,
    101, 103, 107, 109, 113, 127, 131, 137, 139, 149, 151, 157, 163, 167, 173, 179, 181, 191, 193,
    197, 199, 211, 223, 227, 229, 233, 239, 241, 251,
];

fn miller_rabin(n: &Bn, rounds: usize, rng: &mut dyn RngCore) -> bool {
    let ctx = match MontCtx::new(n) {
        Some(c) => c,
        None => return false,
    };
    let n_1 = n.sub(&Bn::one());
    // n - 1 = 2^s * d with d odd
    let mut d = n_1.clone();
    let mut s = 0usize;
    while d.is_even() {
        d = d.shr(1);
        s += 1;
    }
    'witness: for _ in 0..rounds {
        // random witness in [2, 2^120)
        let mut a = [0u8; 15];
        rng.fill_bytes(&mut a);
        a[14] |= 2;
        let a = Bn::from_bytes_be(&a);

        let mut x = ctx.pow(&a, &d);
        if x == Bn::one() || x == n_1 {
            continue;
        }
        for _ in 1..s {
            x = x.mul(&x).rem(n);
            if x == n_1 {
                continue 'witness;
            }
            if x == Bn::one() {
                return false;
            }
        }
        return false;
    }
    true
}

/// Samples a probable prime of exactly `bits` bits suitable as an RSA
/// factor: top two bits set, odd, `p mod e != 1`.
fn generate_prime(bits: usize, rng: &mut dyn RngCore) -> Bn {
    let bytes = bits / 8;
    'candidate: loop {
        let mut buf = vec![0u8; bytes];
        rng.fill_bytes(&mut buf);
        buf[0] |= 0xC0;
        buf[bytes - 1] |= 1;
        let p = Bn::from_bytes_be(&buf);

        for &sp in SMALL_PRIMES.iter() {
            if p.rem_u32(sp) == 0 {
                continue 'candidate;
            }
        }
        // keep e invertible modulo p - 1
        if p.rem_u32(PUBLIC_EXPONENT) == 1 {
            continue;
        }
        if miller_rabin(&p, witness_rounds(bits), rng) {
            return p;
        }
    }
}

/// Generates a fresh CRT key for a `bits`-wide modulus.
///
/// Returns the key material and the public modulus. Fails when `bits` is
/// outside the supported policy set.
pub fn generate_key(bits: usize, rng: &mut dyn RngCore) -> Result<(RsaCrtKey, Bn), CryptoError> {
    if !key_size_supported(bits) {
        return Err(CryptoError::InvalidKey);
    }
    let half = bits / 2;
    let e = Bn::from_u32(PUBLIC_EXPONENT);
    loop {
        let p = generate_prime(half, rng);
        let q = generate_prime(half, rng);
        if p == q {
            continue;
        }
        let p_1 = p.sub(&Bn::one());
        let q_1 = q.sub(&Bn::one());
        let phi = p_1.mul(&q_1);
        let d = match e.mod_inv(&phi) {
            Some(d) => d,
            None => continue,
        };
        let dp = d.rem(&p_1);
        let dq = d.rem(&q_1);
        let qinv = match q.mod_inv(&p) {
            Some(i) => i,
            None => continue,
        };
        let key = RsaCrtKey { p, q, dp, dq, qinv };
        let n = key.modulus();
        if n.bit_len() != bits {
            continue;
        }
        return Ok((key, n));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn test_key(rng: &mut StdRng) -> (RsaCrtKey, Bn) {
        generate_key(512, rng).unwrap()
    }

    #[test]
    fn size_policy() {
        for bits in [512, 768, 1024, 1536, 2048] {
            assert!(key_size_supported(bits));
        }
        for bits in [256, 1000, 3072, 4096] {
            assert!(!key_size_supported(bits));
        }
    }

    #[test]
    fn sign_verifies_with_public_exponent() {
        let mut rng = StdRng::seed_from_u64(7);
        let (key, n) = test_key(&mut rng);
        assert_eq!(n.bit_len(), 512);

        let msg = Bn::from_bytes_be(&[0x37; 64]).rem(&n);
        let sig = private_op(&key, &msg, &mut rng).unwrap();
        let ctx = MontCtx::new(&n).unwrap();
        let back = ctx.pow(&sig, &Bn::from_u32(PUBLIC_EXPONENT));
        assert_eq!(back, msg);
    }

    #[test]
    fn fault_injection_is_detected() {
        let mut rng = StdRng::seed_from_u64(11);
        let (key, n) = test_key(&mut rng);
        let msg = Bn::from_u32(0xC0FFEE).rem(&n);
        let err = blinded_exp(&msg, &key.p, &key.dp, &mut rng, true).unwrap_err();
        assert_eq!(err, CryptoError::FaultDetected);
        assert!(blinded_exp(&msg, &key.p, &key.dp, &mut rng, false).is_ok());
    }

    #[test]
    fn oversize_message_rejected() {
        let mut rng = StdRng::seed_from_u64(13);
        let (key, n) = test_key(&mut rng);
        assert_eq!(
            private_op(&key, &n, &mut rng).unwrap_err(),
            CryptoError::BadLength
        );
    }

    #[test]
    fn type1_padding_layout() {
        let t = [0xAB; 20];
        let block = pkcs1_type1_pad(&t, 64).unwrap();
        assert_eq!(block.len(), 64);
        assert_eq!(&block[..2], &[0x00, 0x01]);
        assert!(block[2..43].iter().all(|&b| b == 0xFF));
        assert_eq!(block[43], 0x00);
        assert_eq!(&block[44..], &t);
        assert!(pkcs1_type1_pad(&[0u8; 60], 64).is_none());
    }

    #[test]
    fn type2_strip() {
        let mut block = vec![0x00, 0x02];
        block.extend_from_slice(&[0x11; 9]);
        block.push(0x00);
        block.extend_from_slice(b"secret");
        assert_eq!(pkcs1_type2_strip(&block).unwrap(), b"secret");

        // too little random padding
        let mut short = vec![0x00, 0x02, 0x11, 0x11, 0x00];
        short.extend_from_slice(&[0u8; 16]);
        assert!(pkcs1_type2_strip(&short).is_none());
        assert!(pkcs1_type2_strip(&[0x00, 0x01, 0x00, 0x00]).is_none());
    }

    #[test]
    fn witness_budget_scales() {
        assert_eq!(witness_rounds(1024), 3);
        assert_eq!(witness_rounds(512), 6);
        assert_eq!(witness_rounds(256), 12);
    }

    #[test]
    fn miller_rabin_rejects_composites() {
        let mut rng = StdRng::seed_from_u64(3);
        assert!(miller_rabin(&Bn::from_u32(65537), 8, &mut rng));
        assert!(miller_rabin(&Bn::from_u64(2305843009213693951), 8, &mut rng)); // 2^61-1
        assert!(!miller_rabin(&Bn::from_u32(65537 * 3), 8, &mut rng));
        assert!(!miller_rabin(&Bn::from_u64(3825123056546413051), 8, &mut rng)); // strong pseudoprime to small bases
    }
}
