//! Unsigned big-number arithmetic — portable reference backend.
//!
//! [`Bn`] is an arbitrary-width unsigned integer over little-endian u32
//! limbs, normalized so the top limb is never zero (zero is the empty limb
//! vector). The routines here are the reference implementation of the
//! arithmetic seam: schoolbook multiplication, binary long division and an
//! extended-Euclid inverse. They favour being obviously correct over being
//! fast or constant-time; the constant-time obligations of the card
//! (fixed-window ladders, blinding, XOR-accumulator compares) are enforced
//! one layer up, and a platform build may swap in hardened limb routines.

use core::cmp::Ordering;

/// Arbitrary-width unsigned integer, little-endian u32 limbs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bn {
    limbs: Vec<u32>,
}

impl Bn {
    /// The value 0.
    pub fn zero() -> Bn {
        Bn { limbs: Vec::new() }
    }

    /// The value 1.
    pub fn one() -> Bn {
        Bn::from_u32(1)
    }

    /// A single-limb value.
    pub fn from_u32(v: u32) -> Bn {
        let mut n = Bn { limbs: vec![v] };
        n.normalize();
        n
    }

    /// A value from a u64.
    pub fn from_u64(v: u64) -> Bn {
        let mut n = Bn {
            limbs: vec![v as u32, (v >> 32) as u32],
        };
        n.normalize();
        n
    }

    /// Parses big-endian bytes (leading zeros allowed).
    pub fn from_bytes_be(bytes: &[u8]) -> Bn {
        let mut limbs = Vec::with_capacity(bytes.len() / 4 + 1);
        let mut acc: u32 = 0;
        let mut shift = 0;
        for &b in bytes.iter().rev() {
            acc |= u32::from(b) << shift;
            shift += 8;
            if shift == 32 {
                limbs.push(acc);
                acc = 0;
                shift = 0;
            }
        }
        if shift != 0 {
            limbs.push(acc);
        }
        let mut n = Bn { limbs };
        n.normalize();
        n
    }

    /// Parses little-endian bytes (the key-file byte order for RSA parts).
    pub fn from_bytes_le(bytes: &[u8]) -> Bn {
        let mut rev = bytes.to_vec();
        rev.reverse();
        Bn::from_bytes_be(&rev)
    }

    /// Serializes to exactly `width` big-endian bytes.
    ///
    /// Panics in debug builds if the value does not fit.
    pub fn to_bytes_be(&self, width: usize) -> Vec<u8> {
        debug_assert!(self.byte_len() <= width, "value wider than requested");
        let mut out = vec![0u8; width];
        for i in 0..width {
            let bit = 8 * i;
            let limb = bit / 32;
            let off = bit % 32;
            let byte = if limb < self.limbs.len() {
                (self.limbs[limb] >> off) as u8
            } else {
                0
            };
            out[width - 1 - i] = byte;
        }
        out
    }

    /// Serializes to exactly `width` little-endian bytes.
    pub fn to_bytes_le(&self, width: usize) -> Vec<u8> {
        let mut out = self.to_bytes_be(width);
        out.reverse();
        out
    }

    /// Number of significant bits (0 for the value 0).
    pub fn bit_len(&self) -> usize {
        match self.limbs.last() {
            None => 0,
            Some(&top) => 32 * (self.limbs.len() - 1) + (32 - top.leading_zeros() as usize),
        }
    }

    /// Number of significant bytes.
    pub fn byte_len(&self) -> usize {
        (self.bit_len() + 7) / 8
    }

    /// Bit `i` (little-endian numbering).
    pub fn bit(&self, i: usize) -> bool {
        let limb = i / 32;
        if limb >= self.limbs.len() {
            return false;
        }
        self.limbs[limb] >> (i % 32) & 1 == 1
    }

    /// Sets bit `i` to one, growing as needed.
    pub fn set_bit(&mut self, i: usize) {
        let limb = i / 32;
        if limb >= self.limbs.len() {
            self.limbs.resize(limb + 1, 0);
        }
        self.limbs[limb] |= 1 << (i % 32);
    }

    /// The 4-bit window `w` of the value (bits `4w .. 4w+3`).
    pub fn nibble(&self, w: usize) -> u8 {
        let limb = w / 8;
        if limb >= self.limbs.len() {
            return 0;
        }
        (self.limbs[limb] >> (4 * (w % 8)) & 0xF) as u8
    }

    /// True when the value is 0.
    pub fn is_zero(&self) -> bool {
        self.limbs.is_empty()
    }

    /// True for even values (0 is even).
    pub fn is_even(&self) -> bool {
        self.limbs.first().map_or(true, |l| l & 1 == 0)
    }

    /// Borrow of the internal limbs (little-endian).
    pub fn limbs(&self) -> &[u32] {
        &self.limbs
    }

    /// Builds a value from raw little-endian limbs.
    pub fn from_limbs(limbs: &[u32]) -> Bn {
        let mut n = Bn {
            limbs: limbs.to_vec(),
        };
        n.normalize();
        n
    }

    fn normalize(&mut self) {
        while self.limbs.last() == Some(&0) {
            self.limbs.pop();
        }
    }

    /// `self + other`.
    pub fn add(&self, other: &Bn) -> Bn {
        let mut out = self.clone();
        out.add_in_place(other);
        out
    }

    fn add_in_place(&mut self, other: &Bn) {
        if self.limbs.len() < other.limbs.len() {
            self.limbs.resize(other.limbs.len(), 0);
        }
        let mut carry = 0u64;
        for i in 0..self.limbs.len() {
            let b = other.limbs.get(i).copied().unwrap_or(0);
            let sum = u64::from(self.limbs[i]) + u64::from(b) + carry;
            self.limbs[i] = sum as u32;
            carry = sum >> 32;
        }
        if carry != 0 {
            self.limbs.push(carry as u32);
        }
    }

    /// `self - other`; `other` must not exceed `self`.
    pub fn sub(&self, other: &Bn) -> Bn {
        let mut out = self.clone();
        out.sub_in_place(other);
        out
    }

    fn sub_in_place(&mut self, other: &Bn) {
        debug_assert!(*self >= *other, "big-number subtraction underflow");
        let mut borrow = 0i64;
        for i in 0..self.limbs.len() {
            let b = other.limbs.get(i).copied().unwrap_or(0);
            let diff = i64::from(self.limbs[i]) - i64::from(b) - borrow;
            if diff < 0 {
                self.limbs[i] = (diff + (1 << 32)) as u32;
                borrow = 1;
            } else {
                self.limbs[i] = diff as u32;
                borrow = 0;
            }
        }
        self.normalize();
    }

    /// `self * other`, schoolbook.
    pub fn mul(&self, other: &Bn) -> Bn {
        if self.is_zero() || other.is_zero() {
            return Bn::zero();
        }
        let (a, b) = (&self.limbs, &other.limbs);
        let mut res = vec![0u32; a.len() + b.len()];
        for (i, &ai) in a.iter().enumerate() {
            let mut carry = 0u64;
            for (j, &bj) in b.iter().enumerate() {
                let t = u64::from(res[i + j]) + u64::from(ai) * u64::from(bj) + carry;
                res[i + j] = t as u32;
                carry = t >> 32;
            }
            let mut k = i + b.len();
            while carry != 0 {
                let t = u64::from(res[k]) + carry;
                res[k] = t as u32;
                carry = t >> 32;
                k += 1;
            }
        }
        Bn::from_limbs(&res)
    }

    /// `self << bits`.
    pub fn shl(&self, bits: usize) -> Bn {
        if self.is_zero() {
            return Bn::zero();
        }
        let limb_shift = bits / 32;
        let bit_shift = bits % 32;
        let mut limbs = vec![0u32; limb_shift];
        if bit_shift == 0 {
            limbs.extend_from_slice(&self.limbs);
        } else {
            let mut carry = 0u32;
            for &l in &self.limbs {
                limbs.push(l << bit_shift | carry);
                carry = (u64::from(l) >> (32 - bit_shift)) as u32;
            }
            if carry != 0 {
                limbs.push(carry);
            }
        }
        Bn::from_limbs(&limbs)
    }

    /// `self >> bits`.
    pub fn shr(&self, bits: usize) -> Bn {
        let limb_shift = bits / 32;
        if limb_shift >= self.limbs.len() {
            return Bn::zero();
        }
        let bit_shift = bits % 32;
        let src = &self.limbs[limb_shift..];
        let mut limbs = Vec::with_capacity(src.len());
        if bit_shift == 0 {
            limbs.extend_from_slice(src);
        } else {
            for i in 0..src.len() {
                let hi = src.get(i + 1).copied().unwrap_or(0);
                limbs.push(src[i] >> bit_shift | ((u64::from(hi) << (32 - bit_shift)) as u32));
            }
        }
        Bn::from_limbs(&limbs)
    }

    /// `(self / d, self % d)`, binary long division.
    pub fn div_rem(&self, d: &Bn) -> (Bn, Bn) {
        assert!(!d.is_zero(), "big-number division by zero");
        if *self < *d {
            return (Bn::zero(), self.clone());
        }
        let bits = self.bit_len();
        let mut q = Bn::zero();
        let mut rem = Bn::zero();
        for i in (0..bits).rev() {
            rem = rem.shl(1);
            if self.bit(i) {
                rem.set_bit(0);
            }
            if rem >= *d {
                rem.sub_in_place(d);
                q.set_bit(i);
            }
        }
        (q, rem)
    }

    /// `self % d`.
    pub fn rem(&self, d: &Bn) -> Bn {
        self.div_rem(d).1
    }

    /// `self % d` for a small divisor.
    pub fn rem_u32(&self, d: u32) -> u32 {
        let mut r: u64 = 0;
        for &l in self.limbs.iter().rev() {
            r = (r << 32 | u64::from(l)) % u64::from(d);
        }
        r as u32
    }

    /// `(self + other) mod m`; inputs must already be below `m`.
    pub fn mod_add(&self, other: &Bn, m: &Bn) -> Bn {
        let sum = self.add(other);
        if sum >= *m {
            sum.sub(m)
        } else {
            sum
        }
    }

    /// `(self - other) mod m`; inputs must already be below `m`.
    pub fn mod_sub(&self, other: &Bn, m: &Bn) -> Bn {
        if *self >= *other {
            self.sub(other)
        } else {
            self.add(m).sub(other)
        }
    }

    /// `(self * other) mod m`.
    pub fn mod_mul(&self, other: &Bn, m: &Bn) -> Bn {
        self.mul(other).rem(m)
    }

    /// `self^-1 mod m` when it exists (`gcd(self, m) == 1`, `m > 1`).
    ///
    /// Extended Euclid with signed-magnitude coefficient tracking; works for
    /// any modulus, odd or even (key generation inverts modulo `p - 1`).
    pub fn mod_inv(&self, m: &Bn) -> Option<Bn> {
        if m.is_zero() || *m == Bn::one() {
            return None;
        }
        let mut r0 = m.clone();
        let mut r1 = self.rem(m);
        if r1.is_zero() {
            return None;
        }
        let mut t0 = SignedBn::zero();
        let mut t1 = SignedBn::from(Bn::one());
        while !r1.is_zero() {
            let (q, r2) = r0.div_rem(&r1);
            let t2 = t0.sub(&t1.mul_unsigned(&q));
            r0 = r1;
            r1 = r2;
            t0 = t1;
            t1 = t2;
        }
        if r0 != Bn::one() {
            return None;
        }
        Some(t0.rem_euclid(m))
    }
}

impl Ord for Bn {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.limbs.len() != other.limbs.len() {
            return self.limbs.len().cmp(&other.limbs.len());
        }
        for (a, b) in self.limbs.iter().rev().zip(other.limbs.iter().rev()) {
            if a != b {
                return a.cmp(b);
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Bn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Signed-magnitude helper for the extended-Euclid coefficients.
#[derive(Debug, Clone)]
struct SignedBn {
    neg: bool,
    mag: Bn,
}

impl SignedBn {
    fn zero() -> SignedBn {
        SignedBn {
            neg: false,
            mag: Bn::zero(),
        }
    }

    fn from(mag: Bn) -> SignedBn {
        SignedBn { neg: false, mag }
    }

    fn mul_unsigned(&self, q: &Bn) -> SignedBn {
        SignedBn {
            neg: self.neg,
            mag: self.mag.mul(q),
        }
    }

    fn sub(&self, other: &SignedBn) -> SignedBn {
        if self.neg == other.neg {
            if self.mag >= other.mag {
                SignedBn {
                    neg: self.neg && !self.mag.is_zero(),
                    mag: self.mag.sub(&other.mag),
                }
            } else {
                SignedBn {
                    neg: !self.neg,
                    mag: other.mag.sub(&self.mag),
                }
            }
        } else {
            SignedBn {
                neg: self.neg,
                mag: self.mag.add(&other.mag),
            }
        }
    }

    /// Canonical representative in `0 .. m`.
    fn rem_euclid(&self, m: &Bn) -> Bn {
        let r = self.mag.rem(m);
        if self.neg && !r.is_zero() {
            m.sub(&r)
        } else {
            r
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bn(v: u128) -> Bn {
        Bn::from_bytes_be(&v.to_be_bytes())
    }

    #[test]
    fn byte_round_trip() {
        let n = Bn::from_bytes_be(&hex::decode("0102030405060708090a").unwrap());
        assert_eq!(hex::encode(n.to_bytes_be(10)), "0102030405060708090a");
        assert_eq!(hex::encode(n.to_bytes_be(12)), "00000102030405060708090a");
        let le = Bn::from_bytes_le(&[0x01, 0x00, 0x01]);
        assert_eq!(le, bn(0x010001));
    }

    #[test]
    fn bit_length() {
        assert_eq!(Bn::zero().bit_len(), 0);
        assert_eq!(Bn::one().bit_len(), 1);
        assert_eq!(bn(0x1_0000_0000).bit_len(), 33);
    }

    #[test]
    fn division_basics() {
        let (q, r) = bn(1000).div_rem(&bn(7));
        assert_eq!((q, r), (bn(142), bn(6)));
        let (q, r) = bn(5).div_rem(&bn(9));
        assert_eq!((q, r), (Bn::zero(), bn(5)));
        assert_eq!(bn(12345).rem_u32(97), (12345u32 % 97));
    }

    #[test]
    fn mod_inverse_odd_and_even_modulus() {
        let m = bn(65537);
        let a = bn(12345);
        let inv = a.mod_inv(&m).unwrap();
        assert_eq!(a.mul(&inv).rem(&m), Bn::one());

        // even modulus, as used when inverting e modulo p-1
        let m = bn(77_000_002);
        let a = bn(65537);
        let inv = a.mod_inv(&m).unwrap();
        assert_eq!(a.mul(&inv).rem(&m), Bn::one());

        // no inverse when gcd > 1
        assert!(bn(6).mod_inv(&bn(9)).is_none());
    }

    #[test]
    fn shifts() {
        assert_eq!(bn(1).shl(40), bn(1 << 40));
        assert_eq!(bn(0x1234).shl(0), bn(0x1234));
        assert_eq!(bn(0x1234_5678_9abc).shr(16), bn(0x1234_5678));
        assert_eq!(bn(7).shr(70), Bn::zero());
    }

    proptest! {
        #[test]
        fn add_sub_round_trip(a in any::<u128>(), b in any::<u128>()) {
            let sum = bn(a).add(&bn(b));
            prop_assert_eq!(sum.sub(&bn(b)), bn(a));
        }

        #[test]
        fn mul_matches_u128(a in any::<u64>(), b in any::<u64>()) {
            prop_assert_eq!(bn(u128::from(a)).mul(&bn(u128::from(b))), bn(u128::from(a) * u128::from(b)));
        }

        #[test]
        fn div_rem_reconstructs(a in any::<u128>(), d in 1u64..) {
            let (q, r) = bn(a).div_rem(&bn(u128::from(d)));
            prop_assert!(r < bn(u128::from(d)));
            prop_assert_eq!(q.mul(&bn(u128::from(d))).add(&r), bn(a));
        }

        #[test]
        fn mod_inv_property(a in 2u64.., m in 3u64..) {
            let (a, m) = (bn(u128::from(a)), bn(u128::from(m)));
            if let Some(inv) = a.mod_inv(&m) {
                prop_assert_eq!(a.mul(&inv).rem(&m), Bn::one());
                prop_assert!(inv < m);
            }
        }
    }
}
