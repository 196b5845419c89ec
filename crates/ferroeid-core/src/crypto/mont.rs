//! Montgomery modular arithmetic.
//!
//! A [`MontCtx`] is prepared once per odd modulus: the limb count, the
//! negated inverse of the low limb modulo 2^32 and R² mod n. Multiplication
//! uses the CIOS (coarsely integrated operand scanning) form; the
//! exponentiation walks the exponent in fixed 4-bit windows and multiplies
//! on every window — including zero windows, against table entry 0 (= 1 in
//! the Montgomery domain) — so the operation sequence does not depend on
//! the exponent bits.

use super::bn::Bn;

/// Montgomery context for one odd modulus.
#[derive(Debug, Clone)]
pub struct MontCtx {
    n: Vec<u32>,
    n0: u32,
    r2: Vec<u32>,
    one: Vec<u32>,
}

impl MontCtx {
    /// Prepares a context; `n` must be odd and greater than 1.
    pub fn new(n: &Bn) -> Option<MontCtx> {
        if n.is_even() || *n <= Bn::one() {
            return None;
        }
        let limbs = n.limbs().to_vec();
        let s = limbs.len();

        // inverse of n mod 2^32 by Newton iteration, then negate
        let mut inv: u32 = limbs[0];
        for _ in 0..5 {
            inv = inv.wrapping_mul(2u32.wrapping_sub(limbs[0].wrapping_mul(inv)));
        }
        let n0 = inv.wrapping_neg();

        let r = Bn::one().shl(32 * s).rem(n);
        let r2 = r.mul(&r).rem(n);
        Some(MontCtx {
            n: limbs,
            n0,
            r2: to_fixed(&r2, s),
            one: to_fixed(&r, s),
        })
    }

    /// Limb count of the modulus.
    pub fn limb_count(&self) -> usize {
        self.n.len()
    }

    /// The modulus.
    pub fn modulus(&self) -> Bn {
        Bn::from_limbs(&self.n)
    }

    /// CIOS Montgomery product `a * b * R^-1 mod n` on fixed-width limbs.
    fn mont_mul(&self, a: &[u32], b: &[u32]) -> Vec<u32> {
        let s = self.n.len();
        let mut t = vec![0u32; s + 2];
        for i in 0..s {
            // t += a * b[i]
            let bi = u64::from(b[i]);
            let mut carry = 0u64;
            for j in 0..s {
                let sum = u64::from(t[j]) + u64::from(a[j]) * bi + carry;
                t[j] = sum as u32;
                carry = sum >> 32;
            }
            let sum = u64::from(t[s]) + carry;
            t[s] = sum as u32;
            t[s + 1] = (sum >> 32) as u32;

            // t = (t + m*n) / 2^32 with m chosen to zero the low limb
            let m = u64::from(t[0].wrapping_mul(self.n0));
            let sum = u64::from(t[0]) + m * u64::from(self.n[0]);
            let mut carry = sum >> 32;
            for j in 1..s {
                let sum = u64::from(t[j]) + m * u64::from(self.n[j]) + carry;
                t[j - 1] = sum as u32;
                carry = sum >> 32;
            }
            let sum = u64::from(t[s]) + carry;
            t[s - 1] = sum as u32;
            t[s] = t[s + 1].wrapping_add((sum >> 32) as u32);
            t[s + 1] = 0;
        }
        // at most one final subtraction is needed
        let mut out = t[..s].to_vec();
        if t[s] != 0 || !limbs_lt(&out, &self.n) {
            limbs_sub(&mut out, &self.n);
        }
        out
    }

    fn to_mont(&self, x: &Bn) -> Vec<u32> {
        let xr = to_fixed(&x.rem(&self.modulus()), self.n.len());
        self.mont_mul(&xr, &self.r2)
    }

    fn from_mont(&self, x: &[u32]) -> Bn {
        let mut unit = vec![0u32; self.n.len()];
        unit[0] = 1;
        Bn::from_limbs(&self.mont_mul(x, &unit))
    }

    /// `base^exp mod n`, fixed 4-bit windows.
    pub fn pow(&self, base: &Bn, exp: &Bn) -> Bn {
        if exp.is_zero() {
            return Bn::one().rem(&self.modulus());
        }
        // table[0] = 1, table[1] = base, table[i] = base^i (Montgomery domain)
        let xm = self.to_mont(base);
        let mut table = Vec::with_capacity(16);
        table.push(self.one.clone());
        table.push(xm.clone());
        for i in 2..16 {
            let next = self.mont_mul(&table[i - 1], &xm);
            table.push(next);
        }

        let windows = (exp.bit_len() + 3) / 4;
        let mut acc = self.one.clone();
        for w in (0..windows).rev() {
            for _ in 0..4 {
                acc = self.mont_mul(&acc, &acc);
            }
            // multiply unconditionally; zero windows hit table[0] == 1
            acc = self.mont_mul(&acc, &table[usize::from(exp.nibble(w))]);
        }
        self.from_mont(&acc)
    }
}

fn to_fixed(x: &Bn, s: usize) -> Vec<u32> {
    let mut v = x.limbs().to_vec();
    debug_assert!(v.len() <= s, "value wider than the modulus");
    v.resize(s, 0);
    v
}

/// `a < b` on equal-width limb slices.
fn limbs_lt(a: &[u32], b: &[u32]) -> bool {
    for (x, y) in a.iter().rev().zip(b.iter().rev()) {
        if x != y {
            return x < y;
        }
    }
    false
}

/// `a -= b` on equal-width limb slices (a >= b or a carries an extra bit).
fn limbs_sub(a: &mut [u32], b: &[u32]) {
    let mut borrow = 0i64;
    for i in 0..a.len() {
        let diff = i64::from(a[i]) - i64::from(b[i]) - borrow;
        if diff < 0 {
            a[i] = (diff + (1 << 32)) as u32;
            borrow = 1;
        } else {
            a[i] = diff as u32;
            borrow = 0;
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

    fn naive_pow(b: u128, e: u128, m: u128) -> u128 {
        let mut acc: u128 = 1 % m;
        let mut b = b % m;
        let mut e = e;
        while e > 0 {
            if e & 1 == 1 {
                acc = acc * b % m;
            }
            b = b * b % m;
            e >>= 1;
        }
        acc
    }

    #[test]
    fn rejects_even_modulus() {
        assert!(MontCtx::new(&bn(100)).is_none());
        assert!(MontCtx::new(&bn(1)).is_none());
    }

    #[test]
    fn small_known_powers() {
        let ctx = MontCtx::new(&bn(1000003)).unwrap();
        assert_eq!(ctx.pow(&bn(2), &bn(10)), bn(1024));
        assert_eq!(ctx.pow(&bn(5), &Bn::zero()), Bn::one());
        assert_eq!(ctx.pow(&bn(7), &bn(1000002)), Bn::one()); // Fermat
    }

    #[test]
    fn multi_limb_modulus() {
        // 2^61 - 1 is a Mersenne prime; Fermat's little theorem applies
        let m = bn((1u128 << 61) - 1);
        let ctx = MontCtx::new(&m).unwrap();
        assert_eq!(ctx.pow(&bn(123456789), &m.sub(&Bn::one())), Bn::one());
    }

    proptest! {
        #[test]
        fn pow_matches_naive(b in any::<u32>(), e in any::<u16>(), m in any::<u32>()) {
            let m = u128::from(m | 1).max(3);
            let ctx = MontCtx::new(&bn(m)).unwrap();
            let got = ctx.pow(&bn(u128::from(b)), &bn(u128::from(e)));
            prop_assert_eq!(got, bn(naive_pow(u128::from(b), u128::from(e), m)));
        }
    }
}
