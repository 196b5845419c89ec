//! Elliptic-curve engine: Jacobian arithmetic, ECDSA, ECDH, key generation.
//!
//! Points are held in Jacobian coordinates (X, Y, Z), Z = 0 marking the
//! point at infinity, so the ladder never inverts mid-flight. Scalar
//! multiplication walks the (blinded) scalar in fixed 4-bit windows; a zero
//! window performs the same addition into a decoy accumulator so both
//! branches of every step issue identical memory traffic. Scalars are
//! blinded with a random multiple of the group order before the ladder.
//!
//! Field reduction is dispatched per curve: secp256k1 and P-521 use their
//! pseudo-Mersenne folds, the remaining NIST primes a Barrett reduction
//! with a reciprocal cached in the curve record. All of it sits behind
//! [`Curve::reduce`] so a platform build can substitute tuned variants.

use rand::RngCore;

use super::bn::Bn;
use super::CryptoError;

/// Supported curves, selected by key-file type and prime length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveId {
    /// secp192r1 / prime192v1.
    P192,
    /// secp256r1 / prime256v1.
    P256,
    /// secp384r1.
    P384,
    /// secp521r1.
    P521,
    /// secp256k1 (the Koblitz curve; key-file type 0x23).
    Secp256k1,
}

/// Bytes of scalar-blinding randomness.
pub const SCALAR_BLIND_BYTES: usize = 4;

/// Maximum ECDSA / key-generation retry budget.
const MAX_ATTEMPTS: usize = 5;

/// Domain parameters of one curve.
#[derive(Debug, Clone)]
pub struct Curve {
    /// Curve identity.
    pub id: CurveId,
    /// Field prime.
    pub p: Bn,
    /// Coefficient a.
    pub a: Bn,
    /// Coefficient b.
    pub b: Bn,
    /// Group order.
    pub n: Bn,
    gx: Bn,
    gy: Bn,
    /// Field element width in bytes (24, 32, 48 or 66).
    pub field_bytes: usize,
    reducer: Reducer,
}

/// Per-curve fast reduction strategy.
#[derive(Debug, Clone)]
enum Reducer {
    /// secp256k1: 2^256 = 2^32 + 977 (mod p), fold the high half down.
    FoldK1,
    /// P-521: 2^521 = 1 (mod p).
    Fold521,
    /// Barrett with a precomputed reciprocal (the remaining NIST primes).
    Barrett {
        /// floor(2^(2k) / p) for k = bit length of p.
        mu: Bn,
        /// Bit length of p.
        k: usize,
    },
}

/// An affine point (the wire representation `04 || X || Y` decoded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinePoint {
    /// X coordinate.
    pub x: Bn,
    /// Y coordinate.
    pub y: Bn,
}

/// A Jacobian point; `z == 0` is the point at infinity.
#[derive(Debug, Clone)]
struct Point {
    x: Bn,
    y: Bn,
    z: Bn,
}

impl Point {
    fn infinity() -> Point {
        Point {
            x: Bn::one(),
            y: Bn::one(),
            z: Bn::zero(),
        }
    }

    fn is_infinity(&self) -> bool {
        self.z.is_zero()
    }

    fn from_affine(pt: &AffinePoint) -> Point {
        Point {
            x: pt.x.clone(),
            y: pt.y.clone(),
            z: Bn::one(),
        }
    }
}

impl Curve {
    /// Looks up the domain parameters for `id`.
    pub fn get(id: CurveId) -> Curve {
        let (p, a, b, n, gx, gy, width): (&str, &str, &str, &str, &str, &str, usize) = match id {
            CurveId::P192 => (
                "fffffffffffffffffffffffffffffffeffffffffffffffff",
                "fffffffffffffffffffffffffffffffefffffffffffffffc",
                "64210519e59c80e70fa7e9ab72243049feb8deecc146b9b1",
                "ffffffffffffffffffffffff99def836146bc9b1b4d22831",
                "188da80eb03090f67cbf20eb43a18800f4ff0afd82ff1012",
                "07192b95ffc8da78631011ed6b24cdd573f977a11e794811",
                24,
            ),
            CurveId::P256 => (
                "ffffffff00000001000000000000000000000000ffffffffffffffffffffffff",
                "ffffffff00000001000000000000000000000000fffffffffffffffffffffffc",
                "5ac635d8aa3a93e7b3ebbd55769886bc651d06b0cc53b0f63bce3c3e27d2604b",
                "ffffffff00000000ffffffffffffffffbce6faada7179e84f3b9cac2fc632551",
                "6b17d1f2e12c4247f8bce6e563a440f277037d812deb33a0f4a13945d898c296",
                "4fe342e2fe1a7f9b8ee7eb4a7c0f9e162bce33576b315ececbb6406837bf51f5",
                32,
            ),
            CurveId::P384 => (
                "fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffeffffffff0000000000000000ffffffff",
                "fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffeffffffff0000000000000000fffffffc",
                "b3312fa7e23ee7e4988e056be3f82d19181d9c6efe8141120314088f5013875ac656398d8a2ed19d2a85c8edd3ec2aef",
                "ffffffffffffffffffffffffffffffffffffffffffffffffc7634d81f4372ddf581a0db248b0a77aecec196accc52973",
                "aa87ca22be8b05378eb1c71ef320ad746e1d3b628ba79b9859f741e082542a385502f25dbf55296c3a545e3872760ab7",
                "3617de4a96262c6f5d9e98bf9292dc29f8f41dbd289a147ce9da3113b5f0b8c00a60b1ce1d7e819d7a431d7c90ea0e5f",
                48,
            ),
            CurveId::P521 => (
                "01ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
                "01fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffc",
                "0051953eb9618e1c9a1f929a21a0b68540eea2da725b99b315f3b8b489918ef109e156193951ec7e937b1652c0bd3bb1bf073573df883d2c34f1ef451fd46b503f00",
                "01fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffa51868783bf2f966b7fcc0148f709a5d03bb5c9b8899c47aebb6fb71e91386409",
                "00c6858e06b70404e9cd9e3ecb662395b4429c648139053fb521f828af606b4d3dbaa14b5e77efe75928fe1dc127a2ffa8de3348b3c1856a429bf97e7e31c2e5bd66",
                "011839296a789a3bc0045c8a5fb42c7d1bd998f54449579b446817afbd17273e662c97ee72995ef42640c550b9013fad0761353c7086a272c24088be94769fd16650",
                66,
            ),
            CurveId::Secp256k1 => (
                "fffffffffffffffffffffffffffffffffffffffffffffffffffffffefffffc2f",
                "0000000000000000000000000000000000000000000000000000000000000000",
                "0000000000000000000000000000000000000000000000000000000000000007",
                "fffffffffffffffffffffffffffffffebaaedce6af48a03bbfd25e8cd0364141",
                "79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798",
                "483ada7726a3c4655da4fbfc0e1108a8fd17b448a68554199c47d08ffb10d4b8",
                32,
            ),
        };
        let p = bn_hex(p);
        let reducer = match id {
            CurveId::Secp256k1 => Reducer::FoldK1,
            CurveId::P521 => Reducer::Fold521,
            _ => {
                let k = p.bit_len();
                Reducer::Barrett {
                    mu: Bn::one().shl(2 * k).div_rem(&p).0,
                    k,
                }
            }
        };
        Curve {
            id,
            p,
            a: bn_hex(a),
            b: bn_hex(b),
            n: bn_hex(n),
            gx: bn_hex(gx),
            gy: bn_hex(gy),
            field_bytes: width,
            reducer,
        }
    }

    /// Curve for a key-file `(type, size-in-bits)` pair, if supported.
    pub fn for_key_file(file_type: u8, bits: u16) -> Option<CurveId> {
        match (file_type, bits) {
            (0x23, 256) => Some(CurveId::Secp256k1),
            (0x22, 192) => Some(CurveId::P192),
            (0x22, 256) => Some(CurveId::P256),
            (0x22, 384) => Some(CurveId::P384),
            (0x22, 521) => Some(CurveId::P521),
            _ => None,
        }
    }

    /// Curve for an existing private-key part of `len` bytes.
    pub fn for_key_len(file_type: u8, len: usize) -> Option<CurveId> {
        if file_type == 0x23 {
            return (len == 32).then_some(CurveId::Secp256k1);
        }
        match len {
            24 => Some(CurveId::P192),
            32 => Some(CurveId::P256),
            48 => Some(CurveId::P384),
            66 => Some(CurveId::P521),
            _ => None,
        }
    }

    /// The generator point.
    pub fn generator(&self) -> AffinePoint {
        AffinePoint {
            x: self.gx.clone(),
            y: self.gy.clone(),
        }
    }

    /// Reduces an intermediate (a product of two field elements) modulo
    /// `p`.
    fn reduce(&self, x: Bn) -> Bn {
        match &self.reducer {
            Reducer::FoldK1 => {
                let c = Bn::from_u64(0x1_0000_03D1);
                let mut x = x;
                while x.bit_len() > 256 {
                    let hi = x.shr(256);
                    let lo = x.sub(&hi.shl(256));
                    x = lo.add(&hi.mul(&c));
                }
                while x >= self.p {
                    x = x.sub(&self.p);
                }
                x
            }
            Reducer::Fold521 => {
                let mut x = x;
                while x.bit_len() > 521 {
                    let hi = x.shr(521);
                    let lo = x.sub(&hi.shl(521));
                    x = lo.add(&hi);
                }
                if x >= self.p {
                    x = x.sub(&self.p);
                }
                x
            }
            Reducer::Barrett { mu, k } => {
                if x < self.p {
                    return x;
                }
                // q underestimates x/p by at most two
                let q = x.shr(k - 1).mul(mu).shr(k + 1);
                let mut r = x.sub(&q.mul(&self.p));
                while r >= self.p {
                    r = r.sub(&self.p);
                }
                r
            }
        }
    }

    fn fmul(&self, a: &Bn, b: &Bn) -> Bn {
        self.reduce(a.mul(b))
    }

    fn fsqr(&self, a: &Bn) -> Bn {
        self.reduce(a.mul(a))
    }

    fn fadd(&self, a: &Bn, b: &Bn) -> Bn {
        a.mod_add(b, &self.p)
    }

    fn fsub(&self, a: &Bn, b: &Bn) -> Bn {
        a.mod_sub(b, &self.p)
    }

    fn fdbl(&self, a: &Bn) -> Bn {
        a.mod_add(a, &self.p)
    }

    /// Point doubling, general `a` coefficient.
    fn double(&self, pt: &Point) -> Point {
        if pt.is_infinity() || pt.y.is_zero() {
            return Point::infinity();
        }
        let ysq = self.fsqr(&pt.y);
        // S = 4 * X * Y^2
        let s = self.fdbl(&self.fdbl(&self.fmul(&pt.x, &ysq)));
        // M = 3 * X^2 + a * Z^4
        let xsq = self.fsqr(&pt.x);
        let z4 = self.fsqr(&self.fsqr(&pt.z));
        let m = self.fadd(&self.fadd(&self.fdbl(&xsq), &xsq), &self.fmul(&self.a, &z4));
        let x3 = self.fsub(&self.fsqr(&m), &self.fdbl(&s));
        // Y3 = M * (S - X3) - 8 * Y^4
        let y4_8 = self.fdbl(&self.fdbl(&self.fdbl(&self.fsqr(&ysq))));
        let y3 = self.fsub(&self.fmul(&m, &self.fsub(&s, &x3)), &y4_8);
        let z3 = self.fdbl(&self.fmul(&pt.y, &pt.z));
        Point {
            x: x3,
            y: y3,
            z: z3,
        }
    }

    /// General point addition (handles infinity and the doubling case).
    fn add(&self, a: &Point, b: &Point) -> Point {
        if a.is_infinity() {
            return b.clone();
        }
        if b.is_infinity() {
            return a.clone();
        }
        let z1sq = self.fsqr(&a.z);
        let z2sq = self.fsqr(&b.z);
        let u1 = self.fmul(&a.x, &z2sq);
        let u2 = self.fmul(&b.x, &z1sq);
        let s1 = self.fmul(&a.y, &self.fmul(&z2sq, &b.z));
        let s2 = self.fmul(&b.y, &self.fmul(&z1sq, &a.z));
        let h = self.fsub(&u2, &u1);
        let r = self.fsub(&s2, &s1);
        if h.is_zero() {
            if r.is_zero() {
                return self.double(a);
            }
            return Point::infinity();
        }
        let hsq = self.fsqr(&h);
        let hcu = self.fmul(&hsq, &h);
        let u1hsq = self.fmul(&u1, &hsq);
        let x3 = self.fsub(&self.fsub(&self.fsqr(&r), &hcu), &self.fdbl(&u1hsq));
        let y3 = self.fsub(&self.fmul(&r, &self.fsub(&u1hsq, &x3)), &self.fmul(&s1, &hcu));
        let z3 = self.fmul(&self.fmul(&a.z, &b.z), &h);
        Point {
            x: x3,
            y: y3,
            z: z3,
        }
    }

    /// Fixed-window ladder over a big-endian scalar byte string.
    ///
    /// Every 4-bit window performs four doublings and one addition; a zero
    /// window adds into a decoy accumulator instead of skipping, so the
    /// operation trace is independent of the scalar bits.
    fn scalar_mul(&self, base: &Point, k: &[u8]) -> Point {
        // table[i] = i * base, i in 1..16
        let mut table: Vec<Point> = Vec::with_capacity(16);
        table.push(Point::infinity()); // index 0 unused
        table.push(base.clone());
        for i in 2..16 {
            let pt = if i % 2 == 0 {
                self.double(&table[i / 2])
            } else {
                self.add(&table[i - 1], &table[1])
            };
            table.push(pt);
        }

        let mut acc = Point::infinity();
        let mut decoy = table[2].clone();
        for &byte in k {
            for nibble in [byte >> 4, byte & 0x0F] {
                for _ in 0..4 {
                    acc = self.double(&acc);
                }
                if nibble == 0 {
                    decoy = self.add(&decoy, &table[1]);
                } else {
                    acc = self.add(&acc, &table[usize::from(nibble)]);
                }
            }
        }
        // keep the decoy alive so the compiler cannot elide its adds
        if decoy.is_infinity() {
            return decoy;
        }
        acc
    }

    /// Converts to affine coordinates; fails on the point at infinity.
    fn affinify(&self, pt: &Point) -> Result<AffinePoint, CryptoError> {
        if pt.is_infinity() {
            return Err(CryptoError::InvalidPoint);
        }
        let zinv = pt.z.mod_inv(&self.p).ok_or(CryptoError::InvalidPoint)?;
        let zinv2 = self.fsqr(&zinv);
        let x = self.fmul(&pt.x, &zinv2);
        let y = self.fmul(&pt.y, &self.fmul(&zinv2, &zinv));
        Ok(AffinePoint { x, y })
    }

    /// Affine on-curve check: `y^2 == x^3 + a*x + b` with coordinates below
    /// the field prime.
    pub fn is_on_curve(&self, pt: &AffinePoint) -> bool {
        if pt.x >= self.p || pt.y >= self.p {
            return false;
        }
        let lhs = self.fsqr(&pt.y);
        let rhs = self.fadd(
            &self.fadd(&self.fmul(&self.fsqr(&pt.x), &pt.x), &self.fmul(&self.a, &pt.x)),
            &self.b,
        );
        lhs == rhs
    }

    /// Blinded scalar multiplication `k * base` with the order-range checks
    /// the card applies to every secret scalar.
    fn mul_blinded(
        &self,
        k: &Bn,
        base: &AffinePoint,
        rng: &mut dyn RngCore,
    ) -> Result<AffinePoint, CryptoError> {
        if k.is_zero() || *k >= self.n {
            return Err(CryptoError::InvalidKey);
        }
        // blind: k' = k + r * n, r random with a pinned top bit so the
        // ladder length does not depend on k
        let mut rb = [0u8; SCALAR_BLIND_BYTES];
        rng.fill_bytes(&mut rb);
        rb[0] = (rb[0] & 0x3F) | 0x20;
        let blinded = k.add(&Bn::from_bytes_be(&rb).mul(&self.n));
        let kb = blinded.to_bytes_be(self.field_bytes + SCALAR_BLIND_BYTES + 1);

        let q = self.scalar_mul(&Point::from_affine(base), &kb);
        let affine = self.affinify(&q)?;
        // X must be usable as an r-value: nonzero and below the order
        if affine.x.is_zero() || affine.x >= self.n {
            return Err(CryptoError::InvalidPoint);
        }
        Ok(affine)
    }

    /// Generates a key pair; retries on degenerate scalars.
    pub fn generate_key(
        &self,
        rng: &mut dyn RngCore,
    ) -> Result<(Bn, AffinePoint), CryptoError> {
        let g = self.generator();
        for _ in 0..MAX_ATTEMPTS {
            let d = self.random_scalar(rng);
            if let Ok(public) = self.mul_blinded(&d, &g, rng) {
                return Ok((d, public));
            }
        }
        Err(CryptoError::Exhausted)
    }

    fn random_scalar(&self, rng: &mut dyn RngCore) -> Bn {
        let mut buf = vec![0u8; self.field_bytes];
        rng.fill_bytes(&mut buf);
        if self.id == CurveId::P521 {
            buf[0] &= 1;
        }
        Bn::from_bytes_be(&buf)
    }

    /// ECDSA over a raw message scalar (the hash, truncated/padded by the
    /// caller to at most the field width). Returns `(r, s)`.
    pub fn ecdsa_sign(
        &self,
        d: &Bn,
        hash: &[u8],
        rng: &mut dyn RngCore,
    ) -> Result<(Bn, Bn), CryptoError> {
        if hash.len() > self.field_bytes {
            return Err(CryptoError::BadLength);
        }
        if d.is_zero() || *d >= self.n {
            return Err(CryptoError::InvalidKey);
        }
        let e = Bn::from_bytes_be(hash).rem(&self.n);
        let g = self.generator();
        for _ in 0..MAX_ATTEMPTS {
            let k = self.random_scalar(rng);
            if k.is_zero() || k >= self.n {
                continue;
            }
            let rp = match self.mul_blinded(&k, &g, rng) {
                Ok(pt) => pt,
                Err(_) => continue,
            };
            let r = rp.x;
            // s = k^-1 * (e + d*r) mod n
            let kinv = match k.mod_inv(&self.n) {
                Some(v) => v,
                None => continue,
            };
            let s = kinv.mod_mul(&d.mod_mul(&r, &self.n).mod_add(&e, &self.n), &self.n);
            if s.is_zero() {
                continue;
            }
            return Ok((r, s));
        }
        Err(CryptoError::Exhausted)
    }

    /// ECDH: multiplies the verified peer point by the private scalar and
    /// returns the X coordinate of the shared point.
    pub fn ecdh(
        &self,
        d: &Bn,
        peer: &AffinePoint,
        rng: &mut dyn RngCore,
    ) -> Result<Bn, CryptoError> {
        if !self.is_on_curve(peer) {
            return Err(CryptoError::InvalidPoint);
        }
        Ok(self.mul_blinded(d, peer, rng)?.x)
    }

    /// ECDSA verification (harness/tests; the card itself only signs).
    pub fn ecdsa_verify(&self, hash: &[u8], r: &Bn, s: &Bn, public: &AffinePoint) -> bool {
        if r.is_zero() || *r >= self.n || s.is_zero() || *s >= self.n {
            return false;
        }
        if !self.is_on_curve(public) {
            return false;
        }
        let e = Bn::from_bytes_be(hash).rem(&self.n);
        let w = match s.mod_inv(&self.n) {
            Some(w) => w,
            None => return false,
        };
        let u1 = e.mod_mul(&w, &self.n);
        let u2 = r.mod_mul(&w, &self.n);
        let width = self.field_bytes + 1;
        let a = self.scalar_mul(
            &Point::from_affine(&self.generator()),
            &u1.to_bytes_be(width),
        );
        let b = self.scalar_mul(&Point::from_affine(public), &u2.to_bytes_be(width));
        match self.affinify(&self.add(&a, &b)) {
            Ok(pt) => pt.x.rem(&self.n) == *r,
            Err(_) => false,
        }
    }
}

fn bn_hex(s: &str) -> Bn {
    let mut out = Vec::with_capacity(s.len() / 2);
    let bytes = s.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        let hi = (bytes[i] as char).to_digit(16).expect("curve constant");
        let lo = (bytes[i + 1] as char).to_digit(16).expect("curve constant");
        out.push((hi << 4 | lo) as u8);
        i += 2;
    }
    Bn::from_bytes_be(&out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const ALL: [CurveId; 5] = [
        CurveId::P192,
        CurveId::P256,
        CurveId::P384,
        CurveId::P521,
        CurveId::Secp256k1,
    ];

    #[test]
    fn reduction_agrees_with_division() {
        for id in ALL {
            let c = Curve::get(id);
            let pm1 = c.p.sub(&Bn::one());
            for v in [
                Bn::zero(),
                Bn::one(),
                pm1.clone(),
                pm1.mul(&pm1),
                pm1.mul(&Bn::from_u32(2)),
                c.gx.mul(&c.gy),
            ] {
                assert_eq!(c.reduce(v.clone()), v.rem(&c.p), "{id:?}");
            }
        }
    }

    #[test]
    fn generators_are_on_their_curves() {
        for id in ALL {
            let c = Curve::get(id);
            assert!(c.is_on_curve(&c.generator()), "{id:?}");
            assert!(c.generator().x.byte_len() <= c.field_bytes);
        }
    }

    #[test]
    fn small_multiples_match_repeated_addition() {
        let c = Curve::get(CurveId::P256);
        let g = Point::from_affine(&c.generator());
        let mut expect = g.clone();
        for k in 1u8..=8 {
            let got = c.scalar_mul(&g, &[k]);
            let got = c.affinify(&got).unwrap();
            let want = c.affinify(&expect).unwrap();
            assert_eq!(got, want, "k = {k}");
            assert!(c.is_on_curve(&got));
            expect = c.add(&expect, &g);
        }
    }

    #[test]
    fn doubling_formula_agrees_with_addition() {
        for id in [CurveId::P192, CurveId::Secp256k1] {
            let c = Curve::get(id);
            let g = Point::from_affine(&c.generator());
            let d = c.double(&g);
            let two_g = c.scalar_mul(&g, &[2]);
            assert_eq!(c.affinify(&d).unwrap(), c.affinify(&two_g).unwrap());
        }
    }

    #[test]
    fn sign_verify_round_trip() {
        let mut rng = StdRng::seed_from_u64(42);
        for id in [CurveId::P256, CurveId::Secp256k1] {
            let c = Curve::get(id);
            let (d, public) = c.generate_key(&mut rng).unwrap();
            assert!(c.is_on_curve(&public));
            let hash = [0xA5u8; 32];
            let (r, s) = c.ecdsa_sign(&d, &hash, &mut rng).unwrap();
            assert!(!r.is_zero() && !s.is_zero());
            assert!(c.ecdsa_verify(&hash, &r, &s, &public), "{id:?}");
            // a different message must not verify
            assert!(!c.ecdsa_verify(&[0x5Au8; 32], &r, &s, &public));
        }
    }

    #[test]
    fn ecdh_agreement() {
        let mut rng = StdRng::seed_from_u64(1);
        let c = Curve::get(CurveId::P256);
        let (da, qa) = c.generate_key(&mut rng).unwrap();
        let (db, qb) = c.generate_key(&mut rng).unwrap();
        let sa = c.ecdh(&da, &qb, &mut rng).unwrap();
        let sb = c.ecdh(&db, &qa, &mut rng).unwrap();
        assert_eq!(sa, sb);
    }

    #[test]
    fn off_curve_peer_is_rejected() {
        let mut rng = StdRng::seed_from_u64(2);
        let c = Curve::get(CurveId::P256);
        let (d, _) = c.generate_key(&mut rng).unwrap();
        let mut bad = c.generator();
        bad.y = bad.y.mod_add(&Bn::one(), &c.p);
        assert_eq!(
            c.ecdh(&d, &bad, &mut rng).unwrap_err(),
            CryptoError::InvalidPoint
        );
    }

    #[test]
    fn p521_keygen_produces_valid_pair() {
        let mut rng = StdRng::seed_from_u64(9);
        let c = Curve::get(CurveId::P521);
        let (d, public) = c.generate_key(&mut rng).unwrap();
        assert!(d < c.n);
        assert!(c.is_on_curve(&public));
    }

    #[test]
    fn key_file_mapping() {
        assert_eq!(Curve::for_key_file(0x22, 256), Some(CurveId::P256));
        assert_eq!(Curve::for_key_file(0x23, 256), Some(CurveId::Secp256k1));
        assert_eq!(Curve::for_key_file(0x22, 255), None);
        assert_eq!(Curve::for_key_file(0x23, 192), None);
        assert_eq!(Curve::for_key_len(0x22, 66), Some(CurveId::P521));
    }
}
