//! AES-128/192/256 block primitive.
//!
//! The S-box, its inverse and the round constants are derived from the
//! GF(2^8) arithmetic at first use rather than transcribed, so a table typo
//! cannot exist. Only the ECB block operation lives here; CBC chaining and
//! PKCS#7 are applied by the security-operation layer, which is where the
//! original card put them as well.

use std::sync::OnceLock;

use super::CryptoError;

/// AES block size in bytes.
pub const BLOCK: usize = 16;

struct Tables {
    sbox: [u8; 256],
    inv_sbox: [u8; 256],
}

fn xtime(a: u8) -> u8 {
    (a << 1) ^ (if a & 0x80 != 0 { 0x1B } else { 0 })
}

/// GF(2^8) product modulo x^8 + x^4 + x^3 + x + 1.
fn gmul(mut a: u8, mut b: u8) -> u8 {
    let mut r = 0u8;
    while b != 0 {
        if b & 1 != 0 {
            r ^= a;
        }
        a = xtime(a);
        b >>= 1;
    }
    r
}

fn tables() -> &'static Tables {
    static TABLES: OnceLock<Tables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let mut sbox = [0u8; 256];
        let mut inv_sbox = [0u8; 256];
        for x in 0..256u16 {
            let x = x as u8;
            // multiplicative inverse via x^254, 0 maps to 0
            let mut inv = 1u8;
            if x != 0 {
                for _ in 0..254 {
                    inv = gmul(inv, x);
                }
            }
            // affine transform
            let b = inv
                ^ inv.rotate_left(1)
                ^ inv.rotate_left(2)
                ^ inv.rotate_left(3)
                ^ inv.rotate_left(4)
                ^ 0x63;
            sbox[usize::from(x)] = b;
            inv_sbox[usize::from(b)] = x;
        }
        Tables { sbox, inv_sbox }
    })
}

/// An expanded AES key schedule.
#[derive(Clone)]
pub struct Aes {
    round_keys: Vec<u32>,
    rounds: usize,
}

impl Aes {
    /// Expands a 16-, 24- or 32-byte key.
    pub fn new(key: &[u8]) -> Result<Aes, CryptoError> {
        let nk = match key.len() {
            16 => 4,
            24 => 6,
            32 => 8,
            _ => return Err(CryptoError::BadLength),
        };
        let rounds = nk + 6;
        let t = tables();
        let sub_word =
            |w: u32| -> u32 { w.to_be_bytes().iter().fold(0u32, |acc, &b| acc << 8 | u32::from(t.sbox[usize::from(b)])) };

        let mut w = Vec::with_capacity(4 * (rounds + 1));
        for chunk in key.chunks_exact(4) {
            w.push(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        let mut rcon: u8 = 1;
        for i in nk..4 * (rounds + 1) {
            let mut temp = w[i - 1];
            if i % nk == 0 {
                temp = sub_word(temp.rotate_left(8)) ^ u32::from(rcon) << 24;
                rcon = xtime(rcon);
            } else if nk > 6 && i % nk == 4 {
                temp = sub_word(temp);
            }
            w.push(w[i - nk] ^ temp);
        }
        Ok(Aes {
            round_keys: w,
            rounds,
        })
    }

    fn add_round_key(&self, state: &mut [u8; BLOCK], round: usize) {
        for c in 0..4 {
            let k = self.round_keys[4 * round + c].to_be_bytes();
            for r in 0..4 {
                state[4 * c + r] ^= k[r];
            }
        }
    }

    /// Encrypts one block in place.
    pub fn encrypt_block(&self, state: &mut [u8; BLOCK]) {
        let t = tables();
        self.add_round_key(state, 0);
        for round in 1..=self.rounds {
            for b in state.iter_mut() {
                *b = t.sbox[usize::from(*b)];
            }
            shift_rows(state);
            if round != self.rounds {
                mix_columns(state);
            }
            self.add_round_key(state, round);
        }
    }

    /// Decrypts one block in place.
    pub fn decrypt_block(&self, state: &mut [u8; BLOCK]) {
        let t = tables();
        self.add_round_key(state, self.rounds);
        for round in (0..self.rounds).rev() {
            inv_shift_rows(state);
            for b in state.iter_mut() {
                *b = t.inv_sbox[usize::from(*b)];
            }
            self.add_round_key(state, round);
            if round != 0 {
                inv_mix_columns(state);
            }
        }
    }
}

// state layout: state[4c + r] = s[r][c], matching the FIPS-197 column order
// of the input byte stream.

fn shift_rows(state: &mut [u8; BLOCK]) {
    let old = *state;
    for r in 1..4 {
        for c in 0..4 {
            state[4 * c + r] = old[4 * ((c + r) % 4) + r];
        }
    }
}

fn inv_shift_rows(state: &mut [u8; BLOCK]) {
    let old = *state;
    for r in 1..4 {
        for c in 0..4 {
            state[4 * ((c + r) % 4) + r] = old[4 * c + r];
        }
    }
}

fn mix_columns(state: &mut [u8; BLOCK]) {
    for c in 0..4 {
        let col = &mut state[4 * c..4 * c + 4];
        let [s0, s1, s2, s3] = [col[0], col[1], col[2], col[3]];
        col[0] = gmul(s0, 2) ^ gmul(s1, 3) ^ s2 ^ s3;
        col[1] = s0 ^ gmul(s1, 2) ^ gmul(s2, 3) ^ s3;
        col[2] = s0 ^ s1 ^ gmul(s2, 2) ^ gmul(s3, 3);
        col[3] = gmul(s0, 3) ^ s1 ^ s2 ^ gmul(s3, 2);
    }
}

fn inv_mix_columns(state: &mut [u8; BLOCK]) {
    for c in 0..4 {
        let col = &mut state[4 * c..4 * c + 4];
        let [s0, s1, s2, s3] = [col[0], col[1], col[2], col[3]];
        col[0] = gmul(s0, 14) ^ gmul(s1, 11) ^ gmul(s2, 13) ^ gmul(s3, 9);
        col[1] = gmul(s0, 9) ^ gmul(s1, 14) ^ gmul(s2, 11) ^ gmul(s3, 13);
        col[2] = gmul(s0, 13) ^ gmul(s1, 9) ^ gmul(s2, 14) ^ gmul(s3, 11);
        col[3] = gmul(s0, 11) ^ gmul(s1, 13) ^ gmul(s2, 9) ^ gmul(s3, 14);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sbox_has_known_fixed_points() {
        let t = tables();
        assert_eq!(t.sbox[0x00], 0x63);
        assert_eq!(t.sbox[0x01], 0x7C);
        assert_eq!(t.sbox[0x53], 0xED);
        for i in 0..256 {
            assert_eq!(usize::from(t.inv_sbox[usize::from(t.sbox[i])]), i);
        }
    }

    // FIPS-197 appendix C vectors
    const PLAIN: [u8; 16] = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE,
        0xFF,
    ];

    fn seq_key(len: usize) -> Vec<u8> {
        (0..len as u8).collect()
    }

    #[test]
    fn fips197_aes128() {
        let aes = Aes::new(&seq_key(16)).unwrap();
        let mut block = PLAIN;
        aes.encrypt_block(&mut block);
        assert_eq!(
            hex::encode(block),
            "69c4e0d86a7b0430d8cdb78070b4c55a"
        );
        aes.decrypt_block(&mut block);
        assert_eq!(block, PLAIN);
    }

    #[test]
    fn fips197_aes192() {
        let aes = Aes::new(&seq_key(24)).unwrap();
        let mut block = PLAIN;
        aes.encrypt_block(&mut block);
        assert_eq!(
            hex::encode(block),
            "dda97ca4864cdfe06eaf70a0ec0d7191"
        );
        aes.decrypt_block(&mut block);
        assert_eq!(block, PLAIN);
    }

    #[test]
    fn fips197_aes256() {
        let aes = Aes::new(&seq_key(32)).unwrap();
        let mut block = PLAIN;
        aes.encrypt_block(&mut block);
        assert_eq!(
            hex::encode(block),
            "8ea2b7ca516745bfeafc49904b496089"
        );
        aes.decrypt_block(&mut block);
        assert_eq!(block, PLAIN);
    }

    #[test]
    fn rejects_bad_key_lengths() {
        assert!(Aes::new(&[0u8; 15]).is_err());
        assert!(Aes::new(&[0u8; 33]).is_err());
    }
}
