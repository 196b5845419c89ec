//! GENERATE KEY (INS 0x46): on-card RSA and EC key pair generation.
//!
//! The key shape is never in the command: the selected file's type and
//! declared size decide everything. RSA writes the CRT components plus the
//! per-prime Montgomery/Barrett precomputes and answers with the modulus;
//! EC writes the private and public parts and answers with the public
//! point. Every generated part carries the provenance flag, so the write
//! is gated on the GENERATE ACL.

use crate::apdu::Apdu;
use crate::card::Card;
use crate::crypto::ec::Curve;
use crate::crypto::rsa;
use crate::dispatch::CmdResult;
use crate::fs::{keyfile, Located, KIND_RSA};
use crate::status::StatusWord;
use crate::tlv::push_len;

impl Card {
    pub(crate) fn cmd_generate_key(&mut self, a: &Apdu) -> CmdResult {
        if a.p1 != 0 || a.p2 != 0 {
            return Err(StatusWord::WRONG_P1P2);
        }
        let hit = self
            .require_selected()
            .map_err(|_| StatusWord::CONDITIONS_NOT_SATISFIED)?;
        if hit.entry.kind & 0xBF == KIND_RSA {
            self.generate_rsa(a, &hit)
        } else {
            self.generate_ec(a, &hit)
        }
    }

    fn generate_rsa(&mut self, a: &Apdu, hit: &Located) -> CmdResult {
        // optional public-exponent sequence; anything but 65537 is refused
        if a.nc != 0 {
            let d = &a.data;
            let ok = d.len() == 7
                && d[0] == 0x30
                && d[1] == 0x05
                && (d[2] == 0x81 || d[2] == 0x02)
                && d[3] == 0x03
                && d[4..7] == [0x01, 0x00, 0x01];
            if !ok {
                return Err(StatusWord::INVALID_DATA);
            }
        }
        let bits = usize::from(hit.entry.size);
        if !rsa::key_size_supported(bits) {
            return Err(StatusWord::INCOMPATIBLE_FILE);
        }
        self.long_operation();
        let (key, modulus) = rsa::generate_key(bits, &mut *self.rng)
            .map_err(|_| StatusWord::CONDITIONS_NOT_SATISFIED)?;

        let half = bits / 16;
        let gen = keyfile::KEY_GENERATE;
        let p_le = key.p.to_bytes_le(half);
        let q_le = key.q.to_bytes_le(half);
        self.write_key_part(hit, keyfile::TAG_RSA_P | gen, &p_le)?;
        self.write_prime_precomputes(hit, keyfile::TAG_RSA_P | gen, &p_le)?;
        self.write_key_part(hit, keyfile::TAG_RSA_Q | gen, &q_le)?;
        self.write_prime_precomputes(hit, keyfile::TAG_RSA_Q | gen, &q_le)?;
        self.write_key_part(hit, keyfile::TAG_RSA_DP | gen, &key.dp.to_bytes_le(half))?;
        self.write_key_part(hit, keyfile::TAG_RSA_DQ | gen, &key.dq.to_bytes_le(half))?;
        self.write_key_part(hit, keyfile::TAG_RSA_QINV | gen, &key.qinv.to_bytes_le(half))?;
        self.write_key_part(hit, keyfile::TAG_RSA_PUB_EXP | gen, &[0x01, 0x00, 0x01])?;

        self.stage_response(modulus.to_bytes_be(bits / 8))
    }

    fn generate_ec(&mut self, a: &Apdu, hit: &Located) -> CmdResult {
        if a.nc != 0 {
            return Err(StatusWord::CONDITIONS_NOT_SATISFIED);
        }
        let id = self
            .curve_of_selected(hit)
            .ok_or(StatusWord::CONDITIONS_NOT_SATISFIED)?;
        let curve = Curve::get(id);
        self.long_operation();
        let (d, public) = curve
            .generate_key(&mut *self.rng)
            .map_err(|_| StatusWord::CONDITIONS_NOT_SATISFIED)?;

        let fb = curve.field_bytes;
        let gen = keyfile::KEY_GENERATE;
        self.write_key_part(hit, keyfile::TAG_EC_PRIVATE | gen, &d.to_bytes_be(fb))?;
        let mut point = Vec::with_capacity(1 + 2 * fb);
        point.push(0x04);
        point.extend_from_slice(&public.x.to_bytes_be(fb));
        point.extend_from_slice(&public.y.to_bytes_be(fb));
        self.write_key_part(hit, keyfile::TAG_EC_PUBLIC | gen, &point)?;

        self.ec_public_tlv(hit, 0x86)
    }

    /// Stages the stored EC public point wrapped in a one-tag TLV.
    pub(crate) fn ec_public_tlv(&mut self, hit: &Located, tag: u8) -> CmdResult {
        let point = self.read_key_part(hit, keyfile::TAG_EC_PUBLIC)?;
        let mut out = vec![tag];
        push_len(&mut out, point.len());
        out.extend_from_slice(&point);
        self.stage_response(out)
    }
}
