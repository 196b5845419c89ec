//! GET DATA / PUT DATA object handlers: card identification, file lists,
//! key info, applet initialization, PIN initialization and key upload.

use crate::apdu::Apdu;
use crate::card::{AclOp, Card};
use crate::crypto::bn::Bn;
use crate::crypto::ec::Curve;
use crate::crypto::rsa;
use crate::dispatch::{CmdResult, Reply};
use crate::fs::{self, keyfile, Located, Query, KIND_AES, KIND_DES, KIND_EC_K1, KIND_EC_NIST,
    KIND_RSA};
use crate::pin;
use crate::status::StatusWord;

/// Card identification data (GET DATA 0xA0): 8 id bytes plus a 12-byte
/// serial area.
const CARD_ID: [u8; 20] = [
    0x46, 0x45, 0x52, 0x52, 0x4F, 0x45, 0x49, 0x44, // "FERROEID"
    0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Capability blob (GET DATA 0xAA): applet version and feature bytes.
const CARD_CAPS: [u8; 11] = [
    0x40, 0x01, 0x00, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x08,
];

impl Card {
    pub(crate) fn cmd_get_data(&mut self, a: &Apdu) -> CmdResult {
        if a.p1 != 1 {
            return Err(StatusWord::REF_NOT_FOUND);
        }
        if a.p2 & 0xB0 == 0xB0 {
            let rec = pin::load(&*self.sec, a.p2 & 0x0F)?;
            return self.stage_response(rec.info().to_vec());
        }
        if (0x81..=0x85).contains(&a.p2) {
            return self.ecc_domain_param(a.p2);
        }
        match a.p2 {
            0xA0 => self.stage_response(CARD_ID.to_vec()),
            0xA1..=0xA6 => self.list_files(a.p2),
            0xAA => self.stage_response(CARD_CAPS.to_vec()),
            0xAC => {
                let view = self.access_view();
                self.stage_response(view.to_be_bytes().to_vec())
            }
            0x00 => self.rsa_key_info(),
            0x01 => self.rsa_modulus(),
            0x02 => {
                let hit = self.require_selected().map_err(|_| StatusWord::REF_NOT_FOUND)?;
                let exp = self.key_part_or_missing(&hit, keyfile::TAG_RSA_PUB_EXP)?;
                self.stage_response(exp)
            }
            0x86 => {
                let hit = self.require_selected().map_err(|_| StatusWord::REF_NOT_FOUND)?;
                self.ec_public_tlv(&hit, 0x30)
            }
            _ => Err(StatusWord::REF_NOT_FOUND),
        }
    }

    /// Key-part read with the GET DATA error shape: anything unusable reads
    /// as "referenced data not found".
    fn key_part_or_missing(&self, hit: &Located, tag: u8) -> Result<Vec<u8>, StatusWord> {
        self.read_key_part(hit, tag).map_err(|e| {
            if e == StatusWord::MEMORY_FAILURE {
                e
            } else {
                StatusWord::REF_NOT_FOUND
            }
        })
    }

    fn ecc_domain_param(&mut self, p2: u8) -> CmdResult {
        let hit = self.require_selected().map_err(|_| StatusWord::REF_NOT_FOUND)?;
        let (curve, _) = self
            .load_ec_key(&hit)
            .map_err(|_| StatusWord::REF_NOT_FOUND)?;
        let fb = curve.field_bytes;
        let g = curve.generator();
        let value = match p2 {
            0x81 => curve.p.to_bytes_be(fb),
            0x82 => curve.a.to_bytes_be(fb),
            0x83 => curve.b.to_bytes_be(fb),
            0x84 => {
                let mut v = g.x.to_bytes_be(fb);
                v.extend_from_slice(&g.y.to_bytes_be(fb));
                v
            }
            _ => curve.n.to_bytes_be(fb),
        };
        self.stage_response(value)
    }

    fn list_files(&mut self, p2: u8) -> CmdResult {
        let (value, mask) = match p2 {
            0xA1 => (0x00, 0x00),        // everything
            0xA2 => (0x01, 0xBF),        // working EFs
            0xA3 => (0x38, 0xBF),        // DFs
            0xA4 => (0x11, 0xBF),        // RSA key EFs
            0xA5 => (0x22, 0xBE),        // EC key EFs (0x22 and 0x23)
            _ => (0x09, 0x8F),           // symmetric key EFs (0x19 and 0x29)
        };
        let dir = self.current_df()?;
        let ids = fs::list_ids(&*self.data, dir.entry.uuid, value, mask)?;
        if ids.is_empty() {
            return Ok(Reply::Done);
        }
        let mut out = Vec::with_capacity(ids.len() * 2);
        for id in ids {
            out.extend_from_slice(&id.to_be_bytes());
        }
        self.stage_response(out)
    }

    /// GET DATA 0x00: `92 00 || public exponent bits || modulus bits`.
    fn rsa_key_info(&mut self) -> CmdResult {
        let hit = self.require_selected().map_err(|_| StatusWord::REF_NOT_FOUND)?;
        let exp_bits = self.key_part_or_missing(&hit, keyfile::TAG_RSA_PUB_EXP)?.len() * 8;
        let mod_bits = self.key_part_or_missing(&hit, keyfile::TAG_RSA_P)?.len() * 16;
        let mut out = vec![0x92, 0x00];
        out.extend_from_slice(&(exp_bits as u16).to_be_bytes());
        out.extend_from_slice(&(mod_bits as u16).to_be_bytes());
        self.stage_response(out)
    }

    /// GET DATA 0x01: the modulus, recomputed from the stored primes.
    fn rsa_modulus(&mut self) -> CmdResult {
        let hit = self.require_selected().map_err(|_| StatusWord::REF_NOT_FOUND)?;
        let p_raw = self.key_part_or_missing(&hit, keyfile::TAG_RSA_P)?;
        let q_raw = self.key_part_or_missing(&hit, keyfile::TAG_RSA_Q)?;
        let width = p_raw.len() + q_raw.len();
        let n = Bn::from_bytes_le(&p_raw).mul(&Bn::from_bytes_le(&q_raw));
        self.stage_response(n.to_bytes_be(width))
    }

    pub(crate) fn cmd_put_data(&mut self, a: &Apdu) -> CmdResult {
        if a.p1 != 1 {
            return Err(StatusWord::WRONG_P1P2);
        }
        match a.p2 {
            0xE0 => self.initialize_applet(&a.data),
            1..=14 => {
                if self.lifecycle() != pin::LIFECYCLE_INIT {
                    return Err(StatusWord::SECURITY_STATUS);
                }
                pin::initialize(&mut *self.sec, a.p2, &a.data)?;
                Ok(Reply::Done)
            }
            0x80..=0x8B | 0xA0 => self.upload_key(a),
            _ => Err(StatusWord::FUNC_NOT_SUPPORTED),
        }
    }

    /// PUT DATA 0xE0: erase and re-initialize the card.
    ///
    /// Data layout: 2 bytes requested filesystem size (informational),
    /// 3 bytes MF ACL, 3 bytes application-DF ACL. Five to seven bytes of
    /// data create the MF alone; anything else also creates DF 5015.
    fn initialize_applet(&mut self, data: &[u8]) -> CmdResult {
        if let Ok(mf) = fs::search(&*self.data, Query::ByUuid(0)) {
            self.acl_check(&mf, AclOp::Delete)?;
        }
        self.long_operation();
        let mf_acl = (data.len() >= 5).then(|| [data[2], data[3], data[4]]);
        let with_app = data.len() < 5 || data.len() >= 8;
        let app_acl = (data.len() >= 8).then(|| [data[5], data[6], data[7]]);
        let mf = fs::mkfs(&mut *self.data, mf_acl, with_app, app_acl)?;

        // wipe the security records; blank memory reads as lifecycle 1
        let mut offset = 0usize;
        while offset < self.sec.len() {
            let chunk = (self.sec.len() - offset).min(256);
            self.sec
                .fill_ff(offset, chunk)
                .map_err(|_| StatusWord::MEMORY_FAILURE)?;
            offset += chunk;
        }
        self.selected = Some(mf);
        Ok(Reply::Done)
    }

    fn upload_key(&mut self, a: &Apdu) -> CmdResult {
        let hit = self.require_selected().map_err(|_| StatusWord::FILE_NOT_FOUND)?;
        let bits = usize::from(hit.entry.size);
        if bits == 0 {
            return Err(StatusWord::FILE_NOT_FOUND);
        }
        match hit.entry.kind & 0xBF {
            KIND_DES => {
                if !matches!(bits, 64 | 128 | 192) || a.data.len() * 8 != bits {
                    return Err(StatusWord::WRONG_LENGTH);
                }
                self.write_key_part(&hit, a.p2, &a.data)?;
                Ok(Reply::Done)
            }
            KIND_AES => {
                if !matches!(bits, 128 | 192 | 256) || a.data.len() * 8 != bits {
                    return Err(StatusWord::WRONG_LENGTH);
                }
                self.write_key_part(&hit, a.p2, &a.data)?;
                Ok(Reply::Done)
            }
            _ if self.curve_of_selected(&hit).is_some() => self.upload_ec_key(a, &hit),
            KIND_RSA if rsa::key_size_supported(bits) => self.upload_rsa_part(a, &hit),
            _ => Err(StatusWord::INCOMPATIBLE_FILE),
        }
    }

    fn upload_ec_key(&mut self, a: &Apdu, hit: &Located) -> CmdResult {
        let id = self
            .curve_of_selected(hit)
            .ok_or(StatusWord::INCOMPATIBLE_FILE)?;
        let fb = Curve::get(id).field_bytes;
        match a.p2 {
            0x87 => {
                if a.data.len() != fb {
                    return Err(StatusWord::WRONG_LENGTH);
                }
                self.write_key_part(hit, keyfile::TAG_EC_PRIVATE, &a.data)?;
            }
            0x86 => {
                if a.data.len() != 2 * fb + 1 {
                    return Err(StatusWord::WRONG_LENGTH);
                }
                if a.data[0] != 0x04 {
                    return Err(StatusWord::CONDITIONS_NOT_SATISFIED);
                }
                self.write_key_part(hit, keyfile::TAG_EC_PUBLIC, &a.data)?;
            }
            _ => return Err(StatusWord::WRONG_P1P2),
        }
        Ok(Reply::Done)
    }

    fn upload_rsa_part(&mut self, a: &Apdu, hit: &Located) -> CmdResult {
        let bits = usize::from(hit.entry.size);
        let mut value = a.data.clone();
        // CRT components may arrive with a spurious sign byte
        if value.len() % 2 == 1 && a.p2 != keyfile::TAG_RSA_PUB_EXP {
            if value.first() != Some(&0x00) {
                return Err(StatusWord::CONDITIONS_NOT_SATISFIED);
            }
            value.remove(0);
        }
        match a.p2 {
            // the card computes the modulus itself and CRT needs no full
            // private exponent; these uploads are acknowledged and dropped
            keyfile::TAG_RSA_MOD
            | keyfile::TAG_RSA_MOD_P1
            | keyfile::TAG_RSA_MOD_P2
            | keyfile::TAG_RSA_PRIV_EXP
            | keyfile::TAG_RSA_PRIV_EXP_P1
            | keyfile::TAG_RSA_PRIV_EXP_P2 => return Ok(Reply::Done),
            keyfile::TAG_RSA_P
            | keyfile::TAG_RSA_Q
            | keyfile::TAG_RSA_DP
            | keyfile::TAG_RSA_DQ
            | keyfile::TAG_RSA_QINV => {
                if value.len() * 16 != bits {
                    return Err(StatusWord::WRONG_LENGTH);
                }
            }
            keyfile::TAG_RSA_PUB_EXP => {}
            _ => return Err(StatusWord::CONDITIONS_NOT_SATISFIED),
        }
        self.long_operation();
        // numbers arrive big-endian and are stored little-endian
        value.reverse();
        self.write_key_part(hit, a.p2, &value)?;
        if a.p2 == keyfile::TAG_RSA_P || a.p2 == keyfile::TAG_RSA_Q {
            self.write_prime_precomputes(hit, a.p2, &value)?;
        }
        Ok(Reply::Done)
    }

    /// CLA 0x80 key-type change: retags a NIST EC key file as secp256k1.
    pub(crate) fn cmd_key_change_type(&mut self, a: &Apdu) -> CmdResult {
        if a.p1 != 0 || a.p2 != 0 {
            return Err(StatusWord::WRONG_P1P2);
        }
        let hit = self.require_selected()?;
        if self.acl_check(&hit, AclOp::Update).is_err()
            && self.acl_check(&hit, AclOp::Generate).is_err()
        {
            return Err(StatusWord::SECURITY_STATUS);
        }
        if hit.entry.kind == KIND_EC_K1 {
            return Ok(Reply::Done);
        }
        if hit.entry.kind != KIND_EC_NIST {
            return Err(StatusWord::CONDITIONS_NOT_SATISFIED);
        }
        let mut patched = hit;
        patched.entry.kind = KIND_EC_K1;
        fs::rewrite_entry(&mut *self.data, &patched)?;
        self.refresh_selection();
        Ok(Reply::Done)
    }
}
