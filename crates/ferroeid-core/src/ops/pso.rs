//! PERFORM SECURITY OPERATION, MANAGE SECURITY ENVIRONMENT and GENERAL
//! AUTHENTICATE.
//!
//! Every key operation runs the same envelope: the key file named by the
//! environment is selected, the operation executes, the previous selection
//! is restored and the key file's user-consent PIN (prop nibble 12..15) is
//! deauthenticated. Symmetric CBC state (`iv_run`) survives across chained
//! fragments; RSA deciphering reassembles split ciphertexts delivered with
//! the 0x81/0x82 padding indicators through a synthetic chain.

use crate::apdu::{Apdu, ChainState, MAX_RESPONSE};
use crate::card::{AclOp, Card};
use crate::crypto::aes::Aes;
use crate::crypto::bn::Bn;
use crate::crypto::des::Des3;
use crate::crypto::ec::{AffinePoint, Curve};
use crate::crypto::rsa;
use crate::dispatch::{CmdResult, Reply};
use crate::fs::{self, keyfile, Located, Query, KIND_AES, KIND_DES, KIND_RSA};
use crate::sec_env::{self, SecurityEnv, Template};
use crate::status::StatusWord;
use crate::tlv::{push_len, TlvReader};

/// Direction of a symmetric operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
    Encrypt,
    Decrypt,
}

enum BlockCipher {
    Aes(Box<Aes>),
    Des(Box<Des3>),
}

impl BlockCipher {
    fn block_size(&self) -> usize {
        match self {
            BlockCipher::Aes(_) => 16,
            BlockCipher::Des(_) => 8,
        }
    }

    fn apply(&self, chunk: &mut [u8], dir: Dir) {
        match self {
            BlockCipher::Aes(aes) => {
                let mut block = [0u8; 16];
                block.copy_from_slice(chunk);
                match dir {
                    Dir::Encrypt => aes.encrypt_block(&mut block),
                    Dir::Decrypt => aes.decrypt_block(&mut block),
                }
                chunk.copy_from_slice(&block);
            }
            BlockCipher::Des(des) => {
                let mut block = [0u8; 8];
                block.copy_from_slice(chunk);
                match dir {
                    Dir::Encrypt => des.encrypt_block(&mut block),
                    Dir::Decrypt => des.decrypt_block(&mut block),
                }
                chunk.copy_from_slice(&block);
            }
        }
    }
}

impl Card {
    pub(crate) fn cmd_manage_security_env(&mut self, a: &Apdu) -> CmdResult {
        // any MSE first tears the previous environment down
        self.env = None;
        let dir = self.current_df()?.entry.uuid;
        if let Some(env) = sec_env::parse_mse(&*self.data, dir, a.p1, a.p2, &a.data)? {
            self.env = Some(env);
        }
        Ok(Reply::Done)
    }

    pub(crate) fn cmd_perform_security_operation(&mut self, a: &Apdu) -> CmdResult {
        enum Op {
            Sign,
            Encipher,
            Decipher { return_data: bool },
        }
        let op = if a.p1 == 0x9E && a.p2 == 0x9A {
            Op::Sign
        } else if a.p1 == 0x84 {
            if a.p2 & 0x7F != 0 {
                return Err(StatusWord::WRONG_P1P2);
            }
            Op::Encipher
        } else if a.p2 == 0x84 || a.p2 == 0x86 {
            if a.p1 & 0x7F != 0 {
                return Err(StatusWord::WRONG_P1P2);
            }
            Op::Decipher {
                return_data: a.p1 == 0x80,
            }
        } else {
            return Err(StatusWord::WRONG_P1P2);
        };

        let env = self
            .env
            .clone()
            .ok_or(StatusWord::CONDITIONS_NOT_SATISFIED)?;
        let saved = self.selected;
        if self.select_uuid_quiet(env.key_file_uuid).is_err() {
            return Err(StatusWord::CONDITIONS_NOT_SATISFIED);
        }
        let result = match op {
            Op::Sign => self.pso_sign(a, &env),
            Op::Encipher => self.pso_encipher(a, &env),
            Op::Decipher { return_data } => self.pso_decipher(a, &env, return_data),
        };
        self.finish_key_op(saved, env.key_file_uuid);
        result
    }

    /// Restores the selection and burns the key file's user-consent PIN.
    fn finish_key_op(&mut self, saved: Option<Located>, key_uuid: u16) {
        if let Ok(hit) = fs::search(&*self.data, Query::ByUuid(key_uuid)) {
            let auth = (hit.entry.prop >> 12) as u8;
            if auth != 0 {
                self.deauth_pin(auth);
            }
        }
        self.selected = saved;
    }

    fn pso_sign(&mut self, a: &Apdu, env: &SecurityEnv) -> CmdResult {
        if env.template != Template::Dst || env.encipher {
            return Err(StatusWord::CONDITIONS_NOT_SATISFIED);
        }
        if a.nc == 0 {
            return Err(StatusWord::WRONG_LENGTH);
        }
        if a.chain.running() {
            // wait for the rest of the chained message
            return Ok(Reply::Done);
        }
        self.long_operation();
        let hit = self.require_selected()?;
        match env.algo {
            sec_env::ALGO_EC => self.sign_ecdsa(&hit, &a.data),
            sec_env::ALGO_RAW | sec_env::ALGO_PKCS1 | sec_env::ALGO_SHA1_PKCS1 => {
                self.sign_rsa(&hit, &a.data, env.algo)
            }
            _ => Err(StatusWord::CONDITIONS_NOT_SATISFIED),
        }
    }

    fn sign_rsa(&mut self, hit: &Located, msg: &[u8], algo: u8) -> CmdResult {
        let key = self.load_rsa_key(hit)?;
        let k = key.modulus_bytes();
        let block = match algo {
            sec_env::ALGO_RAW => {
                if msg.len() != k {
                    return Err(StatusWord::CONDITIONS_NOT_SATISFIED);
                }
                msg.to_vec()
            }
            sec_env::ALGO_SHA1_PKCS1 => {
                // exactly one SHA-1 digest, DigestInfo prepended here
                if msg.len() != 20 {
                    return Err(StatusWord::CONDITIONS_NOT_SATISFIED);
                }
                let mut t = rsa::SHA1_DIGEST_INFO.to_vec();
                t.extend_from_slice(msg);
                rsa::pkcs1_type1_pad(&t, k).ok_or(StatusWord::CONDITIONS_NOT_SATISFIED)?
            }
            _ => rsa::pkcs1_type1_pad(msg, k).ok_or(StatusWord::CONDITIONS_NOT_SATISFIED)?,
        };
        let m = Bn::from_bytes_be(&block);
        let sig = rsa::private_op(&key, &m, &mut *self.rng)
            .map_err(|_| StatusWord::CONDITIONS_NOT_SATISFIED)?;
        self.stage_response(sig.to_bytes_be(k))
    }

    fn sign_ecdsa(&mut self, hit: &Located, msg: &[u8]) -> CmdResult {
        let (curve, d) = self.load_ec_key(hit)?;
        if msg.len() > curve.field_bytes {
            return Err(StatusWord::WRONG_LENGTH);
        }
        let (r, s) = curve
            .ecdsa_sign(&d, msg, &mut *self.rng)
            .map_err(|_| StatusWord::CONDITIONS_NOT_SATISFIED)?;
        self.stage_response(encode_ecdsa_signature(&curve, &r, &s))
    }

    fn pso_decipher(&mut self, a: &Apdu, env: &SecurityEnv, return_data: bool) -> CmdResult {
        if env.encipher {
            return Err(StatusWord::CONDITIONS_NOT_SATISFIED);
        }
        if a.nc == 0 {
            return Err(StatusWord::WRONG_LENGTH);
        }
        let hit = self.require_selected()?;
        let kind = hit.entry.kind & 0xBF;

        if kind == KIND_DES || kind == KIND_AES {
            // symmetric deciphering streams fragment by fragment
            if a.p2 != 0x84 {
                return Err(StatusWord::WRONG_P1P2);
            }
            let input = a.data.clone();
            let out = self.symmetric_cipher(a, env, &input, Dir::Decrypt)?;
            return self.finish_decipher(a, env, out, return_data);
        }
        if kind != KIND_RSA {
            return Err(StatusWord::CONDITIONS_NOT_SATISFIED);
        }
        if a.chain.running() {
            return Ok(Reply::Done);
        }

        let ciphertext = if a.p2 == 0x86 {
            match a.data[0] {
                0x81 if self.tmp_len == 0 => {
                    // first half of a split ciphertext: open a synthetic
                    // chain and wait for the 0x82 part
                    self.chain = ChainState::Active;
                    self.chain_ins = 0x2A;
                    self.chain_buf = a.data.clone();
                    self.tmp_len = 0;
                    return Ok(Reply::Done);
                }
                0x81 => {
                    let split = self.tmp_len;
                    if a.data.get(split) != Some(&0x82) {
                        return Err(StatusWord::WRONG_P1P2);
                    }
                    let mut ct = a.data[1..split].to_vec();
                    ct.extend_from_slice(&a.data[split + 1..]);
                    ct
                }
                0x00 => a.data[1..].to_vec(),
                _ => return Err(StatusWord::INVALID_DATA),
            }
        } else {
            a.data.clone()
        };

        self.long_operation();
        let key = self.load_rsa_key(&hit)?;
        let k = key.modulus_bytes();
        if ciphertext.len() != k {
            return Err(StatusWord::CONDITIONS_NOT_SATISFIED);
        }
        let m = rsa::private_op(&key, &Bn::from_bytes_be(&ciphertext), &mut *self.rng)
            .map_err(|_| StatusWord::CONDITIONS_NOT_SATISFIED)?;
        let mut out = m.to_bytes_be(k);
        if env.algo & sec_env::ALGO_PKCS1 != 0 {
            out = rsa::pkcs1_type2_strip(&out).ok_or(StatusWord::CONDITIONS_NOT_SATISFIED)?;
        }
        self.finish_decipher(a, env, out, return_data)
    }

    /// Tail of every deciphering path: UNWRAP into the target file when one
    /// is bound, then either return or swallow the plaintext.
    fn finish_decipher(
        &mut self,
        a: &Apdu,
        env: &SecurityEnv,
        out: Vec<u8>,
        return_data: bool,
    ) -> CmdResult {
        if let Some(target) = env.target_file_uuid {
            if !a.chain.running() {
                self.store_unwrapped(target, &out)?;
            }
        }
        if return_data {
            self.stage_response(out)
        } else {
            Ok(Reply::Done)
        }
    }

    fn store_unwrapped(&mut self, target_uuid: u16, bytes: &[u8]) -> Result<(), StatusWord> {
        if bytes.is_empty() || bytes.len() >= 254 {
            return Err(StatusWord::CONDITIONS_NOT_SATISFIED);
        }
        let target = fs::search(&*self.data, Query::ByUuid(target_uuid))
            .map_err(|_| StatusWord::CONDITIONS_NOT_SATISFIED)?;
        match target.entry.kind {
            // shareable transparent EF: raw key bytes at offset 0
            0x41 => {
                self.acl_check(&target, AclOp::Update)?;
                fs::update_binary(&mut *self.data, &target, 0, bytes)?;
            }
            KIND_DES | KIND_AES => {
                self.write_key_part(&target, keyfile::TAG_SYMMETRIC, bytes)?;
            }
            _ => return Err(StatusWord::CONDITIONS_NOT_SATISFIED),
        }
        Ok(())
    }

    fn pso_encipher(&mut self, a: &Apdu, env: &SecurityEnv) -> CmdResult {
        if env.template != Template::Ct || !env.encipher {
            return Err(StatusWord::CONDITIONS_NOT_SATISFIED);
        }
        let plaintext = if a.nc == 0 {
            // WRAP: encipher the extractable target key in place
            let target_uuid = env.target_file_uuid.ok_or(StatusWord::WRONG_LENGTH)?;
            let target = fs::search(&*self.data, Query::ByUuid(target_uuid))
                .map_err(|_| StatusWord::CONDITIONS_NOT_SATISFIED)?;
            if target.entry.prop & keyfile::PROP_EXTRACTABLE == 0 {
                return Err(StatusWord::CONDITIONS_NOT_SATISFIED);
            }
            if !matches!(target.entry.kind & 0xBF, KIND_DES | KIND_AES) {
                return Err(StatusWord::CONDITIONS_NOT_SATISFIED);
            }
            self.read_key_part(&target, keyfile::TAG_SYMMETRIC)?
        } else {
            a.data.clone()
        };
        let out = self.symmetric_cipher(a, env, &plaintext, Dir::Encrypt)?;
        self.stage_response(out)
    }

    /// CBC engine over the selected symmetric key file.
    ///
    /// The running vector is reseeded from the environment IV at the start
    /// of a (possibly chained) message and carried across fragments; PKCS#7
    /// is applied or stripped only on the terminating fragment and only
    /// when the reference algorithm requests it.
    fn symmetric_cipher(
        &mut self,
        a: &Apdu,
        env: &SecurityEnv,
        input: &[u8],
        dir: Dir,
    ) -> Result<Vec<u8>, StatusWord> {
        let hit = self.require_selected()?;
        if matches!(a.chain, ChainState::Inactive | ChainState::Start) {
            self.iv_run = env.iv;
        }
        let keymat = self.read_key_part(&hit, keyfile::TAG_SYMMETRIC)?;
        let engine = match hit.entry.kind & 0xBF {
            KIND_DES => BlockCipher::Des(Box::new(
                Des3::new(&keymat).map_err(|_| StatusWord::INCOMPATIBLE_FILE)?,
            )),
            KIND_AES => BlockCipher::Aes(Box::new(
                Aes::new(&keymat).map_err(|_| StatusWord::INCOMPATIBLE_FILE)?,
            )),
            _ => return Err(StatusWord::INCOMPATIBLE_FILE),
        };
        let bsize = engine.block_size();
        let pad = env.algo & 0x80 != 0 && !a.chain.running();

        let mut data = input.to_vec();
        if dir == Dir::Encrypt && pad {
            let padlen = bsize - data.len() % bsize;
            if data.len() + padlen > MAX_RESPONSE {
                return Err(StatusWord::WRONG_LENGTH);
            }
            data.extend(std::iter::repeat(padlen as u8).take(padlen));
        }
        if data.is_empty() || data.len() % bsize != 0 {
            return Err(StatusWord::WRONG_LENGTH);
        }

        for chunk in data.chunks_mut(bsize) {
            match dir {
                Dir::Encrypt => {
                    for (b, iv) in chunk.iter_mut().zip(self.iv_run.iter()) {
                        *b ^= iv;
                    }
                    engine.apply(chunk, Dir::Encrypt);
                    self.iv_run[..bsize].copy_from_slice(chunk);
                }
                Dir::Decrypt => {
                    let carried: Vec<u8> = chunk.to_vec();
                    engine.apply(chunk, Dir::Decrypt);
                    for (b, iv) in chunk.iter_mut().zip(self.iv_run.iter()) {
                        *b ^= iv;
                    }
                    self.iv_run[..bsize].copy_from_slice(&carried);
                }
            }
        }

        if dir == Dir::Decrypt && pad {
            let padlen = usize::from(*data.last().expect("nonempty"));
            if padlen == 0 || padlen > bsize || padlen > data.len() {
                return Err(StatusWord::CONDITIONS_NOT_SATISFIED);
            }
            let tail = data.len() - padlen;
            if data[tail..].iter().any(|&b| usize::from(b) != padlen) {
                return Err(StatusWord::CONDITIONS_NOT_SATISFIED);
            }
            data.truncate(tail);
        }
        Ok(data)
    }

    pub(crate) fn cmd_general_authenticate(&mut self, a: &Apdu) -> CmdResult {
        if a.p1 != 0 || a.p2 != 0 {
            return Err(StatusWord::WRONG_P1P2);
        }
        let env = self
            .env
            .clone()
            .ok_or(StatusWord::CONDITIONS_NOT_SATISFIED)?;
        if env.template != Template::At || env.encipher {
            return Err(StatusWord::CONDITIONS_NOT_SATISFIED);
        }

        // dynamic authentication template: 7C { [80 ...] 85 [04 || X || Y] }
        let mut outer = TlvReader::new(&a.data);
        let tpl = match outer.next() {
            Ok(Some(obj)) if obj.tag == 0x7C => obj,
            _ => return Err(StatusWord::INVALID_DATA),
        };
        if outer.remaining() != 0 {
            return Err(StatusWord::INVALID_DATA);
        }
        let mut inner = TlvReader::new(tpl.value);
        let point_bytes = loop {
            match inner.next() {
                Ok(Some(obj)) if obj.tag == 0x85 => break obj.value,
                Ok(Some(obj)) if obj.tag == 0x80 => continue,
                _ => return Err(StatusWord::INVALID_DATA),
            }
        };
        if point_bytes.first() != Some(&0x04) {
            return Err(StatusWord::INVALID_DATA);
        }

        let saved = self.selected;
        if self.select_uuid_quiet(env.key_file_uuid).is_err() {
            return Err(StatusWord::CONDITIONS_NOT_SATISFIED);
        }
        let result = self.ecdh_with_selected(&point_bytes[1..]);
        self.finish_key_op(saved, env.key_file_uuid);
        result
    }

    fn ecdh_with_selected(&mut self, coords: &[u8]) -> CmdResult {
        let hit = self.require_selected()?;
        let (curve, d) = self.load_ec_key(&hit)?;
        let fb = curve.field_bytes;
        if coords.len() != 2 * fb {
            return Err(StatusWord::INVALID_DATA);
        }
        let peer = AffinePoint {
            x: Bn::from_bytes_be(&coords[..fb]),
            y: Bn::from_bytes_be(&coords[fb..]),
        };
        self.long_operation();
        let x = curve
            .ecdh(&d, &peer, &mut *self.rng)
            .map_err(|_| StatusWord::CONDITIONS_NOT_SATISFIED)?;
        self.stage_response(x.to_bytes_be(fb))
    }
}

/// BER `SEQUENCE { INTEGER r, INTEGER s }` with fixed-width integers and a
/// leading-zero guard byte where the sign bit is set.
fn encode_ecdsa_signature(curve: &Curve, r: &Bn, s: &Bn) -> Vec<u8> {
    let mut body = Vec::with_capacity(2 * curve.field_bytes + 6);
    for v in [r, s] {
        let bytes = v.to_bytes_be(curve.field_bytes);
        body.push(0x02);
        if bytes[0] & 0x80 != 0 {
            body.push((curve.field_bytes + 1) as u8);
            body.push(0x00);
        } else {
            body.push(curve.field_bytes as u8);
        }
        body.extend_from_slice(&bytes);
    }
    let mut out = vec![0x30];
    push_len(&mut out, body.len());
    out.extend_from_slice(&body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ec::CurveId;

    #[test]
    fn ecdsa_der_sizes() {
        let curve = Curve::get(CurveId::P256);
        let low = Bn::from_u32(5);
        let sig = encode_ecdsa_signature(&curve, &low, &low);
        assert_eq!(sig.len(), 70);
        let hi = Bn::from_bytes_be(&[0x80; 32]);
        let sig = encode_ecdsa_signature(&curve, &hi, &hi);
        assert_eq!(sig.len(), 72);
        assert_eq!(sig[0], 0x30);
        assert_eq!(sig[1], 70);
        assert_eq!(&sig[2..5], &[0x02, 33, 0x00]);
    }

    #[test]
    fn p521_signature_uses_long_form_length() {
        let curve = Curve::get(CurveId::P521);
        let v = Bn::from_u32(1);
        let sig = encode_ecdsa_signature(&curve, &v, &v);
        assert_eq!(&sig[..2], &[0x30, 0x81]);
        assert_eq!(usize::from(sig[2]), sig.len() - 3);
    }
}
