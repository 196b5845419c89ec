//! Command handlers: the MyEID operation set on top of the filesystem,
//! PIN subsystem and crypto engines.
//!
//! Handlers are `Card` methods grouped by concern:
//! [`iso`] — selection, binary access, file management and PIN commands;
//! [`pso`] — MANAGE SECURITY ENVIRONMENT, PERFORM SECURITY OPERATION and
//! GENERAL AUTHENTICATE; [`keygen`] — on-card key generation;
//! [`objects`] — GET DATA / PUT DATA objects, applet initialization and
//! key upload.

mod iso;
mod keygen;
mod objects;
mod pso;

use crate::card::{AclOp, Card};
use crate::crypto::bn::Bn;
use crate::crypto::ec::{Curve, CurveId};
use crate::crypto::rsa::RsaCrtKey;
use crate::fs::{keyfile, FsError, Located};
use crate::status::StatusWord;

impl Card {
    /// Reads a key part, gated on the file's READ ACL.
    ///
    /// Absent or inconsistent parts surface as `0x6985`: the file is not in
    /// a usable state for the requested operation.
    pub(crate) fn read_key_part(&self, hit: &Located, tag: u8) -> Result<Vec<u8>, StatusWord> {
        self.acl_check(hit, AclOp::Read)?;
        keyfile::read(&*self.data, hit, tag).map_err(|e| match e {
            FsError::Store(_) | FsError::Corrupt => StatusWord::MEMORY_FAILURE,
            _ => StatusWord::CONDITIONS_NOT_SATISFIED,
        })
    }

    /// Writes a key part, gated on UPDATE — or GENERATE when the tag
    /// carries the provenance flag — and maintains the file's prop marks
    /// (`valid key`, `generated`).
    pub(crate) fn write_key_part(
        &mut self,
        hit: &Located,
        tag: u8,
        value: &[u8],
    ) -> Result<(), StatusWord> {
        let generated = tag & keyfile::KEY_GENERATE != 0;
        self.acl_check(
            hit,
            if generated {
                AclOp::Generate
            } else {
                AclOp::Update
            },
        )?;
        keyfile::write(&mut *self.data, hit, tag, value).map_err(StatusWord::from)?;

        // re-read the header: earlier part writes may have marked it already
        let mut raw = [0u8; crate::fs::ENTRY_LEN];
        self.data
            .read(hit.offset, &mut raw)
            .map_err(|_| StatusWord::MEMORY_FAILURE)?;
        let mut current = Located {
            entry: crate::fs::FsEntry::decode(&raw),
            offset: hit.offset,
        };
        let mut prop = current.entry.prop;
        if keyfile::is_defining_part(tag) {
            prop |= keyfile::PROP_VALID_KEY;
        }
        if generated {
            prop |= keyfile::PROP_GENERATED;
        }
        if prop != current.entry.prop {
            current.entry.prop = prop;
            crate::fs::rewrite_entry(&mut *self.data, &current).map_err(StatusWord::from)?;
            self.refresh_selection();
        }
        Ok(())
    }

    /// Loads the CRT key material from the selected RSA key file.
    pub(crate) fn load_rsa_key(&self, hit: &Located) -> Result<RsaCrtKey, StatusWord> {
        // parts are stored little-endian, the order numbers leave the card
        let part = |tag: u8| -> Result<Bn, StatusWord> {
            Ok(Bn::from_bytes_le(&self.read_key_part(hit, tag)?))
        };
        Ok(RsaCrtKey {
            p: part(keyfile::TAG_RSA_P)?,
            q: part(keyfile::TAG_RSA_Q)?,
            dp: part(keyfile::TAG_RSA_DP)?,
            dq: part(keyfile::TAG_RSA_DQ)?,
            qinv: part(keyfile::TAG_RSA_QINV)?,
        })
    }

    /// Curve and private scalar of the selected EC key file.
    pub(crate) fn load_ec_key(&self, hit: &Located) -> Result<(Curve, Bn), StatusWord> {
        let raw = self.read_key_part(hit, keyfile::TAG_EC_PRIVATE)?;
        let id = Curve::for_key_len(hit.entry.kind, raw.len())
            .ok_or(StatusWord::CONDITIONS_NOT_SATISFIED)?;
        Ok((Curve::get(id), Bn::from_bytes_be(&raw)))
    }

    /// Curve of the selected EC key file, derived from its declared size.
    pub(crate) fn curve_of_selected(&self, hit: &Located) -> Option<CurveId> {
        Curve::for_key_file(hit.entry.kind & 0xBF, hit.entry.size)
    }

    /// Writes the Montgomery and Barrett constants derived from an RSA
    /// prime next to it in the key file (tags `prime | 0x20` and
    /// `prime | 0x30`).
    pub(crate) fn write_prime_precomputes(
        &mut self,
        hit: &Located,
        prime_tag: u8,
        prime_le: &[u8],
    ) -> Result<(), StatusWord> {
        let w = prime_le.len();
        let p = Bn::from_bytes_le(prime_le);
        if p.is_even() || w < 2 {
            return Err(StatusWord::INVALID_DATA);
        }
        let gen_flag = prime_tag & keyfile::KEY_GENERATE;
        let base = prime_tag & !keyfile::KEY_GENERATE;

        // Montgomery: -p^-1 modulo 2^(half the prime width)
        let r = Bn::one().shl(4 * w);
        let inv = p.mod_inv(&r).ok_or(StatusWord::INVALID_DATA)?;
        let mont = if inv.is_zero() { inv } else { r.sub(&inv) };
        self.write_key_part(
            hit,
            base | keyfile::TAG_PRECOMP_MONT | gen_flag,
            &mont.to_bytes_le(w / 2),
        )?;

        // Barrett: 2^(1.5 * prime bits) mod p
        let barrett = Bn::one().shl(12 * w).rem(&p);
        self.write_key_part(
            hit,
            base | keyfile::TAG_PRECOMP_BARRETT | gen_flag,
            &barrett.to_bytes_le(w),
        )
    }
}
