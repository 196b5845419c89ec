//! MANAGE SECURITY ENVIRONMENT parsing and the active environment.
//!
//! One environment is active at a time; every MSE command first tears the
//! previous one down, and a reset clears it. The parser resolves the
//! referenced key (and optional target) file ids to uuids immediately, so
//! later selection changes cannot redirect a prepared operation.

use crate::fs::{self, ChildKind, Query};
use crate::status::StatusWord;
use crate::store::MemoryDevice;

/// Reference algorithm: raw private-key operation.
pub const ALGO_RAW: u8 = 0x00;
/// PKCS#1 v1.5 padding applied/removed around the RSA operation.
pub const ALGO_PKCS1: u8 = 0x02;
/// EC operation (ECDSA / ECDH).
pub const ALGO_EC: u8 = 0x04;
/// Key wrap/unwrap.
pub const ALGO_WRAP: u8 = 0x0A;
/// SHA-1 DigestInfo prefix plus PKCS#1 v1.5 type-1 padding.
pub const ALGO_SHA1_PKCS1: u8 = 0x12;
/// Symmetric operation with PKCS#7 padding on the final fragment.
pub const ALGO_PKCS7: u8 = 0x80;
/// Wrap/unwrap with PKCS#7 padding.
pub const ALGO_WRAP_PKCS7: u8 = 0x8A;

/// Maximum initialization vector length.
pub const IV_MAX: usize = 16;

/// ISO 7816-8 control reference template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    /// Confidentiality template (0xB8): decipher/encipher/wrap/unwrap.
    Ct,
    /// Digital signature template (0xB6).
    Dst,
    /// Authentication template (0xA4): key agreement.
    At,
}

/// A fully parsed, validated security environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityEnv {
    /// Selected template.
    pub template: Template,
    /// P1 was 0x81: encipher/wrap rather than a private-key operation.
    pub encipher: bool,
    /// Reference algorithm (one of the `ALGO_*` values).
    pub algo: u8,
    /// Uuid of the key file (resolved at MSE time).
    pub key_file_uuid: u16,
    /// Uuid of the wrap/unwrap target file, when referenced.
    pub target_file_uuid: Option<u16>,
    /// Initialization vector for symmetric operations.
    pub iv: [u8; IV_MAX],
    /// Significant prefix of `iv` (0 when no IV was supplied).
    pub iv_len: usize,
}

/// Parses an MSE command.
///
/// `dir_uuid` is the DF context in which file references resolve (the DF of
/// the current selection). Returns `None` for the restore form (`P1 =
/// 0xF3`), which acknowledges without establishing an environment.
pub fn parse_mse(
    dev: &dyn MemoryDevice,
    dir_uuid: u16,
    p1: u8,
    p2: u8,
    data: &[u8],
) -> Result<Option<SecurityEnv>, StatusWord> {
    if p1 == 0xF3 {
        if p2 != 0 || !data.is_empty() {
            return Err(StatusWord::LC_INCONSISTENT);
        }
        return Ok(None);
    }
    let (encipher, template) = match (p1, p2) {
        (0x81, 0xB8) => (true, Template::Ct),
        (0x81, _) => return Err(StatusWord::CONDITIONS_NOT_SATISFIED),
        (0x41, 0xB8) => (false, Template::Ct),
        (0x41, 0xB6) => (false, Template::Dst),
        (0x41, 0xA4) => (false, Template::At),
        (0x41, _) => return Err(StatusWord::CONDITIONS_NOT_SATISFIED),
        _ => return Err(StatusWord::FUNC_NOT_SUPPORTED),
    };

    let mut algo = None;
    let mut key_file_uuid = None;
    let mut target_file_uuid = None;
    let mut iv = [0u8; IV_MAX];
    let mut iv_len = 0usize;

    let mut reader = crate::tlv::TlvReader::new(data);
    loop {
        let obj = match reader.next() {
            Ok(Some(obj)) => obj,
            Ok(None) => break,
            Err(_) => return Err(StatusWord::INVALID_DATA),
        };
        if obj.value.len() > IV_MAX {
            return Err(StatusWord::INVALID_DATA);
        }
        match obj.tag {
            0x80 => {
                let [v] = obj.value else {
                    return Err(StatusWord::FUNC_NOT_SUPPORTED);
                };
                if !matches!(
                    *v,
                    ALGO_RAW | ALGO_PKCS1 | ALGO_EC | ALGO_WRAP | ALGO_SHA1_PKCS1 | ALGO_PKCS7
                        | ALGO_WRAP_PKCS7
                ) {
                    return Err(StatusWord::FUNC_NOT_SUPPORTED);
                }
                algo = Some(*v);
            }
            0x81 => {
                if obj.value.len() != 2 {
                    return Err(StatusWord::FUNC_NOT_SUPPORTED);
                }
                let id = crate::tlv::be_uint(obj.value);
                key_file_uuid = Some(resolve_ef(dev, dir_uuid, id)?);
            }
            // 0x83/0x84: a 1-byte key index (always 0) or a 2-byte
            // target-file reference for wrap/unwrap
            0x83 | 0x84 => match obj.value.len() {
                1 => {
                    if obj.value[0] != 0 {
                        return Err(StatusWord::FUNC_NOT_SUPPORTED);
                    }
                }
                2 => {
                    let id = crate::tlv::be_uint(obj.value);
                    target_file_uuid = Some(resolve_ef(dev, dir_uuid, id)?);
                }
                _ => return Err(StatusWord::FUNC_NOT_SUPPORTED),
            },
            0x87 => {
                iv_len = obj.value.len();
                iv[..iv_len].copy_from_slice(obj.value);
            }
            _ => return Err(StatusWord::WRONG_DATA),
        }
    }

    // an environment is usable only with both the algorithm and the key
    let (Some(algo), Some(key_file_uuid)) = (algo, key_file_uuid) else {
        return Err(StatusWord::FUNC_NOT_SUPPORTED);
    };
    Ok(Some(SecurityEnv {
        template,
        encipher,
        algo,
        key_file_uuid,
        target_file_uuid,
        iv,
        iv_len,
    }))
}

fn resolve_ef(dev: &dyn MemoryDevice, dir_uuid: u16, id: u16) -> Result<u16, StatusWord> {
    fs::search(
        dev,
        Query::ById {
            dir: dir_uuid,
            id,
            kind: ChildKind::Ef,
        },
    )
    .map(|hit| hit.entry.uuid)
    .map_err(|_| StatusWord::REF_NOT_FOUND)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{create_file, mkfs, NewFile, KIND_AES};
    use crate::store::BufferDevice;

    fn dev_with_keys() -> BufferDevice {
        let mut dev = BufferDevice::new(2048);
        mkfs(&mut dev, None, false, None).unwrap();
        for id in [0x4D01u16, 0x4D02] {
            create_file(
                &mut dev,
                0,
                &NewFile {
                    id,
                    size: 64,
                    kind: KIND_AES,
                    acl: [0, 0, 0],
                    prop: 0,
                    name: Vec::new(),
                    tag_81: false,
                },
            )
            .unwrap();
        }
        dev
    }

    #[test]
    fn parses_a_wrap_environment() {
        let dev = dev_with_keys();
        let mut data = hex::decode("80018A81024D0183024D02").unwrap();
        data.extend_from_slice(&[0x87, 0x10]);
        data.extend_from_slice(&[0u8; 16]);
        let env = parse_mse(&dev, 0, 0x41, 0xB8, &data).unwrap().unwrap();
        assert_eq!(env.template, Template::Ct);
        assert!(!env.encipher);
        assert_eq!(env.algo, ALGO_WRAP_PKCS7);
        assert!(env.target_file_uuid.is_some());
        assert_eq!(env.iv_len, 16);
    }

    #[test]
    fn sign_template_and_key_index() {
        let dev = dev_with_keys();
        let data = hex::decode("80010481024D01840100").unwrap();
        let env = parse_mse(&dev, 0, 0x41, 0xB6, &data).unwrap().unwrap();
        assert_eq!(env.template, Template::Dst);
        assert_eq!(env.algo, ALGO_EC);
        assert_eq!(env.target_file_uuid, None);
        // nonzero key index is refused
        let data = hex::decode("80010481024D01840101").unwrap();
        assert_eq!(
            parse_mse(&dev, 0, 0x41, 0xB6, &data).unwrap_err(),
            StatusWord::FUNC_NOT_SUPPORTED
        );
    }

    #[test]
    fn restore_form_is_a_no_op() {
        let dev = dev_with_keys();
        assert_eq!(parse_mse(&dev, 0, 0xF3, 0x00, &[]).unwrap(), None);
        assert_eq!(
            parse_mse(&dev, 0, 0xF3, 0x01, &[]).unwrap_err(),
            StatusWord::LC_INCONSISTENT
        );
    }

    #[test]
    fn error_selection() {
        let dev = dev_with_keys();
        // unknown reference algorithm
        let data = hex::decode("80010381024D01").unwrap();
        assert_eq!(
            parse_mse(&dev, 0, 0x41, 0xB8, &data).unwrap_err(),
            StatusWord::FUNC_NOT_SUPPORTED
        );
        // missing key reference
        let data = hex::decode("800100").unwrap();
        assert_eq!(
            parse_mse(&dev, 0, 0x41, 0xB8, &data).unwrap_err(),
            StatusWord::FUNC_NOT_SUPPORTED
        );
        // dangling file reference
        let data = hex::decode("8001008102AAAA").unwrap();
        assert_eq!(
            parse_mse(&dev, 0, 0x41, 0xB8, &data).unwrap_err(),
            StatusWord::REF_NOT_FOUND
        );
        // unknown CRDO tag
        let data = hex::decode("80010081024D01990100").unwrap();
        assert_eq!(
            parse_mse(&dev, 0, 0x41, 0xB8, &data).unwrap_err(),
            StatusWord::WRONG_DATA
        );
        // encipher accepts only the confidentiality template
        assert_eq!(
            parse_mse(&dev, 0, 0x81, 0xB6, &[]).unwrap_err(),
            StatusWord::CONDITIONS_NOT_SATISFIED
        );
        // oversize value
        let mut data = hex::decode("80010081024D01").unwrap();
        data.extend_from_slice(&[0x87, 0x11]);
        data.extend_from_slice(&[0u8; 17]);
        assert_eq!(
            parse_mse(&dev, 0, 0x41, 0xB8, &data).unwrap_err(),
            StatusWord::INVALID_DATA
        );
    }
}
