//! Key-part TLV storage inside key EFs.
//!
//! A key EF body is a sequence of `tag (1) | len (1) | value` triples; a
//! length byte of 0 means 256 value bytes. Tag 0xFF marks the free space
//! that follows the last part (the erased-flash pattern), so no part may
//! ever be written with that tag. Writes only land in free space — a
//! present part is immutable until the file is recreated or the card is
//! reformatted.

use super::{FsError, Located};
use crate::store::MemoryDevice;

/// EC private key part.
pub const TAG_EC_PRIVATE: u8 = 0x02;
/// EC public key part (`04 || X || Y`).
pub const TAG_EC_PUBLIC: u8 = 0x03;
/// RSA public exponent.
pub const TAG_RSA_PUB_EXP: u8 = 0x81;
/// RSA private exponent (accepted on upload, not stored).
pub const TAG_RSA_PRIV_EXP: u8 = 0x82;
/// RSA prime p.
pub const TAG_RSA_P: u8 = 0x83;
/// RSA prime q.
pub const TAG_RSA_Q: u8 = 0x84;
/// RSA exponent d mod (p-1).
pub const TAG_RSA_DP: u8 = 0x85;
/// RSA exponent d mod (q-1).
pub const TAG_RSA_DQ: u8 = 0x86;
/// RSA coefficient q^-1 mod p.
pub const TAG_RSA_QINV: u8 = 0x87;
/// RSA modulus (accepted on upload, recomputed on demand).
pub const TAG_RSA_MOD: u8 = 0x80;
/// RSA modulus, upper part (2048-bit uploads).
pub const TAG_RSA_MOD_P1: u8 = 0x88;
/// RSA modulus, lower part (2048-bit uploads).
pub const TAG_RSA_MOD_P2: u8 = 0x89;
/// RSA private exponent, upper part.
pub const TAG_RSA_PRIV_EXP_P1: u8 = 0x8A;
/// RSA private exponent, lower part.
pub const TAG_RSA_PRIV_EXP_P2: u8 = 0x8B;
/// Tag modifier: Montgomery constant of a prime (ORed onto the prime tag,
/// precomputed when the prime is written).
pub const TAG_PRECOMP_MONT: u8 = 0x20;
/// Tag modifier: Barrett constant of a prime (ORed onto the prime tag).
pub const TAG_PRECOMP_BARRETT: u8 = 0x30;
/// Symmetric (AES/DES) key material.
pub const TAG_SYMMETRIC: u8 = 0xA0;
/// Free-space marker; never writable.
pub const TAG_FREE: u8 = 0xFF;

/// Provenance flag ORed into a tag when the part was generated on-card.
pub const KEY_GENERATE: u8 = 0x40;

/// Prop bit marking a key file as holding usable material.
pub const PROP_VALID_KEY: u16 = 0x0100;
/// Prop bit marking on-card generated material.
pub const PROP_GENERATED: u16 = 0x0200;
/// Prop bit allowing the key to be wrapped off-card.
pub const PROP_EXTRACTABLE: u16 = 0x0008;

/// Location of a key part (or of the free space) inside a key EF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPart {
    /// The part exists: offset of its tag byte and its value length.
    Exists {
        /// Store offset of the tag byte.
        offset: usize,
        /// Value length in bytes (1..=256).
        len: usize,
    },
    /// The part is absent; offset of the first free tag position.
    Free {
        /// Store offset of the free-space marker.
        offset: usize,
    },
}

/// Walks the TLV sequence of `hit` looking for `tag`.
///
/// Fails with [`FsError::InvalidData`] for DFs, for tag 0xFF and for files
/// whose TLV chain is exhausted or inconsistent.
pub fn find(dev: &dyn MemoryDevice, hit: &Located, tag: u8) -> Result<KeyPart, FsError> {
    if tag == TAG_FREE || hit.entry.is_df() {
        return Err(FsError::InvalidData);
    }
    let tag = tag & !KEY_GENERATE;
    let mut offset = hit.body_offset();
    let mut remaining = i32::from(hit.entry.size);
    while remaining > 2 {
        let mut tl = [0u8; 2];
        dev.read(offset, &mut tl)?;
        if tl[0] == TAG_FREE {
            return Ok(KeyPart::Free { offset });
        }
        let len = if tl[1] == 0 { 256 } else { usize::from(tl[1]) };
        if tl[0] == tag {
            return Ok(KeyPart::Exists {
                offset,
                len,
            });
        }
        offset += 2 + len;
        remaining -= 2 + len as i32;
    }
    Err(FsError::InvalidData)
}

/// Value length of a present part, or `None`.
pub fn part_len(dev: &dyn MemoryDevice, hit: &Located, tag: u8) -> Option<usize> {
    match find(dev, hit, tag) {
        Ok(KeyPart::Exists { len, .. }) => Some(len),
        _ => None,
    }
}

/// Reads the value of a present part.
pub fn read(dev: &dyn MemoryDevice, hit: &Located, tag: u8) -> Result<Vec<u8>, FsError> {
    match find(dev, hit, tag)? {
        KeyPart::Exists { offset, len } => {
            let mut out = vec![0u8; len];
            dev.read(offset + 2, &mut out)?;
            Ok(out)
        }
        KeyPart::Free { .. } => Err(FsError::NotFound),
    }
}

/// Appends a new part into the free space of the key EF.
///
/// `value` must be 1..=254 bytes so the tag, length and value land in one
/// block write. Refuses to overwrite an already-present part and enforces
/// the file bounds. ACL gating (UPDATE vs GENERATE) happens in the command
/// layer before this is called.
pub fn write(
    dev: &mut dyn MemoryDevice,
    hit: &Located,
    tag: u8,
    value: &[u8],
) -> Result<(), FsError> {
    if value.is_empty() || value.len() > 254 {
        return Err(FsError::InvalidData);
    }
    let offset = match find(dev, hit, tag)? {
        KeyPart::Free { offset } => offset,
        KeyPart::Exists { .. } => return Err(FsError::InvalidData),
    };
    let used = offset - hit.body_offset();
    if used + 2 + value.len() > usize::from(hit.entry.size) {
        return Err(FsError::OutsideFile);
    }
    let mut rec = Vec::with_capacity(value.len() + 2);
    rec.push(tag & !KEY_GENERATE);
    rec.push(value.len() as u8);
    rec.extend_from_slice(value);
    dev.write(offset, &rec)?;
    Ok(())
}

/// True when `tag` is one of the parts whose arrival makes the key file
/// usable (drives the `PROP_VALID_KEY` marking).
pub fn is_defining_part(tag: u8) -> bool {
    matches!(
        tag & !KEY_GENERATE,
        TAG_EC_PRIVATE | TAG_RSA_P | TAG_RSA_MOD_P2 | TAG_SYMMETRIC
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{create_file, mkfs, NewFile, KIND_AES};
    use crate::store::BufferDevice;

    fn key_file(size: u16) -> (BufferDevice, Located) {
        let mut dev = BufferDevice::new(2048);
        mkfs(&mut dev, None, false, None).unwrap();
        let hit = create_file(
            &mut dev,
            0,
            &NewFile {
                id: 0x4D01,
                size,
                kind: KIND_AES,
                acl: [0, 0, 0],
                prop: 0,
                name: Vec::new(),
                tag_81: false,
            },
        )
        .unwrap();
        (dev, hit)
    }

    #[test]
    fn fresh_key_file_is_all_free() {
        let (dev, hit) = key_file(64);
        assert!(matches!(
            find(&dev, &hit, TAG_SYMMETRIC).unwrap(),
            KeyPart::Free { .. }
        ));
        assert!(read(&dev, &hit, TAG_SYMMETRIC).is_err());
    }

    #[test]
    fn write_then_read_round_trip() {
        let (mut dev, hit) = key_file(64);
        write(&mut dev, &hit, TAG_SYMMETRIC, &[0x42; 16]).unwrap();
        assert_eq!(read(&dev, &hit, TAG_SYMMETRIC).unwrap(), vec![0x42; 16]);
        assert_eq!(part_len(&dev, &hit, TAG_SYMMETRIC), Some(16));
        // second part lands after the first
        write(&mut dev, &hit, TAG_RSA_PUB_EXP, &[1, 0, 1]).unwrap();
        assert_eq!(read(&dev, &hit, TAG_RSA_PUB_EXP).unwrap(), vec![1, 0, 1]);
    }

    #[test]
    fn present_part_is_immutable() {
        let (mut dev, hit) = key_file(64);
        write(&mut dev, &hit, TAG_SYMMETRIC, &[1; 8]).unwrap();
        assert_eq!(
            write(&mut dev, &hit, TAG_SYMMETRIC, &[2; 8]).unwrap_err(),
            FsError::InvalidData
        );
        // the generate flag addresses the same slot
        assert_eq!(
            write(&mut dev, &hit, TAG_SYMMETRIC | KEY_GENERATE, &[2; 8]).unwrap_err(),
            FsError::InvalidData
        );
    }

    #[test]
    fn bounds_and_forbidden_tags() {
        let (mut dev, hit) = key_file(16);
        assert_eq!(
            write(&mut dev, &hit, TAG_SYMMETRIC, &[0; 32]).unwrap_err(),
            FsError::OutsideFile
        );
        assert_eq!(
            write(&mut dev, &hit, TAG_FREE, &[0; 4]).unwrap_err(),
            FsError::InvalidData
        );
        let mut dev2 = BufferDevice::new(1024);
        let mf = mkfs(&mut dev2, None, false, None).unwrap();
        assert!(find(&dev2, &mf, TAG_SYMMETRIC).is_err());
    }
}
