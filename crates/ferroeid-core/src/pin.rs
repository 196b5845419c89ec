//! PIN/PUK records, verification state and ACL evaluation.
//!
//! Fourteen 49-byte PIN records live at fixed offsets in the security
//! store, followed by the card lifecycle byte. The lifecycle is stored
//! XOR 0xFE so that blank (0xFF) security memory reads as lifecycle 1 —
//! the personalization state in which every ACL check passes.
//!
//! The volatile side is a 16-bit bitmap: bits 0..13 are "PIN n verified",
//! bit 14 the global-unblocker state, bit 15 the admin state. It is owned
//! by the card session and cleared on reset.

use thiserror::Error;

use crate::crypto::ct_eq;
use crate::status::StatusWord;
use crate::store::{MemoryDevice, StoreError};

/// Number of PIN slots.
pub const MAX_PINS: u8 = 14;

/// Encoded size of one PIN record.
pub const RECORD_LEN: usize = 49;

/// Offset of the lifecycle byte (after the PIN records).
pub const LIFECYCLE_OFFSET: usize = RECORD_LEN * MAX_PINS as usize;

/// Lifecycle: personalization, ACLs wide open.
pub const LIFECYCLE_INIT: u8 = 1;
/// Lifecycle: operational, ACLs enforced.
pub const LIFECYCLE_OPERATIONAL: u8 = 7;

/// Flag bits of a PIN record.
pub mod flags {
    /// PIN is locked and unusable until unblocked.
    pub const LOCKED: u8 = 0x01;
    /// Relock the PIN again after a PUK-based unblock.
    pub const RELOCK: u8 = 0x02;
    /// The global unblocker may unblock this PIN.
    pub const UNBLOCK_BY_GLOBAL: u8 = 0x04;
    /// Verifying this PIN activates the global-unblocker state.
    pub const ACTIVATES_UNBLOCKER: u8 = 0x08;
    /// The admin state may change this PIN.
    pub const CHANGE_BY_ADMIN: u8 = 0x10;
    /// Verifying this PIN activates the admin state.
    pub const ACTIVATES_ADMIN: u8 = 0x20;
}

/// Volatile access bitmap masks.
pub const ACCESS_UNBLOCKER: u16 = 0x4000;
/// Admin-state bit of the volatile access bitmap.
pub const ACCESS_ADMIN: u16 = 0x8000;

/// PIN subsystem failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PinError {
    /// PIN id outside 1..=14.
    #[error("no such PIN slot")]
    BadId,
    /// Security store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<PinError> for StatusWord {
    fn from(e: PinError) -> StatusWord {
        match e {
            PinError::BadId => StatusWord::WRONG_P1P2,
            PinError::Store(_) => StatusWord::MEMORY_FAILURE,
        }
    }
}

/// One persistent PIN record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinRecord {
    /// Stored PIN value, padded to 8 bytes.
    pub pin: [u8; 8],
    /// Stored PUK value, padded to 8 bytes.
    pub puk: [u8; 8],
    /// Challenge-response key slot (reserved).
    pub cr_key: [u8; 24],
    /// Remaining PIN attempts.
    pub pin_retry: u8,
    /// Remaining PUK attempts.
    pub puk_retry: u8,
    /// Configured PIN attempt ceiling.
    pub pin_retry_max: u8,
    /// Configured PUK attempt ceiling.
    pub puk_retry_max: u8,
    /// Flag bits (see [`flags`]).
    pub flags: u8,
    /// PIN kind (only 0 = plain PIN is supported).
    pub kind: u8,
    /// Grid size (reserved).
    pub grid_size: u8,
    /// Minimum accepted PIN length.
    pub pin_min_length: u8,
    /// Minimum accepted PUK length.
    pub puk_min_length: u8,
}

impl PinRecord {
    fn decode(raw: &[u8; RECORD_LEN]) -> PinRecord {
        let mut pin = [0u8; 8];
        let mut puk = [0u8; 8];
        let mut cr_key = [0u8; 24];
        pin.copy_from_slice(&raw[0..8]);
        puk.copy_from_slice(&raw[8..16]);
        cr_key.copy_from_slice(&raw[16..40]);
        PinRecord {
            pin,
            puk,
            cr_key,
            pin_retry: raw[40],
            puk_retry: raw[41],
            pin_retry_max: raw[42],
            puk_retry_max: raw[43],
            flags: raw[44],
            kind: raw[45],
            grid_size: raw[46],
            pin_min_length: raw[47],
            puk_min_length: raw[48],
        }
    }

    fn encode(&self) -> [u8; RECORD_LEN] {
        let mut raw = [0u8; RECORD_LEN];
        raw[0..8].copy_from_slice(&self.pin);
        raw[8..16].copy_from_slice(&self.puk);
        raw[16..40].copy_from_slice(&self.cr_key);
        raw[40] = self.pin_retry;
        raw[41] = self.puk_retry;
        raw[42] = self.pin_retry_max;
        raw[43] = self.puk_retry_max;
        raw[44] = self.flags;
        raw[45] = self.kind;
        raw[46] = self.grid_size;
        raw[47] = self.pin_min_length;
        raw[48] = self.puk_min_length;
        raw
    }

    /// The non-secret record tail returned by GET DATA pin-info.
    pub fn info(&self) -> [u8; 9] {
        [
            self.pin_retry,
            self.puk_retry,
            self.pin_retry_max,
            self.puk_retry_max,
            self.flags,
            self.kind,
            self.grid_size,
            self.pin_min_length,
            self.puk_min_length,
        ]
    }
}

fn record_offset(id: u8) -> Result<usize, PinError> {
    if (1..=MAX_PINS).contains(&id) {
        Ok(usize::from(id - 1) * RECORD_LEN)
    } else {
        Err(PinError::BadId)
    }
}

/// Loads the record of PIN `id` (1-based).
pub fn load(sec: &dyn MemoryDevice, id: u8) -> Result<PinRecord, PinError> {
    let mut raw = [0u8; RECORD_LEN];
    sec.read(record_offset(id)?, &mut raw)?;
    Ok(PinRecord::decode(&raw))
}

/// Stores the record of PIN `id`.
pub fn store(sec: &mut dyn MemoryDevice, id: u8, rec: &PinRecord) -> Result<(), PinError> {
    sec.write(record_offset(id)?, &rec.encode())?;
    Ok(())
}

/// Reads the card lifecycle; everything except 7 reads as 1.
pub fn lifecycle(sec: &dyn MemoryDevice) -> u8 {
    let mut raw = [0u8; 1];
    if sec.read(LIFECYCLE_OFFSET, &mut raw).is_err() {
        return LIFECYCLE_INIT;
    }
    let lc = raw[0] ^ 0xFE;
    if lc == LIFECYCLE_OPERATIONAL {
        LIFECYCLE_OPERATIONAL
    } else {
        LIFECYCLE_INIT
    }
}

/// Writes the card lifecycle (stored XOR 0xFE, skipping no-op writes).
pub fn set_lifecycle(sec: &mut dyn MemoryDevice, lc: u8) -> Result<(), StoreError> {
    if lifecycle(sec) != lc {
        sec.write(LIFECYCLE_OFFSET, &[lc ^ 0xFE])?;
    }
    Ok(())
}

/// Pads a host-supplied PIN value to the stored 8-byte form with 0xFF.
pub fn pad_value(value: &[u8]) -> Option<[u8; 8]> {
    if value.is_empty() || value.len() > 8 {
        return None;
    }
    let mut out = [0xFFu8; 8];
    out[..value.len()].copy_from_slice(value);
    Some(out)
}

/// Compares two padded 8-byte values, treating 0x00 and 0xFF padding bytes
/// as interchangeable on either side.
///
/// Fixed-trip loop over all 8 positions; the per-byte verdicts are folded
/// through a boolean accumulator rather than an early return.
pub fn padded_eq(a: &[u8; 8], b: &[u8; 8]) -> bool {
    let mut all = true;
    for i in 0..8 {
        let (x, y) = (a[i], b[i]);
        let same = ct_eq(&[x], &[y]);
        let pad = (x == 0x00 && y == 0xFF) || (x == 0xFF && y == 0x00);
        all &= same || pad;
    }
    all
}

/// Which credential of the record is being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential {
    /// The PIN value / retry counter.
    Pin,
    /// The PUK value / retry counter.
    Puk,
}

/// Outcome of a credential comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinCheck {
    /// Value matched; retry counter restored. Carries the states this PIN
    /// activates.
    Ok {
        /// Verifying this PIN raises the global-unblocker state.
        unblocker: bool,
        /// Verifying this PIN raises the admin state.
        admin: bool,
    },
    /// Value mismatched; counter decremented, `retries_left` remain.
    Mismatch {
        /// Remaining attempts (0 means now blocked).
        retries_left: u8,
    },
    /// The counter was already exhausted (or the slot uninitialized).
    Blocked,
}

/// Checks `value` against the stored credential, burning a retry on
/// mismatch and restoring the ceiling on success.
pub fn check_credential(
    sec: &mut dyn MemoryDevice,
    id: u8,
    cred: Credential,
    value: &[u8; 8],
) -> Result<PinCheck, PinError> {
    let mut rec = load(sec, id)?;
    let (retry, max, stored) = match cred {
        Credential::Pin => (rec.pin_retry, rec.pin_retry_max, rec.pin),
        Credential::Puk => (rec.puk_retry, rec.puk_retry_max, rec.puk),
    };
    // 0xFF is blank security memory: an uninitialized slot never verifies
    if retry == 0 || retry == 0xFF {
        return Ok(PinCheck::Blocked);
    }
    let outcome = if padded_eq(value, &stored) {
        match cred {
            Credential::Pin => rec.pin_retry = max,
            Credential::Puk => rec.puk_retry = max,
        }
        PinCheck::Ok {
            unblocker: rec.flags & flags::ACTIVATES_UNBLOCKER != 0,
            admin: rec.flags & flags::ACTIVATES_ADMIN != 0,
        }
    } else {
        let left = retry - 1;
        match cred {
            Credential::Pin => rec.pin_retry = left,
            Credential::Puk => rec.puk_retry = left,
        }
        PinCheck::Mismatch { retries_left: left }
    };
    store(sec, id, &rec)?;
    Ok(outcome)
}

/// Remaining attempts and the locked flag, without burning a retry.
pub fn retries(
    sec: &dyn MemoryDevice,
    id: u8,
    cred: Credential,
) -> Result<(u8, bool), PinError> {
    let rec = load(sec, id)?;
    let retry = match cred {
        Credential::Pin => rec.pin_retry,
        Credential::Puk => rec.puk_retry,
    };
    let retry = if retry == 0xFF { 0 } else { retry };
    Ok((retry, rec.flags & flags::LOCKED != 0))
}

/// CHANGE REFERENCE DATA / RESET RETRY COUNTER core.
///
/// `data` is either `old || new` (16 bytes, old checked against the PIN or
/// the PUK depending on `puk_mode`) or `new` alone (8 bytes, allowed only
/// under the admin state — or, for the PUK path, the global-unblocker
/// state — when the record's flags permit it). On success the PIN is
/// replaced, unblocked and its counter restored; a PUK-path unblock relocks
/// the PIN when the relock flag is set.
pub fn change_reference(
    sec: &mut dyn MemoryDevice,
    access: u16,
    puk_mode: bool,
    id: u8,
    data: &[u8],
) -> Result<(), StatusWord> {
    let mut rec = load(sec, id).map_err(StatusWord::from)?;
    let new_value: [u8; 8] = match data.len() {
        16 => {
            let old = pad_value(&data[0..8]).ok_or(StatusWord::WRONG_LENGTH)?;
            let cred = if puk_mode {
                Credential::Puk
            } else {
                Credential::Pin
            };
            match check_credential(sec, id, cred, &old).map_err(StatusWord::from)? {
                PinCheck::Ok { .. } => {}
                PinCheck::Mismatch { retries_left: 0 } | PinCheck::Blocked => {
                    return Err(StatusWord::AUTH_BLOCKED)
                }
                PinCheck::Mismatch { retries_left } => {
                    return Err(StatusWord::retries(retries_left))
                }
            }
            // the comparison path rewrote the counters
            rec = load(sec, id).map_err(StatusWord::from)?;
            data[8..16].try_into().expect("8-byte slice")
        }
        8 => {
            let granted = (access & ACCESS_ADMIN != 0 && rec.flags & flags::CHANGE_BY_ADMIN != 0)
                || (puk_mode
                    && access & ACCESS_UNBLOCKER != 0
                    && rec.flags & flags::UNBLOCK_BY_GLOBAL != 0);
            if !granted {
                let retry = if puk_mode { rec.puk_retry } else { rec.pin_retry };
                return Err(if retry == 0 || retry == 0xFF {
                    StatusWord::AUTH_BLOCKED
                } else {
                    StatusWord::retries(retry.min(15))
                });
            }
            data[0..8].try_into().expect("8-byte slice")
        }
        _ => return Err(StatusWord::WRONG_LENGTH),
    };
    // screen the new value: minimum length of bytes that are not padding
    for &b in new_value.iter().take(usize::from(rec.pin_min_length)) {
        if b == 0x00 || b == 0xFF {
            return Err(StatusWord::WRONG_LENGTH);
        }
    }
    rec.pin = new_value;
    rec.pin_retry = rec.pin_retry_max;
    rec.flags &= !flags::LOCKED;
    if puk_mode && rec.flags & flags::RELOCK != 0 {
        rec.flags |= flags::LOCKED;
    }
    store(sec, id, &rec).map_err(StatusWord::from)?;
    Ok(())
}

/// PUT DATA initialize-PIN: writes a full record. Lifecycle gating happens
/// in the command layer.
pub fn initialize(sec: &mut dyn MemoryDevice, id: u8, body: &[u8]) -> Result<(), StatusWord> {
    if body.len() < 16 || body.len() > 16 + 7 + 24 {
        return Err(StatusWord::WRONG_LENGTH);
    }
    let clamp_retry = |b: u8| b.min(15);
    let clamp_min_len = |b: u8| if (1..=8).contains(&b) { b } else { 4 };
    let mut rec = PinRecord {
        pin: body[0..8].try_into().expect("8-byte slice"),
        puk: body[8..16].try_into().expect("8-byte slice"),
        cr_key: [0u8; 24],
        pin_retry: 5,
        puk_retry: 10,
        pin_retry_max: 5,
        puk_retry_max: 10,
        flags: 0,
        kind: 0,
        grid_size: 0,
        pin_min_length: 4,
        puk_min_length: 4,
    };
    if let Some(&b) = body.get(16) {
        rec.pin_retry_max = clamp_retry(b);
        rec.pin_retry = rec.pin_retry_max;
    }
    if let Some(&b) = body.get(17) {
        rec.puk_retry_max = clamp_retry(b);
        rec.puk_retry = rec.puk_retry_max;
    }
    if let Some(&b) = body.get(18) {
        rec.flags = b & 0xBF;
    }
    // only plain PINs: grid and challenge-response kinds are not wired up
    if let Some(&b) = body.get(19) {
        if b != 0 {
            return Err(StatusWord::INVALID_DATA);
        }
    }
    if let Some(&b) = body.get(20) {
        rec.grid_size = b;
    }
    if let Some(&b) = body.get(21) {
        rec.pin_min_length = clamp_min_len(b);
    }
    if let Some(&b) = body.get(22) {
        rec.puk_min_length = clamp_min_len(b);
    }
    store(sec, id, &rec).map_err(StatusWord::from)?;
    Ok(())
}

/// Evaluates one ACL nibble against the access bitmap: 0 is always allowed,
/// 15 never, 1..14 require the matching verified bit.
pub fn acl_allows(nibble: u8, access: u16) -> bool {
    match nibble {
        0 => true,
        15 => false,
        n => access & (1 << (n - 1)) != 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BufferDevice;

    fn sec_with_pin1() -> BufferDevice {
        let mut dev = BufferDevice::new(1024);
        let mut body = Vec::new();
        body.extend_from_slice(b"1111\xFF\xFF\xFF\xFF");
        body.extend_from_slice(b"2222\xFF\xFF\xFF\xFF");
        initialize(&mut dev, 1, &body).unwrap();
        dev
    }

    #[test]
    fn lifecycle_default_is_init() {
        let mut dev = BufferDevice::new(1024);
        assert_eq!(lifecycle(&dev), LIFECYCLE_INIT);
        set_lifecycle(&mut dev, LIFECYCLE_OPERATIONAL).unwrap();
        assert_eq!(lifecycle(&dev), LIFECYCLE_OPERATIONAL);
        // unknown stored values read as init
        dev.write(LIFECYCLE_OFFSET, &[0x05]).unwrap();
        assert_eq!(lifecycle(&dev), LIFECYCLE_INIT);
    }

    #[test]
    fn padding_equivalence() {
        let a = pad_value(b"1234").unwrap();
        let mut b = a;
        assert!(padded_eq(&a, &b));
        // 0x00 padding on one side matches 0xFF on the other
        b[4] = 0x00;
        assert!(padded_eq(&a, &b));
        // complements are not padding
        let x = [0x0F; 8];
        let y = [0xF0; 8];
        assert!(!padded_eq(&x, &y));
        assert!(!padded_eq(&pad_value(b"1234").unwrap(), &pad_value(b"1235").unwrap()));
    }

    #[test]
    fn retry_counter_burns_and_restores() {
        let mut dev = sec_with_pin1();
        let wrong = pad_value(b"9999").unwrap();
        let right = pad_value(b"1111").unwrap();
        assert_eq!(
            check_credential(&mut dev, 1, Credential::Pin, &wrong).unwrap(),
            PinCheck::Mismatch { retries_left: 4 }
        );
        assert_eq!(
            check_credential(&mut dev, 1, Credential::Pin, &right).unwrap(),
            PinCheck::Ok {
                unblocker: false,
                admin: false
            }
        );
        assert_eq!(retries(&dev, 1, Credential::Pin).unwrap(), (5, false));
    }

    #[test]
    fn blocked_after_max_failures() {
        let mut dev = sec_with_pin1();
        let wrong = pad_value(b"9999").unwrap();
        for left in (0..5).rev() {
            assert_eq!(
                check_credential(&mut dev, 1, Credential::Pin, &wrong).unwrap(),
                PinCheck::Mismatch {
                    retries_left: left
                }
            );
        }
        assert_eq!(
            check_credential(&mut dev, 1, Credential::Pin, &wrong).unwrap(),
            PinCheck::Blocked
        );
        // the right value no longer helps
        let right = pad_value(b"1111").unwrap();
        assert_eq!(
            check_credential(&mut dev, 1, Credential::Pin, &right).unwrap(),
            PinCheck::Blocked
        );
    }

    #[test]
    fn uninitialized_slot_is_blocked() {
        let mut dev = BufferDevice::new(1024);
        let v = pad_value(b"0000").unwrap();
        assert_eq!(
            check_credential(&mut dev, 3, Credential::Pin, &v).unwrap(),
            PinCheck::Blocked
        );
        assert!(check_credential(&mut dev, 0, Credential::Pin, &v).is_err());
        assert!(check_credential(&mut dev, 15, Credential::Pin, &v).is_err());
    }

    #[test]
    fn change_with_old_value() {
        let mut dev = sec_with_pin1();
        let mut data = Vec::new();
        data.extend_from_slice(&pad_value(b"1111").unwrap());
        data.extend_from_slice(&pad_value(b"4321").unwrap());
        change_reference(&mut dev, 0, false, 1, &data).unwrap();
        let rec = load(&dev, 1).unwrap();
        assert!(padded_eq(&rec.pin, &pad_value(b"4321").unwrap()));

        // wrong old value burns a retry
        let mut bad = Vec::new();
        bad.extend_from_slice(&pad_value(b"1111").unwrap());
        bad.extend_from_slice(&pad_value(b"5678").unwrap());
        assert_eq!(
            change_reference(&mut dev, 0, false, 1, &bad).unwrap_err(),
            StatusWord::retries(4)
        );
    }

    #[test]
    fn unblock_by_puk_and_relock() {
        let mut dev = sec_with_pin1();
        // add the relock flag
        let mut rec = load(&dev, 1).unwrap();
        rec.flags |= flags::RELOCK;
        rec.pin_retry = 0;
        store(&mut dev, 1, &rec).unwrap();

        let mut data = Vec::new();
        data.extend_from_slice(&pad_value(b"2222").unwrap());
        data.extend_from_slice(&pad_value(b"7777").unwrap());
        change_reference(&mut dev, 0, true, 1, &data).unwrap();
        let rec = load(&dev, 1).unwrap();
        assert_eq!(rec.pin_retry, rec.pin_retry_max);
        assert!(rec.flags & flags::LOCKED != 0);
    }

    #[test]
    fn admin_changes_without_old_value() {
        let mut dev = sec_with_pin1();
        let mut rec = load(&dev, 1).unwrap();
        rec.flags |= flags::CHANGE_BY_ADMIN;
        store(&mut dev, 1, &rec).unwrap();

        let new = pad_value(b"8888").unwrap();
        // without the admin state the short form is refused
        assert!(change_reference(&mut dev, 0, false, 1, &new).is_err());
        change_reference(&mut dev, ACCESS_ADMIN, false, 1, &new).unwrap();
        assert!(padded_eq(&load(&dev, 1).unwrap().pin, &new));
    }

    #[test]
    fn new_pin_screening() {
        let mut dev = sec_with_pin1();
        let mut data = Vec::new();
        data.extend_from_slice(&pad_value(b"1111").unwrap());
        data.extend_from_slice(&[0x31, 0x00, 0x32, 0x33, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(
            change_reference(&mut dev, 0, false, 1, &data).unwrap_err(),
            StatusWord::WRONG_LENGTH
        );
    }

    #[test]
    fn acl_nibbles() {
        assert!(acl_allows(0, 0));
        assert!(!acl_allows(15, 0xFFFF & !0x8000));
        assert!(acl_allows(1, 0x0001));
        assert!(!acl_allows(1, 0x0002));
        assert!(acl_allows(14, 0x2000));
    }

    #[test]
    fn initialize_parses_optional_tail() {
        let mut dev = BufferDevice::new(1024);
        let mut body = Vec::new();
        body.extend_from_slice(&[0x31; 8]);
        body.extend_from_slice(&[0x32; 8]);
        body.extend_from_slice(&[3, 7, 0xFF, 0, 0, 9, 2]);
        initialize(&mut dev, 2, &body).unwrap();
        let rec = load(&dev, 2).unwrap();
        assert_eq!(rec.pin_retry_max, 3);
        assert_eq!(rec.puk_retry_max, 7);
        assert_eq!(rec.flags, 0xBF);
        assert_eq!(rec.pin_min_length, 4); // 9 out of range -> default
        assert_eq!(rec.puk_min_length, 2);
        // kind other than plain is refused
        let mut bad = body.clone();
        bad[19] = 1;
        assert!(initialize(&mut dev, 2, &bad).is_err());
    }
}
