//! ISO 7816-4 status words.
//!
//! Every command handler resolves to a [`StatusWord`]; the engine appends it
//! to the response APDU. The parametric families (`61 LL` more data,
//! `63 CN` retries left) get constructor helpers so the remaining code never
//! assembles raw SW bytes.

use core::fmt;

/// A two-byte ISO 7816-4 status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusWord(pub u16);

impl StatusWord {
    /// `90 00` — normal completion.
    pub const OK: StatusWord = StatusWord(0x9000);
    /// `62 81` — warning, returned data may be corrupted.
    pub const CORRUPTED_DATA: StatusWord = StatusWord(0x6281);
    /// `62 82` — end of file reached before reading Le bytes.
    pub const EOF_BEFORE_LE: StatusWord = StatusWord(0x6282);
    /// `65 81` — memory failure.
    pub const MEMORY_FAILURE: StatusWord = StatusWord(0x6581);
    /// `67 00` — wrong length.
    pub const WRONG_LENGTH: StatusWord = StatusWord(0x6700);
    /// `69 81` — command incompatible with file structure.
    pub const INCOMPATIBLE_FILE: StatusWord = StatusWord(0x6981);
    /// `69 82` — security status not satisfied.
    pub const SECURITY_STATUS: StatusWord = StatusWord(0x6982);
    /// `69 83` — authentication method blocked.
    pub const AUTH_BLOCKED: StatusWord = StatusWord(0x6983);
    /// `69 84` — referenced data invalid.
    pub const INVALID_DATA: StatusWord = StatusWord(0x6984);
    /// `69 85` — conditions of use not satisfied.
    pub const CONDITIONS_NOT_SATISFIED: StatusWord = StatusWord(0x6985);
    /// `69 86` — command not allowed (no current EF).
    pub const NOT_ALLOWED: StatusWord = StatusWord(0x6986);
    /// `6A 80` — incorrect parameters in the command data field.
    pub const WRONG_DATA: StatusWord = StatusWord(0x6A80);
    /// `6A 81` — function not supported.
    pub const FUNC_NOT_SUPPORTED: StatusWord = StatusWord(0x6A81);
    /// `6A 82` — file or application not found.
    pub const FILE_NOT_FOUND: StatusWord = StatusWord(0x6A82);
    /// `6A 86` — incorrect parameters P1-P2.
    pub const WRONG_P1P2: StatusWord = StatusWord(0x6A86);
    /// `6A 87` — Lc inconsistent with P1-P2.
    pub const LC_INCONSISTENT: StatusWord = StatusWord(0x6A87);
    /// `6A 88` — referenced data not found.
    pub const REF_NOT_FOUND: StatusWord = StatusWord(0x6A88);
    /// `6A 89` — file already exists.
    pub const ALREADY_EXISTS: StatusWord = StatusWord(0x6A89);
    /// `6B 00` — offset outside the EF.
    pub const OUTSIDE_EF: StatusWord = StatusWord(0x6B00);
    /// `6C 00` — wrong Le field (exact length in SW2 when known).
    pub const WRONG_LE: StatusWord = StatusWord(0x6C00);
    /// `6D 00` — instruction not supported.
    pub const INS_NOT_SUPPORTED: StatusWord = StatusWord(0x6D00);
    /// `6E 00` — class not supported.
    pub const CLA_NOT_SUPPORTED: StatusWord = StatusWord(0x6E00);
    /// `6F 00` — no precise diagnosis.
    pub const NO_DIAGNOSIS: StatusWord = StatusWord(0x6F00);

    /// `61 LL` — `remaining` response bytes still available.
    ///
    /// `LL == 0` signals 256 or more bytes per ISO 7816-4.
    pub fn more_data(remaining: usize) -> StatusWord {
        let ll = if remaining >= 256 { 0 } else { remaining as u16 };
        StatusWord(0x6100 | ll)
    }

    /// `63 CN` — verification failed, `n` retries left (clamped to 15).
    pub fn retries(n: u8) -> StatusWord {
        StatusWord(0x63C0 | u16::from(n.min(15)))
    }

    /// High byte of the status word.
    pub fn sw1(self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// Low byte of the status word.
    pub fn sw2(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    /// True for every word that is not `90 00`, `61 LL` or `63 CN`.
    ///
    /// These are the words that abort an APDU chain and guarantee no
    /// observable state change beyond PIN counter bookkeeping.
    pub fn is_error(self) -> bool {
        if self == StatusWord::OK {
            return false;
        }
        !matches!(self.0 & 0xFF00, 0x6100 | 0x6300)
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn more_data_encodes_remaining() {
        assert_eq!(StatusWord::more_data(0x80).0, 0x6180);
        assert_eq!(StatusWord::more_data(255).0, 0x61FF);
        assert_eq!(StatusWord::more_data(256).0, 0x6100);
        assert_eq!(StatusWord::more_data(1000).0, 0x6100);
    }

    #[test]
    fn retries_clamps_to_nibble() {
        assert_eq!(StatusWord::retries(4).0, 0x63C4);
        assert_eq!(StatusWord::retries(20).0, 0x63CF);
    }

    #[test]
    fn error_classification() {
        assert!(!StatusWord::OK.is_error());
        assert!(!StatusWord::more_data(10).is_error());
        assert!(!StatusWord::retries(3).is_error());
        assert!(StatusWord::WRONG_LENGTH.is_error());
        assert!(StatusWord::AUTH_BLOCKED.is_error());
        assert!(StatusWord::EOF_BEFORE_LE.is_error());
    }
}
