//! Command APDU parsing: case discrimination and length rules.
//!
//! The engine receives complete logical frames — header plus data field —
//! from the transport adapter (under T=0 the adapter has already run the
//! procedure-byte data phase). Case derivation therefore reduces to length
//! bookkeeping: T=0 interprets P3 through the per-INS attribute table,
//! T=1 distinguishes the short and extended cases 1 / 2S / 3S / 4S / 2E /
//! 3E / 4E from the frame length.
//!
//! A command with `P3 == 0` carries no Le field yet still answers with up
//! to 256 bytes; such a defaulted Ne never trips the `EMPTY_LE` attribute,
//! only a transmitted Le field does.

use crate::status::StatusWord;

/// Transport protocol tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Byte-oriented ISO 7816-3 T=0.
    T0,
    /// Block-oriented ISO 7816-3 T=1.
    T1,
}

/// Largest data field a single command (or assembled chain) may carry:
/// 256 ciphertext bytes plus a padding indicator, with slack for the
/// extended-header cases.
pub const MAX_DATA: usize = 261;

/// Largest response payload held by the card.
pub const MAX_RESPONSE: usize = 258;

/// Per-INS attribute bits.
pub mod attr {
    /// Under T=0, P3 is Ne (the command returns data).
    pub const P3_IS_NE: u8 = 0x10;
    /// Under T=0 case 3S, assume Le present with Ne = 256.
    pub const T0_LE_PRESENT: u8 = 0x20;
    /// The INS accepts Nc > 255 and keeps Ne > 256 unclamped.
    pub const LONG: u8 = 0x80;
    /// Nc must be nonzero.
    pub const REQUIRE_NC: u8 = 0x01;
    /// Ne must be nonzero.
    pub const REQUIRE_NE: u8 = 0x02;
    /// Nc must be zero (no data field).
    pub const EMPTY_LC: u8 = 0x04;
    /// No explicit Le field may be transmitted.
    pub const EMPTY_LE: u8 = 0x08;
}

/// APDU chaining state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChainState {
    /// No chain in progress.
    #[default]
    Inactive,
    /// First fragment collected.
    Start,
    /// Intermediate fragments collected.
    Active,
    /// Final fragment arrived; the handler sees the assembled APDU.
    Last,
}

impl ChainState {
    /// True while fragments are still being collected.
    pub fn running(self) -> bool {
        matches!(self, ChainState::Start | ChainState::Active)
    }
}

/// A parsed command APDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    /// Class byte (after the legacy-CLA remap).
    pub cla: u8,
    /// Instruction byte.
    pub ins: u8,
    /// Parameter 1.
    pub p1: u8,
    /// Parameter 2.
    pub p2: u8,
    /// Command data field length.
    pub nc: usize,
    /// Maximum expected response length (65536 collapses to 65535).
    pub ne: usize,
    /// Command data field (the assembled chain for chained commands).
    pub data: Vec<u8>,
    /// Chaining state at dispatch time.
    pub chain: ChainState,
}

/// The derived body of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Body {
    /// Command data field length.
    pub nc: usize,
    /// Expected response length after defaulting and clamping.
    pub ne: usize,
    /// Command data field bytes.
    pub data: Vec<u8>,
}

/// Derives the body from a raw frame and enforces the INS attributes.
pub fn parse_body(raw: &[u8], protocol: Protocol, attrs: u8) -> Result<Body, StatusWord> {
    // (nc, ne, explicit_le, data)
    let (nc, mut ne, explicit_le, data): (usize, usize, bool, &[u8]) = match protocol {
        Protocol::T0 => {
            if raw.len() < 5 {
                return Err(StatusWord::WRONG_LENGTH);
            }
            let p3 = usize::from(raw[4]);
            if p3 == 0 {
                // no data phase; Ne defaults to 256
                if raw.len() != 5 {
                    return Err(StatusWord::WRONG_LENGTH);
                }
                (0, 256, false, &raw[5..5])
            } else if attrs & attr::P3_IS_NE != 0 {
                if raw.len() != 5 {
                    return Err(StatusWord::WRONG_LENGTH);
                }
                (0, p3, true, &raw[5..5])
            } else {
                // case 3S/4S: Le is not transmissible under T=0, the
                // attribute decides whether the INS answers with data
                if raw.len() != 5 + p3 {
                    return Err(StatusWord::WRONG_LENGTH);
                }
                let ne = if attrs & attr::T0_LE_PRESENT != 0 { 256 } else { 0 };
                (p3, ne, false, &raw[5..])
            }
        }
        Protocol::T1 => {
            if raw.len() < 4 {
                return Err(StatusWord::WRONG_LENGTH);
            }
            if raw.len() == 4 {
                (0, 0, false, &raw[4..4])
            } else {
                let p3 = usize::from(raw[4]);
                if p3 != 0 {
                    if raw.len() == 5 {
                        (0, p3, true, &raw[5..5])
                    } else if raw.len() == 5 + p3 {
                        (p3, 0, false, &raw[5..])
                    } else if raw.len() == 6 + p3 {
                        let le = usize::from(raw[raw.len() - 1]);
                        (p3, if le == 0 { 256 } else { le }, true, &raw[5..5 + p3])
                    } else {
                        return Err(StatusWord::WRONG_LENGTH);
                    }
                } else if raw.len() == 5 {
                    (0, 256, false, &raw[5..5])
                } else {
                    // extended cases 2E / 3E / 4E
                    if raw.len() < 7 {
                        return Err(StatusWord::WRONG_LENGTH);
                    }
                    let ext = usize::from(raw[5]) << 8 | usize::from(raw[6]);
                    if ext == 0 {
                        if raw.len() == 7 {
                            (0, 65535, true, &raw[7..7])
                        } else {
                            return Err(StatusWord::WRONG_LENGTH);
                        }
                    } else if raw.len() == 7 {
                        (0, ext, true, &raw[7..7])
                    } else if raw.len() == 7 + ext {
                        (ext, 0, false, &raw[7..])
                    } else if raw.len() == 9 + ext {
                        let le = usize::from(raw[raw.len() - 2]) << 8
                            | usize::from(raw[raw.len() - 1]);
                        (ext, if le == 0 { 65535 } else { le }, true, &raw[7..7 + ext])
                    } else {
                        return Err(StatusWord::WRONG_LENGTH);
                    }
                }
            }
        }
    };

    if attrs & attr::LONG == 0 {
        if nc > 255 {
            return Err(StatusWord::WRONG_LENGTH);
        }
        ne = ne.min(256);
    } else if nc > MAX_DATA {
        return Err(StatusWord::WRONG_LENGTH);
    }

    if attrs & attr::REQUIRE_NC != 0 && nc == 0 {
        return Err(StatusWord::WRONG_LENGTH);
    }
    if attrs & attr::REQUIRE_NE != 0 && ne == 0 {
        return Err(StatusWord::WRONG_LENGTH);
    }
    if attrs & attr::EMPTY_LC != 0 && nc != 0 {
        return Err(StatusWord::WRONG_LENGTH);
    }
    if attrs & attr::EMPTY_LE != 0 && explicit_le && ne != 0 {
        return Err(StatusWord::WRONG_LENGTH);
    }
    Ok(Body {
        nc,
        ne,
        data: data.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t1_case_1() {
        let b = parse_body(&[0x00, 0xE4, 0, 0], Protocol::T1, attr::EMPTY_LE).unwrap();
        assert_eq!((b.nc, b.ne), (0, 0));
        assert!(b.data.is_empty());
    }

    #[test]
    fn t1_case_2s() {
        let b = parse_body(&[0x00, 0xB0, 0, 0, 0x08], Protocol::T1, attr::P3_IS_NE).unwrap();
        assert_eq!((b.nc, b.ne), (0, 8));
        let b = parse_body(&[0x00, 0xB0, 0, 0, 0x00], Protocol::T1, attr::P3_IS_NE).unwrap();
        assert_eq!(b.ne, 256);
    }

    #[test]
    fn t1_case_3s_and_4s() {
        let raw = [0x00, 0xD6, 0, 0, 2, 0xAA, 0xBB];
        let b = parse_body(&raw, Protocol::T1, 0).unwrap();
        assert_eq!((b.nc, b.ne), (2, 0));
        assert_eq!(b.data, vec![0xAA, 0xBB]);

        let raw = [0x00, 0xA4, 0, 0, 2, 0x3F, 0x00, 0x00];
        let b = parse_body(&raw, Protocol::T1, 0).unwrap();
        assert_eq!((b.nc, b.ne), (2, 256));
    }

    #[test]
    fn t1_extended_cases() {
        // 2E with Le = 0 means 65535, clamped for ordinary INS
        let raw = [0x00, 0x84, 0, 0, 0, 0, 0];
        let b = parse_body(&raw, Protocol::T1, 0).unwrap();
        assert_eq!((b.nc, b.ne), (0, 256));
        let b = parse_body(&raw, Protocol::T1, attr::LONG).unwrap();
        assert_eq!(b.ne, 65535);

        // 3E
        let mut raw = vec![0x00, 0xDA, 0, 0, 0, 0x01, 0x00];
        raw.extend_from_slice(&[0x55; 256]);
        let b = parse_body(&raw, Protocol::T1, attr::LONG).unwrap();
        assert_eq!((b.nc, b.ne), (256, 0));
        assert_eq!(b.data.len(), 256);
        // the same frame without LONG is too big
        assert!(parse_body(&raw, Protocol::T1, 0).is_err());

        // 4E
        let mut raw = vec![0x00, 0x2A, 0x9E, 0x9A, 0, 0x01, 0x00];
        raw.extend_from_slice(&[0x55; 256]);
        raw.extend_from_slice(&[0x01, 0x00]);
        let b = parse_body(&raw, Protocol::T1, attr::LONG).unwrap();
        assert_eq!((b.nc, b.ne), (256, 256));
    }

    #[test]
    fn t0_p3_interpretation() {
        // returns-data INS: P3 is Ne
        let b = parse_body(&[0x00, 0xB0, 0, 0, 0x10], Protocol::T0, attr::P3_IS_NE).unwrap();
        assert_eq!((b.nc, b.ne), (0, 0x10));
        // data INS: P3 is Nc, Le presence from the attribute
        let raw = [0x00, 0xA4, 0, 0, 2, 0x3F, 0x00];
        let b = parse_body(&raw, Protocol::T0, attr::T0_LE_PRESENT).unwrap();
        assert_eq!((b.nc, b.ne), (2, 256));
        let b = parse_body(&raw, Protocol::T0, 0).unwrap();
        assert_eq!((b.nc, b.ne), (2, 0));
        // missing data phase
        assert!(parse_body(&[0x00, 0xA4, 0, 0, 2, 0x3F], Protocol::T0, 0).is_err());
    }

    #[test]
    fn defaulted_ne_passes_empty_le() {
        // ACTIVATE APPLET as `00 44 00 00 00`: Ne defaults to 256 but no Le
        // field was transmitted
        let b = parse_body(&[0x00, 0x44, 0, 0, 0], Protocol::T1, attr::EMPTY_LE).unwrap();
        assert_eq!(b.ne, 256);
        // VERIFY status query over T=0
        let b = parse_body(&[0x00, 0x20, 0, 1, 0], Protocol::T0, attr::EMPTY_LE).unwrap();
        assert_eq!((b.nc, b.ne), (0, 256));
    }

    #[test]
    fn attribute_enforcement() {
        // VERIFY with an explicit Le is refused
        let raw = [0x00, 0x20, 0, 1, 4, 0x31, 0x31, 0x31, 0x31, 0x00];
        assert_eq!(
            parse_body(&raw, Protocol::T1, attr::EMPTY_LE).unwrap_err(),
            StatusWord::WRONG_LENGTH
        );
        // GET CHALLENGE requires Ne
        assert_eq!(
            parse_body(&[0x00, 0x84, 0, 0], Protocol::T1, attr::REQUIRE_NE).unwrap_err(),
            StatusWord::WRONG_LENGTH
        );
        // UPDATE BINARY requires Nc
        assert_eq!(
            parse_body(&[0x00, 0xD6, 0, 0, 4], Protocol::T1, attr::REQUIRE_NC).unwrap_err(),
            StatusWord::WRONG_LENGTH
        );
        // ERASE BINARY forbids a data field
        assert_eq!(
            parse_body(&[0x00, 0x0E, 0, 0, 1, 0xAA], Protocol::T1, attr::EMPTY_LC).unwrap_err(),
            StatusWord::WRONG_LENGTH
        );
    }
}
