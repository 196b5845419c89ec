//! CLA/INS dispatch tables.
//!
//! Each table row carries the per-INS attribute bits used by case
//! derivation and the handler to invoke. CLA 0x00 (and its chained form
//! 0x10) covers the ISO 7816-4 command set plus the MyEID extensions;
//! CLA 0x80 carries the proprietary variants.

use crate::apdu::{attr, Apdu};
use crate::card::Card;
use crate::status::StatusWord;

/// What a handler produced besides the status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Status only (`90 00`).
    Done,
    /// Response bytes were staged; deliver per protocol rules.
    Data,
    /// GET RESPONSE: pump staged bytes regardless of protocol.
    Pump,
}

/// Handler outcome.
pub type CmdResult = Result<Reply, StatusWord>;

/// Handler entry point.
pub type Handler = fn(&mut Card, &Apdu) -> CmdResult;

/// One dispatch row.
pub struct InsEntry {
    /// Instruction byte.
    pub ins: u8,
    /// Attribute bits (see [`attr`]).
    pub attrs: u8,
    /// Command handler.
    pub handler: Handler,
}

const fn row(ins: u8, attrs: u8, handler: Handler) -> InsEntry {
    InsEntry {
        ins,
        attrs,
        handler,
    }
}

/// CLA 0x00 / 0x10 command set.
pub static CLA00: &[InsEntry] = &[
    row(0x0E, attr::EMPTY_LC, Card::cmd_erase_binary),
    row(0x20, attr::EMPTY_LE, Card::cmd_verify),
    row(0x22, attr::EMPTY_LE, Card::cmd_manage_security_env),
    row(
        0x24,
        attr::REQUIRE_NC | attr::EMPTY_LE,
        Card::cmd_change_reference_data,
    ),
    row(
        0x2A,
        attr::T0_LE_PRESENT | attr::LONG,
        Card::cmd_perform_security_operation,
    ),
    row(
        0x2C,
        attr::REQUIRE_NC | attr::EMPTY_LE,
        Card::cmd_reset_retry_counter,
    ),
    row(
        0x2E,
        attr::EMPTY_LC | attr::EMPTY_LE,
        Card::cmd_deauthenticate,
    ),
    row(0x44, attr::EMPTY_LE, Card::cmd_activate_applet),
    row(0x46, attr::T0_LE_PRESENT, Card::cmd_generate_key),
    row(
        0x84,
        attr::REQUIRE_NE | attr::EMPTY_LC | attr::P3_IS_NE,
        Card::cmd_get_challenge,
    ),
    row(
        0x86,
        attr::T0_LE_PRESENT | attr::REQUIRE_NC,
        Card::cmd_general_authenticate,
    ),
    row(0xA4, attr::T0_LE_PRESENT, Card::cmd_select_file),
    row(
        0xB0,
        attr::REQUIRE_NE | attr::EMPTY_LC | attr::P3_IS_NE,
        Card::cmd_read_binary,
    ),
    row(
        0xC0,
        attr::REQUIRE_NE | attr::EMPTY_LC | attr::P3_IS_NE,
        Card::cmd_get_response,
    ),
    row(
        0xCA,
        attr::REQUIRE_NE | attr::EMPTY_LC | attr::P3_IS_NE,
        Card::cmd_get_data,
    ),
    row(
        0xD6,
        attr::REQUIRE_NC | attr::EMPTY_LE,
        Card::cmd_update_binary,
    ),
    row(
        0xDA,
        attr::REQUIRE_NC | attr::EMPTY_LE | attr::LONG,
        Card::cmd_put_data,
    ),
    row(
        0xE0,
        attr::REQUIRE_NC | attr::EMPTY_LE,
        Card::cmd_create_file,
    ),
    row(0xE4, attr::EMPTY_LE, Card::cmd_delete_file),
];

/// CLA 0x80 proprietary command set.
pub static CLA80: &[InsEntry] = &[
    row(
        0x2A,
        attr::REQUIRE_NC | attr::T0_LE_PRESENT | attr::LONG,
        Card::cmd_perform_security_operation,
    ),
    row(
        0xDA,
        attr::REQUIRE_NC | attr::EMPTY_LE,
        Card::cmd_key_change_type,
    ),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_have_unique_instructions() {
        for table in [CLA00, CLA80] {
            for (i, a) in table.iter().enumerate() {
                for b in table.iter().skip(i + 1) {
                    assert_ne!(a.ins, b.ins);
                }
            }
        }
    }

    #[test]
    fn iso_command_set_is_present() {
        let ins: Vec<u8> = CLA00.iter().map(|e| e.ins).collect();
        for expected in [
            0x0E, 0x20, 0x22, 0x24, 0x2A, 0x2C, 0x2E, 0x44, 0x46, 0x84, 0x86, 0xA4, 0xB0, 0xC0,
            0xCA, 0xD6, 0xDA, 0xE0, 0xE4,
        ] {
            assert!(ins.contains(&expected), "missing INS {expected:02X}");
        }
    }
}
