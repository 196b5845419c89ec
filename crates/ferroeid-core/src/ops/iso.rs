//! ISO 7816-4 file and PIN command handlers.

use rand::RngCore;

use crate::apdu::Apdu;
use crate::card::{AclOp, Card};
use crate::dispatch::{CmdResult, Reply};
use crate::fs::{self, ChildKind, Query};
use crate::pin::{self, Credential, PinCheck};
use crate::status::StatusWord;

impl Card {
    pub(crate) fn cmd_select_file(&mut self, a: &Apdu) -> CmdResult {
        // P2 = 0x0C suppresses the FCI template; everything else except 0
        // is unsupported
        let want_fci = match a.p2 {
            0x00 => true,
            0x0C => false,
            _ => return Err(StatusWord::WRONG_P1P2),
        };

        let hit = if a.nc == 0 {
            match a.p1 {
                // empty body with P1 = P2 = 0 selects the MF
                0x00 if a.p2 == 0x00 => self.find_mf()?,
                0x03 => {
                    let sel = self.require_selected().map_err(|_| StatusWord::FILE_NOT_FOUND)?;
                    fs::search(&*self.data, Query::Parent(sel.entry.parent_uuid))
                        .map_err(|_| StatusWord::FILE_NOT_FOUND)?
                }
                _ => return Err(StatusWord::WRONG_LENGTH),
            }
        } else if a.p1 & 0xFE == 0x08 {
            if a.nc < 2 || a.nc % 2 != 0 {
                return Err(StatusWord::LC_INCONSISTENT);
            }
            let start = if a.p1 & 1 == 1 {
                self.current_df()?.entry.uuid
            } else {
                0
            };
            fs::search(
                &*self.data,
                Query::ByPath {
                    start,
                    path: &a.data,
                },
            )
            .map_err(|_| StatusWord::FILE_NOT_FOUND)?
        } else if a.p1 == 0x04 {
            if a.nc > 16 {
                return Err(StatusWord::LC_INCONSISTENT);
            }
            fs::search(&*self.data, Query::ByName(&a.data))
                .map_err(|_| StatusWord::FILE_NOT_FOUND)?
        } else {
            if a.nc != 2 {
                return Err(StatusWord::LC_INCONSISTENT);
            }
            let id = u16::from(a.data[0]) << 8 | u16::from(a.data[1]);
            match a.p1 {
                0x00 => {
                    if a.p2 == 0x00 && id == fs::MF_ID {
                        self.find_mf()?
                    } else {
                        let df = self.current_df()?;
                        fs::search(
                            &*self.data,
                            Query::S0 {
                                dir: df.entry.uuid,
                                parent: df.entry.parent_uuid,
                                id,
                            },
                        )
                        .map_err(|_| StatusWord::FILE_NOT_FOUND)?
                    }
                }
                0x01 => self.select_child(id, ChildKind::Df)?,
                0x02 => self.select_child(id, ChildKind::Ef)?,
                _ => return Err(StatusWord::WRONG_P1P2),
            }
        };

        self.selected = Some(hit);
        if !want_fci {
            return Ok(Reply::Done);
        }
        let fci = fs::build_fci(&*self.data, &hit, self.lifecycle())?;
        self.stage_response(fci)
    }

    fn find_mf(&self) -> Result<fs::Located, StatusWord> {
        fs::search(&*self.data, Query::ByUuid(0)).map_err(|_| StatusWord::FILE_NOT_FOUND)
    }

    fn select_child(&self, id: u16, kind: ChildKind) -> Result<fs::Located, StatusWord> {
        let df = self.current_df()?;
        fs::search(
            &*self.data,
            Query::ById {
                dir: df.entry.uuid,
                id,
                kind,
            },
        )
        .map_err(|_| StatusWord::FILE_NOT_FOUND)
    }

    pub(crate) fn cmd_read_binary(&mut self, a: &Apdu) -> CmdResult {
        if a.p1 & 0x80 != 0 {
            return Err(StatusWord::WRONG_P1P2);
        }
        let hit = self.require_selected()?;
        self.acl_check(&hit, AclOp::Read)?;
        let offset = u16::from(a.p1) << 8 | u16::from(a.p2);
        let bytes = fs::read_binary(&*self.data, &hit, offset, a.ne)?;
        self.stage_response(bytes)
    }

    pub(crate) fn cmd_update_binary(&mut self, a: &Apdu) -> CmdResult {
        if a.p1 & 0x80 != 0 {
            return Err(StatusWord::WRONG_P1P2);
        }
        let hit = self.require_selected()?;
        self.acl_check(&hit, AclOp::Update)?;
        let offset = u16::from(a.p1) << 8 | u16::from(a.p2);
        fs::update_binary(&mut *self.data, &hit, offset, &a.data)?;
        Ok(Reply::Done)
    }

    pub(crate) fn cmd_erase_binary(&mut self, a: &Apdu) -> CmdResult {
        let offset = u16::from(a.p1) << 8 | u16::from(a.p2);
        if offset & 0x8000 != 0 {
            return Err(StatusWord::WRONG_P1P2);
        }
        let hit = self.require_selected()?;
        self.acl_check(&hit, AclOp::Update)?;
        fs::erase_binary(&mut *self.data, &hit, offset)?;
        Ok(Reply::Done)
    }

    pub(crate) fn cmd_create_file(&mut self, a: &Apdu) -> CmdResult {
        if a.p1 != 0 || a.p2 != 0 {
            return Err(StatusWord::WRONG_P1P2);
        }
        if self.selected.is_none() {
            return Err(StatusWord::FILE_NOT_FOUND);
        }
        let file = fs::parse_fcp(&a.data)?;
        let parent = self.current_df()?;
        if file.kind & 0xBF == fs::KIND_DF {
            self.acl_check(&parent, AclOp::CreateDf)?;
            // DF names are unique across the card
            if !file.name.is_empty() && fs::search(&*self.data, Query::ByName(&file.name)).is_ok()
            {
                return Err(StatusWord::ALREADY_EXISTS);
            }
        } else {
            self.acl_check(&parent, AclOp::CreateEf)?;
        }
        let hit = fs::create_file(&mut *self.data, parent.entry.uuid, &file)?;
        self.selected = Some(hit);
        Ok(Reply::Done)
    }

    pub(crate) fn cmd_delete_file(&mut self, a: &Apdu) -> CmdResult {
        if a.p1 != 0 || a.p2 != 0 {
            return Err(StatusWord::WRONG_P1P2);
        }
        let hit = self.require_selected()?;
        let parent = fs::search(&*self.data, Query::Parent(hit.entry.parent_uuid))
            .map_err(|_| StatusWord::FILE_NOT_FOUND)?;
        if hit.entry.is_df() && hit.entry.prop == 0x0002 {
            // permanent DF
            return Err(StatusWord::CONDITIONS_NOT_SATISFIED);
        }
        self.acl_check(&hit, AclOp::Delete)?;
        fs::delete_subtree(&mut *self.data, &hit)?;
        self.selected = Some(parent);
        fs::reclaim_tail(&mut *self.data)?;
        Ok(Reply::Done)
    }

    pub(crate) fn cmd_verify(&mut self, a: &Apdu) -> CmdResult {
        if a.p1 != 0 {
            return Err(StatusWord::WRONG_P1P2);
        }
        let id = a.p2;
        if !(1..=pin::MAX_PINS).contains(&id) {
            return Err(StatusWord::WRONG_P1P2);
        }

        if a.data.is_empty() {
            // status query: already verified (or personalization) is fine
            if pin::acl_allows(id, self.access_view()) {
                return Ok(Reply::Done);
            }
            let (left, locked) = pin::retries(&*self.sec, id, Credential::Pin)?;
            if left == 0 {
                return Err(StatusWord::AUTH_BLOCKED);
            }
            if locked {
                return Err(StatusWord::CONDITIONS_NOT_SATISFIED);
            }
            return Err(StatusWord::retries(left));
        }

        let value = pin::pad_value(&a.data).ok_or(StatusWord::WRONG_LENGTH)?;
        let (left, locked) = pin::retries(&*self.sec, id, Credential::Pin)?;
        if left == 0 {
            return Err(StatusWord::AUTH_BLOCKED);
        }
        if locked {
            return Err(StatusWord::CONDITIONS_NOT_SATISFIED);
        }
        match pin::check_credential(&mut *self.sec, id, Credential::Pin, &value)? {
            PinCheck::Ok { unblocker, admin } => {
                self.access |= 1 << (id - 1);
                if unblocker {
                    self.access |= pin::ACCESS_UNBLOCKER;
                }
                if admin {
                    self.access |= pin::ACCESS_ADMIN;
                }
                Ok(Reply::Done)
            }
            PinCheck::Mismatch { retries_left: 0 } | PinCheck::Blocked => {
                Err(StatusWord::AUTH_BLOCKED)
            }
            PinCheck::Mismatch { retries_left } => Err(StatusWord::retries(retries_left)),
        }
    }

    pub(crate) fn cmd_change_reference_data(&mut self, a: &Apdu) -> CmdResult {
        if a.p1 != 0 {
            return Err(StatusWord::WRONG_P1P2);
        }
        let access = self.access_view();
        pin::change_reference(&mut *self.sec, access, false, a.p2, &a.data)?;
        Ok(Reply::Done)
    }

    pub(crate) fn cmd_reset_retry_counter(&mut self, a: &Apdu) -> CmdResult {
        if a.p1 != 0 {
            return Err(StatusWord::WRONG_P1P2);
        }
        let access = self.access_view();
        pin::change_reference(&mut *self.sec, access, true, a.p2, &a.data)?;
        Ok(Reply::Done)
    }

    pub(crate) fn cmd_deauthenticate(&mut self, a: &Apdu) -> CmdResult {
        match (a.p1, a.p2) {
            (0x00, 0) => self.access = 0,
            (0x00, id @ 1..=14) => self.deauth_pin(id),
            (0xA0, 0) => self.access &= !pin::ACCESS_ADMIN,
            (0xB0, 0) => self.access &= !pin::ACCESS_UNBLOCKER,
            _ => return Err(StatusWord::WRONG_P1P2),
        }
        Ok(Reply::Done)
    }

    pub(crate) fn cmd_get_challenge(&mut self, a: &Apdu) -> CmdResult {
        if a.p1 != 0 || a.p2 != 0 {
            return Err(StatusWord::WRONG_P1P2);
        }
        // the defaulted Ne of 256 wraps to zero here, as MyEID answers it
        let len = a.ne & 0xFF;
        if len == 0 {
            return Err(StatusWord::NO_DIAGNOSIS);
        }
        let mut buf = vec![0u8; len];
        self.rng.fill_bytes(&mut buf);
        self.stage_response(buf)
    }

    pub(crate) fn cmd_get_response(&mut self, a: &Apdu) -> CmdResult {
        if a.p1 != 0 || a.p2 != 0 {
            return Err(StatusWord::WRONG_P1P2);
        }
        if self.pending.is_empty() {
            return Err(StatusWord::CONDITIONS_NOT_SATISFIED);
        }
        Ok(Reply::Pump)
    }

    pub(crate) fn cmd_activate_applet(&mut self, _a: &Apdu) -> CmdResult {
        pin::set_lifecycle(&mut *self.sec, pin::LIFECYCLE_OPERATIONAL)
            .map_err(|_| StatusWord::MEMORY_FAILURE)?;
        Ok(Reply::Done)
    }
}
