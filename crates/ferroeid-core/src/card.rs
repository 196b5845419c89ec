//! The card session: the single owning aggregate of all mutable state.
//!
//! [`Card`] owns the two persistent stores, the entropy source, the current
//! selection, the volatile security bitmap, the active security environment
//! and the response/chaining machinery. Exactly one APDU is in flight at a
//! time; [`Card::transmit`] runs the full `parse → dispatch → serialize`
//! loop and returns the response APDU. A [`Card::reset`] models card reset:
//! volatile state is dropped and the MF re-selected, while both stores
//! persist.

use rand::RngCore;

use crate::apdu::{self, Apdu, ChainState, MAX_DATA, MAX_RESPONSE};
pub use crate::apdu::Protocol;
use crate::dispatch::{self, Reply};
use crate::fs::{self, Located, Query};
use crate::pin;
use crate::sec_env::SecurityEnv;
use crate::status::StatusWord;
use crate::store::{BufferDevice, MemoryDevice, DATA_STORE_SIZE, SEC_STORE_SIZE};

/// Nibble selector into a file's 3-byte ACL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclOp {
    /// EF read / key-part read.
    Read,
    /// EF update / key-part write.
    Update,
    /// File deletion.
    Delete,
    /// On-card key generation.
    Generate,
    /// DF creation under a DF.
    CreateDf,
    /// EF creation under a DF.
    CreateEf,
}

impl AclOp {
    fn nibble(self, acl: &[u8; 3]) -> u8 {
        match self {
            AclOp::Read | AclOp::CreateEf => acl[0] >> 4,
            AclOp::Update | AclOp::CreateDf => acl[0] & 0x0F,
            AclOp::Delete => acl[1] >> 4,
            AclOp::Generate => acl[1] & 0x0F,
        }
    }
}

/// A smart card instance.
pub struct Card {
    pub(crate) data: Box<dyn MemoryDevice>,
    pub(crate) sec: Box<dyn MemoryDevice>,
    pub(crate) rng: Box<dyn RngCore>,
    /// Currently selected file, if any.
    pub(crate) selected: Option<Located>,
    /// Volatile verified-PIN bitmap (bit 14 unblocker, bit 15 admin).
    pub(crate) access: u16,
    /// Active security environment.
    pub(crate) env: Option<SecurityEnv>,
    /// Running CBC vector carried across chained cipher fragments.
    pub(crate) iv_run: [u8; 16],
    /// Pending response bytes awaiting GET RESPONSE.
    pub(crate) pending: Vec<u8>,
    pub(crate) chain: ChainState,
    pub(crate) chain_ins: u8,
    pub(crate) chain_buf: Vec<u8>,
    /// Collected chain length before the current fragment was appended.
    pub(crate) tmp_len: usize,
    protocol: Protocol,
    work_hint: Option<Box<dyn FnMut() + Send>>,
}

impl Card {
    /// Builds a card over explicit devices. A blank data store is formatted
    /// with the default MF and application DF on first boot.
    pub fn new(
        data: Box<dyn MemoryDevice>,
        sec: Box<dyn MemoryDevice>,
        rng: Box<dyn RngCore>,
    ) -> Card {
        let mut card = Card {
            data,
            sec,
            rng,
            selected: None,
            access: 0,
            env: None,
            iv_run: [0u8; 16],
            pending: Vec::new(),
            chain: ChainState::Inactive,
            chain_ins: 0,
            chain_buf: Vec::new(),
            tmp_len: 0,
            protocol: Protocol::T1,
            work_hint: None,
        };
        card.ensure_formatted();
        card.reset();
        card
    }

    /// Convenience constructor over in-memory stores.
    pub fn in_memory(rng: Box<dyn RngCore>) -> Card {
        Card::new(
            Box::new(BufferDevice::new(DATA_STORE_SIZE)),
            Box::new(BufferDevice::new(SEC_STORE_SIZE)),
            rng,
        )
    }

    /// Installs the long-operation hook invoked before key generation and
    /// private-key computations (the transport layer shapes it into T=0
    /// NULL bytes or T=1 S(WTX) requests).
    pub fn set_work_hint(&mut self, hint: Box<dyn FnMut() + Send>) {
        self.work_hint = Some(hint);
    }

    pub(crate) fn long_operation(&mut self) {
        if let Some(hint) = &mut self.work_hint {
            hint();
        }
    }

    fn ensure_formatted(&mut self) {
        let mut probe = [0u8; fs::ENTRY_LEN];
        let blank = self
            .data
            .read(0, &mut probe)
            .map(|()| probe.iter().all(|&b| b == 0xFF))
            .unwrap_or(false);
        if blank {
            let _ = fs::mkfs(&mut *self.data, None, true, None);
        }
    }

    /// Card reset: clears the volatile security bitmap, the security
    /// environment, chaining and the response buffer, and re-selects the MF.
    pub fn reset(&mut self) {
        self.access = 0;
        self.env = None;
        self.pending.clear();
        self.reset_chain();
        self.selected = fs::search(&*self.data, Query::ByUuid(0)).ok();
    }

    pub(crate) fn reset_chain(&mut self) {
        self.chain = ChainState::Inactive;
        self.chain_ins = 0;
        self.chain_buf.clear();
        self.tmp_len = 0;
    }

    /// The externally observable change counter: one tick per filesystem
    /// write, one per 256 security-store writes.
    pub fn change_counter(&self) -> u16 {
        self.data
            .change_ticks()
            .wrapping_add(self.sec.change_ticks() / 256) as u16
    }

    /// Current card lifecycle byte.
    pub fn lifecycle(&self) -> u8 {
        pin::lifecycle(&*self.sec)
    }

    /// Access bitmap as seen by ACL checks: wide open during
    /// personalization.
    pub(crate) fn access_view(&self) -> u16 {
        if self.lifecycle() == pin::LIFECYCLE_INIT {
            0xFFFF
        } else {
            self.access
        }
    }

    /// Evaluates one ACL nibble of `hit` for `op`.
    pub(crate) fn acl_check(&self, hit: &Located, op: AclOp) -> Result<(), StatusWord> {
        if pin::acl_allows(op.nibble(&hit.entry.acl), self.access_view()) {
            Ok(())
        } else {
            Err(StatusWord::SECURITY_STATUS)
        }
    }

    /// The selected file, or `0x6986` when nothing is selected.
    pub(crate) fn require_selected(&self) -> Result<Located, StatusWord> {
        self.selected.ok_or(StatusWord::NOT_ALLOWED)
    }

    /// The DF context of the current selection (the selection itself when
    /// it is a DF, otherwise its parent).
    pub(crate) fn current_df(&self) -> Result<Located, StatusWord> {
        let sel = self.selected.ok_or(StatusWord::FILE_NOT_FOUND)?;
        if sel.entry.is_df() {
            return Ok(sel);
        }
        fs::search(&*self.data, Query::Parent(sel.entry.parent_uuid))
            .map_err(|_| StatusWord::FILE_NOT_FOUND)
    }

    /// Re-reads the selection descriptor from the store (prop flags may
    /// have been rewritten underneath it).
    pub(crate) fn refresh_selection(&mut self) {
        if let Some(sel) = self.selected {
            self.selected = fs::search(&*self.data, Query::ByUuid(sel.entry.uuid)).ok();
        }
    }

    /// Selects a file by uuid without producing an FCI.
    pub(crate) fn select_uuid_quiet(&mut self, uuid: u16) -> Result<(), StatusWord> {
        let hit = fs::search(&*self.data, Query::ByUuid(uuid))
            .map_err(|_| StatusWord::FILE_NOT_FOUND)?;
        self.selected = Some(hit);
        Ok(())
    }

    /// Clears one verified-PIN bit (user-consent deauthentication).
    pub(crate) fn deauth_pin(&mut self, id: u8) {
        if (1..=14).contains(&id) {
            self.access &= !(1u16 << (id - 1));
        }
    }

    /// Stages response bytes for delivery; fails when the payload exceeds
    /// the response buffer.
    pub(crate) fn stage_response(&mut self, bytes: Vec<u8>) -> Result<Reply, StatusWord> {
        if bytes.len() > MAX_RESPONSE {
            return Err(StatusWord::WRONG_LENGTH);
        }
        self.pending = bytes;
        Ok(Reply::Data)
    }

    /// Feeds one framed command APDU to the card and returns the response
    /// APDU (data followed by the status word).
    pub fn transmit(&mut self, frame: &[u8], protocol: Protocol) -> Vec<u8> {
        self.protocol = protocol;
        match self.process(frame) {
            Err(sw) => vec![sw.sw1(), sw.sw2()],
            Ok((Reply::Done, _)) => vec![0x90, 0x00],
            Ok((Reply::Data, ne)) => {
                if ne == 0 {
                    self.pending.clear();
                    return vec![0x90, 0x00];
                }
                if self.pending.is_empty() {
                    return vec![0x90, 0x00];
                }
                if self.protocol == Protocol::T0 {
                    // T=0 signals availability; the host pumps GET RESPONSE
                    let rem = self.pending.len();
                    let ll = if rem >= 256 { 0 } else { rem as u8 };
                    return vec![0x61, ll];
                }
                self.pump(ne)
            }
            Ok((Reply::Pump, ne)) => self.pump(ne),
        }
    }

    /// Emits up to `min(ne, 256)` pending bytes plus the status word, and
    /// shifts the buffer for a follow-up GET RESPONSE.
    fn pump(&mut self, ne: usize) -> Vec<u8> {
        let n = ne.min(256).min(self.pending.len());
        let mut out: Vec<u8> = self.pending.drain(..n).collect();
        let rem = self.pending.len();
        if rem == 0 {
            out.extend_from_slice(&[0x90, 0x00]);
        } else {
            let ll = if rem >= 256 { 0 } else { rem as u8 };
            out.extend_from_slice(&[0x61, ll]);
        }
        out
    }

    fn process(&mut self, frame: &[u8]) -> Result<(Reply, usize), StatusWord> {
        if frame.len() < 4 {
            return Err(StatusWord::WRONG_LENGTH);
        }
        let mut cla = frame[0];
        let ins = frame[1];

        // any INS except GET RESPONSE invalidates a pending response
        if ins != 0xC0 {
            self.pending.clear();
        }
        // the OpenSC MyEID driver issues DELETE FILE under the legacy CLA
        if cla == 0xA0 && ins == 0xE4 {
            cla = 0x00;
        }

        let table = match cla {
            0x00 | 0x10 => dispatch::CLA00,
            0x80 => dispatch::CLA80,
            _ => return Err(StatusWord::CLA_NOT_SUPPORTED),
        };
        let entry = table
            .iter()
            .find(|e| e.ins == ins)
            .ok_or(StatusWord::INS_NOT_SUPPORTED)?;

        let body = match apdu::parse_body(frame, self.protocol, entry.attrs) {
            Ok(body) => body,
            Err(sw) => {
                if sw.is_error() {
                    self.reset_chain();
                }
                return Err(sw);
            }
        };
        let mut cmd = Apdu {
            cla,
            ins,
            p1: frame[2],
            p2: frame[3],
            nc: body.nc,
            ne: body.ne,
            data: body.data,
            chain: ChainState::Inactive,
        };

        // chaining bookkeeping; GET RESPONSE passes through untouched
        if ins != 0xC0 {
            let fragment = cla == 0x10;
            if self.chain.running() && ins != self.chain_ins {
                // interleaved INS aborts the chain
                self.reset_chain();
            }
            if self.chain.running() {
                self.tmp_len = self.chain_buf.len();
                self.chain_buf.extend_from_slice(&cmd.data);
                if self.chain_buf.len() > MAX_DATA {
                    self.reset_chain();
                    return Err(StatusWord::WRONG_LENGTH);
                }
                self.chain = if fragment {
                    ChainState::Active
                } else {
                    ChainState::Last
                };
                cmd.nc = self.chain_buf.len();
                cmd.data = self.chain_buf.clone();
            } else if fragment {
                self.tmp_len = 0;
                self.chain_buf = cmd.data.clone();
                self.chain = ChainState::Start;
                self.chain_ins = ins;
            }
            cmd.chain = self.chain;
        }

        let result = (entry.handler)(self, &cmd);
        match &result {
            Ok(reply) => {
                if self.chain == ChainState::Last {
                    self.reset_chain();
                } else if matches!(reply, Reply::Data) && self.chain.running() {
                    // streamed fragment answered: drop the consumed data,
                    // the chain itself stays open
                    self.chain_buf.clear();
                    self.tmp_len = 0;
                }
            }
            Err(sw) => {
                if sw.is_error() {
                    self.reset_chain();
                }
            }
        }
        result.map(|reply| (reply, cmd.ne))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn card() -> Card {
        Card::in_memory(Box::new(StdRng::seed_from_u64(0xFE44)))
    }

    #[test]
    fn boot_selects_the_mf() {
        let c = card();
        assert_eq!(c.selected.unwrap().entry.id, fs::MF_ID);
        assert_eq!(c.lifecycle(), pin::LIFECYCLE_INIT);
    }

    #[test]
    fn unknown_cla_and_ins() {
        let mut c = card();
        assert_eq!(c.transmit(&[0x55, 0xA4, 0, 0], Protocol::T1), [0x6E, 0x00]);
        assert_eq!(c.transmit(&[0x00, 0x99, 0, 0], Protocol::T1), [0x6D, 0x00]);
        assert_eq!(c.transmit(&[0x00], Protocol::T1), [0x67, 0x00]);
    }

    #[test]
    fn reset_clears_volatile_state() {
        let mut c = card();
        c.access = 0x8003;
        c.pending = vec![1, 2, 3];
        c.chain = ChainState::Active;
        c.reset();
        assert_eq!(c.access, 0);
        assert!(c.pending.is_empty());
        assert_eq!(c.chain, ChainState::Inactive);
        assert_eq!(c.selected.unwrap().entry.id, fs::MF_ID);
    }

    #[test]
    fn lifecycle_gates_the_access_view() {
        let mut c = card();
        assert_eq!(c.access_view(), 0xFFFF);
        pin::set_lifecycle(&mut *c.sec, pin::LIFECYCLE_OPERATIONAL).unwrap();
        assert_eq!(c.access_view(), 0);
        c.access = 0x0005;
        assert_eq!(c.access_view(), 0x0005);
    }

    #[test]
    fn get_response_pumps_in_chunks() {
        let mut c = card();
        c.pending = (0u8..=255).collect();
        // request 16 bytes
        let out = c.transmit(&[0x00, 0xC0, 0, 0, 0x10], Protocol::T1);
        assert_eq!(out.len(), 18);
        assert_eq!(&out[16..], &[0x61, 0xF0]);
        // drain the rest
        let out = c.transmit(&[0x00, 0xC0, 0, 0, 0x00], Protocol::T1);
        assert_eq!(out.len(), 242);
        assert_eq!(&out[240..], &[0x90, 0x00]);
        // nothing left
        let out = c.transmit(&[0x00, 0xC0, 0, 0, 0x01], Protocol::T1);
        assert_eq!(out, [0x69, 0x85]);
    }

    #[test]
    fn non_c0_invalidates_pending_response() {
        let mut c = card();
        c.pending = vec![0xAA; 8];
        // a SELECT discards the stale buffer before running
        let _ = c.transmit(&[0x00, 0xA4, 0x02, 0x00, 0x02, 0x12, 0x34], Protocol::T1);
        let out = c.transmit(&[0x00, 0xC0, 0, 0, 0x08], Protocol::T1);
        assert_eq!(out, [0x69, 0x85]);
    }
}
