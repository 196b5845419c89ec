//! In-process card reader.
//!
//! [`Reader`] owns a card and plays the host side of the transport: it
//! submits framed APDUs, and — when asked for a drained exchange — follows
//! `61 LL` status words with GET RESPONSE until the card has nothing left,
//! returning the concatenated data plus the final status word. That is the
//! behavior a PC/SC stack gives applications under T=0.

use rand::rngs::StdRng;
use rand::SeedableRng;

use ferroeid_core::{Card, Protocol, StatusWord};

/// A host-side reader attached to one card.
pub struct Reader {
    card: Card,
    protocol: Protocol,
}

impl Reader {
    /// Powers up a fresh in-memory card under the given protocol.
    pub fn new(protocol: Protocol) -> Reader {
        Reader {
            card: Card::in_memory(Box::new(StdRng::from_entropy())),
            protocol,
        }
    }

    /// Powers up a card with a deterministic entropy source (tests).
    pub fn with_seed(protocol: Protocol, seed: u64) -> Reader {
        Reader {
            card: Card::in_memory(Box::new(StdRng::seed_from_u64(seed))),
            protocol,
        }
    }

    /// Attaches to an existing card.
    pub fn attach(card: Card, protocol: Protocol) -> Reader {
        Reader { card, protocol }
    }

    /// The protocol in use.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Direct access to the card (state inspection in tests).
    pub fn card(&mut self) -> &mut Card {
        &mut self.card
    }

    /// Cold reset: volatile card state is dropped, stores persist.
    pub fn reset(&mut self) {
        self.card.reset();
    }

    /// Sends one frame and returns the raw response APDU.
    pub fn transmit_raw(&mut self, frame: &[u8]) -> Vec<u8> {
        self.card.transmit(frame, self.protocol)
    }

    /// Sends one frame and pumps GET RESPONSE until the response is
    /// drained. Returns all data bytes plus the final status word.
    pub fn transmit(&mut self, frame: &[u8]) -> Vec<u8> {
        let mut response = self.card.transmit(frame, self.protocol);
        let mut data = Vec::new();
        loop {
            if response.len() < 2 {
                break;
            }
            let sw1 = response[response.len() - 2];
            let sw2 = response[response.len() - 1];
            data.extend_from_slice(&response[..response.len() - 2]);
            if sw1 != 0x61 {
                data.push(sw1);
                data.push(sw2);
                break;
            }
            let le = sw2; // 0 requests the full 256-byte window
            response = self
                .card
                .transmit(&[0x00, 0xC0, 0x00, 0x00, le], self.protocol);
        }
        data
    }

    /// Drained exchange split into data and status word.
    pub fn exchange(&mut self, frame: &[u8]) -> (Vec<u8>, StatusWord) {
        let mut out = self.transmit(frame);
        let sw2 = out.pop().unwrap_or(0);
        let sw1 = out.pop().unwrap_or(0);
        (out, StatusWord(u16::from(sw1) << 8 | u16::from(sw2)))
    }

    /// Formats the card, installs PIN 1 and raises the lifecycle — the
    /// minimal personalization a PKCS#15 layout builds on.
    pub fn personalize(&mut self, pin: &[u8], puk: &[u8]) -> Result<(), StatusWord> {
        let mut init = vec![0x00, 0xDA, 0x01, 0x01, 0x10];
        init.extend_from_slice(&pad8(pin));
        init.extend_from_slice(&pad8(puk));
        self.expect_ok(&init)?;
        self.expect_ok(&[0x00, 0x44, 0x00, 0x00, 0x00])?;
        Ok(())
    }

    fn expect_ok(&mut self, frame: &[u8]) -> Result<(), StatusWord> {
        let (_, sw) = self.exchange(frame);
        if sw == StatusWord::OK {
            Ok(())
        } else {
            Err(sw)
        }
    }
}

fn pad8(value: &[u8]) -> [u8; 8] {
    let mut out = [0xFFu8; 8];
    let n = value.len().min(8);
    out[..n].copy_from_slice(&value[..n]);
    out
}
