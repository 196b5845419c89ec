//! # ferroeid-core
//!
//! Safe Rust core of an ISO/IEC 7816-4 smart-card operating system that
//! emulates the MyEID PKI applet. The crate contains the full command
//! pipeline: APDU case derivation and chaining, a CLA/INS dispatch table, a
//! hierarchical filesystem stored in a linear append region, the PIN/PUK
//! security subsystem, the MANAGE SECURITY ENVIRONMENT / PERFORM SECURITY
//! OPERATION machinery, and the RSA / EC / AES / DES engines behind it.
//!
//! The crate is transport-agnostic: callers feed framed command APDUs to
//! [`card::Card::transmit`] together with a protocol tag (T=0 or T=1) and
//! receive the response APDU bytes. Electrical concerns (procedure bytes,
//! waiting-time extension shaping, ATR/PPS) belong to the transport layer.
//!
//! No `unsafe` code is permitted at the crate level.

#![deny(unsafe_code)]

pub mod apdu;
pub mod card;
pub mod crypto;
pub mod dispatch;
pub mod fs;
pub mod pin;
pub mod sec_env;
pub mod status;
pub mod store;
pub mod tlv;

mod ops;

pub use card::{Card, Protocol};
pub use status::StatusWord;
