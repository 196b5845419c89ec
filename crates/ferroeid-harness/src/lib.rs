//! # ferroeid-harness
//!
//! Conformance tooling for the ferroeid card core: an in-process reader
//! that drives a [`ferroeid_core::Card`] the way a host-side PC/SC stack
//! would (automatic `61 LL` response pumping under T=0), a hex APDU script
//! runner with inline expectations, and JSON fixture sets for captured
//! command traces.

#![forbid(unsafe_code)]

pub mod fixtures;
pub mod reader;
pub mod script;

pub use reader::Reader;
