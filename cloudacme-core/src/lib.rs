//! cloudacme core - shared trigger types
//!
//! This crate holds the inbound event shapes the `cloudacme` binary accepts,
//! the responses it produces for them, and the JSON-lines codec used to move
//! both across stdin/stdout.

mod codec;
mod event;

pub use codec::*;
pub use event::*;
