//! chatkey shared library: ids, key-record types, relay signals and frames
//! shared between the exchange engine and the relay.

pub mod api;
pub mod constants;
pub mod display;
pub mod error;
pub mod ids;
pub mod signal;
