//! Shared helpers for binaries and the relay.

pub mod bootstrap;
pub mod retry;
