#![no_std]

// Telemetry transport engine shared by firmware and host tooling.
//
// Records are cached in a bounded text buffer and drained over an AT-command
// Wi-Fi modem. Nothing here allocates; the byte transport and clock are
// supplied by the target through the traits in `modem`.

#[macro_use]
mod diag;

pub mod cache;
pub mod config;
pub mod logger;
pub mod modem;
pub mod record;
pub mod timestamp;
pub mod uplink;
