//! Testing utilities and mock implementations
//!
//! Mocks for the broker client, modem, reboot handler and firmware
//! downloader, so the transport can be exercised without a broker or modem.

pub mod mocks;

pub use mocks::*;
