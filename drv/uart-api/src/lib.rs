// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The serial seam between the protocol code and the UART hardware.
//!
//! Ports are anything implementing the `embedded-hal` 0.2 serial traits;
//! this crate re-exports those and adds the small set of byte-pump
//! helpers the link layers are written against.
//!
//! Receive-side line errors (framing, parity, noise) are swallowed: the
//! protocols treat a damaged byte exactly like an absent one and recover
//! by magic-byte scanning or timeout one layer up.

#![no_std]

pub use embedded_hal::serial::{Read, Write};
pub use nb;

/// Non-blocking poll for one byte. `None` means no data (or a byte lost
/// to line noise).
pub fn poll_byte<U: Read<u8>>(uart: &mut U) -> Option<u8> {
    uart.read().ok()
}

/// Reads one byte, spinning until one arrives intact.
pub fn read_byte<U: Read<u8>>(uart: &mut U) -> u8 {
    loop {
        if let Ok(byte) = uart.read() {
            return byte;
        }
    }
}

/// Fills `buf`, spinning per byte.
pub fn read_exact<U: Read<u8>>(uart: &mut U, buf: &mut [u8]) {
    for slot in buf {
        *slot = read_byte(uart);
    }
}

/// Writes one byte, spinning while the transmitter is busy.
pub fn write_byte<U: Write<u8>>(uart: &mut U, byte: u8) -> Result<(), U::Error> {
    nb::block!(uart.write(byte))
}

/// Writes all of `bytes` in order.
pub fn write_all<U: Write<u8>>(uart: &mut U, bytes: &[u8]) -> Result<(), U::Error> {
    for &byte in bytes {
        nb::block!(uart.write(byte))?;
    }
    Ok(())
}

/// Discards anything sitting in the receive FIFO. Run once at link setup
/// so a reset on one end doesn't leave the other end parsing stale bytes.
pub fn drain<U: Read<u8>>(uart: &mut U) {
    while uart.read().is_ok() {}
}
