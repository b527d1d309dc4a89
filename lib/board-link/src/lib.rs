// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The point-to-point serial protocol between a car and a fob (and, during
//! pairing, between two fobs).
//!
//! Framing is a single magic byte followed by a fixed-length payload;
//! there is no length field, no checksum, and no resynchronization inside
//! a payload. Receivers discard bytes until the magic they expect, then
//! consume exactly the payload size. Authenticity comes from the
//! signatures inside the payloads, not the transport.
//!
//! The car's response receive is the only bounded operation: eight
//! one-second windows, after which the attempt is abandoned. Everything
//! else blocks, with reset as the escape hatch.

#![cfg_attr(not(test), no_std)]

use core::mem::size_of;

use drv_systick_api::SysTick;
use drv_uart_api::{Read, Write};
use keystore::{Package, NUM_FEATURES, PACKAGE_SIZE, PRIVKEY_SIZE};
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};
use zeroize::Zeroize;

/// Fob asks the car to start an unlock attempt. No payload.
pub const UNLOCK_REQ: u8 = 0x56;
/// Car issues a challenge. Payload: [`Challenge`].
pub const CHAL_START: u8 = 0x57;
/// Fob answers. Payload: [`Response`].
pub const RESP_START: u8 = 0x58;
/// Paired fob delivers credentials. Payload: [`PairPacket`].
pub const PAIR_START: u8 = 0x21;

/// Windows granted to the fob to compute and deliver a response.
pub const RESPONSE_WINDOWS: usize = 8;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkError {
    /// The response did not arrive within the granted windows.
    Timeout,
    /// The transmitter reported a fault.
    Io,
}

/// 64 bytes of fresh DRBG output, unique per unlock attempt.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Zeroize)]
#[repr(C)]
pub struct Challenge {
    pub data: [u8; 64],
}

const_assert_eq!(size_of::<Challenge>(), 64);

/// The fob's answer: a signature over the challenge digest, plus its
/// three feature slots forwarded verbatim (uninstalled slots carry the
/// erased pattern).
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Response {
    pub unlock: [u8; PACKAGE_SIZE],
    pub feature: [Package; NUM_FEATURES],
}

const_assert_eq!(size_of::<Response>(), 256);

/// The credentials a paired fob hands to an unpaired one.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Zeroize)]
#[repr(C)]
pub struct PairPacket {
    pub car_privkey: [u8; PRIVKEY_SIZE],
    pub pin: u32,
}

const_assert_eq!(size_of::<PairPacket>(), 36);

// -- Car side ---------------------------------------------------------------

/// True when the fob has a request byte waiting. Consumes at most one
/// byte; anything that isn't the request magic is dropped.
pub fn poll_unlock_request<U: Read<u8>>(uart: &mut U) -> bool {
    matches!(drv_uart_api::poll_byte(uart), Some(UNLOCK_REQ))
}

pub fn send_challenge<U: Write<u8>>(
    uart: &mut U,
    challenge: &Challenge,
) -> Result<(), LinkError> {
    drv_uart_api::write_byte(uart, CHAL_START).map_err(|_| LinkError::Io)?;
    drv_uart_api::write_all(uart, challenge.as_bytes())
        .map_err(|_| LinkError::Io)
}

/// Collects the fob's response, discarding noise until the start byte,
/// then reading the fixed payload. Gives up after [`RESPONSE_WINDOWS`]
/// one-second windows. Never resynchronizes mid-payload: a short payload
/// runs out the clock and the partial bytes are discarded with the
/// attempt.
pub fn recv_response<U: Read<u8>, S: SysTick>(
    uart: &mut U,
    systick: &mut S,
    response: &mut Response,
) -> Result<(), LinkError> {
    let buf = response.as_mut_bytes();
    let mut filled = 0;
    let mut started = false;

    for _ in 0..RESPONSE_WINDOWS {
        systick.arm();
        while !systick.expired() {
            let Some(byte) = drv_uart_api::poll_byte(uart) else {
                continue;
            };
            if !started {
                started = byte == RESP_START;
                continue;
            }
            buf[filled] = byte;
            filled += 1;
            if filled == buf.len() {
                return Ok(());
            }
        }
    }

    Err(LinkError::Timeout)
}

// -- Fob side ---------------------------------------------------------------

pub fn request_unlock<U: Write<u8>>(uart: &mut U) -> Result<(), LinkError> {
    drv_uart_api::write_byte(uart, UNLOCK_REQ).map_err(|_| LinkError::Io)
}

/// Blocks until a challenge frame arrives. Bytes ahead of the magic are
/// dropped.
pub fn recv_challenge<U: Read<u8>>(uart: &mut U, challenge: &mut Challenge) {
    while drv_uart_api::read_byte(uart) != CHAL_START {}
    drv_uart_api::read_exact(uart, challenge.as_mut_bytes());
}

pub fn send_response<U: Write<u8>>(
    uart: &mut U,
    response: &Response,
) -> Result<(), LinkError> {
    drv_uart_api::write_byte(uart, RESP_START).map_err(|_| LinkError::Io)?;
    drv_uart_api::write_all(uart, response.as_bytes())
        .map_err(|_| LinkError::Io)
}

pub fn send_pair_packet<U: Write<u8>>(
    uart: &mut U,
    packet: &PairPacket,
) -> Result<(), LinkError> {
    drv_uart_api::write_byte(uart, PAIR_START).map_err(|_| LinkError::Io)?;
    drv_uart_api::write_all(uart, packet.as_bytes())
        .map_err(|_| LinkError::Io)
}

/// Blocks until a pairing frame arrives; the caller zeroizes the packet
/// once its contents are committed.
pub fn recv_pair_packet<U: Read<u8>>(uart: &mut U, packet: &mut PairPacket) {
    while drv_uart_api::read_byte(uart) != PAIR_START {}
    drv_uart_api::read_exact(uart, packet.as_mut_bytes());
}
