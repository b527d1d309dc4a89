// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Car firmware: answer unlock requests from a paired fob.
//!
//! The whole protocol runs inside [`Car::try_unlock`], one pass per main
//! loop iteration. Note its shape: a single chain of `&&` from the
//! request poll through to the final emission. Each stage executes only
//! if every stage before it returned true, and the message emissions sit
//! at the end of the chain, so no single skipped predicate can reach
//! them. Keep it that way -- do not refactor the chain into separate
//! statements with accumulated flags.
//!
//! On any failure the car goes silent and returns to idle. The only
//! externally observable outcome of an attempt is the unlock message
//! (and feature messages) on the host line after full verification.

#![cfg_attr(not(test), no_std)]

use board_link::{Challenge, Response};
use drbg::HmacDrbg;
use drv_storage_api::{Eeprom, FlashSector, StorageError};
use drv_systick_api::SysTick;
use drv_uart_api::{Read, Write};
use keystore::{layout, CarData, PUBKEY_SIZE};
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::Signature;
use ringbuf::{ringbuf, ringbuf_entry};
use sha2::{Digest, Sha256};
use zerocopy::FromZeros;
use zeroize::{Zeroize, Zeroizing};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Trace {
    None,
    EntropyRestored,
    DrbgStartFailed,
    ResponseTimeout,
    VerifyFailed,
    Unlocked,
}

ringbuf!(Trace, 16, Trace::None);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BootError {
    /// Rewriting the entropy pool at boot failed; the device cannot be
    /// allowed to run without fresh entropy.
    Entropy(StorageError),
}

impl From<StorageError> for BootError {
    fn from(err: StorageError) -> Self {
        Self::Entropy(err)
    }
}

/// The car's peripherals, as wired by the board support layer.
pub struct CarBoard<U, H, E, F, S> {
    /// Inter-board line to the fob.
    pub fob_uart: U,
    /// Host line; the car only ever transmits on it.
    pub host_uart: H,
    pub eeprom: E,
    /// The entropy pool's sector.
    pub entropy: F,
    pub systick: S,
}

pub struct Car<U, H, E, F, S> {
    board: CarBoard<U, H, E, F, S>,
    drbg: Option<HmacDrbg>,
}

impl<U, H, E, F, S> Car<U, H, E, F, S>
where
    U: Read<u8> + Write<u8>,
    H: Write<u8>,
    E: Eeprom,
    F: FlashSector,
    S: SysTick,
{
    /// Boot-time initialization: repair the entropy pool if it reads as
    /// unprovisioned and flush stale bytes off the fob link. `entropy_image`
    /// is the per-device pool image injected at build time.
    pub fn bootstrap(
        mut board: CarBoard<U, H, E, F, S>,
        entropy_image: &[u8; entropy_pool::POOL_SIZE],
    ) -> Result<Self, BootError> {
        if entropy_pool::provision(&mut board.entropy, entropy_image)? {
            ringbuf_entry!(Trace::EntropyRestored);
        }
        drv_uart_api::drain(&mut board.fob_uart);
        Ok(Self { board, drbg: None })
    }

    pub fn run(mut self) -> ! {
        loop {
            self.try_unlock();
        }
    }

    /// One pass of the unlock protocol. Returns whether the car unlocked.
    pub fn try_unlock(&mut self) -> bool {
        let mut challenge = Challenge::new_zeroed();
        let mut response = Response::new_zeroed();

        let unlocked =
            // A fob is asking.
            board_link::poll_unlock_request(&mut self.board.fob_uart)
            // Draw a fresh challenge.
            && self.gen_challenge(&mut challenge)
            // Put it on the wire.
            && board_link::send_challenge(&mut self.board.fob_uart, &challenge)
                .is_ok()
            // Collect the response within the timeout budget.
            && self.recv_response(&mut response)
            // Check the signature and any feature authorizations.
            && self.verify_response(&challenge, &response)
            // Release the unlock message,
            && self.emit_unlock_message()
            // and the message for each authorized feature.
            && self.emit_feature_messages(&response);

        challenge.zeroize();
        if unlocked {
            ringbuf_entry!(Trace::Unlocked);
        }
        unlocked
    }

    /// Starts the DRBG on first use. Seeded from the flash pool, with the
    /// stored public key as nonce and the SysTick sample as the per-boot
    /// personalization.
    fn init_drbg(&mut self) -> bool {
        let mut car_pubkey = [0u8; PUBKEY_SIZE];
        if self
            .board
            .eeprom
            .read(layout::CAR_DATA, &mut car_pubkey)
            .is_err()
        {
            return false;
        }
        // An EEPROM that lost its image reads as repeating words; don't
        // seed from that.
        if record_reads_blank(&car_pubkey) {
            return false;
        }

        let tick = self.board.systick.now().to_le_bytes();
        match entropy_pool::bootstrap(&mut self.board.entropy, &car_pubkey, &tick)
        {
            Ok(drbg) => {
                self.drbg = Some(drbg);
                true
            }
            Err(_) => {
                ringbuf_entry!(Trace::DrbgStartFailed);
                false
            }
        }
    }

    fn gen_challenge(&mut self, challenge: &mut Challenge) -> bool {
        if self.drbg.is_none() && !self.init_drbg() {
            return false;
        }
        let Some(drbg) = self.drbg.as_mut() else {
            return false;
        };
        drbg.generate(&mut challenge.data).is_ok()
    }

    fn recv_response(&mut self, response: &mut Response) -> bool {
        match board_link::recv_response(
            &mut self.board.fob_uart,
            &mut self.board.systick,
            response,
        ) {
            Ok(()) => true,
            Err(_) => {
                ringbuf_entry!(Trace::ResponseTimeout);
                false
            }
        }
    }

    fn verify_response(
        &mut self,
        challenge: &Challenge,
        response: &Response,
    ) -> bool {
        let ok = self.verification_holds(challenge, response);
        if !ok {
            ringbuf_entry!(Trace::VerifyFailed);
        }
        ok
    }

    fn verification_holds(
        &self,
        challenge: &Challenge,
        response: &Response,
    ) -> bool {
        let Ok(data) = CarData::read(&self.board.eeprom) else {
            return false;
        };
        let Some(car_key) = keystore::verifying_key(&data.car_pubkey) else {
            return false;
        };
        let Some(host_key) = keystore::verifying_key(&data.host_pubkey) else {
            return false;
        };

        // The unlock signature proves possession of the car key and binds
        // the response to this attempt's challenge.
        let Ok(unlock_sig) = Signature::from_slice(&response.unlock) else {
            return false;
        };
        let digest = Sha256::digest(&challenge.data);
        if car_key.verify_prehash(digest.as_slice(), &unlock_sig).is_err() {
            return false;
        }

        // Each installed feature slot must carry the manufacturer's
        // authorization for this car and that slot. Empty slots are fine.
        for (slot, package) in response.feature.iter().enumerate() {
            if !package.is_installed() {
                continue;
            }
            let Ok(sig) = Signature::from_slice(package.signature_bytes())
            else {
                return false;
            };
            let digest =
                keystore::feature_digest(&data.car_pubkey, (slot + 1) as u8);
            if host_key.verify_prehash(&digest, &sig).is_err() {
                return false;
            }
        }
        true
    }

    fn emit_unlock_message(&mut self) -> bool {
        let mut message = Zeroizing::new([0u8; layout::UNLOCK_MSG_SIZE]);
        if self
            .board
            .eeprom
            .read(layout::UNLOCK_MSG, message.as_mut())
            .is_err()
        {
            return false;
        }
        drv_uart_api::write_all(&mut self.board.host_uart, message.as_ref())
            .is_ok()
    }

    fn emit_feature_messages(&mut self, response: &Response) -> bool {
        for (slot, package) in response.feature.iter().enumerate() {
            if !package.is_installed() {
                continue;
            }
            let mut message = Zeroizing::new([0u8; layout::FEATURE_MSG_SIZE]);
            if self
                .board
                .eeprom
                .read(layout::feature_msg(slot), message.as_mut())
                .is_err()
            {
                return false;
            }
            if drv_uart_api::write_all(
                &mut self.board.host_uart,
                message.as_ref(),
            )
            .is_err()
            {
                return false;
            }
        }
        true
    }
}

/// Duplicate-word pattern left behind by a failed or never-run
/// provisioning pass.
fn record_reads_blank(record: &[u8]) -> bool {
    record[0..4] == record[4..8] && record[8..12] == record[12..16]
}
