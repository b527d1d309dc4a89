// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Key fob firmware: request unlocks, install features, pair new fobs.
//!
//! The main loop alternates two non-blocking polls: one on the host line
//! for a command byte, one on the unlock button. Each handler runs to
//! completion before the loop resumes, so there is never more than one
//! operation in flight.
//!
//! The build is parameterized by where its secrets live (the
//! [`SecretSource`] role): a fob provisioned paired reads the car key
//! and PIN out of EEPROM; a fob provisioned unpaired acquires them at
//! runtime, over the pairing link, into its flash record. A fob that has
//! acquired credentials this way behaves exactly like a provisioned one
//! from then on -- including acting as the sending side of a pairing --
//! but can never itself be re-paired.
//!
//! Nothing is ever transmitted on the host line. Success and failure are
//! equally silent; the car's messages are the only evidence an unlock
//! worked, and stolen hardware gets no oracle.

#![cfg_attr(not(test), no_std)]

use core::marker::PhantomData;

use board_link::{Challenge, PairPacket, Response};
use drbg::HmacDrbg;
use drv_storage_api::{Eeprom, FlashSector, StorageError};
use drv_systick_api::SysTick;
use drv_uart_api::{Read, Write};
use embedded_hal::blocking::delay::{DelayMs, DelayUs};
use embedded_hal::digital::v2::InputPin;
use keystore::{FobState, Package, SecretSource, NUM_FEATURES, PACKAGE_SIZE};
use p256::ecdsa::signature::hazmat::RandomizedPrehashSigner;
use p256::ecdsa::Signature;
use ringbuf::{ringbuf, ringbuf_entry};
use sha2::{Digest, Sha256};
use zerocopy::FromZeros;
use zeroize::Zeroize;

pub use keystore::{EepromSecrets, FlashSecrets};

/// Host asks for a feature package to be installed.
pub const ENABLE_CMD: u8 = 0x10;
/// Host asks this (paired) fob to hand its credentials to another fob.
pub const P_PAIR_CMD: u8 = 0x20;
/// Host asks this (unpaired) fob to receive credentials.
pub const U_PAIR_CMD: u8 = 0x30;

/// Cost of a wrong PIN. This is the sole brute-force countermeasure, so
/// it applies before anything else can happen.
pub const PIN_PENALTY_MS: u32 = 5_000;

/// Settling time between the two button samples.
const DEBOUNCE_US: u32 = 750;

cfg_if::cfg_if! {
    if #[cfg(feature = "og-pfob")] {
        /// Secret placement for this build.
        pub type BuildRole = EepromSecrets;
    } else if #[cfg(feature = "og-ufob")] {
        /// Secret placement for this build.
        pub type BuildRole = FlashSecrets;
    }
}

#[cfg(all(feature = "og-pfob", feature = "og-ufob"))]
compile_error!("a fob is built as exactly one of og-pfob / og-ufob");

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Trace {
    None,
    EntropyRestored,
    DrbgStartFailed,
    HostCmd(u8),
    FeatureInstalled(u8),
    PinRejected,
    CredentialsSent,
    Paired,
    SaveFailed,
    UnlockAttempt,
}

ringbuf!(Trace, 16, Trace::None);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BootError {
    /// The entropy pool or the state record could not be brought up.
    Storage(StorageError),
}

impl From<StorageError> for BootError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

/// The fob's peripherals, as wired by the board support layer.
pub struct FobBoard<U, H, E, FS, FE, S, B, D> {
    /// Inter-board line to the car (or the peer fob during pairing).
    pub board_uart: U,
    /// Host line; the fob only ever receives on it.
    pub host_uart: H,
    pub eeprom: E,
    /// The state record's sector.
    pub state_flash: FS,
    /// The entropy pool's sector.
    pub entropy: FE,
    pub systick: S,
    /// Unlock switch, active low.
    pub button: B,
    pub delay: D,
}

pub struct Fob<R, U, H, E, FS, FE, S, B, D> {
    board: FobBoard<U, H, E, FS, FE, S, B, D>,
    /// RAM copy of the flash record, rewritten to flash on every change.
    state: FobState,
    drbg: Option<HmacDrbg>,
    button_was_pressed: bool,
    _role: PhantomData<R>,
}

impl<R, U, H, E, FS, FE, S, B, D> Fob<R, U, H, E, FS, FE, S, B, D>
where
    R: SecretSource,
    U: Read<u8> + Write<u8>,
    H: Read<u8>,
    E: Eeprom,
    FS: FlashSector,
    FE: FlashSector,
    S: SysTick,
    B: InputPin,
    D: DelayMs<u32> + DelayUs<u32>,
{
    /// Boot-time initialization: repair the entropy pool if it reads as
    /// unprovisioned, pull the state record into RAM, and flush stale
    /// bytes off the inter-board link.
    pub fn bootstrap(
        mut board: FobBoard<U, H, E, FS, FE, S, B, D>,
        entropy_image: &[u8; entropy_pool::POOL_SIZE],
    ) -> Result<Self, BootError> {
        if entropy_pool::provision(&mut board.entropy, entropy_image)? {
            ringbuf_entry!(Trace::EntropyRestored);
        }
        let state = FobState::load(&board.state_flash)?;
        drv_uart_api::drain(&mut board.board_uart);
        Ok(Self {
            board,
            state,
            drbg: None,
            button_was_pressed: false,
            _role: PhantomData,
        })
    }

    pub fn run(mut self) -> ! {
        loop {
            self.try_host_cmd();
            self.try_button();
        }
    }

    /// A fob provisioned paired is paired for life; any other fob is
    /// paired once its flash record says so.
    fn paired(&self) -> bool {
        R::BUILT_PAIRED || self.state.is_paired()
    }

    /// Polls the host line and dispatches one command. Commands that
    /// fail their role guard are swallowed without a reply, just like
    /// unknown bytes.
    pub fn try_host_cmd(&mut self) {
        let Some(cmd) = drv_uart_api::poll_byte(&mut self.board.host_uart)
        else {
            return;
        };
        ringbuf_entry!(Trace::HostCmd(cmd));
        match cmd {
            ENABLE_CMD if self.paired() => self.enable_feature(),
            P_PAIR_CMD if self.paired() => self.pair_primary(),
            U_PAIR_CMD if !R::BUILT_PAIRED && !self.paired() => {
                self.pair_replica()
            }
            _ => {}
        }
    }

    /// Polls the unlock button. Fires on a press edge that survives the
    /// debounce delay; holding the button does not retrigger.
    pub fn try_button(&mut self) {
        let pressed = self.board.button.is_low().unwrap_or(false);
        if pressed && !self.button_was_pressed {
            self.board.delay.delay_us(DEBOUNCE_US);
            if self.board.button.is_low().unwrap_or(false) && self.paired() {
                self.unlock();
            }
        }
        self.button_was_pressed = pressed;
    }

    /// Installs a feature package delivered by the host. The fob cannot
    /// check the package -- it has no verification key -- so it stores
    /// whatever it is handed and lets the car judge it during unlock.
    fn enable_feature(&mut self) {
        let slot_byte = drv_uart_api::read_byte(&mut self.board.host_uart);
        let mut package = [0u8; PACKAGE_SIZE];
        drv_uart_api::read_exact(&mut self.board.host_uart, &mut package);

        // The package bytes are consumed either way; only a plausible
        // slot number keeps them.
        let slot = usize::from(slot_byte).wrapping_sub(1);
        if slot >= NUM_FEATURES {
            return;
        }
        self.state.feature[slot] = Package::from(package);
        if self.state.save(&mut self.board.state_flash).is_ok() {
            ringbuf_entry!(Trace::FeatureInstalled(slot_byte));
        } else {
            ringbuf_entry!(Trace::SaveFailed);
        }
    }

    /// Sending side of a pairing: check the host-supplied PIN against the
    /// stored one and, on a match, put the credentials on the inter-board
    /// line where the receiving fob is waiting.
    fn pair_primary(&mut self) {
        let mut offered = [0u8; 4];
        drv_uart_api::read_exact(&mut self.board.host_uart, &mut offered);
        let offered = u32::from_le_bytes(offered);

        let Ok(pin) = R::pin(&self.board.eeprom, &self.state) else {
            return;
        };
        if !pin.matches(offered) {
            self.board.delay.delay_ms(PIN_PENALTY_MS);
            ringbuf_entry!(Trace::PinRejected);
            return;
        }

        let Ok(privkey) = R::privkey(&self.board.eeprom, &self.state) else {
            return;
        };
        let mut packet = PairPacket {
            car_privkey: *privkey.as_bytes(),
            pin: pin.value(),
        };
        if board_link::send_pair_packet(&mut self.board.board_uart, &packet)
            .is_ok()
        {
            ringbuf_entry!(Trace::CredentialsSent);
        }
        packet.zeroize();
    }

    /// Receiving side of a pairing: block until the credentials arrive,
    /// then rewrite the whole state record around them. Receiving the
    /// same packet again just rewrites the record identically.
    fn pair_replica(&mut self) {
        let mut packet = PairPacket::new_zeroed();
        board_link::recv_pair_packet(&mut self.board.board_uart, &mut packet);
        self.state.adopt(&packet.car_privkey, packet.pin);
        packet.zeroize();
        if self.state.save(&mut self.board.state_flash).is_ok() {
            ringbuf_entry!(Trace::Paired);
        } else {
            ringbuf_entry!(Trace::SaveFailed);
        }
    }

    /// One unlock attempt: request, wait for the challenge, sign it,
    /// attach the feature slots, reply.
    fn unlock(&mut self) {
        ringbuf_entry!(Trace::UnlockAttempt);
        let mut challenge = Challenge::new_zeroed();
        let mut response = Response::new_zeroed();

        if board_link::request_unlock(&mut self.board.board_uart).is_err() {
            return;
        }
        board_link::recv_challenge(&mut self.board.board_uart, &mut challenge);
        if self.gen_response(&challenge, &mut response) {
            let _ =
                board_link::send_response(&mut self.board.board_uart, &response);
        }
        challenge.zeroize();
    }

    /// Signs the challenge digest with the car key and copies the feature
    /// slots in verbatim. Starts the DRBG on first use.
    fn gen_response(
        &mut self,
        challenge: &Challenge,
        response: &mut Response,
    ) -> bool {
        if self.drbg.is_none() && !self.init_drbg() {
            return false;
        }
        let Ok(privkey) = R::privkey(&self.board.eeprom, &self.state) else {
            return false;
        };
        let Some(signer) = keystore::signing_key(&privkey) else {
            return false;
        };
        let Some(drbg) = self.drbg.as_mut() else {
            return false;
        };

        let digest = Sha256::digest(&challenge.data);
        let signature: Signature =
            match signer.sign_prehash_with_rng(drbg, digest.as_slice()) {
                Ok(signature) => signature,
                Err(_) => return false,
            };
        response.unlock.copy_from_slice(signature.to_bytes().as_slice());
        response.feature = self.state.feature;
        true
    }

    /// Starts the DRBG. Seeded from the flash pool, with the stored car
    /// key as nonce and the SysTick sample as the per-boot
    /// personalization.
    fn init_drbg(&mut self) -> bool {
        let Ok(privkey) = R::privkey(&self.board.eeprom, &self.state) else {
            return false;
        };
        let tick = self.board.systick.now().to_le_bytes();
        match entropy_pool::bootstrap(
            &mut self.board.entropy,
            privkey.as_bytes(),
            &tick,
        ) {
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
}
