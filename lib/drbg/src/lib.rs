// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deterministic random bit generator, HMAC-DRBG over HMAC-SHA-256
//! (NIST SP 800-90A, section 10.1.2).
//!
//! The generator is deliberately minimal: no derivation function, no
//! prediction-resistance requests, no additional input on generate. The
//! caller seeds it once per boot from the flash entropy pool and a
//! per-boot nonce/personalization, and reseeds only by rebooting, which
//! is well inside the SP 800-90A reseed interval.
//!
//! `HmacDrbg` implements [`rand_core::RngCore`] + [`CryptoRng`] so it can
//! be handed directly to randomized ECDSA signing.

#![cfg_attr(not(test), no_std)]

use core::num::NonZeroU32;

use hmac::{Hmac, Mac};
use rand_core::{impls, CryptoRng, RngCore};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

const OUTLEN: usize = 32;

/// Requests per seed permitted by SP 800-90A for an HMAC-DRBG.
const RESEED_INTERVAL: u64 = 1 << 48;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DrbgError {
    /// The generator has exceeded its reseed interval and must be
    /// re-instantiated before producing more output.
    ReseedRequired,
}

/// Working state: the HMAC key `K`, the chaining value `V`, and the
/// request counter. Both halves of the state are secret.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct HmacDrbg {
    key: [u8; OUTLEN],
    value: [u8; OUTLEN],
    reseed_counter: u64,
}

impl core::fmt::Debug for HmacDrbg {
    /// Deliberately omits `key` and `value`: this type holds secret
    /// state and must never echo it through a debug format.
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HmacDrbg")
            .field("reseed_counter", &self.reseed_counter)
            .finish_non_exhaustive()
    }
}

impl HmacDrbg {
    /// Instantiates from seed material. `entropy` must carry the full
    /// security strength; `nonce` and `personalization` separate
    /// instances that share entropy-pool history.
    pub fn new(entropy: &[u8], nonce: &[u8], personalization: &[u8]) -> Self {
        let mut drbg = Self {
            key: [0x00; OUTLEN],
            value: [0x01; OUTLEN],
            reseed_counter: 1,
        };
        drbg.update(&[entropy, nonce, personalization]);
        drbg
    }

    /// Fills `out` with generator output.
    pub fn generate(&mut self, out: &mut [u8]) -> Result<(), DrbgError> {
        if self.reseed_counter > RESEED_INTERVAL {
            return Err(DrbgError::ReseedRequired);
        }

        let mut filled = 0;
        while filled < out.len() {
            self.value = hmac_once(&self.key, &self.value);
            let take = usize::min(OUTLEN, out.len() - filled);
            out[filled..filled + take].copy_from_slice(&self.value[..take]);
            filled += take;
        }

        self.update(&[]);
        self.reseed_counter += 1;
        Ok(())
    }

    /// Mixes fresh seed material into the state and resets the request
    /// counter.
    pub fn reseed(&mut self, entropy: &[u8], additional: &[u8]) {
        self.update(&[entropy, additional]);
        self.reseed_counter = 1;
    }

    /// The HMAC_DRBG_Update function. An empty `provided` slice is the
    /// "no data" case, which performs only the first round.
    fn update(&mut self, provided: &[&[u8]]) {
        self.round(0x00, provided);
        if provided.is_empty() {
            return;
        }
        self.round(0x01, provided);
    }

    fn round(&mut self, label: u8, provided: &[&[u8]]) {
        let mut mac = HmacSha256::new_from_slice(&self.key).unwrap();
        mac.update(&self.value);
        mac.update(&[label]);
        for part in provided {
            mac.update(part);
        }
        self.key = mac.finalize().into_bytes().into();
        self.value = hmac_once(&self.key, &self.value);
    }
}

fn hmac_once(key: &[u8; OUTLEN], data: &[u8]) -> [u8; OUTLEN] {
    let mut mac = HmacSha256::new_from_slice(key).unwrap();
    mac.update(data);
    mac.finalize().into_bytes().into()
}

const EXHAUSTED: NonZeroU32 = match NonZeroU32::new(rand_core::Error::CUSTOM_START) {
    Some(code) => code,
    None => panic!(),
};

impl RngCore for HmacDrbg {
    fn next_u32(&mut self) -> u32 {
        impls::next_u32_via_fill(self)
    }

    fn next_u64(&mut self) -> u64 {
        impls::next_u64_via_fill(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.try_fill_bytes(dest).expect("drbg exhausted")
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.generate(dest)
            .map_err(|_| rand_core::Error::from(EXHAUSTED))
    }
}

impl CryptoRng for HmacDrbg {}
