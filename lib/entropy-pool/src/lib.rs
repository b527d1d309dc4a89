// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The flash-resident entropy pool.
//!
//! These boards have no hardware RNG and no clock, so randomness is a
//! persistent resource: a 1 KiB flash sector seeded by provisioning and
//! rolled forward on every DRBG start. The rule that makes this sound is
//! commit-before-first-use: [`bootstrap`] writes the successor pool to
//! flash before the caller can draw a single byte, so a reset at any
//! point during an attempt cannot make the next boot reuse seed material.
//!
//! A pool whose leading words repeat (the erased pattern, or an
//! all-zero image from a botched provisioning run) is treated as absent,
//! and every cryptographic operation stays refused until the pool is
//! rewritten.

#![cfg_attr(not(test), no_std)]

use drbg::{DrbgError, HmacDrbg};
use drv_storage_api::{FlashSector, StorageError};
use zeroize::Zeroizing;

/// Size of the pool, one full sector.
pub const POOL_SIZE: usize = 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntropyError {
    /// The pool carries the never-provisioned pattern.
    Unprovisioned,
    /// The underlying sector failed.
    Storage(StorageError),
    /// The generator refused the request.
    Drbg(DrbgError),
}

impl From<StorageError> for EntropyError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

impl From<DrbgError> for EntropyError {
    fn from(err: DrbgError) -> Self {
        Self::Drbg(err)
    }
}

/// True when the pool reads as never-provisioned: words 0/1 equal, words
/// 2/3 equal, and words 0/4 equal. Erased flash trips all three; so does
/// a zero-filled image.
pub fn looks_bad(pool: &[u8]) -> bool {
    pool[0..4] == pool[4..8]
        && pool[8..12] == pool[12..16]
        && pool[0..4] == pool[16..20]
}

/// Boot-time repair: if the pool looks bad, writes the provisioned
/// `image` into the sector. Returns whether a write happened.
pub fn provision<F: FlashSector>(
    flash: &mut F,
    image: &[u8; POOL_SIZE],
) -> Result<bool, StorageError> {
    let mut pool = Zeroizing::new([0u8; POOL_SIZE]);
    flash.read(0, pool.as_mut())?;
    if !looks_bad(pool.as_ref()) {
        return Ok(false);
    }
    flash.replace(image)?;
    Ok(true)
}

/// Starts the per-boot DRBG.
///
/// The pool seeds the generator together with a role-specific `nonce`
/// (a stored key, so two devices sharing a pool image diverge) and a
/// per-boot `personalization` (the SysTick sample, so two boots of one
/// device diverge). The successor pool is generated and committed before
/// the instance is returned.
pub fn bootstrap<F: FlashSector>(
    flash: &mut F,
    nonce: &[u8],
    personalization: &[u8],
) -> Result<HmacDrbg, EntropyError> {
    let mut pool = Zeroizing::new([0u8; POOL_SIZE]);
    flash.read(0, pool.as_mut())?;
    if looks_bad(pool.as_ref()) {
        return Err(EntropyError::Unprovisioned);
    }

    let mut drbg = HmacDrbg::new(pool.as_ref(), nonce, personalization);

    // Roll the pool forward and commit it. Only after the new pool is in
    // flash may any output leave this function.
    let mut next = Zeroizing::new(*pool);
    drbg.generate(next.as_mut())?;
    flash.replace(next.as_ref())?;

    Ok(drbg)
}
