// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistent records and key material for the car and fob devices.
//!
//! Three records matter:
//!
//! - [`CarData`], the car's EEPROM record holding the two public keys it
//!   verifies against;
//! - the built-paired fob's EEPROM secret record (reached through
//!   [`EepromSecrets`]), holding the car signing key and pairing PIN
//!   burned in by provisioning;
//! - [`FobState`], the flash record every fob carries, holding the
//!   paired marker, runtime-delivered credentials, and feature slots.
//!
//! All multi-byte fields are little-endian, matching both the wire and
//! the provisioned images. Flash and EEPROM blanks read as all-`0xFF`,
//! and the record formats treat that pattern as "empty" throughout.

#![cfg_attr(not(test), no_std)]

use core::mem::size_of;

use drv_storage_api::{Eeprom, FlashSector, StorageError};
use p256::ecdsa::{SigningKey, VerifyingKey};
use p256::elliptic_curve::generic_array::GenericArray;
use p256::EncodedPoint;
use sha2::{Digest, Sha256};
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Raw `x || y` encoding of a P-256 public key.
pub const PUBKEY_SIZE: usize = 64;
/// Raw scalar encoding of a P-256 private key.
pub const PRIVKEY_SIZE: usize = 32;
/// Raw `r || s` encoding of a P-256 ECDSA signature.
pub const PACKAGE_SIZE: usize = 64;
/// Number of feature slots a fob can carry.
pub const NUM_FEATURES: usize = 3;

/// Marker word for a fob that holds working credentials.
pub const PAIRED: u32 = 0x2020_2020;
/// Marker word for a fob that does not (also the erased-flash pattern).
pub const UNPAIRED: u32 = 0xFFFF_FFFF;

pub mod layout {
    //! Fixed placement of the persistent records. The EEPROM offsets are
    //! shared with the provisioning tool that burns the initial images;
    //! the sector addresses are consumed by the board support layer when
    //! it constructs the storage drivers.

    /// EEPROM offset of [`CarData`](super::CarData) on the car.
    pub const CAR_DATA: usize = 0;

    /// EEPROM location of the 64-byte message released on unlock.
    pub const UNLOCK_MSG: usize = 0x7C0;
    pub const UNLOCK_MSG_SIZE: usize = 64;

    /// Feature messages sit below the unlock message, one 64-byte slot
    /// per feature, growing downward.
    pub const FEATURE_MSG_SIZE: usize = 64;
    pub const FEATURE_MSG_END: usize = UNLOCK_MSG;

    /// EEPROM location of the message for feature slot `slot` (0-based).
    pub const fn feature_msg(slot: usize) -> usize {
        FEATURE_MSG_END - (slot + 1) * FEATURE_MSG_SIZE
    }

    /// Offsets within the built-paired fob's EEPROM secret record, which
    /// mirrors the head of [`FobState`](super::FobState).
    pub const FOB_SECRET_PIN: usize = 4;
    pub const FOB_SECRET_KEY: usize = 8;

    /// Flash sector homes.
    pub const CAR_ENTROPY_SECTOR: u32 = 0x3FC00;
    pub const FOB_ENTROPY_SECTOR: u32 = 0x3F800;
    pub const FOB_STATE_SECTOR: u32 = 0x3FC00;
}

/// A feature authorization: an ECDSA-P256 signature by the manufacturer
/// host over the digest of the owning car's public key and the feature
/// index. The fob stores and forwards these without being able to check
/// them; only the car verifies. A slot that has never been written holds
/// the erased-flash pattern and is simply "not installed".
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Zeroize,
)]
#[repr(transparent)]
pub struct Package([u8; PACKAGE_SIZE]);

impl Package {
    pub const EMPTY: Package = Package([0xFF; PACKAGE_SIZE]);

    pub fn is_installed(&self) -> bool {
        *self != Self::EMPTY
    }

    pub fn signature_bytes(&self) -> &[u8; PACKAGE_SIZE] {
        &self.0
    }
}

impl Default for Package {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl From<[u8; PACKAGE_SIZE]> for Package {
    fn from(raw: [u8; PACKAGE_SIZE]) -> Self {
        Self(raw)
    }
}

/// The car's EEPROM record, written once by provisioning.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CarData {
    /// Verifies challenge responses; its private half lives in paired
    /// fobs, never here.
    pub car_pubkey: [u8; PUBKEY_SIZE],
    /// Verifies feature authorizations.
    pub host_pubkey: [u8; PUBKEY_SIZE],
}

const_assert_eq!(size_of::<CarData>(), 128);

impl CarData {
    pub fn read<E: Eeprom>(eeprom: &E) -> Result<Self, StorageError> {
        let mut data = Self::new_zeroed();
        eeprom.read(layout::CAR_DATA, data.as_mut_bytes())?;
        Ok(data)
    }
}

/// The flash record every fob carries. Updates rewrite the whole record
/// through the sector-replace primitive, so after a power cut the record
/// is either intact (old or new) or fully erased, and an erased record
/// reads as unpaired.
#[derive(Clone, FromBytes, IntoBytes, Immutable, KnownLayout, Zeroize)]
#[repr(C)]
pub struct FobState {
    paired: u32,
    pin: u32,
    car_privkey: [u8; PRIVKEY_SIZE],
    pub feature: [Package; NUM_FEATURES],
}

const_assert_eq!(size_of::<FobState>(), 232);
// The record must program cleanly with word granularity.
const_assert_eq!(size_of::<FobState>() % 4, 0);

impl FobState {
    pub fn load<F: FlashSector>(flash: &F) -> Result<Self, StorageError> {
        let mut state = Self::new_zeroed();
        flash.read(0, state.as_mut_bytes())?;
        Ok(state)
    }

    pub fn save<F: FlashSector>(
        &self,
        flash: &mut F,
    ) -> Result<(), StorageError> {
        flash.replace(self.as_bytes())
    }

    pub fn is_paired(&self) -> bool {
        self.paired == PAIRED
    }

    pub fn pin(&self) -> Pin {
        Pin(self.pin)
    }

    pub fn privkey(&self) -> PrivKey {
        PrivKey(self.car_privkey)
    }

    /// Takes on the credentials delivered during pairing. Every field the
    /// credentials touch is rewritten, so applying the same delivery
    /// twice yields byte-identical flash.
    pub fn adopt(&mut self, privkey: &[u8; PRIVKEY_SIZE], pin: u32) {
        self.car_privkey = *privkey;
        self.pin = pin;
        self.paired = PAIRED;
    }
}

/// An in-RAM copy of the car's signing key. Wiped wherever it ends up.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PrivKey([u8; PRIVKEY_SIZE]);

impl PrivKey {
    pub fn as_bytes(&self) -> &[u8; PRIVKEY_SIZE] {
        &self.0
    }
}

impl From<[u8; PRIVKEY_SIZE]> for PrivKey {
    fn from(raw: [u8; PRIVKEY_SIZE]) -> Self {
        Self(raw)
    }
}

/// The pairing PIN.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Pin(u32);

impl Pin {
    pub fn matches(&self, offered: u32) -> bool {
        self.0 == offered
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Where a fob's secrets live is a build-time property: a fob built
/// paired carries them in its provisioned EEPROM; a fob built unpaired
/// receives them over the pairing link into its flash record. Everything
/// downstream of this trait is identical between the two.
pub trait SecretSource {
    /// True for the build that was provisioned paired.
    const BUILT_PAIRED: bool;

    fn privkey<E: Eeprom>(
        eeprom: &E,
        state: &FobState,
    ) -> Result<PrivKey, StorageError>;

    fn pin<E: Eeprom>(eeprom: &E, state: &FobState)
        -> Result<Pin, StorageError>;
}

/// Secret access for the build provisioned paired.
pub struct EepromSecrets;

impl SecretSource for EepromSecrets {
    const BUILT_PAIRED: bool = true;

    fn privkey<E: Eeprom>(
        eeprom: &E,
        _state: &FobState,
    ) -> Result<PrivKey, StorageError> {
        let mut key = PrivKey([0; PRIVKEY_SIZE]);
        eeprom.read(layout::FOB_SECRET_KEY, &mut key.0)?;
        Ok(key)
    }

    fn pin<E: Eeprom>(
        eeprom: &E,
        _state: &FobState,
    ) -> Result<Pin, StorageError> {
        let mut word = [0u8; 4];
        eeprom.read(layout::FOB_SECRET_PIN, &mut word)?;
        Ok(Pin(u32::from_le_bytes(word)))
    }
}

/// Secret access for the build provisioned unpaired.
pub struct FlashSecrets;

impl SecretSource for FlashSecrets {
    const BUILT_PAIRED: bool = false;

    fn privkey<E: Eeprom>(
        _eeprom: &E,
        state: &FobState,
    ) -> Result<PrivKey, StorageError> {
        Ok(state.privkey())
    }

    fn pin<E: Eeprom>(
        _eeprom: &E,
        state: &FobState,
    ) -> Result<Pin, StorageError> {
        Ok(state.pin())
    }
}

/// Decodes a stored raw `x || y` public key.
pub fn verifying_key(raw: &[u8; PUBKEY_SIZE]) -> Option<VerifyingKey> {
    let point = EncodedPoint::from_untagged_bytes(GenericArray::from_slice(raw));
    VerifyingKey::from_encoded_point(&point).ok()
}

/// Builds a signer from a stored raw scalar.
pub fn signing_key(key: &PrivKey) -> Option<SigningKey> {
    SigningKey::from_bytes(GenericArray::from_slice(key.as_bytes())).ok()
}

/// The digest a feature authorization signs: the owning car's public key
/// followed by the one-based feature index. Binding the car key into the
/// digest keeps an authorization bought for one car from unlocking the
/// same feature on another.
pub fn feature_digest(car_pubkey: &[u8; PUBKEY_SIZE], index: u8) -> [u8; 32] {
    let mut sha = Sha256::new();
    sha.update(car_pubkey);
    sha.update([index]);
    sha.finalize().into()
}
