// -*- mode: rust; -*-
//
// This file is part of pinproof.
// See LICENSE for licensing information.

//! Device keys which bind a registration to one device.
//!
//! A device key `k` multiplies the client secret before the PIN factor is
//! stripped, so the issuer's share is useless without the device that
//! registered it.  The verifier checks against `s·(k·G2)` in place of the
//! plain server public key `s·G2`.

use core::fmt::Debug;

use bls12_381::{G2Projective, Scalar};
use ff::Field;
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use subtle::{Choice, ConstantTimeEq};

use crate::errors::{Error, Result};
use crate::pairing::{g2_from_bytes, g2_to_bytes, scalar_from_bytes, scalar_to_bytes, G2_LENGTH, SCALAR_LENGTH};
use crate::scalars::wipe;

/// The length of a `DeviceSecretKey`, in bytes.
pub const DEVICE_SECRET_KEY_LENGTH: usize = SCALAR_LENGTH;

/// The length of a `DevicePublicKey`, in bytes.
pub const DEVICE_PUBLIC_KEY_LENGTH: usize = G2_LENGTH;

/// Secret half of a device key, the scalar `k`.
#[derive(Clone)]
pub struct DeviceSecretKey(pub(crate) Scalar);

impl Debug for DeviceSecretKey {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        write!(f, "DeviceSecretKey(..)")
    }
}

/// Overwrite secret key material with zero when it goes out of scope.
impl Drop for DeviceSecretKey {
    fn drop(&mut self) {
        wipe(&mut self.0);
    }
}

impl Eq for DeviceSecretKey {}
impl PartialEq for DeviceSecretKey {
    fn eq(&self, other: &Self) -> bool {
        self.ct_eq(other).unwrap_u8() == 1u8
    }
}
impl ConstantTimeEq for DeviceSecretKey {
    fn ct_eq(&self, other: &Self) -> Choice {
        self.0.ct_eq(&other.0)
    }
}

impl DeviceSecretKey {
    /// Generate a non-zero device secret.
    pub fn generate<R>(mut csprng: R) -> DeviceSecretKey
    where
        R: CryptoRng + RngCore,
    {
        loop {
            let k = Scalar::random(&mut csprng);
            if !bool::from(k.is_zero()) {
                return DeviceSecretKey(k);
            }
        }
    }

    /// Convert this secret key to a byte array.
    pub fn to_bytes(&self) -> [u8; DEVICE_SECRET_KEY_LENGTH] {
        scalar_to_bytes(&self.0)
    }

    /// Construct a secret key from a slice of bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<DeviceSecretKey> {
        let k = scalar_from_bytes(bytes)?;
        if bool::from(k.is_zero()) {
            return Err(Error::ScalarFormat);
        }
        Ok(DeviceSecretKey(k))
    }

    /// Derive the public half `k·G2`.
    pub fn to_public(&self) -> DevicePublicKey {
        DevicePublicKey(G2Projective::generator() * self.0)
    }
}

/// Public half of a device key, the G2 point `k·G2`.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct DevicePublicKey(pub(crate) G2Projective);

impl Debug for DevicePublicKey {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        write!(f, "DevicePublicKey({})", hex::encode(self.to_bytes()))
    }
}

impl DevicePublicKey {
    /// Access the underlying G2 point.
    pub fn as_point(&self) -> &G2Projective {
        &self.0
    }

    /// Compressed encoding.
    pub fn to_bytes(&self) -> [u8; DEVICE_PUBLIC_KEY_LENGTH] {
        g2_to_bytes(&self.0)
    }

    /// Decode a compressed, subgroup-checked device public key.
    pub fn from_bytes(bytes: &[u8]) -> Result<DevicePublicKey> {
        g2_from_bytes(bytes).map(DevicePublicKey)
    }

    /// Hex of the compressed encoding, as carried on the wire.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Decode from hex.
    pub fn from_hex(s: &str) -> Result<DevicePublicKey> {
        DevicePublicKey::from_bytes(&hex::decode(s.trim())?)
    }
}

impl Serialize for DevicePublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'d> Deserialize<'d> for DevicePublicKey {
    fn deserialize<D: Deserializer<'d>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        DevicePublicKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A device keypair.
#[derive(Clone, Debug)]
pub struct DeviceKeypair {
    /// The secret half of this keypair.
    pub secret: DeviceSecretKey,
    /// The public half of this keypair.
    pub public: DevicePublicKey,
}

impl DeviceKeypair {
    /// Generate a device keypair.
    pub fn generate<R>(csprng: R) -> DeviceKeypair
    where
        R: CryptoRng + RngCore,
    {
        let secret = DeviceSecretKey::generate(csprng);
        let public = secret.to_public();
        DeviceKeypair { secret, public }
    }

    /// Rebuild a keypair from its persisted secret half.
    pub fn from_secret(secret: DeviceSecretKey) -> DeviceKeypair {
        let public = secret.to_public();
        DeviceKeypair { secret, public }
    }
}
