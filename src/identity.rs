// -*- mode: rust; -*-
//
// This file is part of pinproof.
// See LICENSE for licensing information.

//! Identities and their hash-to-point images.

use core::fmt;

use bls12_381::G1Projective;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::keys::DevicePublicKey;
use crate::pairing::PairingContext;

/// Domain separator for `H(identity)`.
pub const IDENTITY_DOMAIN: &[u8] = b"pinproof-identity-v1";

/// A registered identity.
///
/// Immutable once registered: the hash input covers the user id, the
/// project, and the device public key when the registration is device bound.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Opaque user identifier, usually an e-mail address.
    pub user_id: String,
    /// Project the identity was issued for.
    pub project_id: String,
    /// Device key this identity is bound to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_key: Option<DevicePublicKey>,
}

impl Identity {
    /// An identity without a device binding.
    pub fn new(user_id: impl Into<String>, project_id: impl Into<String>) -> Result<Identity> {
        let user_id = user_id.into();
        let project_id = project_id.into();
        if user_id.trim().is_empty() {
            return Err(Error::MalformedPayload("empty user id".into()));
        }
        if project_id.trim().is_empty() {
            return Err(Error::MalformedPayload("empty project id".into()));
        }
        Ok(Identity { user_id, project_id, device_key: None })
    }

    /// Bind this identity to a device public key.
    pub fn with_device_key(mut self, device_key: DevicePublicKey) -> Identity {
        self.device_key = Some(device_key);
        self
    }

    /// Canonical byte string hashed onto G1.
    ///
    /// Length prefixed `user_id ‖ project_id`, then the compressed device
    /// key when present.
    pub fn hash_input(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.user_id.len() + self.project_id.len() + 96);
        for part in [self.user_id.as_bytes(), self.project_id.as_bytes()] {
            out.extend_from_slice(&(part.len() as u32).to_be_bytes());
            out.extend_from_slice(part);
        }
        if let Some(key) = &self.device_key {
            out.extend_from_slice(&key.to_bytes());
        }
        out
    }

    /// `H(identity)`.
    pub fn hash_point(&self, ctx: &dyn PairingContext) -> Result<G1Projective> {
        ctx.hash_to_g1(IDENTITY_DOMAIN, &self.hash_input())
    }

    /// Key under which this identity's registration is stored and locked.
    pub fn key(&self) -> IdentityKey {
        IdentityKey(format!("{}/{}", self.project_id, self.user_id))
    }
}

/// Store and lock key of an identity: `project_id/user_id`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentityKey(pub(crate) String);

impl IdentityKey {
    /// The key as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::keys::DeviceKeypair;
    use crate::pairing::Bls12Context;

    #[test]
    fn device_binding_changes_the_hash_point() {
        let ctx = Bls12Context::new();
        let plain = Identity::new("alice@example.com", "proj").unwrap();
        let bound = plain.clone().with_device_key(DeviceKeypair::generate(rand::thread_rng()).public);
        assert_eq!(plain.key(), bound.key());
        assert_ne!(plain.hash_point(&ctx).unwrap(), bound.hash_point(&ctx).unwrap());
    }

    #[test]
    fn hash_input_is_unambiguous() {
        let a = Identity::new("ab", "c").unwrap();
        let b = Identity::new("a", "bc").unwrap();
        assert_ne!(a.hash_input(), b.hash_input());
    }

    #[test]
    fn empty_user_id_is_malformed() {
        assert!(matches!(Identity::new(" ", "proj"), Err(Error::MalformedPayload(_))));
    }
}
