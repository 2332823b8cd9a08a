// -*- mode: rust; -*-
//
// This file is part of pinproof.
// See LICENSE for licensing information.

//! ### Signature creation and verification on message digests.
//!
//! Signing reuses the proof algebra, with the challenge `y` taken from a
//! signing transcript over the identity, the message digest, the signing
//! time, the session id and the commitment `U`.  Changing any bit of the
//! digest changes `y`, and with it the verification equation.

use core::fmt::Debug;

use bls12_381::{G1Projective, G2Projective, Scalar};
use ff::Field;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroize;

use crate::context::{signing_context, ProofTranscript};
use crate::errors::{Error, Result};
use crate::identity::Identity;
use crate::pairing::{g1_from_bytes, g1_to_bytes, hex_codec, PairingContext, G1_LENGTH};
use crate::proof;
use crate::scalars::wipe;
use crate::secret::{pin_factor_at, Pin, Token};

// === Signing session === //

/// A signing request fetched from the verifier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningSessionDetails {
    /// Signing session identifier.
    pub session_id: String,
    /// User expected to sign.
    pub user_id: String,
    /// Project the session belongs to.
    pub project_id: String,
    /// Digest of the message to sign.
    #[serde(with = "crate::api::hex_bytes")]
    pub digest: Vec<u8>,
    /// Human readable description shown before PIN entry.
    #[serde(default)]
    pub description: String,
    /// Time the session was created, in seconds since the Unix epoch.
    pub timestamp: u64,
    /// Time after which the session can no longer be signed.
    pub expires_at: u64,
}

impl SigningSessionDetails {
    /// Whether the session has expired at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    fn validate(&self, identity: &Identity, now: u64) -> Result<()> {
        if self.is_expired(now) {
            return Err(Error::ExpiredChallenge { session_id: self.session_id.clone() });
        }
        if self.session_id.trim().is_empty() {
            return Err(Error::MalformedPayload("empty session id".into()));
        }
        if self.digest.is_empty() {
            return Err(Error::MalformedPayload("empty message digest".into()));
        }
        if self.project_id != identity.project_id {
            return Err(Error::ProjectMismatch);
        }
        if self.user_id != identity.user_id {
            return Err(Error::MalformedPayload("signing session is for another user".into()));
        }
        Ok(())
    }
}

// === Actual signature type === //

/// The length of an encoded `Signature` pair `U ‖ V`, in bytes.
pub const SIGNATURE_LENGTH: usize = 2 * G1_LENGTH;

/// A signature over a message digest.
#[allow(non_snake_case)]
#[derive(Clone, Eq, PartialEq)]
pub struct Signature {
    /// Commitment `U = x·H(identity)`.
    pub U: G1Projective,
    /// Response `V = −(x + y)·secret`.
    pub V: G1Projective,
    /// The signed digest.
    pub digest: Vec<u8>,
    /// Signing session the signature answers.
    pub session_id: String,
    /// Signing time, in seconds since the Unix epoch.
    pub timestamp: u64,
}

impl Debug for Signature {
    fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
        write!(
            f,
            "Signature( U: {}, V: {}, session_id: {}, timestamp: {} )",
            hex_codec::g1(&self.U),
            hex_codec::g1(&self.V),
            self.session_id,
            self.timestamp
        )
    }
}

impl Signature {
    /// Convert the `(U, V)` pair to a byte array.
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LENGTH] {
        let mut bytes = [0u8; SIGNATURE_LENGTH];
        bytes[..G1_LENGTH].copy_from_slice(&g1_to_bytes(&self.U));
        bytes[G1_LENGTH..].copy_from_slice(&g1_to_bytes(&self.V));
        bytes
    }

    /// Rebuild a signature from its `(U, V)` bytes and the signed context.
    pub fn from_bytes(bytes: &[u8], digest: Vec<u8>, session_id: String, timestamp: u64) -> Result<Signature> {
        if bytes.len() != SIGNATURE_LENGTH {
            return Err(Error::BytesLength { name: "Signature", length: SIGNATURE_LENGTH });
        }
        Ok(Signature {
            U: g1_from_bytes(&bytes[..G1_LENGTH])?,
            V: g1_from_bytes(&bytes[G1_LENGTH..])?,
            digest,
            session_id,
            timestamp,
        })
    }

    /// The challenge `y` bound to this signature.
    pub fn challenge(&self, identity: &Identity) -> Scalar {
        signing_challenge(identity, &self.digest, self.timestamp, &self.session_id, &self.U)
    }

    /// Verify against `public_key`, the server public key scaled by the
    /// device key for device-bound identities.
    pub fn verify(&self, ctx: &dyn PairingContext, identity: &Identity, public_key: &G2Projective) -> Result<bool> {
        let y = self.challenge(identity);
        proof::verify(ctx, identity, &self.U, &self.V, &y, public_key)
    }
}

fn signing_challenge(identity: &Identity, digest: &[u8], timestamp: u64, session_id: &str, u: &G1Projective) -> Scalar {
    let mut t = signing_context(&identity.hash_input(), digest, timestamp, session_id);
    t.commit_point(b"U", u);
    t.challenge_scalar(b"y")
}

// === Signing === //

/// Sign the digest of `details` at time `now`.
///
/// Expired sessions fail with `ExpiredChallenge` before any group
/// arithmetic.  Every call draws a fresh `x`, so signing twice yields two
/// different, equally valid signatures.
pub fn sign(
    ctx: &dyn PairingContext,
    token: &Token,
    pin: &Pin,
    identity: &Identity,
    details: &SigningSessionDetails,
    now: u64,
) -> Result<Signature> {
    details.validate(identity, now)?;

    let hid = identity.hash_point(ctx)?;
    let factor = pin_factor_at(ctx, identity, &hid, pin)?;
    let secret = token.recombine(&factor);

    let t = signing_context(&identity.hash_input(), &details.digest, now, &details.session_id);
    let mut secret_bytes = g1_to_bytes(&secret.0);
    let mut x = t.witness_scalar(b"x", &secret_bytes);
    secret_bytes.zeroize();
    let u = ctx.mul_g1(&hid, &x);
    let y = signing_challenge(identity, &details.digest, now, &details.session_id, &u);

    let mut xy = x + y;
    wipe(&mut x);
    if bool::from(xy.is_zero()) {
        return Err(Error::CryptoPrimitiveFailure("degenerate signing challenge"));
    }
    let v = -(ctx.mul_g1(&secret.0, &xy));
    wipe(&mut xy);

    debug!(user_id = %identity.user_id, session_id = %details.session_id, "digest signed");
    Ok(Signature { U: u, V: v, digest: details.digest.clone(), session_id: details.session_id.clone(), timestamp: now })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pairing::Bls12Context;
    use crate::secret::{combine_shares, SecretShare};

    fn setup() -> (Bls12Context, Identity, Token, G2Projective) {
        let ctx = Bls12Context::new();
        let identity = Identity::new("alice@example.com", "proj").unwrap();
        let s = Scalar::random(rand::thread_rng());
        let share_point = ctx.mul_g1(&identity.hash_point(&ctx).unwrap(), &s);
        let share = SecretShare::from_hex(&hex_codec::g1(&share_point), "issuer").unwrap();
        let cs = combine_shares(&[share]).unwrap();
        let token = Token::from_client_secret(&ctx, &identity, &cs, &Pin::new("1234").unwrap(), None).unwrap();
        (ctx, identity, token, ctx.mul_g2(&ctx.g2_generator(), &s))
    }

    fn details() -> SigningSessionDetails {
        SigningSessionDetails {
            session_id: "SIG1".into(),
            user_id: "alice@example.com".into(),
            project_id: "proj".into(),
            digest: vec![0x5a; 32],
            description: "Contract".into(),
            timestamp: 1_000,
            expires_at: 1_300,
        }
    }

    #[test]
    fn sign_verify() {
        let (ctx, identity, token, q) = setup();
        let pin = Pin::new("1234").unwrap();
        let a = sign(&ctx, &token, &pin, &identity, &details(), 1_010).unwrap();
        let b = sign(&ctx, &token, &pin, &identity, &details(), 1_010).unwrap();
        assert_ne!(a.to_bytes(), b.to_bytes());
        assert!(a.verify(&ctx, &identity, &q).unwrap());
        assert!(b.verify(&ctx, &identity, &q).unwrap());
    }

    #[test]
    fn flipped_digest_bit_fails() {
        let (ctx, identity, token, q) = setup();
        let mut sig = sign(&ctx, &token, &Pin::new("1234").unwrap(), &identity, &details(), 1_010).unwrap();
        sig.digest[7] ^= 0x01;
        assert!(!sig.verify(&ctx, &identity, &q).unwrap());
    }

    #[test]
    fn wrong_pin_fails_verification() {
        let (ctx, identity, token, q) = setup();
        let sig = sign(&ctx, &token, &Pin::new("9999").unwrap(), &identity, &details(), 1_010).unwrap();
        assert!(!sig.verify(&ctx, &identity, &q).unwrap());
    }

    #[test]
    fn bytes_restore_the_signature() {
        let (ctx, identity, token, q) = setup();
        let sig = sign(&ctx, &token, &Pin::new("1234").unwrap(), &identity, &details(), 1_010).unwrap();
        let back = Signature::from_bytes(&sig.to_bytes(), sig.digest.clone(), sig.session_id.clone(), sig.timestamp).unwrap();
        assert_eq!(back, sig);
        assert!(back.verify(&ctx, &identity, &q).unwrap());
    }

    #[test]
    fn invalid_sessions_fail_fast() {
        let (ctx, identity, token, _) = setup();
        let pin = Pin::new("1234").unwrap();
        assert_eq!(
            sign(&ctx, &token, &pin, &identity, &details(), 1_300).unwrap_err(),
            Error::ExpiredChallenge { session_id: "SIG1".into() }
        );
        let mut empty = details();
        empty.digest.clear();
        assert!(matches!(sign(&ctx, &token, &pin, &identity, &empty, 1_010), Err(Error::MalformedPayload(_))));
        let mut other = details();
        other.project_id = "elsewhere".into();
        assert_eq!(sign(&ctx, &token, &pin, &identity, &other, 1_010).unwrap_err(), Error::ProjectMismatch);
    }
}
