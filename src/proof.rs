// -*- mode: rust; -*-
//
// This file is part of pinproof.
// See LICENSE for licensing information.

//! Zero-knowledge proof of the identity secret.
//!
//! A prover holding `Token` and `PIN` recombines `secret = Token + PINFactor`
//! and proves knowledge of it without revealing it:
//!
//! ```text
//! U = x · H(identity)              x random
//! V = −(x + y) · secret            y the verifier's challenge
//! ```
//!
//! The verifier accepts iff `e(V, G2) · e(U + y·H(identity), Q) = 1`, with
//! `Q = s·G2` the server public key (or `s·(k·G2)` for device-bound
//! identities).  A wrong PIN recombines a wrong secret, so the proof simply
//! fails that equation; nothing local tells the two apart.
//!
//! [`commit`] and [`PendingProof::respond`] split the proof across the two
//! passes of the verifier protocol.  [`authenticate`] builds a single-shot
//! proof whose `y` is taken from a transcript over the challenge and `U`.

use bls12_381::{G1Affine, G1Projective, G2Affine, G2Projective, Scalar};
use ff::Field;
use merlin::Transcript;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroize;

use crate::context::{auth_context, ProofTranscript};
use crate::errors::{Error, Result};
use crate::identity::Identity;
use crate::pairing::{g1_to_bytes, hex_codec, PairingContext};
use crate::scalars::wipe;
use crate::secret::{pin_factor_at, Pin, RecombinedSecret, Token};

/// A verifier challenge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    /// Session this challenge belongs to.
    pub session_id: String,
    /// Server-issued nonce.
    #[serde(with = "crate::api::hex_bytes")]
    pub nonce: Vec<u8>,
    /// Issue time, in seconds since the Unix epoch.
    pub issued_at: u64,
    /// Time to live, in seconds, when the verifier states one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

impl Challenge {
    /// A challenge issued at `issued_at` that lives for `ttl` seconds.
    pub fn new(session_id: impl Into<String>, nonce: impl Into<Vec<u8>>, issued_at: u64, ttl: u64) -> Challenge {
        Challenge { session_id: session_id.into(), nonce: nonce.into(), issued_at, ttl: Some(ttl) }
    }

    /// Assume `ttl` when the verifier did not state one.
    pub fn or_ttl(mut self, ttl: u64) -> Challenge {
        self.ttl.get_or_insert(ttl);
        self
    }

    /// Time after which the challenge is no longer answered.
    ///
    /// A challenge without a TTL expires at its issue time.
    pub fn expires_at(&self) -> u64 {
        self.issued_at.saturating_add(self.ttl.unwrap_or(0))
    }

    /// Whether the challenge has expired at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at()
    }

    pub(crate) fn ensure_fresh(&self, now: u64) -> Result<()> {
        if self.is_expired(now) {
            return Err(Error::ExpiredChallenge { session_id: self.session_id.clone() });
        }
        if self.session_id.trim().is_empty() {
            return Err(Error::MalformedPayload("empty session id".into()));
        }
        Ok(())
    }
}

/// A finished proof `(U, V)` bound to one challenge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proof {
    /// Commitment `U`.
    pub u: G1Projective,
    /// Response `V`.
    pub v: G1Projective,
    /// Session the proof answers.
    pub session_id: String,
    /// Time the proof was built, in seconds since the Unix epoch.
    pub timestamp: u64,
}

impl Proof {
    /// Hex of `U` as carried on the wire.
    pub fn u_hex(&self) -> String {
        hex_codec::g1(&self.u)
    }

    /// Hex of `V` as carried on the wire.
    pub fn v_hex(&self) -> String {
        hex_codec::g1(&self.v)
    }
}

/// First pass of a proof: the commitment `U` and what is needed to answer
/// a challenge `y` for it.
///
/// Consumed by [`PendingProof::respond`], so one commitment answers exactly
/// one challenge.
pub struct PendingProof {
    secret: RecombinedSecret,
    x: Scalar,
    u: G1Projective,
    session_id: String,
    timestamp: u64,
    transcript: Transcript,
}

impl core::fmt::Debug for PendingProof {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PendingProof")
            .field("u", &self.u_hex())
            .field("session_id", &self.session_id)
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

impl Drop for PendingProof {
    fn drop(&mut self) {
        wipe(&mut self.x);
    }
}

impl PendingProof {
    /// Commitment `U`.
    pub fn u(&self) -> &G1Projective {
        &self.u
    }

    /// Hex of `U` as carried on the wire.
    pub fn u_hex(&self) -> String {
        hex_codec::g1(&self.u)
    }

    /// Session the commitment was made for.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Answer the challenge `y`: `V = −(x + y) · secret`.
    pub fn respond(self, y: &Scalar) -> Result<Proof> {
        let mut xy = self.x + y;
        if bool::from(xy.is_zero()) {
            return Err(Error::CryptoPrimitiveFailure("degenerate challenge"));
        }
        let v = -(self.secret.0 * xy);
        wipe(&mut xy);
        Ok(Proof { u: self.u, v, session_id: self.session_id.clone(), timestamp: self.timestamp })
    }
}

/// Commit to a proof for `challenge`.
///
/// Fails with `ExpiredChallenge` before any group arithmetic when the
/// challenge has expired at `now`.
pub fn commit(
    ctx: &dyn PairingContext,
    token: &Token,
    pin: &Pin,
    identity: &Identity,
    challenge: &Challenge,
    now: u64,
) -> Result<PendingProof> {
    challenge.ensure_fresh(now)?;

    let hid = identity.hash_point(ctx)?;
    let factor = pin_factor_at(ctx, identity, &hid, pin)?;
    let secret = token.recombine(&factor);

    let transcript = auth_context(&identity.hash_input(), &challenge.session_id, &challenge.nonce, now);
    let mut secret_bytes = g1_to_bytes(&secret.0);
    let x = transcript.witness_scalar(b"x", &secret_bytes);
    secret_bytes.zeroize();
    if bool::from(x.is_zero()) {
        return Err(Error::CryptoPrimitiveFailure("zero witness"));
    }
    let u = ctx.mul_g1(&hid, &x);

    debug!(user_id = %identity.user_id, session_id = %challenge.session_id, "proof commitment built");
    Ok(PendingProof { secret, x, u, session_id: challenge.session_id.clone(), timestamp: now, transcript })
}

/// Build a single-shot proof for `challenge`.
///
/// `y` is the transcript challenge over the identity, the session id, the
/// nonce, `now`, and `U`.
pub fn authenticate(
    ctx: &dyn PairingContext,
    token: &Token,
    pin: &Pin,
    identity: &Identity,
    challenge: &Challenge,
    now: u64,
) -> Result<Proof> {
    let mut pending = commit(ctx, token, pin, identity, challenge, now)?;
    let y = single_shot_challenge(&mut pending.transcript, &pending.u);
    pending.respond(&y)
}

fn single_shot_challenge(transcript: &mut Transcript, u: &G1Projective) -> Scalar {
    transcript.commit_point(b"U", u);
    transcript.challenge_scalar(b"y")
}

/// The challenge `y` a verifier derives for a single-shot proof.
pub fn derive_challenge(identity: &Identity, challenge: &Challenge, proof: &Proof) -> Scalar {
    let mut t = auth_context(&identity.hash_input(), &challenge.session_id, &challenge.nonce, proof.timestamp);
    single_shot_challenge(&mut t, &proof.u)
}

/// Check `e(V, G2) · e(U + y·H(identity), Q) = 1`.
///
/// `public_key` is `Q`: the server public key, already scaled by the device
/// public key for device-bound identities.
pub fn verify(
    ctx: &dyn PairingContext,
    identity: &Identity,
    u: &G1Projective,
    v: &G1Projective,
    y: &Scalar,
    public_key: &G2Projective,
) -> Result<bool> {
    let hid = identity.hash_point(ctx)?;
    let lhs = u + ctx.mul_g1(&hid, y);
    Ok(ctx.pairing_product_is_identity(&[
        (G1Affine::from(v), G2Affine::from(ctx.g2_generator())),
        (G1Affine::from(lhs), G2Affine::from(public_key)),
    ]))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pairing::Bls12Context;
    use crate::secret::{combine_shares, SecretShare};

    struct Fixture {
        ctx: Bls12Context,
        identity: Identity,
        token: Token,
        q: G2Projective,
    }

    fn fixture(pin: &str) -> Fixture {
        let ctx = Bls12Context::new();
        let identity = Identity::new("alice@example.com", "proj").unwrap();
        let s = Scalar::random(rand::thread_rng());
        let share_point = ctx.mul_g1(&identity.hash_point(&ctx).unwrap(), &s);
        let share = SecretShare::from_hex(&hex_codec::g1(&share_point), "issuer").unwrap();
        let cs = combine_shares(&[share]).unwrap();
        let token = Token::from_client_secret(&ctx, &identity, &cs, &Pin::new(pin).unwrap(), None).unwrap();
        let q = ctx.mul_g2(&ctx.g2_generator(), &s);
        Fixture { ctx, identity, token, q }
    }

    fn challenge(session: &str) -> Challenge {
        Challenge::new(session, vec![0xab, 0xcd], 1_000, 120)
    }

    #[test]
    fn single_shot_proof_verifies_with_the_right_pin() {
        let f = fixture("1234");
        let c = challenge("S1");
        let proof = authenticate(&f.ctx, &f.token, &Pin::new("1234").unwrap(), &f.identity, &c, 1_010).unwrap();
        let y = derive_challenge(&f.identity, &c, &proof);
        assert!(verify(&f.ctx, &f.identity, &proof.u, &proof.v, &y, &f.q).unwrap());
        assert_eq!(proof.session_id, "S1");
        assert_eq!(proof.timestamp, 1_010);
    }

    #[test]
    fn wrong_pin_fails_only_at_verification() {
        let f = fixture("1234");
        let c = challenge("S2");
        let proof = authenticate(&f.ctx, &f.token, &Pin::new("4321").unwrap(), &f.identity, &c, 1_010).unwrap();
        let y = derive_challenge(&f.identity, &c, &proof);
        assert!(!verify(&f.ctx, &f.identity, &proof.u, &proof.v, &y, &f.q).unwrap());
    }

    #[test]
    fn two_pass_proof_answers_the_verifier_challenge() {
        let f = fixture("1234");
        let pending = commit(&f.ctx, &f.token, &Pin::new("1234").unwrap(), &f.identity, &challenge("S1"), 1_001).unwrap();
        let u = *pending.u();
        let y = Scalar::random(rand::thread_rng());
        let proof = pending.respond(&y).unwrap();
        assert_eq!(proof.u, u);
        assert!(verify(&f.ctx, &f.identity, &proof.u, &proof.v, &y, &f.q).unwrap());
        let other = y + Scalar::one();
        assert!(!verify(&f.ctx, &f.identity, &proof.u, &proof.v, &other, &f.q).unwrap());
    }

    #[test]
    fn each_proof_uses_a_fresh_commitment() {
        let f = fixture("1234");
        let pin = Pin::new("1234").unwrap();
        let c = challenge("S1");
        let a = authenticate(&f.ctx, &f.token, &pin, &f.identity, &c, 1_001).unwrap();
        let b = authenticate(&f.ctx, &f.token, &pin, &f.identity, &c, 1_001).unwrap();
        assert_ne!(a.u, b.u);
        assert_ne!(a.v, b.v);
    }

    #[test]
    fn expired_challenge_is_rejected() {
        let f = fixture("1234");
        let c = challenge("S1");
        assert!(!c.is_expired(1_119));
        assert!(c.is_expired(1_120));
        let err = authenticate(&f.ctx, &f.token, &Pin::new("1234").unwrap(), &f.identity, &c, 1_120).unwrap_err();
        assert_eq!(err, Error::ExpiredChallenge { session_id: "S1".into() });
    }

    #[test]
    fn unstated_ttl_takes_the_assumed_one() {
        let c: Challenge = serde_json::from_str(r#"{"sessionId":"S1","nonce":"abcd","issuedAt":1000}"#).unwrap();
        assert_eq!(c.ttl, None);
        assert!(c.is_expired(1_000));
        let c = c.or_ttl(60);
        assert_eq!(c.expires_at(), 1_060);
        assert_eq!(challenge("S1").or_ttl(60).expires_at(), 1_120);
    }

    #[test]
    fn challenge_json_uses_hex_nonce() {
        let c = challenge("S1");
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["nonce"], "abcd");
        assert_eq!(json["issuedAt"], 1_000);
        let back: Challenge = serde_json::from_value(json).unwrap();
        assert_eq!(back, c);
    }
}
