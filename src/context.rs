// -*- mode: rust; -*-
//
// This file is part of pinproof.
// See LICENSE for licensing information.

//! Proof transcripts and contexts.
//!
//! Challenge scalars `y` and witness scalars `x` are both drawn from
//! `merlin` transcripts.  Authentication and signing use separate contexts,
//! so a proof transcript can never be replayed as a signature transcript.

use core::borrow::{Borrow, BorrowMut};

use bls12_381::{G1Projective, Scalar};
use merlin::Transcript;
use rand_core::OsRng;

use crate::pairing::g1_to_bytes;

/// Label of the authentication context.
pub const AUTH_CONTEXT: &[u8] = b"pinproof-authenticate-v1";

/// Label of the signing context.
pub const SIGNING_CONTEXT: &[u8] = b"pinproof-sign-v1";

/// Proof transcript
///
/// Interface for the commitment-and-challenge constructions of this crate,
/// compatible with `merlin::Transcript` whether owned or borrowed.
pub trait ProofTranscript {
    /// Extend transcript with some bytes, shadowed by `merlin::Transcript`.
    fn commit_bytes(&mut self, label: &'static [u8], bytes: &[u8]);

    /// Extend the transcript with a compressed G1 point.
    fn commit_point(&mut self, label: &'static [u8], point: &G1Projective) {
        self.commit_bytes(label, &g1_to_bytes(point));
    }

    /// Extend the transcript with a little-endian `u64`.
    fn commit_u64(&mut self, label: &'static [u8], value: u64) {
        self.commit_bytes(label, &value.to_le_bytes());
    }

    /// Produce some challenge bytes, shadowed by `merlin::Transcript`.
    fn challenge_bytes(&mut self, label: &'static [u8], dest: &mut [u8]);

    /// Produce the public challenge scalar `y`.
    fn challenge_scalar(&mut self, label: &'static [u8]) -> Scalar {
        let mut buf = [0; 64];
        self.challenge_bytes(label, &mut buf);
        Scalar::from_bytes_wide(&buf)
    }

    /// Produce a secret witness scalar `x` from the transcript, the given
    /// witness bytes, and fresh operating system randomness.
    fn witness_scalar(&self, label: &'static [u8], witness: &[u8]) -> Scalar;
}

impl<T> ProofTranscript for T
where
    T: Borrow<Transcript> + BorrowMut<Transcript>,
{
    fn commit_bytes(&mut self, label: &'static [u8], bytes: &[u8]) {
        Transcript::append_message(self.borrow_mut(), label, bytes);
    }

    fn challenge_bytes(&mut self, label: &'static [u8], dest: &mut [u8]) {
        Transcript::challenge_bytes(self.borrow_mut(), label, dest);
    }

    fn witness_scalar(&self, label: &'static [u8], witness: &[u8]) -> Scalar {
        let mut rng = self
            .borrow()
            .build_rng()
            .rekey_with_witness_bytes(label, witness)
            .finalize(&mut OsRng);
        <Scalar as ff::Field>::random(&mut rng)
    }
}

/// Initialize an authentication transcript for one challenge.
///
/// Binds the identity, the session, the verifier nonce and the proof
/// timestamp.  The caller commits `U` before taking the challenge.
pub fn auth_context(identity: &[u8], session_id: &str, nonce: &[u8], timestamp: u64) -> Transcript {
    let mut t = Transcript::new(AUTH_CONTEXT);
    t.commit_bytes(b"identity", identity);
    t.commit_bytes(b"session-id", session_id.as_bytes());
    t.commit_bytes(b"nonce", nonce);
    t.commit_u64(b"timestamp", timestamp);
    t
}

/// Initialize a signing transcript on a message digest.
pub fn signing_context(identity: &[u8], digest: &[u8], timestamp: u64, session_id: &str) -> Transcript {
    let mut t = Transcript::new(SIGNING_CONTEXT);
    t.commit_bytes(b"identity", identity);
    t.commit_bytes(b"digest", digest);
    t.commit_u64(b"timestamp", timestamp);
    t.commit_bytes(b"session-id", session_id.as_bytes());
    t
}

#[cfg(test)]
mod test {
    use super::*;
    use group::Group;

    #[test]
    fn challenges_bind_every_input() {
        let u = G1Projective::generator();
        let y = |t: &mut Transcript| {
            t.commit_point(b"U", &u);
            t.challenge_scalar(b"y")
        };
        let base = y(&mut auth_context(b"alice", "S1", b"n", 10));
        assert_eq!(base, y(&mut auth_context(b"alice", "S1", b"n", 10)));
        assert_ne!(base, y(&mut auth_context(b"bob", "S1", b"n", 10)));
        assert_ne!(base, y(&mut auth_context(b"alice", "S2", b"n", 10)));
        assert_ne!(base, y(&mut auth_context(b"alice", "S1", b"m", 10)));
        assert_ne!(base, y(&mut auth_context(b"alice", "S1", b"n", 11)));
    }

    #[test]
    fn contexts_are_separated() {
        let mut a = auth_context(b"alice", "S1", b"digest", 10);
        let mut s = signing_context(b"alice", b"digest", 10, "S1");
        assert_ne!(a.challenge_scalar(b"y"), s.challenge_scalar(b"y"));
    }

    #[test]
    fn witnesses_are_fresh() {
        let t = auth_context(b"alice", "S1", b"n", 10);
        assert_ne!(t.witness_scalar(b"x", b"w"), t.witness_scalar(b"x", b"w"));
    }
}
