// -*- mode: rust; -*-
//
// This file is part of pinproof.
// See LICENSE for licensing information.

#[macro_use]
extern crate criterion;

use criterion::Criterion;

mod proof_benches {
    use super::*;
    use bls12_381::{G2Projective, Scalar};
    use ff::Field;
    use pinproof::pairing::hex_codec;
    use pinproof::secret::{combine_shares, SecretShare};
    use pinproof::sign::sign;
    use pinproof::{proof, Bls12Context, Challenge, Identity, PairingContext, Pin, SigningSessionDetails, Token};
    use rand::thread_rng;

    const NOW: u64 = 1_700_000_000;

    struct Setup {
        ctx: Bls12Context,
        identity: Identity,
        token: Token,
        pin: Pin,
        q: G2Projective,
    }

    fn setup() -> Setup {
        let ctx = Bls12Context::new();
        let identity = Identity::new("alice@example.com", "proj").unwrap();
        let s = Scalar::random(thread_rng());
        let share = ctx.mul_g1(&identity.hash_point(&ctx).unwrap(), &s);
        let share = SecretShare::from_hex(&hex_codec::g1(&share), "bench").unwrap();
        let client_secret = combine_shares(&[share]).unwrap();
        let pin = Pin::new("1234").unwrap();
        let token = Token::from_client_secret(&ctx, &identity, &client_secret, &pin, None).unwrap();
        let q = ctx.mul_g2(&ctx.g2_generator(), &s);
        Setup { ctx, identity, token, pin, q }
    }

    fn hash_identity(c: &mut Criterion) {
        let Setup { ctx, identity, .. } = setup();
        c.bench_function("Identity hash to G1", move |b| b.iter(|| identity.hash_point(&ctx)));
    }

    fn authenticate(c: &mut Criterion) {
        let Setup { ctx, identity, token, pin, .. } = setup();
        let challenge = Challenge::new("S1", b"nonce".to_vec(), NOW, 120);
        c.bench_function("Single-shot proof", move |b| {
            b.iter(|| proof::authenticate(&ctx, &token, &pin, &identity, &challenge, NOW))
        });
    }

    fn verify(c: &mut Criterion) {
        let Setup { ctx, identity, token, pin, q } = setup();
        let challenge = Challenge::new("S1", b"nonce".to_vec(), NOW, 120);
        let proof = proof::authenticate(&ctx, &token, &pin, &identity, &challenge, NOW).unwrap();
        let y = proof::derive_challenge(&identity, &challenge, &proof);
        c.bench_function("Proof verification", move |b| {
            b.iter(|| proof::verify(&ctx, &identity, &proof.u, &proof.v, &y, &q))
        });
    }

    fn sign_digest(c: &mut Criterion) {
        let Setup { ctx, identity, token, pin, .. } = setup();
        let details = SigningSessionDetails {
            session_id: "G1".into(),
            user_id: identity.user_id.clone(),
            project_id: identity.project_id.clone(),
            digest: vec![0xab; 32],
            description: String::new(),
            timestamp: NOW,
            expires_at: NOW + 300,
        };
        c.bench_function("Digest signing", move |b| {
            b.iter(|| sign(&ctx, &token, &pin, &identity, &details, NOW))
        });
    }

    criterion_group! {
        name = proof_benches;
        config = Criterion::default();
        targets =
            hash_identity,
            authenticate,
            verify,
            sign_digest,
    }
}

criterion_main!(proof_benches::proof_benches);
