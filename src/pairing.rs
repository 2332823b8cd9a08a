// -*- mode: rust; -*-
//
// This file is part of pinproof.
// See LICENSE for licensing information.

//! Handle onto the pairing-friendly group library.
//!
//! The protocol engines never reach for process-wide curve state.  Every
//! operation that hashes onto the curve, multiplies a point, or evaluates a
//! pairing goes through an explicit [`PairingContext`] passed in by the
//! caller.  [`Bls12Context`] is the production handle, backed by the
//! `bls12_381` crate.
//!
//! Encodings: G1 points are 48 byte compressed, G2 points 96 byte
//! compressed, and scalars 32 byte little-endian canonical, all as defined
//! by `bls12_381`.

use bls12_381::{multi_miller_loop, G1Affine, G1Projective, G2Affine, G2Prepared, G2Projective, Scalar};
use group::Group;
use sha2::{Digest, Sha384};

use crate::errors::{Error, Result};

/// Identifier of the curve this client speaks, as named on the wire.
pub const CURVE_ID: &str = "BLS12381";

/// The length of a compressed G1 point, in bytes.
pub const G1_LENGTH: usize = 48;

/// The length of a compressed G2 point, in bytes.
pub const G2_LENGTH: usize = 96;

/// The length of an encoded scalar, in bytes.
pub const SCALAR_LENGTH: usize = 32;

/// Operations of the pairing primitive library used by the protocol.
///
/// Implementations must be deterministic for `hash_to_g1` and must never
/// log their inputs.
pub trait PairingContext: Send + Sync {
    /// Curve name advertised to, and expected from, the issuing authority.
    fn curve_id(&self) -> &'static str;

    /// Hash arbitrary bytes onto a G1 point of unknown discrete log.
    fn hash_to_g1(&self, domain: &'static [u8], msg: &[u8]) -> Result<G1Projective>;

    /// Scalar multiplication on G1.
    fn mul_g1(&self, point: &G1Projective, scalar: &Scalar) -> G1Projective;

    /// Scalar multiplication on G2.
    fn mul_g2(&self, point: &G2Projective, scalar: &Scalar) -> G2Projective;

    /// The fixed G2 generator used by public keys.
    fn g2_generator(&self) -> G2Projective;

    /// Whether `∏ e(P_i, Q_i)` is the identity of GT.
    fn pairing_product_is_identity(&self, terms: &[(G1Affine, G2Affine)]) -> bool;
}

/// Pairing handle over BLS12-381.
#[derive(Clone, Copy, Debug, Default)]
pub struct Bls12Context;

impl Bls12Context {
    /// Create a new handle.
    pub fn new() -> Bls12Context {
        Bls12Context
    }
}

impl PairingContext for Bls12Context {
    fn curve_id(&self) -> &'static str {
        CURVE_ID
    }

    /// Try-and-increment: hash to a candidate x coordinate, keep the first
    /// one on the curve, then clear the cofactor.
    fn hash_to_g1(&self, domain: &'static [u8], msg: &[u8]) -> Result<G1Projective> {
        for counter in 0..=u8::MAX {
            let digest = Sha384::new()
                .chain_update((domain.len() as u64).to_le_bytes())
                .chain_update(domain)
                .chain_update((msg.len() as u64).to_le_bytes())
                .chain_update(msg)
                .chain_update([counter])
                .finalize();

            let mut x = [0u8; G1_LENGTH];
            x.copy_from_slice(&digest);
            let sign = x[G1_LENGTH - 1] & 1;
            // compression flag set, infinity flag clear, sign bit from the digest
            x[0] &= 0b0001_1111;
            x[0] |= 0b1000_0000 | (sign << 5);

            let candidate: Option<G1Affine> = G1Affine::from_compressed_unchecked(&x).into();
            if let Some(point) = candidate {
                let point = G1Projective::from(point).clear_cofactor();
                if !bool::from(point.is_identity()) {
                    return Ok(point);
                }
            }
        }
        Err(Error::CryptoPrimitiveFailure("hash to G1 exhausted its counter"))
    }

    fn mul_g1(&self, point: &G1Projective, scalar: &Scalar) -> G1Projective {
        point * scalar
    }

    fn mul_g2(&self, point: &G2Projective, scalar: &Scalar) -> G2Projective {
        point * scalar
    }

    fn g2_generator(&self) -> G2Projective {
        G2Projective::generator()
    }

    fn pairing_product_is_identity(&self, terms: &[(G1Affine, G2Affine)]) -> bool {
        let prepared: Vec<(G1Affine, G2Prepared)> =
            terms.iter().map(|(p, q)| (*p, G2Prepared::from(*q))).collect();
        let refs: Vec<(&G1Affine, &G2Prepared)> = prepared.iter().map(|(p, q)| (p, q)).collect();
        bool::from(multi_miller_loop(&refs).final_exponentiation().is_identity())
    }
}

/// Compress a G1 point.
pub fn g1_to_bytes(point: &G1Projective) -> [u8; G1_LENGTH] {
    G1Affine::from(point).to_compressed()
}

/// Decompress and subgroup-check a G1 point.
pub fn g1_from_bytes(bytes: &[u8]) -> Result<G1Projective> {
    if bytes.len() != G1_LENGTH {
        return Err(Error::BytesLength { name: "G1 point", length: G1_LENGTH });
    }
    let mut buf = [0u8; G1_LENGTH];
    buf.copy_from_slice(bytes);
    let point: Option<G1Affine> = G1Affine::from_compressed(&buf).into();
    point.map(G1Projective::from).ok_or(Error::PointDecoding("G1"))
}

/// Compress a G2 point.
pub fn g2_to_bytes(point: &G2Projective) -> [u8; G2_LENGTH] {
    G2Affine::from(point).to_compressed()
}

/// Decompress and subgroup-check a G2 point.
pub fn g2_from_bytes(bytes: &[u8]) -> Result<G2Projective> {
    if bytes.len() != G2_LENGTH {
        return Err(Error::BytesLength { name: "G2 point", length: G2_LENGTH });
    }
    let mut buf = [0u8; G2_LENGTH];
    buf.copy_from_slice(bytes);
    let point: Option<G2Affine> = G2Affine::from_compressed(&buf).into();
    point.map(G2Projective::from).ok_or(Error::PointDecoding("G2"))
}

/// Encode a scalar.
pub fn scalar_to_bytes(scalar: &Scalar) -> [u8; SCALAR_LENGTH] {
    scalar.to_bytes()
}

/// Decode a canonical scalar.
pub fn scalar_from_bytes(bytes: &[u8]) -> Result<Scalar> {
    if bytes.len() != SCALAR_LENGTH {
        return Err(Error::BytesLength { name: "Scalar", length: SCALAR_LENGTH });
    }
    let mut buf = [0u8; SCALAR_LENGTH];
    buf.copy_from_slice(bytes);
    let scalar: Option<Scalar> = Scalar::from_bytes(&buf).into();
    scalar.ok_or(Error::ScalarFormat)
}

/// Hex forms used by the JSON wire contracts.
pub mod hex_codec {
    use super::*;

    /// Hex of a compressed G1 point.
    pub fn g1(point: &G1Projective) -> String {
        hex::encode(g1_to_bytes(point))
    }

    /// G1 point from hex.
    pub fn g1_from(s: &str) -> Result<G1Projective> {
        g1_from_bytes(&hex::decode(s.trim())?)
    }

    /// Hex of a compressed G2 point.
    pub fn g2(point: &G2Projective) -> String {
        hex::encode(g2_to_bytes(point))
    }

    /// G2 point from hex.
    pub fn g2_from(s: &str) -> Result<G2Projective> {
        g2_from_bytes(&hex::decode(s.trim())?)
    }

    /// Hex of a scalar.
    pub fn scalar(scalar: &Scalar) -> String {
        hex::encode(scalar_to_bytes(scalar))
    }

    /// Scalar from hex.
    pub fn scalar_from(s: &str) -> Result<Scalar> {
        scalar_from_bytes(&hex::decode(s.trim())?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ff::Field;
    use rand_core::OsRng;

    #[test]
    fn hash_to_g1_is_deterministic_and_domain_separated() {
        let ctx = Bls12Context::new();
        let a = ctx.hash_to_g1(b"test-id", b"alice@example.com").unwrap();
        let b = ctx.hash_to_g1(b"test-id", b"alice@example.com").unwrap();
        let c = ctx.hash_to_g1(b"test-msg", b"alice@example.com").unwrap();
        let d = ctx.hash_to_g1(b"test-id", b"bob@example.com").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(bool::from(G1Affine::from(a).is_torsion_free()));
    }

    #[test]
    fn pairing_product_checks_bilinearity() {
        let ctx = Bls12Context::new();
        let s = Scalar::random(&mut OsRng);
        let p = ctx.hash_to_g1(b"test", b"point").unwrap();
        let g2 = ctx.g2_generator();

        // e(s·P, G2) · e(−P, s·G2) = 1
        let lhs = G1Affine::from(ctx.mul_g1(&p, &s));
        let rhs = G1Affine::from(-p);
        let sg2 = G2Affine::from(ctx.mul_g2(&g2, &s));
        assert!(ctx.pairing_product_is_identity(&[(lhs, G2Affine::from(g2)), (rhs, sg2)]));
        assert!(!ctx.pairing_product_is_identity(&[(lhs, G2Affine::from(g2)), (lhs, sg2)]));
    }

    #[test]
    fn codecs_reject_bad_lengths_and_points() {
        assert_eq!(
            g1_from_bytes(&[0u8; 47]).unwrap_err(),
            Error::BytesLength { name: "G1 point", length: G1_LENGTH }
        );
        assert_eq!(g1_from_bytes(&[0xffu8; 48]).unwrap_err(), Error::PointDecoding("G1"));
        assert_eq!(scalar_from_bytes(&[0xffu8; 32]).unwrap_err(), Error::ScalarFormat);

        let p = Bls12Context.hash_to_g1(b"test", b"codec").unwrap();
        assert_eq!(hex_codec::g1_from(&hex_codec::g1(&p)).unwrap(), p);
    }
}
