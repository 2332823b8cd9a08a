// -*- mode: rust; -*-
//
// This file is part of pinproof.
// See LICENSE for licensing information.

//! The split identity secret.
//!
//! The full `ClientSecret` exists only while registering.  What stays on the
//! device is the `Token`, the secret with the PIN factor stripped off:
//!
//! ```text
//! PINFactor = pinScalar(identity, PIN) · H(identity)
//! Token     = [k·]ClientSecret − PINFactor
//! ```
//!
//! where `k` is the device secret of a device-bound registration.  The two
//! halves are recombined only inside the proof and signing engines, as a
//! `RecombinedSecret` that is wiped when it goes out of scope.

use core::fmt::{self, Debug};

use bls12_381::G1Projective;
use group::Group;
use subtle::{Choice, ConstantTimeEq};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::errors::{Error, Result};
use crate::identity::Identity;
use crate::keys::DeviceSecretKey;
use crate::pairing::{g1_from_bytes, g1_to_bytes, hex_codec, PairingContext, G1_LENGTH};
use crate::scalars::{pin_scalar, wipe};

/// Shortest PIN accepted at registration.
pub const MIN_PIN_LENGTH: usize = 4;

/// Longest PIN accepted at registration.
pub const MAX_PIN_LENGTH: usize = 6;

/// The length of a serialized `Token`, in bytes.
pub const TOKEN_LENGTH: usize = G1_LENGTH;

/// A numeric PIN, wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Pin(Vec<u8>);

impl Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pin(****)")
    }
}

impl Pin {
    /// Parse a PIN of [`MIN_PIN_LENGTH`]..=[`MAX_PIN_LENGTH`] ASCII digits.
    pub fn new(digits: &str) -> Result<Pin> {
        let pin = Pin(digits.as_bytes().to_vec());
        pin.ensure_length(MIN_PIN_LENGTH, MAX_PIN_LENGTH)?;
        Ok(pin)
    }

    /// Check the PIN is all digits with a length in `min..=max`.
    pub fn ensure_length(&self, min: usize, max: usize) -> Result<()> {
        let digits_only = self.0.iter().all(u8::is_ascii_digit);
        if !digits_only || self.0.len() < min || self.0.len() > max {
            return Err(Error::InvalidPin { min, max });
        }
        Ok(())
    }

    /// Number of digits.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the PIN has no digits.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Defines a G1 point newtype that hides its value in `Debug` and is wiped
/// on drop.
macro_rules! secret_point {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name(pub(crate) G1Projective);

        impl Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "(..)"))
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                wipe(&mut self.0);
            }
        }

        impl ConstantTimeEq for $name {
            fn ct_eq(&self, other: &Self) -> Choice {
                self.0.ct_eq(&other.0)
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.ct_eq(other).into()
            }
        }

        impl Eq for $name {}
    };
}

secret_point!(
    /// The PIN factor `pinScalar(identity, PIN) · H(identity)`.
    PinFactor
);

secret_point!(
    /// The full client secret, the sum of all issued shares.
    ClientSecret
);

secret_point!(
    /// The PIN-stripped secret kept in the token store.
    Token
);

secret_point!(
    /// `Token + PINFactor`, alive for one proof construction.
    RecombinedSecret
);

/// Derive the PIN factor of `identity` for `pin`.
///
/// Pure and deterministic for a given `(identity, pin)`.
pub fn extract_pin_factor(ctx: &dyn PairingContext, identity: &Identity, pin: &Pin) -> Result<PinFactor> {
    let hid = identity.hash_point(ctx)?;
    pin_factor_at(ctx, identity, &hid, pin)
}

/// PIN factor for an already hashed identity point.
pub(crate) fn pin_factor_at(
    ctx: &dyn PairingContext,
    identity: &Identity,
    hid: &G1Projective,
    pin: &Pin,
) -> Result<PinFactor> {
    let mut s = pin_scalar(&identity.hash_input(), pin.as_bytes())?;
    let factor = PinFactor(ctx.mul_g1(hid, &s));
    wipe(&mut s);
    Ok(factor)
}

/// A client secret share issued by one issuing authority.
#[derive(Clone)]
pub struct SecretShare {
    /// The share, a G1 point.
    pub(crate) point: G1Projective,
    /// Issuer that produced the share.
    pub issuer_id: String,
}

impl Debug for SecretShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretShare {{ issuer_id: {:?} }}", self.issuer_id)
    }
}

impl Drop for SecretShare {
    fn drop(&mut self) {
        wipe(&mut self.point);
    }
}

impl SecretShare {
    /// Decode a share from its hex wire form.
    pub fn from_hex(share: &str, issuer_id: impl Into<String>) -> Result<SecretShare> {
        let point = hex_codec::g1_from(share)?;
        if bool::from(point.is_identity()) {
            return Err(Error::PointDecoding("secret share"));
        }
        Ok(SecretShare { point, issuer_id: issuer_id.into() })
    }
}

/// Combine the shares of every issuer: `ClientSecret = Σ shares`.
pub fn combine_shares(shares: &[SecretShare]) -> Result<ClientSecret> {
    if shares.is_empty() {
        return Err(Error::MalformedPayload("no secret shares".into()));
    }
    let mut sum = G1Projective::identity();
    for share in shares {
        sum += share.point;
    }
    if bool::from(sum.is_identity()) {
        return Err(Error::CryptoPrimitiveFailure("secret shares cancel out"));
    }
    Ok(ClientSecret(sum))
}

impl Token {
    /// Strip the PIN factor from a client secret, after scaling it by the
    /// device secret when the registration is device bound.
    pub fn from_client_secret(
        ctx: &dyn PairingContext,
        identity: &Identity,
        client_secret: &ClientSecret,
        pin: &Pin,
        device_secret: Option<&DeviceSecretKey>,
    ) -> Result<Token> {
        let factor = extract_pin_factor(ctx, identity, pin)?;
        let bound = match device_secret {
            Some(k) => ClientSecret(ctx.mul_g1(&client_secret.0, &k.0)),
            None => client_secret.clone(),
        };
        let token = Token(bound.0 - factor.0);
        if bool::from(token.0.is_identity()) {
            return Err(Error::CryptoPrimitiveFailure("token is the identity"));
        }
        Ok(token)
    }

    /// `Token + PINFactor`.
    pub(crate) fn recombine(&self, factor: &PinFactor) -> RecombinedSecret {
        RecombinedSecret(self.0 + factor.0)
    }

    /// Convert this token to its compressed encoding.
    pub fn to_bytes(&self) -> [u8; TOKEN_LENGTH] {
        g1_to_bytes(&self.0)
    }

    /// Decode a token, rejecting the identity point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Token> {
        let point = g1_from_bytes(bytes)?;
        if bool::from(point.is_identity()) {
            return Err(Error::PointDecoding("Token"));
        }
        Ok(Token(point))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pairing::Bls12Context;
    use ff::Field;
    use rand::thread_rng;

    fn alice() -> Identity {
        Identity::new("alice@example.com", "proj").unwrap()
    }

    fn random_share(issuer: &str) -> SecretShare {
        let p = G1Projective::generator() * bls12_381::Scalar::random(thread_rng());
        SecretShare { point: p, issuer_id: issuer.into() }
    }

    #[test]
    fn pin_policy() {
        assert!(Pin::new("1234").is_ok());
        assert!(Pin::new("123456").is_ok());
        assert_eq!(Pin::new("123").unwrap_err(), Error::InvalidPin { min: 4, max: 6 });
        assert_eq!(Pin::new("1234567").unwrap_err(), Error::InvalidPin { min: 4, max: 6 });
        assert_eq!(Pin::new("12a4").unwrap_err(), Error::InvalidPin { min: 4, max: 6 });
        let pin = Pin::new("12345").unwrap();
        assert_eq!(pin.ensure_length(4, 4).unwrap_err(), Error::InvalidPin { min: 4, max: 4 });
    }

    #[test]
    fn debug_never_prints_secrets() {
        let pin = Pin::new("1234").unwrap();
        assert_eq!(format!("{:?}", pin), "Pin(****)");
        let share = random_share("issuer-a");
        let cs = combine_shares(&[share]).unwrap();
        assert_eq!(format!("{:?}", cs), "ClientSecret(..)");
    }

    #[test]
    fn pin_factor_is_deterministic() {
        let ctx = Bls12Context::new();
        let pin = Pin::new("1234").unwrap();
        let a = extract_pin_factor(&ctx, &alice(), &pin).unwrap();
        let b = extract_pin_factor(&ctx, &alice(), &pin).unwrap();
        let c = extract_pin_factor(&ctx, &alice(), &Pin::new("4321").unwrap()).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn token_plus_factor_restores_the_client_secret() {
        let ctx = Bls12Context::new();
        let pin = Pin::new("1234").unwrap();
        let cs = combine_shares(&[random_share("a"), random_share("b")]).unwrap();
        let token = Token::from_client_secret(&ctx, &alice(), &cs, &pin, None).unwrap();
        let factor = extract_pin_factor(&ctx, &alice(), &pin).unwrap();
        assert_eq!(token.recombine(&factor).0, cs.0);

        let wrong = extract_pin_factor(&ctx, &alice(), &Pin::new("4321").unwrap()).unwrap();
        assert_ne!(token.recombine(&wrong).0, cs.0);
    }

    #[test]
    fn token_bytes() {
        let ctx = Bls12Context::new();
        let cs = combine_shares(&[random_share("a")]).unwrap();
        let token = Token::from_client_secret(&ctx, &alice(), &cs, &Pin::new("1234").unwrap(), None).unwrap();
        assert_eq!(Token::from_bytes(&token.to_bytes()).unwrap(), token);
        let identity = g1_to_bytes(&G1Projective::identity());
        assert_eq!(Token::from_bytes(&identity).unwrap_err(), Error::PointDecoding("Token"));
    }

    #[test]
    fn shares_must_not_be_empty() {
        assert!(matches!(combine_shares(&[]), Err(Error::MalformedPayload(_))));
        let hex_identity = hex::encode(g1_to_bytes(&G1Projective::identity()));
        assert_eq!(
            SecretShare::from_hex(&hex_identity, "a").unwrap_err(),
            Error::PointDecoding("secret share")
        );
    }
}
