// -*- mode: rust; -*-
//
// This file is part of pinproof.
// See LICENSE for licensing information.

//! PIN-protected identity-based authentication and signing over BLS12-381.
//!
//! Each identity `ID` owns a client secret `s·H(ID)` issued by one or more
//! issuing authorities, where `H` hashes onto G1 and `s` is the authorities'
//! combined master secret.  The device never stores that secret.  It keeps
//! a *token* instead, the client secret minus a PIN-derived factor, so the
//! token alone is useless and a wrong PIN yields a wrong secret that only
//! the verifier can tell apart.
//!
//! # Example
//!
//! Registration and authentication against the in-process reference
//! authority:
//!
//! ```
//! # #[cfg(feature = "authority")]
//! # fn main() -> Result<(), pinproof::Error> {
//! use std::sync::Arc;
//! use pinproof::authority::ReferenceAuthority;
//! use pinproof::{Bls12Context, ClientConfig, IdentityLocks, ManualClock, MemoryTokenStore};
//! use pinproof::{Orchestrator, Pin, PinProvider, PinPurpose, QrCode, Registrar, RegistrationOptions};
//! use pinproof::CancelHandle;
//!
//! struct Fixed;
//!
//! #[async_trait::async_trait]
//! impl PinProvider for Fixed {
//!     async fn request_pin(&self, _: &str, _: PinPurpose, _: Option<usize>) -> Option<Pin> {
//!         Pin::new("1234").ok()
//!     }
//! }
//!
//! let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
//! runtime.block_on(async {
//!     let clock = Arc::new(ManualClock::new(1_700_000_000));
//!     let authority = Arc::new(ReferenceAuthority::new("proj", "https://verifier.example.com/", 1, clock.clone())?);
//!     authority.add_activation_token("alice@example.com", "TOK123");
//!
//!     let ctx = Arc::new(Bls12Context::new());
//!     let store = Arc::new(MemoryTokenStore::new());
//!     let locks = Arc::new(IdentityLocks::new());
//!     let config = ClientConfig::new("proj");
//!
//!     let registrar = Registrar::new(ctx.clone(), config.clone(), authority.issuers(), store.clone(), locks.clone())?;
//!     let registration = registrar
//!         .register("alice@example.com", "TOK123", &Fixed, RegistrationOptions::default(), &CancelHandle::new())
//!         .await?;
//!
//!     let orchestrator = Orchestrator::new(ctx, config, authority.clone(), store, locks, clock)?;
//!     let locator = authority.start_authentication("S1", b"nonce", 120)?;
//!     let session = orchestrator.authenticate(&QrCode::from_locator(&locator), &registration.key(), &Fixed).await?;
//!     assert_eq!(session.state(), pinproof::SessionState::Verified);
//!     Ok::<(), pinproof::Error>(())
//! })
//! # }
//! # #[cfg(not(feature = "authority"))]
//! # fn main() {}
//! ```
//!
//! ## Layout
//!
//! * [`secret`] holds PINs, shares, client secrets and tokens.
//! * [`proof`] and [`sign`] are the pure proof and signature engines.
//! * [`registration`], [`session`] and [`store`] drive them against the
//!   issuing authority and verifier through the traits of [`api`].
//! * [`channel`] decodes QR codes, universal links and push payloads.
//! * [`Orchestrator::generate_jwt`] and [`Orchestrator::generate_quick_code`]
//!   run authentications the client opens itself, scoped to a JWT or a
//!   QuickCode for verifying another device.

#![deny(missing_docs)] // refuse to compile if documentation is missing

mod scalars;

pub mod api;
pub mod channel;
pub mod config;
pub mod context;
pub mod errors;
pub mod identity;
pub mod keys;
pub mod pairing;
pub mod proof;
pub mod registration;
pub mod retry;
pub mod secret;
pub mod session;
pub mod sign;
pub mod store;

#[cfg(any(test, feature = "authority"))]
pub mod authority;


pub use api::{AuthScope, AuthenticationSessionDetails, IssuerApi, QuickCode, VerificationConfirmationRequest, VerifierApi};
pub use channel::{ChallengeCarrier, ChallengeLocator, CarrierKind, PushPayload, QrCode, UniversalLink};
pub use config::ClientConfig;
pub use errors::{Error, Result};
pub use identity::{Identity, IdentityKey};
pub use keys::{DeviceKeypair, DevicePublicKey, DeviceSecretKey};
pub use pairing::{Bls12Context, PairingContext};
pub use proof::{Challenge, Proof};
pub use registration::{PinProvider, PinPurpose, Registrar, RegistrationOptions};
pub use retry::{CancelHandle, RetryPolicy};
pub use secret::{Pin, Token};
pub use session::{Clock, ManualClock, Orchestrator, Session, SessionKind, SessionState, SystemClock};
pub use sign::{Signature, SigningSessionDetails, SIGNATURE_LENGTH};
pub use store::{EncryptedTokenStore, IdentityLocks, MemoryBlobStore, MemoryTokenStore, Registration, StoreKey, TokenStore};
