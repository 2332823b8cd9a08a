// -*- mode: rust; -*-
//
// This file is part of pinproof.
// See LICENSE for licensing information.

//! Registration of identities.
//!
//! Registration exchanges an activation token with every configured issuing
//! authority, sums the issued shares into the client secret, asks the user
//! for a PIN, and stores only the PIN-stripped token.

use std::sync::Arc;

use async_trait::async_trait;
use rand_core::OsRng;
use tracing::{debug, info, warn};

use crate::api::{IssuerApi, RegistrationRequest};
use crate::config::ClientConfig;
use crate::errors::{Error, Result};
use crate::identity::{Identity, IdentityKey};
use crate::keys::DeviceKeypair;
use crate::pairing::PairingContext;
use crate::retry::{retry, CancelHandle};
use crate::secret::{combine_shares, Pin, SecretShare, Token};
use crate::store::{IdentityLocks, Registration, TokenStore};

/// Why a PIN is requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PinPurpose {
    /// Choosing the PIN of a new registration.
    Register,
    /// Answering an authentication challenge.
    Authenticate,
    /// Signing a message digest.
    Sign,
}

/// Source of PINs, typically a PIN-entry dialog.
#[async_trait]
pub trait PinProvider: Send + Sync {
    /// Ask for the PIN of `user_id`.  `length` is the registered PIN length,
    /// absent while registering.  `None` means the user dismissed the prompt.
    async fn request_pin(&self, user_id: &str, purpose: PinPurpose, length: Option<usize>) -> Option<Pin>;
}

/// Per-registration choices.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistrationOptions {
    /// Overrides the configured device name.
    pub device_name: Option<String>,
    /// Overrides the configured device binding.
    pub bind_device_key: Option<bool>,
}

/// Registers and de-registers identities of one project.
pub struct Registrar {
    ctx: Arc<dyn PairingContext>,
    config: ClientConfig,
    issuers: Vec<Arc<dyn IssuerApi>>,
    store: Arc<dyn TokenStore>,
    locks: Arc<IdentityLocks>,
}

impl Registrar {
    /// A registrar using `issuers` and storing into `store`.
    pub fn new(
        ctx: Arc<dyn PairingContext>,
        config: ClientConfig,
        issuers: Vec<Arc<dyn IssuerApi>>,
        store: Arc<dyn TokenStore>,
        locks: Arc<IdentityLocks>,
    ) -> Result<Registrar> {
        config.validate()?;
        if issuers.is_empty() {
            return Err(Error::Config("no issuing authority configured".into()));
        }
        Ok(Registrar { ctx, config, issuers, store, locks })
    }

    /// Register `user_id` with `activation_token`.
    ///
    /// Replaces any earlier registration of the same identity.
    pub async fn register(
        &self,
        user_id: &str,
        activation_token: &str,
        pins: &dyn PinProvider,
        options: RegistrationOptions,
        cancel: &CancelHandle,
    ) -> Result<Registration> {
        if activation_token.trim().is_empty() {
            return Err(Error::InvalidActivationToken);
        }
        let mut identity = Identity::new(user_id, self.config.project_id.clone())?;
        let device = if options.bind_device_key.unwrap_or(self.config.bind_device_key) {
            let keypair = DeviceKeypair::generate(OsRng);
            identity = identity.with_device_key(keypair.public);
            Some(keypair)
        } else {
            None
        };

        let request = RegistrationRequest {
            user_id: identity.user_id.clone(),
            project_id: identity.project_id.clone(),
            activation_token: activation_token.to_owned(),
            device_name: options.device_name.unwrap_or_else(|| self.config.device_name.clone()),
            device_public_key: device.as_ref().map(|d| d.public.to_hex()),
        };

        let mut shares = Vec::with_capacity(self.issuers.len());
        for issuer in &self.issuers {
            let response = retry(&self.config.retry, cancel, "issue_share", || issuer.issue_share(&request)).await;
            let response = match response {
                Ok(r) => r,
                Err(err) => {
                    warn!(user_id = %identity.user_id, issuer = issuer.issuer_id(), error = %err, "share request failed");
                    return Err(err);
                }
            };
            if response.curve != self.ctx.curve_id() {
                return Err(Error::UnsupportedCurve(response.curve));
            }
            if response.project_id != identity.project_id {
                return Err(Error::ProjectMismatch);
            }
            shares.push(SecretShare::from_hex(&response.secret_share, response.issuer_id.clone())?);
            debug!(user_id = %identity.user_id, issuer = %response.issuer_id, "secret share received");
        }

        let pin = pins
            .request_pin(&identity.user_id, PinPurpose::Register, None)
            .await
            .ok_or(Error::CancelledOperation)?;
        pin.ensure_length(self.config.min_pin_length, self.config.max_pin_length)?;

        let client_secret = combine_shares(&shares)?;
        let token = Token::from_client_secret(
            self.ctx.as_ref(),
            &identity,
            &client_secret,
            &pin,
            device.as_ref().map(|d| &d.secret),
        )?;
        drop(client_secret);

        let registration = Registration {
            issuers: shares.iter().map(|s| s.issuer_id.clone()).collect(),
            identity,
            token,
            device_secret: device.map(|d| d.secret),
            pin_length: pin.len(),
            revoked: false,
        };

        let _guard = self.locks.lock(&registration.key()).await;
        self.store.save(&registration).await?;
        info!(
            user_id = %registration.identity.user_id,
            device_bound = registration.device_secret.is_some(),
            issuers = registration.issuers.len(),
            "identity registered"
        );
        Ok(registration)
    }

    /// Destroy the stored token of `key`.
    pub async fn deregister(&self, key: &IdentityKey) -> Result<()> {
        let _guard = self.locks.lock(key).await;
        if self.store.load(key).await?.is_none() {
            return Err(Error::UnknownIdentity(key.to_string()));
        }
        self.store.delete(key).await?;
        info!(identity = %key, "identity deregistered");
        Ok(())
    }

    /// Identities registered on this device.
    pub async fn registrations(&self) -> Result<Vec<IdentityKey>> {
        self.store.keys().await
    }
}
