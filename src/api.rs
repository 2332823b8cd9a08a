// -*- mode: rust; -*-
//
// This file is part of pinproof.
// See LICENSE for licensing information.

//! Wire contracts with the issuing authority and the verifier.
//!
//! Transport is not this crate's concern: callers implement [`IssuerApi`]
//! and [`VerifierApi`] over whatever client they use, returning
//! `NetworkFailure` for transient errors and decoding error bodies with
//! [`ApiErrorResponse::into_error`].  All bodies are camelCase JSON with
//! hex-encoded points and scalars.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::channel::ChallengeLocator;
use crate::errors::{Error, Result};
use crate::proof::Challenge;
use crate::sign::SigningSessionDetails;

/// Serde adapter for byte strings carried as hex.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'d, D: Deserializer<'d>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.trim()).map_err(serde::de::Error::custom)
    }
}

// === Registration === //

/// Activation token exchange request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    /// User being registered.
    pub user_id: String,
    /// Project the user registers with.
    pub project_id: String,
    /// One-time activation token obtained out of band.
    pub activation_token: String,
    /// Name of the registering device.
    pub device_name: String,
    /// Hex device public key of a device-bound registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_public_key: Option<String>,
}

/// A client secret share issued for a registration.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareResponse {
    /// Hex G1 share.
    pub secret_share: String,
    /// Issuer that produced the share.
    pub issuer_id: String,
    /// Curve the share lives on.
    pub curve: String,
    /// Project the share was issued for.
    pub project_id: String,
}

impl core::fmt::Debug for ShareResponse {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ShareResponse")
            .field("issuer_id", &self.issuer_id)
            .field("curve", &self.curve)
            .field("project_id", &self.project_id)
            .finish_non_exhaustive()
    }
}

// === Verification === //

/// Confirmation of an out-of-band identity verification, exchanged for an
/// activation token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationConfirmationRequest {
    /// User whose identity was verified.
    pub user_id: String,
    /// Code delivered by the verification channel.
    pub code: String,
}

impl VerificationConfirmationRequest {
    /// Validate a user id and code.
    pub fn new(user_id: &str, code: &str) -> Result<VerificationConfirmationRequest> {
        let (user_id, code) = (user_id.trim(), code.trim());
        if user_id.is_empty() {
            return Err(Error::MalformedPayload("empty user id".into()));
        }
        if code.is_empty() {
            return Err(Error::MalformedPayload("empty verification code".into()));
        }
        Ok(VerificationConfirmationRequest { user_id: user_id.to_owned(), code: code.to_owned() })
    }

    /// Read the `user_id` and `code` query parameters of a verification link.
    pub fn from_url(link: &Url) -> Result<VerificationConfirmationRequest> {
        let param = |name: &str| {
            link.query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default()
        };
        VerificationConfirmationRequest::new(&param("user_id"), &param("code"))
    }
}

impl core::fmt::Debug for VerificationConfirmationRequest {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VerificationConfirmationRequest")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// An activation token granted for a confirmed verification.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationTokenResponse {
    /// The one-time activation token.
    #[serde(rename = "actToken")]
    pub activation_token: String,
    /// Project the verification was made for.
    pub project_id: String,
    /// Session the verification started from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_id: Option<String>,
}

impl core::fmt::Debug for ActivationTokenResponse {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ActivationTokenResponse")
            .field("project_id", &self.project_id)
            .field("access_id", &self.access_id)
            .finish_non_exhaustive()
    }
}

// === Authentication === //

/// What a successful authentication grants, sent with pass 1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthScope {
    /// Log in to the session a carrier pointed at.
    #[default]
    #[serde(rename = "oidc")]
    Session,
    /// Receive a JWT for the relying party's backend.
    #[serde(rename = "jwt")]
    Jwt,
    /// Receive a JWT redeemable for a QuickCode.
    #[serde(rename = "reg-code")]
    QuickCode,
}

impl AuthScope {
    /// Wire name of the scope.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthScope::Session => "oidc",
            AuthScope::Jwt => "jwt",
            AuthScope::QuickCode => "reg-code",
        }
    }
}

/// How the project verifies identities before registration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VerificationMethod {
    /// Verification mail sent by the platform.
    #[default]
    StandardEmail,
    /// Verification run entirely by the relying party.
    FullCustom,
}

/// Kind of user ids a project accepts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IdentityType {
    /// E-mail addresses.
    #[default]
    Email,
    /// Any alphanumeric string.
    Alphanumeric,
}

/// What the verifier tells about an authentication session before the user
/// commits to it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationSessionDetails {
    /// User id typed when the session was started, possibly empty.
    #[serde(rename = "prerollId", default)]
    pub user_id: String,
    /// Project the session belongs to.
    pub project_id: String,
    /// Display name of the project.
    #[serde(default)]
    pub project_name: String,
    /// Logo of the project.
    #[serde(rename = "projectLogoURL", default)]
    pub project_logo_url: String,
    /// Length of the PIN the project asks for.
    pub pin_length: usize,
    /// How identities are verified before registration.
    #[serde(default)]
    pub verification_method: VerificationMethod,
    /// Where a custom verification starts.
    #[serde(rename = "verificationURL", default)]
    pub verification_url: String,
    /// Text shown for a custom verification.
    #[serde(default)]
    pub verification_custom_text: String,
    /// Label shown for the user id.
    #[serde(default)]
    pub identity_type_label: String,
    /// Kind of user ids the project accepts.
    #[serde(default)]
    pub identity_type: IdentityType,
    /// Whether QuickCodes may verify new devices.
    #[serde(rename = "enableRegistrationCode", default)]
    pub quick_code_enabled: bool,
    /// Whether devices registered through a QuickCode may not issue one.
    #[serde(rename = "limitRegCodeVerified", default)]
    pub limit_quick_code_registration: bool,
    /// The session described.
    #[serde(default)]
    pub session_id: String,
}

/// Pass 1: the commitment `U`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pass1Request {
    /// Authenticating user.
    pub user_id: String,
    /// Project of the user.
    pub project_id: String,
    /// Session being answered.
    pub session_id: String,
    /// Hex commitment `U`.
    pub u: String,
    /// What the authentication grants.
    #[serde(default)]
    pub scope: Vec<AuthScope>,
}

/// Pass 1 answer: the verifier challenge `y`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pass1Response {
    /// Hex scalar `y`.
    pub y: String,
    /// Session the challenge belongs to.
    pub session_id: String,
}

/// Pass 2: the response `V`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pass2Request {
    /// Session being answered.
    pub session_id: String,
    /// Hex response `V`.
    pub v: String,
}

/// Verification outcome of pass 2.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pass2Response {
    /// Whether the proof verified.
    pub verified: bool,
    /// Reason for a rejection, if given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Token granted by a `jwt` or `reg-code` scoped authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
}

// === QuickCode === //

/// Exchange of a `reg-code` JWT for a QuickCode.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickCodeRequest {
    /// Project of the authenticated user.
    pub project_id: String,
    /// JWT from a `reg-code` scoped authentication.
    pub jwt: String,
    /// Device asking for the code.
    pub device_name: String,
}

impl core::fmt::Debug for QuickCodeRequest {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QuickCodeRequest")
            .field("project_id", &self.project_id)
            .field("device_name", &self.device_name)
            .finish_non_exhaustive()
    }
}

/// A short-lived code verifying the user on another device.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickCode {
    /// The code to type on the other device.
    pub code: String,
    /// Expiry, in seconds since the Unix epoch.
    pub expire_time: u64,
    /// Lifetime of the code, in seconds.
    pub ttl_seconds: u64,
}

impl core::fmt::Debug for QuickCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QuickCode")
            .field("expire_time", &self.expire_time)
            .field("ttl_seconds", &self.ttl_seconds)
            .finish_non_exhaustive()
    }
}

// === Signing === //

/// A signature submitted for a signing session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureRequest {
    /// Signing user.
    pub user_id: String,
    /// Project of the user.
    pub project_id: String,
    /// Signing session answered.
    pub session_id: String,
    /// Hex commitment `U`.
    pub u: String,
    /// Hex response `V`.
    pub v: String,
    /// Signing time, in seconds since the Unix epoch.
    pub timestamp: u64,
    /// Hex message digest.
    pub message_digest: String,
}

/// Status of a signing session as reported by the verifier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SigningSessionStatus {
    /// Waiting for a signature.
    #[default]
    Active,
    /// A signature was accepted.
    Signed,
}

/// Verification outcome of a signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureResponse {
    /// Whether the signature verified.
    pub verified: bool,
    /// Session status after submission.
    #[serde(default)]
    pub status: SigningSessionStatus,
}

// === Errors === //

/// Error body returned by either service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    /// Machine readable error code.
    pub error: String,
    /// Human readable description.
    #[serde(default)]
    pub info: String,
    /// Extra details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<HashMap<String, String>>,
}

impl ApiErrorResponse {
    /// Map a service error code onto the protocol error taxonomy.
    pub fn into_error(self) -> Error {
        match self.error.as_str() {
            "INVALID_ACTIVATION_TOKEN" => Error::InvalidActivationToken,
            "MPINID_REVOKED" | "REVOKED_MPINID" | "MPINID_EXPIRED" | "EXPIRED_MPINID" => Error::RevokedIdentity,
            "PROJECT_MISMATCH" => Error::ProjectMismatch,
            "LIMITED_QUICKCODE_GENERATION" => Error::LimitedQuickCodeGeneration,
            "UNSUCCESSFUL_AUTHENTICATION"
            | "UNSUCCESSFUL_VERIFICATION"
            | "INVALID_VERIFICATION_CODE"
            | "INVALID_AUTH" => {
                Error::VerificationFailed { reason: Some(self.info).filter(|s| !s.is_empty()) }
            }
            "INVALID_AUTH_SESSION" | "INVALID_AUTHENTICATION_SESSION" => {
                let session_id = self
                    .context
                    .and_then(|mut c| c.remove("sessionId"))
                    .unwrap_or_default();
                Error::SessionExpired { session_id }
            }
            "BACKOFF_ERROR" | "REQUEST_BACKOFF" => Error::NetworkFailure(self.error),
            other => Error::MalformedPayload(format!("unexpected error code {}", other)),
        }
    }
}

// === Services === //

/// An issuing authority.
#[async_trait]
pub trait IssuerApi: Send + Sync {
    /// Stable identifier of this authority.
    fn issuer_id(&self) -> &str;

    /// Exchange an activation token for a client secret share.
    async fn issue_share(&self, request: &RegistrationRequest) -> Result<ShareResponse>;
}

/// The verifying service.
#[async_trait]
pub trait VerifierApi: Send + Sync {
    /// Exchange a confirmed verification for an activation token.
    async fn confirm_verification(&self, request: &VerificationConfirmationRequest) -> Result<ActivationTokenResponse>;

    /// Describe the authentication session a carrier points at.
    async fn fetch_session_details(&self, locator: &ChallengeLocator) -> Result<AuthenticationSessionDetails>;

    /// Open a session the client answers itself, for `jwt` and `reg-code`
    /// scoped authentication.
    async fn open_session(&self, scope: AuthScope) -> Result<ChallengeLocator>;

    /// Fetch the authentication challenge a carrier points at.
    async fn fetch_challenge(&self, locator: &ChallengeLocator) -> Result<Challenge>;

    /// Submit `U`, receive `y`.
    async fn pass1(&self, request: &Pass1Request) -> Result<Pass1Response>;

    /// Submit `V`, receive the verification outcome.
    async fn pass2(&self, request: &Pass2Request) -> Result<Pass2Response>;

    /// Fetch the signing session a carrier points at.
    async fn fetch_signing_session(&self, locator: &ChallengeLocator) -> Result<SigningSessionDetails>;

    /// Submit a signature.
    async fn submit_signature(&self, request: &SignatureRequest) -> Result<SignatureResponse>;

    /// Abandon a session.
    async fn abort(&self, session_id: &str) -> Result<()>;

    /// Exchange a `reg-code` JWT for a QuickCode.
    async fn generate_quick_code(&self, request: &QuickCodeRequest) -> Result<QuickCode>;
}
