// -*- mode: rust; -*-
//
// This file is part of pinproof.
// See LICENSE for licensing information.

//! In-process reference issuing authority and verifier.
//!
//! Implements [`IssuerApi`] and [`VerifierApi`] over in-memory state, for
//! interoperability checks and tests.  Each issuer `i` holds a master
//! scalar `s_i` and issues `s_i·H(identity)`; the verifier checks proofs
//! against `Q = (Σ s_i)·G2`, or `(Σ s_i)·(k·G2)` for device-bound
//! identities.
//!
//! Tokens granted by `jwt` and `reg-code` scoped authentications are
//! `hex(claims).hex(mac)`, the MAC being SHA-256 keyed by the master
//! secret.  [`ReferenceAuthority::jwt_claims`] checks them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bls12_381::{G1Projective, G2Projective, Scalar};
use ff::Field;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::api::{
    ActivationTokenResponse, AuthScope, AuthenticationSessionDetails, IdentityType, IssuerApi, Pass1Request,
    Pass1Response, Pass2Request, Pass2Response, QuickCode, QuickCodeRequest, RegistrationRequest, ShareResponse,
    SignatureRequest, SignatureResponse, SigningSessionStatus, VerificationConfirmationRequest, VerificationMethod,
    VerifierApi,
};
use crate::channel::ChallengeLocator;
use crate::errors::{Error, Result};
use crate::identity::Identity;
use crate::keys::DevicePublicKey;
use crate::pairing::{hex_codec, Bls12Context, PairingContext};
use crate::proof::{self, Challenge, Proof};
use crate::scalars::wipe;
use crate::session::Clock;
use crate::sign::{Signature, SigningSessionDetails};

/// Outcome of an authentication session on the verifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthStatus {
    /// Waiting for a proof.
    Pending,
    /// A proof verified.
    Verified,
    /// A proof failed.
    Failed,
    /// The client aborted.
    Aborted,
}

struct IssuerKey {
    id: String,
    secret: Scalar,
}

impl Drop for IssuerKey {
    fn drop(&mut self) {
        wipe(&mut self.secret);
    }
}

/// Lifetime of sessions opened for scoped authentication.
const DIRECT_SESSION_TTL: u64 = 60;

/// Lifetime of granted tokens and QuickCodes.
const JWT_TTL: u64 = 300;
const QUICK_CODE_TTL: u64 = 60;

/// Claims of a token granted by a scoped authentication.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Authenticated user.
    pub sub: String,
    /// Project the token is for.
    pub aud: String,
    /// Scope the token was granted for.
    pub scope: AuthScope,
    /// Issue time.
    pub iat: u64,
    /// Expiry time.
    pub exp: u64,
}

struct Commitment {
    user_id: String,
    u: G1Projective,
    y: Scalar,
    scope: AuthScope,
}

struct AuthSession {
    challenge: Challenge,
    commitment: Option<Commitment>,
    status: AuthStatus,
}

struct SigningSession {
    details: SigningSessionDetails,
    status: SigningSessionStatus,
    aborted: bool,
}

#[derive(Default)]
struct State {
    activation_tokens: HashMap<String, (String, HashSet<String>)>,
    identities: HashMap<String, Identity>,
    revoked: HashSet<String>,
    failures: HashMap<String, u32>,
    auth_sessions: HashMap<String, AuthSession>,
    signing_sessions: HashMap<String, SigningSession>,
    verification_codes: HashMap<String, String>,
    quick_codes: HashMap<String, (String, u64)>,
    quick_code_tokens: HashSet<String>,
    quick_code_verified: HashSet<String>,
    network_failures: u32,
}

/// Reference issuing authority and verifier for one project.
pub struct ReferenceAuthority {
    ctx: Bls12Context,
    project_id: String,
    endpoint: String,
    curve: String,
    issuers: Vec<IssuerKey>,
    max_failures: Option<u32>,
    project_name: String,
    pin_length: usize,
    limit_quick_codes: bool,
    state_ttl: bool,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl ReferenceAuthority {
    /// An authority with `issuers` independent issuers, serving challenges
    /// at `endpoint`.
    pub fn new(project_id: &str, endpoint: &str, issuers: usize, clock: Arc<dyn Clock>) -> Result<ReferenceAuthority> {
        let endpoint = ChallengeLocator::new("endpoint-check", endpoint)?.endpoint;
        let issuers = (1..=issuers.max(1))
            .map(|i| IssuerKey { id: format!("issuer-{}", i), secret: Scalar::random(OsRng) })
            .collect();
        Ok(ReferenceAuthority {
            ctx: Bls12Context::new(),
            project_id: project_id.to_owned(),
            endpoint,
            curve: Bls12Context::new().curve_id().to_owned(),
            issuers,
            max_failures: None,
            project_name: project_id.to_owned(),
            pin_length: 4,
            limit_quick_codes: false,
            state_ttl: true,
            clock,
            state: Mutex::new(State::default()),
        })
    }

    /// Advertise another curve in share responses.
    pub fn with_curve(mut self, curve: &str) -> ReferenceAuthority {
        self.curve = curve.to_owned();
        self
    }

    /// Revoke an identity after `max` failed proofs.
    pub fn with_max_failures(mut self, max: u32) -> ReferenceAuthority {
        self.max_failures = Some(max);
        self
    }

    /// Refuse QuickCodes to registrations verified through a QuickCode.
    pub fn with_quick_code_limit(mut self) -> ReferenceAuthority {
        self.limit_quick_codes = true;
        self
    }

    /// Serve challenges without their TTL, leaving the client to assume
    /// one.  Expiry is still enforced here.
    pub fn with_unstated_ttl(mut self) -> ReferenceAuthority {
        self.state_ttl = false;
        self
    }

    /// Name and PIN length reported in session details.
    pub fn with_project_name(mut self, name: &str, pin_length: usize) -> ReferenceAuthority {
        self.project_name = name.to_owned();
        self.pin_length = pin_length;
        self
    }

    /// The normalized challenge endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Handles onto every issuer.
    pub fn issuers(self: &Arc<Self>) -> Vec<Arc<dyn IssuerApi>> {
        (0..self.issuers.len())
            .map(|index| Arc::new(IssuerHandle { authority: self.clone(), index }) as Arc<dyn IssuerApi>)
            .collect()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Accept `token` as the activation token of `user_id`.
    pub fn add_activation_token(&self, user_id: &str, token: &str) {
        self.state()
            .activation_tokens
            .insert(token.to_owned(), (user_id.to_owned(), HashSet::new()));
    }

    /// Start verifying `user_id` out of band and return the code the
    /// verification mail would carry.
    pub fn start_verification(&self, user_id: &str) -> String {
        let code = random_hex(8);
        self.state().verification_codes.insert(code.clone(), user_id.to_owned());
        code
    }

    /// Revoke `user_id`.
    pub fn revoke(&self, user_id: &str) {
        self.state().revoked.insert(user_id.to_owned());
    }

    /// Fail the next `n` calls with `NetworkFailure`.
    pub fn fail_next_calls(&self, n: u32) {
        self.state().network_failures = n;
    }

    /// Open an authentication session living `ttl` seconds from now.
    pub fn start_authentication(&self, session_id: &str, nonce: &[u8], ttl: u64) -> Result<ChallengeLocator> {
        let locator = ChallengeLocator::new(session_id, &self.endpoint)?;
        let challenge = Challenge::new(session_id, nonce.to_vec(), self.clock.now(), ttl);
        self.state().auth_sessions.insert(
            session_id.to_owned(),
            AuthSession { challenge, commitment: None, status: AuthStatus::Pending },
        );
        Ok(locator)
    }

    /// Open a signing session for `user_id` over `digest`.
    pub fn start_signing(
        &self,
        session_id: &str,
        user_id: &str,
        digest: &[u8],
        description: &str,
        ttl: u64,
    ) -> Result<ChallengeLocator> {
        let locator = ChallengeLocator::new(session_id, &self.endpoint)?;
        let now = self.clock.now();
        let details = SigningSessionDetails {
            session_id: session_id.to_owned(),
            user_id: user_id.to_owned(),
            project_id: self.project_id.clone(),
            digest: digest.to_vec(),
            description: description.to_owned(),
            timestamp: now,
            expires_at: now.saturating_add(ttl),
        };
        self.state().signing_sessions.insert(
            session_id.to_owned(),
            SigningSession { details, status: SigningSessionStatus::Active, aborted: false },
        );
        Ok(locator)
    }

    /// Status of an authentication session.
    pub fn auth_status(&self, session_id: &str) -> Option<AuthStatus> {
        self.state().auth_sessions.get(session_id).map(|s| s.status)
    }

    /// Status of a signing session, and whether it was aborted.
    pub fn signing_status(&self, session_id: &str) -> Option<(SigningSessionStatus, bool)> {
        self.state().signing_sessions.get(session_id).map(|s| (s.status, s.aborted))
    }

    /// The key `Q` proofs of `user_id` verify against.
    pub fn public_key_for(&self, user_id: &str) -> Option<G2Projective> {
        let identity = self.state().identities.get(user_id).cloned()?;
        Some(self.public_key(&identity))
    }

    /// Check a single-shot proof of `user_id` against its challenge.
    pub fn verify_single_shot(&self, user_id: &str, challenge: &Challenge, proof: &Proof) -> Result<bool> {
        let identity = self
            .state()
            .identities
            .get(user_id)
            .cloned()
            .ok_or_else(|| Error::UnknownIdentity(user_id.to_owned()))?;
        if proof.session_id != challenge.session_id || challenge.is_expired(proof.timestamp) {
            return Ok(false);
        }
        let y = proof::derive_challenge(&identity, challenge, proof);
        proof::verify(&self.ctx, &identity, &proof.u, &proof.v, &y, &self.public_key(&identity))
    }

    /// Check a granted token and return its claims.
    pub fn jwt_claims(&self, token: &str) -> Result<Claims> {
        let invalid = || Error::VerificationFailed { reason: Some("invalid token".into()) };
        let (claims, mac) = token.split_once('.').ok_or_else(invalid)?;
        let claims = hex::decode(claims)?;
        let mac = hex::decode(mac)?;
        if !bool::from(self.token_mac(&claims).as_slice().ct_eq(&mac)) {
            return Err(invalid());
        }
        let claims: Claims = serde_json::from_slice(&claims)?;
        if claims.exp <= self.clock.now() || claims.aud != self.project_id {
            return Err(invalid());
        }
        Ok(claims)
    }

    fn grant(&self, user_id: &str, scope: AuthScope) -> Result<String> {
        let now = self.clock.now();
        let claims = Claims { sub: user_id.to_owned(), aud: self.project_id.clone(), scope, iat: now, exp: now + JWT_TTL };
        let claims = serde_json::to_vec(&claims)?;
        Ok(format!("{}.{}", hex::encode(&claims), hex::encode(self.token_mac(&claims))))
    }

    fn token_mac(&self, claims: &[u8]) -> Vec<u8> {
        let mut s = self.master_secret();
        let mut key = s.to_bytes();
        let mac = Sha256::new().chain_update(b"pinproof-reference-jwt").chain_update(key).chain_update(claims).finalize();
        wipe(&mut s);
        key.iter_mut().for_each(|b| *b = 0);
        mac.to_vec()
    }

    fn master_secret(&self) -> Scalar {
        self.issuers.iter().fold(Scalar::zero(), |acc, k| acc + k.secret)
    }

    fn public_key(&self, identity: &Identity) -> G2Projective {
        let base = identity.device_key.as_ref().map(|k| *k.as_point()).unwrap_or_else(|| self.ctx.g2_generator());
        let mut s = self.master_secret();
        let q = self.ctx.mul_g2(&base, &s);
        wipe(&mut s);
        q
    }

    fn network_check(&self) -> Result<()> {
        let mut state = self.state();
        if state.network_failures > 0 {
            state.network_failures -= 1;
            return Err(Error::NetworkFailure("connection reset".into()));
        }
        Ok(())
    }

    fn record_failure(&self, state: &mut State, user_id: &str) {
        let count = state.failures.entry(user_id.to_owned()).or_insert(0);
        *count += 1;
        if let Some(max) = self.max_failures {
            if *count >= max {
                state.revoked.insert(user_id.to_owned());
            }
        }
    }

    fn issue(&self, index: usize, request: &RegistrationRequest) -> Result<ShareResponse> {
        self.network_check()?;
        let issuer = &self.issuers[index];
        let mut state = self.state();
        match state.activation_tokens.get_mut(&request.activation_token) {
            Some((user, served)) if *user == request.user_id && !served.contains(&issuer.id) => {
                served.insert(issuer.id.clone());
            }
            _ => return Err(Error::InvalidActivationToken),
        }
        if state.revoked.contains(&request.user_id) {
            return Err(Error::RevokedIdentity);
        }

        let mut identity = Identity::new(request.user_id.clone(), request.project_id.clone())?;
        if let Some(key) = &request.device_public_key {
            identity = identity.with_device_key(DevicePublicKey::from_hex(key)?);
        }
        let share = self.ctx.mul_g1(&identity.hash_point(&self.ctx)?, &issuer.secret);
        state.identities.insert(request.user_id.clone(), identity);
        if state.quick_code_tokens.contains(&request.activation_token) {
            state.quick_code_verified.insert(request.user_id.clone());
        } else {
            state.quick_code_verified.remove(&request.user_id);
        }
        debug!(issuer = %issuer.id, user_id = %request.user_id, "share issued");

        Ok(ShareResponse {
            secret_share: hex_codec::g1(&share),
            issuer_id: issuer.id.clone(),
            curve: self.curve.clone(),
            project_id: self.project_id.clone(),
        })
    }
}

struct IssuerHandle {
    authority: Arc<ReferenceAuthority>,
    index: usize,
}

#[async_trait]
impl IssuerApi for IssuerHandle {
    fn issuer_id(&self) -> &str {
        &self.authority.issuers[self.index].id
    }

    async fn issue_share(&self, request: &RegistrationRequest) -> Result<ShareResponse> {
        self.authority.issue(self.index, request)
    }
}

#[async_trait]
impl VerifierApi for ReferenceAuthority {
    async fn confirm_verification(&self, request: &VerificationConfirmationRequest) -> Result<ActivationTokenResponse> {
        self.network_check()?;
        let now = self.clock.now();
        let mut state = self.state();
        let unsuccessful = || Error::VerificationFailed { reason: Some("invalid verification code".into()) };
        let from_quick_code = if state.verification_codes.get(&request.code) == Some(&request.user_id) {
            state.verification_codes.remove(&request.code);
            false
        } else {
            match state.quick_codes.remove(&request.code) {
                Some((user, expires)) if user == request.user_id && now < expires => true,
                _ => return Err(unsuccessful()),
            }
        };
        let token = random_hex(16);
        state
            .activation_tokens
            .insert(token.clone(), (request.user_id.clone(), HashSet::new()));
        if from_quick_code {
            state.quick_code_tokens.insert(token.clone());
        }
        debug!(user_id = %request.user_id, from_quick_code, "verification confirmed");
        Ok(ActivationTokenResponse { activation_token: token, project_id: self.project_id.clone(), access_id: None })
    }

    async fn fetch_session_details(&self, locator: &ChallengeLocator) -> Result<AuthenticationSessionDetails> {
        self.network_check()?;
        if locator.endpoint != self.endpoint {
            return Err(Error::MalformedPayload("unknown challenge endpoint".into()));
        }
        let expired = || Error::SessionExpired { session_id: locator.session_id.clone() };
        let state = self.state();
        let session = state.auth_sessions.get(&locator.session_id).ok_or_else(expired)?;
        if session.status != AuthStatus::Pending || session.challenge.is_expired(self.clock.now()) {
            return Err(expired());
        }
        Ok(AuthenticationSessionDetails {
            user_id: String::new(),
            project_id: self.project_id.clone(),
            project_name: self.project_name.clone(),
            project_logo_url: String::new(),
            pin_length: self.pin_length,
            verification_method: VerificationMethod::StandardEmail,
            verification_url: String::new(),
            verification_custom_text: String::new(),
            identity_type_label: "Email".into(),
            identity_type: IdentityType::Email,
            quick_code_enabled: true,
            limit_quick_code_registration: self.limit_quick_codes,
            session_id: locator.session_id.clone(),
        })
    }

    async fn open_session(&self, scope: AuthScope) -> Result<ChallengeLocator> {
        self.network_check()?;
        let session_id = format!("{}-{}", scope.as_str(), random_hex(8));
        self.start_authentication(&session_id, &random_nonce(), DIRECT_SESSION_TTL)
    }

    async fn fetch_challenge(&self, locator: &ChallengeLocator) -> Result<Challenge> {
        self.network_check()?;
        if locator.endpoint != self.endpoint {
            return Err(Error::MalformedPayload("unknown challenge endpoint".into()));
        }
        let challenge = self
            .state()
            .auth_sessions
            .get(&locator.session_id)
            .map(|s| s.challenge.clone())
            .ok_or_else(|| Error::SessionExpired { session_id: locator.session_id.clone() })?;
        Ok(if self.state_ttl { challenge } else { Challenge { ttl: None, ..challenge } })
    }

    async fn pass1(&self, request: &Pass1Request) -> Result<Pass1Response> {
        self.network_check()?;
        let now = self.clock.now();
        let mut state = self.state();
        if state.revoked.contains(&request.user_id) {
            return Err(Error::RevokedIdentity);
        }
        if !state.identities.contains_key(&request.user_id) || request.project_id != self.project_id {
            return Err(Error::rejected());
        }
        let expired = Error::SessionExpired { session_id: request.session_id.clone() };
        let session = state.auth_sessions.get_mut(&request.session_id).ok_or_else(|| expired.clone())?;
        if session.status != AuthStatus::Pending || session.challenge.is_expired(now) {
            return Err(expired);
        }
        let u = hex_codec::g1_from(&request.u)?;
        let y = Scalar::random(OsRng);
        let scope = request.scope.first().copied().unwrap_or_default();
        session.commitment = Some(Commitment { user_id: request.user_id.clone(), u, y, scope });
        Ok(Pass1Response { y: hex_codec::scalar(&y), session_id: request.session_id.clone() })
    }

    async fn pass2(&self, request: &Pass2Request) -> Result<Pass2Response> {
        self.network_check()?;
        let now = self.clock.now();
        let mut state = self.state();
        let expired = || Error::SessionExpired { session_id: request.session_id.clone() };
        let session = state.auth_sessions.get_mut(&request.session_id).ok_or_else(expired)?;
        if session.status != AuthStatus::Pending {
            return Ok(Pass2Response { verified: false, reason: Some("session already answered".into()), jwt: None });
        }
        if session.challenge.is_expired(now) {
            session.commitment = None;
            return Err(expired());
        }
        let Commitment { user_id, u, y, scope } = session
            .commitment
            .take()
            .ok_or(Error::VerificationFailed { reason: Some("no commitment".into()) })?;
        let v = hex_codec::g1_from(&request.v)?;

        let identity = state.identities.get(&user_id).cloned().ok_or_else(Error::rejected)?;
        let verified = proof::verify(&self.ctx, &identity, &u, &v, &y, &self.public_key(&identity))?;

        if let Some(session) = state.auth_sessions.get_mut(&request.session_id) {
            session.status = if verified { AuthStatus::Verified } else { AuthStatus::Failed };
        }
        debug!(session_id = %request.session_id, verified, scope = scope.as_str(), "pass 2 checked");
        if !verified {
            self.record_failure(&mut state, &user_id);
            return Ok(Pass2Response { verified, reason: None, jwt: None });
        }
        let jwt = match scope {
            AuthScope::Session => None,
            AuthScope::QuickCode if self.limit_quick_codes && state.quick_code_verified.contains(&user_id) => {
                return Err(Error::LimitedQuickCodeGeneration)
            }
            AuthScope::Jwt | AuthScope::QuickCode => Some(self.grant(&user_id, scope)?),
        };
        Ok(Pass2Response { verified, reason: None, jwt })
    }

    async fn fetch_signing_session(&self, locator: &ChallengeLocator) -> Result<SigningSessionDetails> {
        self.network_check()?;
        if locator.endpoint != self.endpoint {
            return Err(Error::MalformedPayload("unknown challenge endpoint".into()));
        }
        self.state()
            .signing_sessions
            .get(&locator.session_id)
            .map(|s| s.details.clone())
            .ok_or_else(|| Error::SessionExpired { session_id: locator.session_id.clone() })
    }

    async fn submit_signature(&self, request: &SignatureRequest) -> Result<SignatureResponse> {
        self.network_check()?;
        let now = self.clock.now();
        let mut state = self.state();
        if state.revoked.contains(&request.user_id) {
            return Err(Error::RevokedIdentity);
        }
        let identity = state.identities.get(&request.user_id).cloned().ok_or_else(Error::rejected)?;
        let session = state
            .signing_sessions
            .get_mut(&request.session_id)
            .ok_or_else(|| Error::SessionExpired { session_id: request.session_id.clone() })?;
        if session.aborted || session.details.is_expired(now) {
            return Err(Error::SessionExpired { session_id: request.session_id.clone() });
        }
        if session.status == SigningSessionStatus::Signed {
            return Ok(SignatureResponse { verified: false, status: session.status });
        }

        let digest = hex::decode(&request.message_digest)?;
        let signature = Signature {
            U: hex_codec::g1_from(&request.u)?,
            V: hex_codec::g1_from(&request.v)?,
            digest,
            session_id: request.session_id.clone(),
            timestamp: request.timestamp,
        };
        let bound = signature.digest == session.details.digest
            && request.user_id == session.details.user_id
            && request.timestamp < session.details.expires_at;
        let verified = bound && signature.verify(&self.ctx, &identity, &self.public_key(&identity))?;
        if verified {
            session.status = SigningSessionStatus::Signed;
        }
        let status = session.status;
        if !verified {
            self.record_failure(&mut state, &request.user_id);
        }
        Ok(SignatureResponse { verified, status })
    }

    async fn abort(&self, session_id: &str) -> Result<()> {
        self.network_check()?;
        let mut state = self.state();
        if let Some(session) = state.auth_sessions.get_mut(session_id) {
            session.status = AuthStatus::Aborted;
            session.commitment = None;
        }
        if let Some(session) = state.signing_sessions.get_mut(session_id) {
            session.aborted = true;
        }
        Ok(())
    }

    async fn generate_quick_code(&self, request: &QuickCodeRequest) -> Result<QuickCode> {
        self.network_check()?;
        let claims = self.jwt_claims(&request.jwt)?;
        if claims.scope != AuthScope::QuickCode || request.project_id != self.project_id {
            return Err(Error::VerificationFailed { reason: Some("token not granted for QuickCodes".into()) });
        }
        let expire_time = self.clock.now() + QUICK_CODE_TTL;
        let code = format!("{:06}", OsRng.next_u32() % 1_000_000);
        self.state().quick_codes.insert(code.clone(), (claims.sub, expire_time));
        debug!(device = %request.device_name, "quick code issued");
        Ok(QuickCode { code, expire_time, ttl_seconds: QUICK_CODE_TTL })
    }
}

/// 16 random bytes, for challenges opened in tests and tools.
pub fn random_nonce() -> Vec<u8> {
    let mut nonce = vec![0u8; 16];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
