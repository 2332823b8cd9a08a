// -*- mode: rust; -*-
//
// This file is part of pinproof.
// See LICENSE for licensing information.

//! Session orchestration.
//!
//! A session walks
//!
//! ```text
//! Created → ChallengeReceived → PinEntered → ProofComputed → Submitted → {Verified | Rejected | Expired}
//! ```
//!
//! without skipping a state.  `PinEntered` may be re-entered after
//! `ProofComputed`, which discards the earlier proof.  A session whose
//! challenge expires before `Submitted` ends `Expired`; an aborted session
//! ends `Rejected`.
//!
//! The [`Orchestrator`] drives sessions against a [`VerifierApi`], taking
//! the token out of the [`TokenStore`] under the identity's lock for one
//! proof construction at a time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::api::{
    ActivationTokenResponse, AuthScope, AuthenticationSessionDetails, Pass1Request, Pass2Request, QuickCode,
    QuickCodeRequest, SignatureRequest, SigningSessionStatus, VerificationConfirmationRequest, VerifierApi,
};
use crate::channel::{CarrierKind, ChallengeCarrier, ChallengeLocator};
use crate::config::ClientConfig;
use crate::errors::{Error, Result};
use crate::identity::IdentityKey;
use crate::pairing::{hex_codec, PairingContext};
use crate::proof::{commit, Challenge, Proof};
use crate::registration::{PinProvider, PinPurpose};
use crate::secret::Pin;
use crate::retry::{retry, CancelHandle};
use crate::sign::{sign, Signature, SigningSessionDetails};
use crate::store::{IdentityLocks, Registration, TokenStore};

/// Source of the current time, in seconds since the Unix epoch.
pub trait Clock: Send + Sync {
    /// The current time.
    fn now(&self) -> u64;
}

/// The operating system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    /// A clock reading `now`.
    pub fn new(now: u64) -> ManualClock {
        ManualClock(AtomicU64::new(now))
    }

    /// Set the time.
    pub fn set(&self, now: u64) {
        self.0.store(now, Ordering::SeqCst);
    }

    /// Move the time forward by `secs`.
    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// State of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Session id allocated and carrier decoded.
    Created,
    /// Challenge fetched from the verifier.
    ChallengeReceived,
    /// PIN obtained; the engine is running.
    PinEntered,
    /// Proof or signature ready.
    ProofComputed,
    /// Proof or signature sent.
    Submitted,
    /// The verifier accepted.
    Verified,
    /// The verifier rejected, or the session was aborted.
    Rejected,
    /// The challenge expired before submission.
    Expired,
}

impl SessionState {
    /// Name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Created => "Created",
            SessionState::ChallengeReceived => "ChallengeReceived",
            SessionState::PinEntered => "PinEntered",
            SessionState::ProofComputed => "ProofComputed",
            SessionState::Submitted => "Submitted",
            SessionState::Verified => "Verified",
            SessionState::Rejected => "Rejected",
            SessionState::Expired => "Expired",
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Verified | SessionState::Rejected | SessionState::Expired)
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_advance_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (*self, next) {
            (Created, ChallengeReceived)
            | (ChallengeReceived, PinEntered)
            | (PinEntered, ProofComputed)
            | (ProofComputed, PinEntered)
            | (ProofComputed, Submitted)
            | (Submitted, Verified)
            | (Submitted, Rejected) => true,
            (Created | ChallengeReceived | PinEntered | ProofComputed, Expired | Rejected) => true,
            _ => false,
        }
    }
}

/// What a session asks of the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionKind {
    /// Prove possession of the identity secret.
    Authentication,
    /// Sign a message digest.
    Signing,
}

enum Artifact {
    Proof(Proof),
    Signature(Signature),
}

enum Submission {
    Proof(Pass2Request),
    Signature(SignatureRequest),
}

/// One authentication or signing session.
pub struct Session {
    kind: SessionKind,
    carrier: CarrierKind,
    locator: ChallengeLocator,
    state: SessionState,
    history: Vec<SessionState>,
    challenge: Option<Challenge>,
    signing: Option<SigningSessionDetails>,
    identity: Option<IdentityKey>,
    artifact: Option<Artifact>,
    scope: AuthScope,
    jwt: Option<String>,
    cancel: CancelHandle,
}

impl core::fmt::Debug for Session {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.locator.session_id)
            .field("kind", &self.kind)
            .field("carrier", &self.carrier)
            .field("state", &self.state)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl Session {
    fn new(kind: SessionKind, carrier: CarrierKind, locator: ChallengeLocator) -> Session {
        Session {
            kind,
            carrier,
            locator,
            state: SessionState::Created,
            history: vec![SessionState::Created],
            challenge: None,
            signing: None,
            identity: None,
            artifact: None,
            scope: AuthScope::Session,
            jwt: None,
            cancel: CancelHandle::new(),
        }
    }

    /// The session identifier.
    pub fn id(&self) -> &str {
        &self.locator.session_id
    }

    /// What the session asks of the user.
    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// The carrier that delivered the session.
    pub fn carrier(&self) -> CarrierKind {
        self.carrier
    }

    /// Canonical locator of the session.
    pub fn locator(&self) -> &ChallengeLocator {
        &self.locator
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every state visited, in order.
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    /// The authentication challenge, once received.
    pub fn challenge(&self) -> Option<&Challenge> {
        self.challenge.as_ref()
    }

    /// The signing request, once received.
    pub fn signing_details(&self) -> Option<&SigningSessionDetails> {
        self.signing.as_ref()
    }

    /// The computed proof, if any.
    pub fn proof(&self) -> Option<&Proof> {
        match &self.artifact {
            Some(Artifact::Proof(p)) => Some(p),
            _ => None,
        }
    }

    /// The computed signature, if any.
    pub fn signature(&self) -> Option<&Signature> {
        match &self.artifact {
            Some(Artifact::Signature(s)) => Some(s),
            _ => None,
        }
    }

    /// What a successful authentication grants.
    pub fn scope(&self) -> AuthScope {
        self.scope
    }

    /// Token granted by a `jwt` or `reg-code` scoped authentication.
    pub fn jwt(&self) -> Option<&str> {
        self.jwt.as_deref()
    }

    /// Handle cancelling this session's pending network calls.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    fn expires_at(&self) -> Option<u64> {
        match (&self.challenge, &self.signing) {
            (Some(c), _) => Some(c.expires_at()),
            (None, Some(d)) => Some(d.expires_at),
            (None, None) => None,
        }
    }

    /// Move to `next`, or fail with `InvalidTransition`.
    pub(crate) fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(Error::InvalidTransition { from: self.state.name(), to: next.name() });
        }
        if next == SessionState::PinEntered {
            self.artifact = None;
        }
        debug!(session_id = %self.locator.session_id, from = self.state.name(), to = next.name(), "session transition");
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Fail the session with `SessionExpired` once its challenge expired.
    fn check_expiry(&mut self, now: u64) -> Result<()> {
        match self.expires_at() {
            Some(at) if now >= at && !self.state.is_terminal() => {
                self.transition(SessionState::Expired)?;
                warn!(session_id = %self.locator.session_id, "session expired");
                Err(Error::SessionExpired { session_id: self.locator.session_id.clone() })
            }
            _ => Ok(()),
        }
    }
}

/// Drives sessions against one verifier.
pub struct Orchestrator {
    ctx: Arc<dyn PairingContext>,
    config: ClientConfig,
    verifier: Arc<dyn VerifierApi>,
    store: Arc<dyn TokenStore>,
    locks: Arc<IdentityLocks>,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    /// An orchestrator reading tokens from `store`.
    pub fn new(
        ctx: Arc<dyn PairingContext>,
        config: ClientConfig,
        verifier: Arc<dyn VerifierApi>,
        store: Arc<dyn TokenStore>,
        locks: Arc<IdentityLocks>,
        clock: Arc<dyn Clock>,
    ) -> Result<Orchestrator> {
        config.validate()?;
        Ok(Orchestrator { ctx, config, verifier, store, locks, clock })
    }

    /// Decode a carrier into a new session.
    pub fn open(&self, carrier: &dyn ChallengeCarrier, kind: SessionKind) -> Result<Session> {
        if kind == SessionKind::Signing && !self.config.signing_enabled {
            return Err(Error::Config("signing is disabled".into()));
        }
        let locator = carrier.decode()?;
        debug!(session_id = %locator.session_id, carrier = ?carrier.kind(), "session created");
        Ok(Session::new(kind, carrier.kind(), locator))
    }

    /// Fetch the session's challenge or signing request.
    pub async fn receive_challenge(&self, session: &mut Session) -> Result<()> {
        if !session.state.can_advance_to(SessionState::ChallengeReceived) {
            return Err(Error::InvalidTransition {
                from: session.state.name(),
                to: SessionState::ChallengeReceived.name(),
            });
        }
        let verifier = &self.verifier;
        let locator = session.locator.clone();
        match session.kind {
            SessionKind::Authentication => {
                let challenge = retry(&self.config.retry, &session.cancel, "fetch_challenge", || {
                    verifier.fetch_challenge(&locator)
                })
                .await?;
                if challenge.session_id != locator.session_id {
                    return Err(Error::MalformedPayload("challenge for another session".into()));
                }
                session.challenge = Some(challenge.or_ttl(self.config.default_challenge_ttl));
            }
            SessionKind::Signing => {
                let details = retry(&self.config.retry, &session.cancel, "fetch_signing_session", || {
                    verifier.fetch_signing_session(&locator)
                })
                .await?;
                if details.session_id != locator.session_id {
                    return Err(Error::MalformedPayload("signing request for another session".into()));
                }
                session.signing = Some(details);
            }
        }
        session.transition(SessionState::ChallengeReceived)?;
        session.check_expiry(self.clock.now())
    }

    /// Obtain the PIN and compute the proof or signature.
    ///
    /// Callable from `ChallengeReceived`, or again from `ProofComputed`
    /// to discard the earlier proof and build a fresh one.  The session only
    /// moves once the proof is built: a failed attempt leaves it where it
    /// was, without any earlier proof, ready for another PIN entry.
    pub async fn enter_pin(&self, session: &mut Session, identity: &IdentityKey, pins: &dyn PinProvider) -> Result<()> {
        if !session.state.can_advance_to(SessionState::PinEntered) {
            return Err(Error::InvalidTransition {
                from: session.state.name(),
                to: SessionState::PinEntered.name(),
            });
        }
        session.check_expiry(self.clock.now())?;

        let _guard = self.locks.lock(identity).await;
        let registration = self
            .store
            .load(identity)
            .await?
            .ok_or_else(|| Error::UnknownIdentity(identity.to_string()))?;
        registration.ensure_active()?;

        let purpose = match session.kind {
            SessionKind::Authentication => PinPurpose::Authenticate,
            SessionKind::Signing => PinPurpose::Sign,
        };
        let pin = pins
            .request_pin(&registration.identity.user_id, purpose, Some(registration.pin_length))
            .await
            .ok_or(Error::CancelledOperation)?;
        pin.ensure_length(registration.pin_length, registration.pin_length)?;

        let now = self.clock.now();
        session.check_expiry(now)?;
        session.artifact = None;
        let artifact = self.compute(session, &registration, pin, now).await?;

        session.transition(SessionState::PinEntered)?;
        session.identity = Some(identity.clone());
        session.artifact = Some(artifact);
        session.transition(SessionState::ProofComputed)?;
        debug!(session_id = %session.id(), user_id = %registration.identity.user_id, "proof computed");
        Ok(())
    }

    async fn compute(&self, session: &Session, registration: &Registration, pin: Pin, now: u64) -> Result<Artifact> {
        let missing = || Error::InvalidTransition { from: SessionState::Created.name(), to: SessionState::PinEntered.name() };
        match session.kind {
            SessionKind::Authentication => {
                let challenge = session.challenge.as_ref().ok_or_else(missing)?;
                let pending = commit(
                    self.ctx.as_ref(),
                    &registration.token,
                    &pin,
                    &registration.identity,
                    challenge,
                    now,
                )?;
                drop(pin);
                let request = Pass1Request {
                    user_id: registration.identity.user_id.clone(),
                    project_id: registration.identity.project_id.clone(),
                    session_id: challenge.session_id.clone(),
                    u: pending.u_hex(),
                    scope: vec![session.scope],
                };
                let verifier = &self.verifier;
                let response = retry(&self.config.retry, &session.cancel, "pass1", || verifier.pass1(&request)).await;
                let response = self.note_revocation(registration, response).await?;
                if response.session_id != challenge.session_id {
                    return Err(Error::MalformedPayload("pass 1 answered another session".into()));
                }
                let y = hex_codec::scalar_from(&response.y)?;
                Ok(Artifact::Proof(pending.respond(&y)?))
            }
            SessionKind::Signing => {
                let details = session.signing.as_ref().ok_or_else(missing)?;
                let signature = sign(self.ctx.as_ref(), &registration.token, &pin, &registration.identity, details, now)?;
                Ok(Artifact::Signature(signature))
            }
        }
    }

    /// Send the proof or signature and record the verifier's answer.
    ///
    /// A rejection moves the session to `Rejected` and fails with
    /// `VerificationFailed`.
    pub async fn submit(&self, session: &mut Session) -> Result<()> {
        if !session.state.can_advance_to(SessionState::Submitted) {
            return Err(Error::InvalidTransition {
                from: session.state.name(),
                to: SessionState::Submitted.name(),
            });
        }
        session.check_expiry(self.clock.now())?;
        let identity = session.identity.clone().ok_or(Error::InvalidTransition {
            from: session.state.name(),
            to: SessionState::Submitted.name(),
        })?;
        let registration = self
            .store
            .load(&identity)
            .await?
            .ok_or_else(|| Error::UnknownIdentity(identity.to_string()))?;
        let submission = match &session.artifact {
            Some(Artifact::Proof(proof)) => {
                Submission::Proof(Pass2Request { session_id: proof.session_id.clone(), v: proof.v_hex() })
            }
            Some(Artifact::Signature(signature)) => Submission::Signature(SignatureRequest {
                user_id: registration.identity.user_id.clone(),
                project_id: registration.identity.project_id.clone(),
                session_id: signature.session_id.clone(),
                u: hex_codec::g1(&signature.U),
                v: hex_codec::g1(&signature.V),
                timestamp: signature.timestamp,
                message_digest: hex::encode(&signature.digest),
            }),
            None => {
                return Err(Error::InvalidTransition {
                    from: session.state.name(),
                    to: SessionState::Submitted.name(),
                })
            }
        };

        let verifier = &self.verifier;
        let outcome = match submission {
            Submission::Proof(request) => {
                let response = retry(&self.config.retry, &session.cancel, "pass2", || verifier.pass2(&request)).await;
                if matches!(response, Err(Error::CancelledOperation)) {
                    return Err(Error::CancelledOperation);
                }
                session.transition(SessionState::Submitted)?;
                match self.note_revocation(&registration, response).await {
                    Ok(r) if r.verified => match (session.scope, r.jwt) {
                        (AuthScope::Session, _) => Ok(()),
                        (_, Some(jwt)) => {
                            session.jwt = Some(jwt);
                            Ok(())
                        }
                        (_, None) => Err(Error::MalformedPayload("verdict carries no token".into())),
                    },
                    Ok(r) => Err(Error::VerificationFailed { reason: r.reason }),
                    Err(err) => Err(err),
                }
            }
            Submission::Signature(request) => {
                let response = retry(&self.config.retry, &session.cancel, "submit_signature", || {
                    verifier.submit_signature(&request)
                })
                .await;
                if matches!(response, Err(Error::CancelledOperation)) {
                    return Err(Error::CancelledOperation);
                }
                session.transition(SessionState::Submitted)?;
                match self.note_revocation(&registration, response).await {
                    Ok(r) if r.verified && r.status == SigningSessionStatus::Signed => Ok(()),
                    Ok(_) => Err(Error::rejected()),
                    Err(err) => Err(err),
                }
            }
        };

        match outcome {
            Ok(()) => {
                session.transition(SessionState::Verified)?;
                info!(session_id = %session.id(), user_id = %registration.identity.user_id, "session verified");
                Ok(())
            }
            Err(err) => {
                session.transition(SessionState::Rejected)?;
                warn!(session_id = %session.id(), user_id = %registration.identity.user_id, error = %err, "session rejected");
                Err(err)
            }
        }
    }

    /// Abandon a session: tell the verifier and end it `Rejected`.
    pub async fn abort(&self, session: &mut Session) -> Result<()> {
        if session.state.is_terminal() {
            return Err(Error::InvalidTransition { from: session.state.name(), to: SessionState::Rejected.name() });
        }
        session.cancel.cancel();
        if session.state != SessionState::Submitted {
            let verifier = &self.verifier;
            let id = session.locator.session_id.clone();
            if let Err(err) = retry(&self.config.retry, &CancelHandle::new(), "abort", || verifier.abort(&id)).await {
                warn!(session_id = %id, error = %err, "abort not delivered");
            }
        }
        session.artifact = None;
        session.transition(SessionState::Rejected)?;
        info!(session_id = %session.id(), "session aborted");
        Ok(())
    }

    /// Run an authentication session from carrier to verdict.
    pub async fn authenticate(
        &self,
        carrier: &dyn ChallengeCarrier,
        identity: &IdentityKey,
        pins: &dyn PinProvider,
    ) -> Result<Session> {
        self.run(carrier, SessionKind::Authentication, identity, pins).await
    }

    /// Run a signing session from carrier to verdict.
    pub async fn sign(&self, carrier: &dyn ChallengeCarrier, identity: &IdentityKey, pins: &dyn PinProvider) -> Result<Session> {
        self.run(carrier, SessionKind::Signing, identity, pins).await
    }

    /// Describe the authentication session a carrier points at, without
    /// starting it.
    pub async fn session_details(&self, carrier: &dyn ChallengeCarrier) -> Result<AuthenticationSessionDetails> {
        let locator = carrier.decode()?;
        let verifier = &self.verifier;
        let details = retry(&self.config.retry, &CancelHandle::new(), "fetch_session_details", || {
            verifier.fetch_session_details(&locator)
        })
        .await?;
        if !details.session_id.is_empty() && details.session_id != locator.session_id {
            return Err(Error::MalformedPayload("details for another session".into()));
        }
        Ok(AuthenticationSessionDetails { session_id: locator.session_id, ..details })
    }

    /// Exchange a confirmed identity verification for an activation token.
    pub async fn activation_token(&self, confirmation: &VerificationConfirmationRequest) -> Result<ActivationTokenResponse> {
        let verifier = &self.verifier;
        let token = retry(&self.config.retry, &CancelHandle::new(), "confirm_verification", || {
            verifier.confirm_verification(confirmation)
        })
        .await?;
        if token.project_id != self.config.project_id {
            return Err(Error::ProjectMismatch);
        }
        info!(user_id = %confirmation.user_id, "activation token obtained");
        Ok(token)
    }

    /// Authenticate `identity` for a JWT the relying party's backend can
    /// check.
    pub async fn generate_jwt(&self, identity: &IdentityKey, pins: &dyn PinProvider) -> Result<String> {
        let session = self.run_scoped(AuthScope::Jwt, identity, pins).await?;
        session.jwt.ok_or_else(|| Error::MalformedPayload("verdict carries no token".into()))
    }

    /// Authenticate `identity` and turn the result into a QuickCode that
    /// verifies the user on another device.
    ///
    /// Fails with `LimitedQuickCodeGeneration` for registrations that were
    /// themselves verified through a QuickCode, when the project limits
    /// those.
    pub async fn generate_quick_code(&self, identity: &IdentityKey, pins: &dyn PinProvider) -> Result<QuickCode> {
        let session = self.run_scoped(AuthScope::QuickCode, identity, pins).await?;
        let request = QuickCodeRequest {
            project_id: self.config.project_id.clone(),
            jwt: session.jwt.ok_or_else(|| Error::MalformedPayload("verdict carries no token".into()))?,
            device_name: self.config.device_name.clone(),
        };
        let verifier = &self.verifier;
        let code = retry(&self.config.retry, &CancelHandle::new(), "generate_quick_code", || {
            verifier.generate_quick_code(&request)
        })
        .await?;
        info!(identity = %identity, ttl = code.ttl_seconds, "quick code generated");
        Ok(code)
    }

    async fn run_scoped(&self, scope: AuthScope, identity: &IdentityKey, pins: &dyn PinProvider) -> Result<Session> {
        let verifier = &self.verifier;
        let locator =
            retry(&self.config.retry, &CancelHandle::new(), "open_session", || verifier.open_session(scope)).await?;
        let mut session = Session::new(SessionKind::Authentication, CarrierKind::Direct, locator);
        session.scope = scope;
        self.receive_challenge(&mut session).await?;
        self.enter_pin(&mut session, identity, pins).await?;
        self.submit(&mut session).await?;
        Ok(session)
    }

    async fn run(
        &self,
        carrier: &dyn ChallengeCarrier,
        kind: SessionKind,
        identity: &IdentityKey,
        pins: &dyn PinProvider,
    ) -> Result<Session> {
        let mut session = self.open(carrier, kind)?;
        self.receive_challenge(&mut session).await?;
        self.enter_pin(&mut session, identity, pins).await?;
        self.submit(&mut session).await?;
        Ok(session)
    }

    async fn note_revocation<T>(&self, registration: &Registration, response: Result<T>) -> Result<T> {
        if let Err(Error::RevokedIdentity) = &response {
            warn!(user_id = %registration.identity.user_id, "identity revoked by verifier");
            self.store.mark_revoked(&registration.key()).await?;
        }
        response
    }
}
