// -*- mode: rust; -*-
//
// This file is part of pinproof.
// See LICENSE for licensing information.

//! Errors which may occur while registering identities, building proofs
//! or signatures, decoding channel payloads, or talking to the issuing
//! authority and verifier.

use thiserror::Error;

/// A result carrying a protocol [`Error`].
pub type Result<T> = core::result::Result<T, Error>;

/// Errors of the authentication and signing protocol.
///
/// Wrong PINs and forged proofs both surface as `VerificationFailed`, and only
/// from the verifier. Nothing here ever carries a PIN, a token, or any
/// intermediate secret value.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// The issuing authority rejected the activation token.
    #[error("Invalid activation token")]
    InvalidActivationToken,

    /// The identity was revoked or expired by the issuing authority.
    #[error("Identity is revoked")]
    RevokedIdentity,

    /// The challenge time-to-live elapsed before the proof was built.
    #[error("Challenge expired: session_id={session_id}")]
    ExpiredChallenge {
        /// Session the challenge belonged to.
        session_id: String,
    },

    /// A channel payload or wire message could not be decoded.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// A call to the issuing authority or verifier failed in transit.
    ///
    /// This is the only retryable variant.
    #[error("Network failure: {0}")]
    NetworkFailure(String),

    /// The verifier rejected the proof or signature.
    #[error("Verification failed")]
    VerificationFailed {
        /// Reason reported by the verifier, if any.
        reason: Option<String>,
    },

    /// An arithmetic invariant was violated. Fatal, never retried.
    #[error("Crypto primitive failure: {0}")]
    CryptoPrimitiveFailure(&'static str),

    /// The session was abandoned after its challenge expired.
    #[error("Session expired: session_id={session_id}")]
    SessionExpired {
        /// The expired session.
        session_id: String,
    },

    /// The caller cancelled the operation, or the PIN entry was dismissed.
    #[error("Operation cancelled")]
    CancelledOperation,

    /// The PIN has non-digit characters or the wrong length.
    #[error("PIN must be {min}..={max} digits")]
    InvalidPin {
        /// Smallest accepted length.
        min: usize,
        /// Largest accepted length.
        max: usize,
    },

    /// The issuer issued a share on a curve this client does not speak.
    #[error("Unsupported elliptic curve: {0}")]
    UnsupportedCurve(String),

    /// The issuer answered for a different project.
    #[error("Registration was started for a different project")]
    ProjectMismatch,

    /// The registration was verified through a QuickCode and may not issue
    /// one itself.
    #[error("QuickCode generation is not allowed for this registration")]
    LimitedQuickCodeGeneration,

    /// No registration exists in the token store for this identity.
    #[error("No registration for identity {0}")]
    UnknownIdentity(String),

    /// A session transition skipped or reversed a state.
    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition {
        /// State the session was in.
        from: &'static str,
        /// State that was requested.
        to: &'static str,
    },

    /// The token store failed to read, write or unseal a record.
    #[error("Token storage failure: {0}")]
    Storage(String),

    /// An error in the length of bytes handed to a constructor.
    #[error("{name} must be {length} bytes in length")]
    BytesLength {
        /// Identifies the type returning the error.
        name: &'static str,
        /// Length expected by the constructor in bytes.
        length: usize,
    },

    /// Bytes do not encode a valid group element.
    #[error("Cannot decode {0} point")]
    PointDecoding(&'static str),

    /// Bytes do not encode a canonical scalar.
    #[error("Cannot decode scalar")]
    ScalarFormat,

    /// Client configuration is missing a value or holds an invalid one.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NetworkFailure(_))
    }

    /// Shorthand for a verifier rejection without a reason.
    pub(crate) fn rejected() -> Error {
        Error::VerificationFailed { reason: None }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Error {
        Error::MalformedPayload(err.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(err: hex::FromHexError) -> Error {
        Error::MalformedPayload(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Error {
        Error::MalformedPayload(err.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn only_network_failures_retry() {
        assert!(Error::NetworkFailure("timeout".into()).is_retryable());
        assert!(!Error::rejected().is_retryable());
        assert!(!Error::CryptoPrimitiveFailure("hash to curve").is_retryable());
        assert!(!Error::ExpiredChallenge { session_id: "S1".into() }.is_retryable());
    }

    #[test]
    fn display_is_stable() {
        let e = Error::BytesLength { name: "Token", length: 48 };
        assert_eq!(e.to_string(), "Token must be 48 bytes in length");
        let e = Error::InvalidPin { min: 4, max: 6 };
        assert_eq!(e.to_string(), "PIN must be 4..=6 digits");
    }

    #[test]
    fn hex_errors_are_malformed_payloads() {
        let err: Error = hex::decode("zz").unwrap_err().into();
        assert!(matches!(err, Error::MalformedPayload(_)));
    }
}
