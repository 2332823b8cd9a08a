// -*- mode: rust; -*-
//
// This file is part of pinproof.
// See LICENSE for licensing information.

//! Channel carriers of a challenge.
//!
//! A challenge reaches the device as a scanned QR code, an opened universal
//! link, or a push notification.  Each carrier decodes to the same
//! canonical [`ChallengeLocator`], so the session orchestrator never knows
//! which one delivered the session.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::{Error, Result};

/// Query parameter of a universal link naming the session.
pub const LINK_SESSION_PARAM: &str = "session_id";

/// Query parameter of a universal link naming the challenge endpoint.
pub const LINK_ENDPOINT_PARAM: &str = "endpoint";

const MAX_SESSION_ID_LENGTH: usize = 128;

/// Which carrier delivered a challenge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CarrierKind {
    /// A scanned QR code.
    QrCode,
    /// An opened universal link.
    UniversalLink,
    /// A push notification.
    Push,
    /// A session the client opened itself.
    Direct,
}

/// Canonical pointer to a challenge: the session and where to fetch it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeLocator {
    /// Session identifier.
    pub session_id: String,
    /// Normalized challenge endpoint URL.
    pub endpoint: String,
}

impl ChallengeLocator {
    /// Validate and normalize a session id and endpoint.
    pub fn new(session_id: &str, endpoint: &str) -> Result<ChallengeLocator> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(Error::MalformedPayload("missing session id".into()));
        }
        if session_id.len() > MAX_SESSION_ID_LENGTH || !session_id.bytes().all(|b| b.is_ascii_graphic() && b != b'#') {
            return Err(Error::MalformedPayload("invalid session id".into()));
        }
        let url = Url::parse(endpoint.trim())?;
        if !matches!(url.scheme(), "https" | "http") {
            return Err(Error::MalformedPayload(format!("unsupported endpoint scheme {}", url.scheme())));
        }
        if url.fragment().is_some() {
            return Err(Error::MalformedPayload("endpoint carries a fragment".into()));
        }
        Ok(ChallengeLocator { session_id: session_id.to_owned(), endpoint: url.to_string() })
    }

    /// Canonical byte encoding: length prefixed session id and endpoint.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.session_id.len() + self.endpoint.len());
        for part in [self.session_id.as_bytes(), self.endpoint.as_bytes()] {
            out.extend_from_slice(&(part.len() as u32).to_be_bytes());
            out.extend_from_slice(part);
        }
        out
    }
}

/// A payload that carries a challenge locator.
pub trait ChallengeCarrier: Send + Sync {
    /// Which carrier this is.
    fn kind(&self) -> CarrierKind;

    /// Decode into the canonical locator.
    fn decode(&self) -> Result<ChallengeLocator>;

    /// PIN length announced by the carrier, if it announces one.
    fn pin_length_hint(&self) -> Option<usize> {
        None
    }
}

/// QR code text: `<challengeEndpoint>#<sessionId>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QrCode(pub String);

impl QrCode {
    /// Encode a locator.
    pub fn from_locator(locator: &ChallengeLocator) -> QrCode {
        QrCode(format!("{}#{}", locator.endpoint, locator.session_id))
    }
}

impl ChallengeCarrier for QrCode {
    fn kind(&self) -> CarrierKind {
        CarrierKind::QrCode
    }

    fn decode(&self) -> Result<ChallengeLocator> {
        let (endpoint, session_id) = self
            .0
            .trim()
            .split_once('#')
            .ok_or_else(|| Error::MalformedPayload("QR code has no session id".into()))?;
        ChallengeLocator::new(session_id, endpoint)
    }
}

/// Universal link carrying `session_id` and `endpoint` query parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UniversalLink(pub String);

impl UniversalLink {
    /// Encode a locator as a link under `base`.
    pub fn from_locator(base: &Url, locator: &ChallengeLocator) -> UniversalLink {
        let mut url = base.clone();
        url.query_pairs_mut()
            .append_pair(LINK_SESSION_PARAM, &locator.session_id)
            .append_pair(LINK_ENDPOINT_PARAM, &locator.endpoint);
        UniversalLink(url.to_string())
    }
}

impl ChallengeCarrier for UniversalLink {
    fn kind(&self) -> CarrierKind {
        CarrierKind::UniversalLink
    }

    fn decode(&self) -> Result<ChallengeLocator> {
        let url = Url::parse(self.0.trim())?;
        let mut session_id = None;
        let mut endpoint = None;
        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                LINK_SESSION_PARAM => session_id = Some(value.into_owned()),
                LINK_ENDPOINT_PARAM => endpoint = Some(value.into_owned()),
                _ => {}
            }
        }
        match (session_id, endpoint) {
            (Some(s), Some(e)) => ChallengeLocator::new(&s, &e),
            _ => Err(Error::MalformedPayload("link lacks session_id or endpoint".into())),
        }
    }
}

/// Push notification payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
    /// Session identifier.
    pub session_id: String,
    /// Where to fetch the challenge.
    pub challenge_endpoint: String,
    /// Length of the PIN the user is asked for.
    #[serde(default)]
    pub pin_length: Option<usize>,
}

impl PushPayload {
    /// Parse a JSON push payload.
    pub fn from_json(json: &str) -> Result<PushPayload> {
        Ok(serde_json::from_str(json)?)
    }

    /// Encode a locator.
    pub fn from_locator(locator: &ChallengeLocator, pin_length: Option<usize>) -> PushPayload {
        PushPayload {
            session_id: locator.session_id.clone(),
            challenge_endpoint: locator.endpoint.clone(),
            pin_length,
        }
    }
}

impl ChallengeCarrier for PushPayload {
    fn kind(&self) -> CarrierKind {
        CarrierKind::Push
    }

    fn decode(&self) -> Result<ChallengeLocator> {
        ChallengeLocator::new(&self.session_id, &self.challenge_endpoint)
    }

    fn pin_length_hint(&self) -> Option<usize> {
        self.pin_length
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const ENDPOINT: &str = "https://verifier.example.com/rps/challenge";

    #[test]
    fn carriers_decode_to_identical_locators() {
        let qr = QrCode(format!("{}#S1", ENDPOINT));
        let link = UniversalLink(format!(
            "https://app.example.com/auth?session_id=S1&endpoint={}",
            "https%3A%2F%2Fverifier.example.com%2Frps%2Fchallenge"
        ));
        let push = PushPayload::from_json(&format!(
            r#"{{"sessionId":"S1","challengeEndpoint":"{}","pinLength":4}}"#,
            ENDPOINT
        ))
        .unwrap();

        let a = qr.decode().unwrap();
        let b = link.decode().unwrap();
        let c = push.decode().unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.to_bytes(), c.to_bytes());
        assert_eq!(push.pin_length_hint(), Some(4));
        assert_eq!(qr.pin_length_hint(), None);
    }

    #[test]
    fn encoders_invert_decoders() {
        let locator = ChallengeLocator::new("S-42", ENDPOINT).unwrap();
        let base = Url::parse("https://app.example.com/auth").unwrap();
        assert_eq!(QrCode::from_locator(&locator).decode().unwrap(), locator);
        assert_eq!(UniversalLink::from_locator(&base, &locator).decode().unwrap(), locator);
        assert_eq!(PushPayload::from_locator(&locator, None).decode().unwrap(), locator);
    }

    #[test]
    fn fragment_marks_agree_across_carriers() {
        let qr = QrCode(format!("{}#S#1", ENDPOINT));
        let link = UniversalLink(format!(
            "https://app.example.com/auth?session_id=S%231&endpoint={}",
            "https%3A%2F%2Fverifier.example.com%2Frps%2Fchallenge"
        ));
        let push = PushPayload::from_locator(
            &ChallengeLocator { session_id: "S#1".into(), endpoint: ENDPOINT.into() },
            None,
        );
        let invalid = Error::MalformedPayload("invalid session id".into());
        assert_eq!(qr.decode().unwrap_err(), invalid);
        assert_eq!(link.decode().unwrap_err(), invalid);
        assert_eq!(push.decode().unwrap_err(), invalid);
    }

    #[test]
    fn endpoints_are_normalized() {
        let a = ChallengeLocator::new("S1", "HTTPS://Verifier.Example.com").unwrap();
        let b = ChallengeLocator::new("S1", "https://verifier.example.com/").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn malformed_payloads() {
        let malformed = |r: Result<ChallengeLocator>| matches!(r, Err(Error::MalformedPayload(_)));
        assert!(malformed(QrCode(ENDPOINT.into()).decode()));
        assert!(malformed(QrCode(format!("{}#", ENDPOINT)).decode()));
        assert!(malformed(QrCode("not a url#S1".into()).decode()));
        assert!(malformed(QrCode("ftp://verifier.example.com#S1".into()).decode()));
        assert!(malformed(UniversalLink("https://app.example.com/auth?session_id=S1".into()).decode()));
        assert!(malformed(ChallengeLocator::new("S 1", ENDPOINT)));
        assert!(malformed(ChallengeLocator::new("S#1", ENDPOINT)));
        assert!(matches!(PushPayload::from_json("{\"sessionId\":1}"), Err(Error::MalformedPayload(_))));
    }
}
