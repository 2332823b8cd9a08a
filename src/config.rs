// -*- mode: rust; -*-
//
// This file is part of pinproof.
// See LICENSE for licensing information.

//! Client configuration.

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::retry::RetryPolicy;
use crate::secret::{MAX_PIN_LENGTH, MIN_PIN_LENGTH};

/// Settings of one client instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Project every identity of this client belongs to.
    pub project_id: String,
    /// Name reported for this device at registration.
    pub device_name: String,
    /// Shortest PIN accepted at registration.
    pub min_pin_length: usize,
    /// Longest PIN accepted at registration.
    pub max_pin_length: usize,
    /// TTL assumed for challenges that do not state one, in seconds.
    pub default_challenge_ttl: u64,
    /// Whether new registrations are bound to a device key.
    pub bind_device_key: bool,
    /// Whether this client may answer signing sessions.
    pub signing_enabled: bool,
    /// Retry bounds for network calls.
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            project_id: String::new(),
            device_name: "pinproof".to_string(),
            min_pin_length: MIN_PIN_LENGTH,
            max_pin_length: MAX_PIN_LENGTH,
            default_challenge_ttl: 120,
            bind_device_key: false,
            signing_enabled: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// A default configuration for `project_id`.
    pub fn new(project_id: impl Into<String>) -> ClientConfig {
        ClientConfig { project_id: project_id.into(), ..ClientConfig::default() }
    }

    /// Load configuration from `PINPROOF_*` environment variables.
    ///
    /// `PINPROOF_PROJECT_ID` is required, everything else falls back to
    /// its default.
    pub fn from_env() -> Result<ClientConfig> {
        ClientConfig::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<ClientConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ClientConfig::default();
        let parse = |name: &str| -> Result<Option<u64>> {
            match lookup(name) {
                Some(v) => v
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| Error::Config(format!("{} must be an unsigned integer", name))),
                None => Ok(None),
            }
        };
        let flag = |name: &str, default: bool| -> Result<bool> {
            match lookup(name).as_deref().map(str::trim) {
                None => Ok(default),
                Some("1") | Some("true") => Ok(true),
                Some("0") | Some("false") => Ok(false),
                Some(_) => Err(Error::Config(format!("{} must be true or false", name))),
            }
        };

        let project_id = lookup("PINPROOF_PROJECT_ID")
            .ok_or_else(|| Error::Config("PINPROOF_PROJECT_ID is required".into()))?;

        let config = ClientConfig {
            project_id,
            device_name: lookup("PINPROOF_DEVICE_NAME").unwrap_or(defaults.device_name),
            min_pin_length: narrow("PINPROOF_MIN_PIN_LENGTH", parse("PINPROOF_MIN_PIN_LENGTH")?, defaults.min_pin_length)?,
            max_pin_length: narrow("PINPROOF_MAX_PIN_LENGTH", parse("PINPROOF_MAX_PIN_LENGTH")?, defaults.max_pin_length)?,
            default_challenge_ttl: parse("PINPROOF_CHALLENGE_TTL_SECONDS")?.unwrap_or(defaults.default_challenge_ttl),
            bind_device_key: flag("PINPROOF_BIND_DEVICE_KEY", defaults.bind_device_key)?,
            signing_enabled: flag("PINPROOF_SIGNING_ENABLED", defaults.signing_enabled)?,
            retry: RetryPolicy {
                max_attempts: narrow(
                    "PINPROOF_RETRY_MAX_ATTEMPTS",
                    parse("PINPROOF_RETRY_MAX_ATTEMPTS")?,
                    defaults.retry.max_attempts,
                )?,
                base_delay_ms: parse("PINPROOF_RETRY_BASE_DELAY_MS")?.unwrap_or(defaults.retry.base_delay_ms),
                max_delay_ms: parse("PINPROOF_RETRY_MAX_DELAY_MS")?.unwrap_or(defaults.retry.max_delay_ms),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.project_id.trim().is_empty() {
            return Err(Error::Config("project id is empty".into()));
        }
        if self.min_pin_length < MIN_PIN_LENGTH
            || self.max_pin_length > MAX_PIN_LENGTH
            || self.min_pin_length > self.max_pin_length
        {
            return Err(Error::Config(format!(
                "PIN length bounds must lie within {}..={}",
                MIN_PIN_LENGTH, MAX_PIN_LENGTH
            )));
        }
        if self.default_challenge_ttl == 0 {
            return Err(Error::Config("challenge TTL must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("at least one attempt is required".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(Error::Config("base retry delay exceeds the maximum".into()));
        }
        Ok(())
    }
}

fn narrow<T: TryFrom<u64>>(name: &str, value: Option<u64>, default: T) -> Result<T> {
    match value {
        Some(v) => T::try_from(v).map_err(|_| Error::Config(format!("{} is out of range", name))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_fill_missing_variables() {
        let config = ClientConfig::from_lookup(lookup(&[("PINPROOF_PROJECT_ID", "proj")])).unwrap();
        assert_eq!(config, ClientConfig::new("proj"));
    }

    #[test]
    fn variables_override_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("PINPROOF_PROJECT_ID", "proj"),
            ("PINPROOF_MIN_PIN_LENGTH", "6"),
            ("PINPROOF_BIND_DEVICE_KEY", "true"),
            ("PINPROOF_RETRY_MAX_ATTEMPTS", "5"),
        ]))
        .unwrap();
        assert_eq!(config.min_pin_length, 6);
        assert!(config.bind_device_key);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(ClientConfig::from_lookup(lookup(&[])), Err(Error::Config(_))));
        assert!(matches!(
            ClientConfig::from_lookup(lookup(&[("PINPROOF_PROJECT_ID", "proj"), ("PINPROOF_MAX_PIN_LENGTH", "9")])),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ClientConfig::from_lookup(lookup(&[("PINPROOF_PROJECT_ID", "proj"), ("PINPROOF_CHALLENGE_TTL_SECONDS", "x")])),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn out_of_range_values_are_not_truncated() {
        let err = ClientConfig::from_lookup(lookup(&[
            ("PINPROOF_PROJECT_ID", "proj"),
            ("PINPROOF_RETRY_MAX_ATTEMPTS", "4294967297"),
        ]))
        .unwrap_err();
        assert_eq!(err, Error::Config("PINPROOF_RETRY_MAX_ATTEMPTS is out of range".into()));
    }

    #[test]
    fn deserializes_partial_json() {
        let config: ClientConfig = serde_json::from_str(r#"{"projectId":"proj","retry":{"maxAttempts":2}}"#).unwrap();
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_delay_ms, RetryPolicy::default().base_delay_ms);
        assert!(config.validate().is_ok());
    }
}
