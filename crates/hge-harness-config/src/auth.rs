// crates/hge-harness-config/src/auth.rs
// ============================================================================
// Module: Auth Modes
// Description: Typed auth configuration for the engine under test.
// Purpose: Parse bare names or single-key mappings into validated auth modes.
// Dependencies: serde, serde_yaml
// ============================================================================

//! ## Overview
//! An auth mode is written either as a bare name (`jwt`) or as a mapping with
//! exactly one key (`{webhook: {mode: post}}`). Unknown names, unknown keys,
//! wrongly typed values and values outside an allowed set are rejected; keys
//! that are absent take their defaults.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_yaml::Mapping;
use serde_yaml::Value;

use crate::error::ConfigError;

// ============================================================================
// SECTION: Auth Kinds
// ============================================================================

/// Auth mode names known to the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthKind {
    /// Engine runs without any access control.
    NoAuth,
    /// Admin secret only.
    AdminSecret,
    /// Admin secret plus JWT verification.
    Jwt,
    /// Admin secret plus an auth webhook.
    Webhook,
}

impl AuthKind {
    /// Every auth kind, in catalog order.
    pub const ALL: [Self; 4] = [Self::NoAuth, Self::AdminSecret, Self::Jwt, Self::Webhook];

    /// Returns the catalog name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoAuth => "noAuth",
            Self::AdminSecret => "adminSecret",
            Self::Jwt => "jwt",
            Self::Webhook => "webhook",
        }
    }

    /// Parses a catalog name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownAuth`] for names outside the catalog.
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| ConfigError::UnknownAuth(name.to_string()))
    }
}

impl fmt::Display for AuthKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SECTION: Auth Settings
// ============================================================================

/// JWT audience: a single value or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JwtAudience {
    /// Single audience.
    One(String),
    /// Audience list.
    Many(Vec<String>),
}

/// JWT auth settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JwtAuth {
    /// Claims are encoded as stringified JSON.
    #[serde(default)]
    pub stringified: bool,
    /// Expected issuer.
    #[serde(default)]
    pub issuer: Option<String>,
    /// Expected audience.
    #[serde(default)]
    pub audience: Option<JwtAudience>,
}

/// HTTP method the engine uses to call the auth webhook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookMode {
    /// Headers forwarded as request headers.
    #[default]
    Get,
    /// Headers forwarded in a JSON body.
    Post,
}

impl WebhookMode {
    /// Returns the value for `HASURA_GRAPHQL_AUTH_HOOK_MODE`.
    #[must_use]
    pub const fn env_value(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

/// Auth webhook settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookAuth {
    /// Add the webhook CA to the trust bundle handed to the engine and tests.
    #[serde(default)]
    pub secure: bool,
    /// Request method.
    #[serde(default)]
    pub mode: WebhookMode,
}

/// Settings-free auth body (`noAuth`, `adminSecret`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoSettings {}

/// Validated auth configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AuthConfig {
    /// No access control.
    #[default]
    NoAuth,
    /// Admin secret only.
    AdminSecret,
    /// JWT mode.
    Jwt(JwtAuth),
    /// Webhook mode.
    Webhook(WebhookAuth),
}

impl AuthConfig {
    /// Returns the auth kind.
    #[must_use]
    pub const fn kind(&self) -> AuthKind {
        match self {
            Self::NoAuth => AuthKind::NoAuth,
            Self::AdminSecret => AuthKind::AdminSecret,
            Self::Jwt(_) => AuthKind::Jwt,
            Self::Webhook(_) => AuthKind::Webhook,
        }
    }

    /// Returns the configuration of `kind` with every setting defaulted.
    #[must_use]
    pub fn defaults_for(kind: AuthKind) -> Self {
        match kind {
            AuthKind::NoAuth => Self::NoAuth,
            AuthKind::AdminSecret => Self::AdminSecret,
            AuthKind::Jwt => Self::Jwt(JwtAuth::default()),
            AuthKind::Webhook => Self::Webhook(WebhookAuth::default()),
        }
    }

    /// Validates an auth value taken from a YAML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for unknown names, extra keys, or invalid
    /// settings.
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        match value {
            Value::String(name) => Ok(Self::defaults_for(AuthKind::parse(name)?)),
            Value::Mapping(mapping) => {
                let mut entries = mapping.iter();
                let (Some((key, body)), None) = (entries.next(), entries.next()) else {
                    return Err(ConfigError::Invalid(
                        "auth mapping must have exactly one key".to_string(),
                    ));
                };
                let name = key
                    .as_str()
                    .ok_or_else(|| ConfigError::Invalid("auth name must be a string".to_string()))?;
                let kind = AuthKind::parse(name)?;
                Self::with_settings(kind, body)
            }
            _ => Err(ConfigError::Invalid("auth must be a name or a mapping".to_string())),
        }
    }

    /// Parses auth from a command line or environment string. Values
    /// containing `:` are read as YAML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the string is not a valid auth mode.
    pub fn parse_str(raw: &str) -> Result<Self, ConfigError> {
        Self::from_value(&inline_value(raw)?)
    }

    /// Deserializes the settings body of `kind`.
    fn with_settings(kind: AuthKind, body: &Value) -> Result<Self, ConfigError> {
        let body = if body.is_null() { Value::Mapping(Mapping::new()) } else { body.clone() };
        let invalid = |err: serde_yaml::Error| {
            ConfigError::Invalid(format!("invalid settings for auth {kind}: {err}"))
        };
        match kind {
            AuthKind::NoAuth | AuthKind::AdminSecret => {
                let _: NoSettings = serde_yaml::from_value(body).map_err(invalid)?;
                Ok(Self::defaults_for(kind))
            }
            AuthKind::Jwt => serde_yaml::from_value(body).map(Self::Jwt).map_err(invalid),
            AuthKind::Webhook => serde_yaml::from_value(body).map(Self::Webhook).map_err(invalid),
        }
    }
}

/// Parses a command line value: YAML when it contains `:`, else a plain string.
///
/// # Errors
///
/// Returns [`ConfigError::Parse`] when the YAML is malformed.
pub fn inline_value(raw: &str) -> Result<Value, ConfigError> {
    if raw.contains(':') {
        serde_yaml::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))
    } else {
        Ok(Value::String(raw.to_string()))
    }
}
