// crates/hge-harness-runner/src/jwt.rs
// ============================================================================
// Module: JWT Material
// Description: RSA signing key and engine JWT configuration.
// Purpose: Let pytest sign tokens the engine verifies in JWT auth mode.
// Dependencies: rcgen, serde_json
// ============================================================================

//! ## Overview
//! A fresh RSA key pair is generated per test case. The private key goes to
//! `<output>/<scenario>_jwt_private.key` for pytest; the public key is
//! embedded in the `HASURA_GRAPHQL_JWT_SECRET` JSON for the engine.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use hge_harness_config::JwtAudience;
use hge_harness_config::JwtAuth;
use rcgen::KeyPair;
use serde_json::Map;
use serde_json::Value;
use tracing::info;

use crate::certs::CertError;

/// Token signing algorithm announced to the engine.
const JWT_ALGORITHM: &str = "RS512";

/// Claims format used when claims are stringified.
const STRINGIFIED_CLAIMS_FORMAT: &str = "stringified_json";

/// Key file and engine configuration for JWT auth.
#[derive(Debug, Clone, PartialEq)]
pub struct JwtMaterial {
    /// PEM private key file handed to pytest.
    pub private_key_file: PathBuf,
    /// JSON configuration handed to the engine and pytest.
    pub conf: Value,
}

impl JwtMaterial {
    /// Generates a key pair and writes the private key for `scenario`.
    ///
    /// # Errors
    ///
    /// Returns [`CertError`] when key generation fails or the key file cannot
    /// be written.
    pub fn generate(output_dir: &Path, scenario: &str, settings: &JwtAuth) -> Result<Self, CertError> {
        let key = KeyPair::generate_for(&rcgen::PKCS_RSA_SHA512)
            .map_err(|err| CertError::Generate(err.to_string()))?;
        let private_key_file = std::path::absolute(output_dir.join(format!("{scenario}_jwt_private.key")))
            .map_err(|err| CertError::Io(err.to_string()))?;
        fs::write(&private_key_file, key.serialize_pem()).map_err(|err| CertError::Io(err.to_string()))?;
        info!(key_file = %private_key_file.display(), "generated jwt key");
        Ok(Self {
            private_key_file,
            conf: jwt_conf(&key.public_key_pem(), settings),
        })
    }

    /// Returns the configuration as compact JSON.
    #[must_use]
    pub fn conf_json(&self) -> String {
        self.conf.to_string()
    }
}

/// Builds the engine JWT configuration for `public_pem`.
#[must_use]
pub fn jwt_conf(public_pem: &str, settings: &JwtAuth) -> Value {
    let mut conf = Map::new();
    conf.insert("type".to_string(), Value::String(JWT_ALGORITHM.to_string()));
    conf.insert("key".to_string(), Value::String(public_pem.to_string()));
    if settings.stringified {
        conf.insert("claims_format".to_string(), Value::String(STRINGIFIED_CLAIMS_FORMAT.to_string()));
    }
    if let Some(issuer) = &settings.issuer {
        conf.insert("issuer".to_string(), Value::String(issuer.clone()));
    }
    match &settings.audience {
        Some(JwtAudience::One(audience)) => {
            conf.insert("audience".to_string(), Value::String(audience.clone()));
        }
        Some(JwtAudience::Many(audiences)) => {
            let list = audiences.iter().cloned().map(Value::String).collect();
            conf.insert("audience".to_string(), Value::Array(list));
        }
        None => {}
    }
    Value::Object(conf)
}
