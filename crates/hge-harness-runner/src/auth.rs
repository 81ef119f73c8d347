// crates/hge-harness-runner/src/auth.rs
// ============================================================================
// Module: Auth Material
// Description: Secrets, keys and TLS files required by an auth mode.
// Purpose: Turn an auth configuration into engine env and pytest inputs.
// Dependencies: hge-harness-config
// ============================================================================

//! ## Overview
//! Every auth mode except `noAuth` gets a fresh admin secret. JWT mode adds an
//! RSA key pair; webhook mode adds the TLS files the webhook serves with and
//! the trust bundle the engine and pytest verify it against. Nothing here
//! starts a process.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use hge_harness_config::AuthConfig;
use hge_harness_config::ScenarioDef;
use hge_harness_config::WebhookMode;

use crate::certs::CertError;
use crate::certs::WebhookTlsFiles;
use crate::jwt::JwtMaterial;
use crate::secrets::SECRET_LEN;
use crate::secrets::random_secret;

/// Webhook inputs derived from the auth configuration.
#[derive(Debug, Clone)]
pub struct WebhookPlan {
    /// TLS files served by the webhook.
    pub tls: WebhookTlsFiles,
    /// Request mode the engine uses.
    pub mode: WebhookMode,
    /// Path appended to the webhook root URL.
    pub path: String,
    /// Log file of the webhook process.
    pub log_file: PathBuf,
}

/// Generated auth inputs for one test case.
#[derive(Debug, Clone, Default)]
pub struct AuthMaterial {
    /// Admin secret, absent for `noAuth`.
    pub admin_secret: Option<String>,
    /// JWT key and configuration.
    pub jwt: Option<JwtMaterial>,
    /// Webhook TLS files and settings.
    pub webhook: Option<WebhookPlan>,
}

impl AuthMaterial {
    /// Generates the material `auth` needs for `scenario`.
    ///
    /// # Errors
    ///
    /// Returns [`CertError`] when keys or TLS files cannot be produced.
    pub fn prepare(
        auth: &AuthConfig,
        scenario: &ScenarioDef,
        output_dir: &Path,
        system_certs_dir: &Path,
    ) -> Result<Self, CertError> {
        let mut material = Self::default();
        if matches!(auth, AuthConfig::NoAuth) {
            return Ok(material);
        }
        material.admin_secret = Some(random_secret(SECRET_LEN));
        match auth {
            AuthConfig::NoAuth | AuthConfig::AdminSecret => {}
            AuthConfig::Jwt(jwt) => {
                material.jwt = Some(JwtMaterial::generate(output_dir, &scenario.name, jwt)?);
            }
            AuthConfig::Webhook(webhook) => {
                let tls = WebhookTlsFiles::prepare(output_dir, system_certs_dir, webhook.secure)?;
                material.webhook = Some(WebhookPlan {
                    tls,
                    mode: webhook.mode,
                    path: scenario.auth_webhook_path.clone(),
                    log_file: output_dir.join(format!("{}_auth_webhook.log", scenario.name)),
                });
            }
        }
        Ok(material)
    }

    /// Returns the engine env for this material. `webhook_url` is the full
    /// hook URL once the webhook runs.
    #[must_use]
    pub fn engine_env(&self, webhook_url: Option<&str>) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(secret) = &self.admin_secret {
            env.insert("HASURA_GRAPHQL_ADMIN_SECRET".to_string(), secret.clone());
        }
        if let Some(jwt) = &self.jwt {
            env.insert("HASURA_GRAPHQL_JWT_SECRET".to_string(), jwt.conf_json());
        }
        if let Some(plan) = &self.webhook {
            if let Some(url) = webhook_url {
                env.insert("HASURA_GRAPHQL_AUTH_HOOK".to_string(), url.to_string());
            }
            env.insert("HASURA_GRAPHQL_AUTH_HOOK_MODE".to_string(), plan.mode.env_value().to_string());
            env.insert("SYSTEM_CERTIFICATE_PATH".to_string(), plan.tls.certs_dir.display().to_string());
        }
        env
    }

    /// Removes generated TLS files. Safe to call repeatedly.
    pub fn cleanup(&self) {
        if let Some(plan) = &self.webhook {
            plan.tls.remove();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "Test-only assertions are permitted.")]

    use hge_harness_config::AuthConfig;
    use hge_harness_config::JwtAuth;
    use hge_harness_config::ScenarioCatalog;
    use hge_harness_config::ScenarioDef;
    use hge_harness_config::WebhookAuth;
    use hge_harness_config::WebhookMode;

    use super::AuthMaterial;

    /// Built-in default scenario.
    fn default_scenario() -> ScenarioDef {
        ScenarioCatalog::builtin().unwrap().get("default").unwrap().clone()
    }

    #[test]
    fn no_auth_has_no_secret_or_env() {
        let dir = tempfile::tempdir().unwrap();
        let material =
            AuthMaterial::prepare(&AuthConfig::NoAuth, &default_scenario(), dir.path(), dir.path()).unwrap();
        assert!(material.admin_secret.is_none());
        assert!(material.engine_env(None).is_empty());
    }

    #[test]
    fn admin_secret_mode_sets_only_the_secret() {
        let dir = tempfile::tempdir().unwrap();
        let material =
            AuthMaterial::prepare(&AuthConfig::AdminSecret, &default_scenario(), dir.path(), dir.path()).unwrap();
        let env = material.engine_env(None);
        assert_eq!(env.len(), 1);
        assert_eq!(env["HASURA_GRAPHQL_ADMIN_SECRET"].len(), 6);
    }

    #[test]
    fn jwt_mode_writes_key_and_sets_jwt_secret() {
        let dir = tempfile::tempdir().unwrap();
        let material = AuthMaterial::prepare(
            &AuthConfig::Jwt(JwtAuth::default()),
            &default_scenario(),
            dir.path(),
            dir.path(),
        )
        .unwrap();
        let jwt = material.jwt.as_ref().unwrap();
        assert!(jwt.private_key_file.ends_with("default_jwt_private.key"));
        let env = material.engine_env(None);
        assert!(env["HASURA_GRAPHQL_JWT_SECRET"].contains("RS512"));
        assert!(env.contains_key("HASURA_GRAPHQL_ADMIN_SECRET"));
    }

    #[test]
    fn webhook_mode_sets_hook_env_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let system = tempfile::tempdir().unwrap();
        let material = AuthMaterial::prepare(
            &AuthConfig::Webhook(WebhookAuth {
                secure: true,
                mode: WebhookMode::Post,
            }),
            &default_scenario(),
            dir.path(),
            system.path(),
        )
        .unwrap();
        let plan = material.webhook.as_ref().unwrap();
        assert!(plan.log_file.ends_with("default_auth_webhook.log"));
        let env = material.engine_env(Some("https://localhost:9090/token-as-base64-of-headers"));
        assert_eq!(env["HASURA_GRAPHQL_AUTH_HOOK"], "https://localhost:9090/token-as-base64-of-headers");
        assert_eq!(env["HASURA_GRAPHQL_AUTH_HOOK_MODE"], "POST");
        assert_eq!(env["SYSTEM_CERTIFICATE_PATH"], plan.tls.certs_dir.display().to_string());

        material.cleanup();
        material.cleanup();
        assert!(!plan.tls.key_file.exists());
    }
}
