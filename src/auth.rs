//! # Connection Admission
//!
//! Token validation for the WebSocket upgrade. Identity itself is owned by
//! an external service; this module only resolves an opaque token into the
//! minimal, non-sensitive user projection the rest of the gateway is allowed
//! to see. The full credential record never enters this process.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

use crate::config::AuthConfig;

/// Minimal projection of an authenticated identity.
///
/// This is the only user data kept per connected client: a numeric id,
/// a display name, and a service tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub id: i64,
    pub username: String,
    pub tier: String,
}

/// Resolves an opaque bearer token into a [`UserContext`], or `None` when
/// the token is invalid or expired.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn resolve_user(&self, token: &str) -> Option<UserContext>;
}

/// Validator backed by a static token table from configuration.
///
/// Used in development and tests, and as the fallback when no introspection
/// URL is configured.
pub struct StaticTokenValidator {
    tokens: HashMap<String, UserContext>,
}

impl StaticTokenValidator {
    pub fn new(tokens: HashMap<String, UserContext>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn resolve_user(&self, token: &str) -> Option<UserContext> {
        self.tokens.get(token).cloned()
    }
}

/// Validator that asks an external identity service about the token.
///
/// POSTs `{"token": "..."}` to the configured introspection URL; a 200
/// response carrying a user projection admits the connection, anything else
/// refuses it. Transport failures are logged and treated as a refusal, not
/// an admission.
pub struct RemoteTokenValidator {
    client: reqwest::Client,
    introspection_url: String,
}

impl RemoteTokenValidator {
    pub fn new(client: reqwest::Client, introspection_url: String) -> Self {
        Self {
            client,
            introspection_url,
        }
    }
}

#[async_trait]
impl TokenValidator for RemoteTokenValidator {
    async fn resolve_user(&self, token: &str) -> Option<UserContext> {
        let response = match self
            .client
            .post(&self.introspection_url)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                error!("Token introspection request failed: {}", err);
                return None;
            }
        };

        if !response.status().is_success() {
            debug!("Token refused by identity service: {}", response.status());
            return None;
        }

        match response.json::<UserContext>().await {
            Ok(user) => Some(user),
            Err(err) => {
                error!("Invalid user payload from identity service: {}", err);
                None
            }
        }
    }
}

/// Build the validator configured for this deployment.
pub fn build_validator(config: &AuthConfig, client: reqwest::Client) -> Arc<dyn TokenValidator> {
    match &config.introspection_url {
        Some(url) => Arc::new(RemoteTokenValidator::new(client, url.clone())),
        None => Arc::new(StaticTokenValidator::new(config.static_tokens.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_user() -> UserContext {
        UserContext {
            id: 7,
            username: "ada".to_string(),
            tier: "pro".to_string(),
        }
    }

    #[tokio::test]
    async fn test_static_validator_resolves_known_token() {
        let mut tokens = HashMap::new();
        tokens.insert("secret".to_string(), test_user());
        let validator = StaticTokenValidator::new(tokens);

        assert_eq!(validator.resolve_user("secret").await, Some(test_user()));
        assert_eq!(validator.resolve_user("wrong").await, None);
    }

    #[test]
    fn test_build_validator_prefers_remote() {
        let config = AuthConfig {
            introspection_url: Some("http://identity.local/introspect".to_string()),
            static_tokens: HashMap::new(),
        };
        // Just verify construction succeeds; behavior is covered by the
        // static validator tests and exercised against a real service.
        let _validator = build_validator(&config, reqwest::Client::new());
    }
}
