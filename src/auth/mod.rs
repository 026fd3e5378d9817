//! Authentication helpers
//!
//! Token verification is delegated to an external collaborator behind the
//! [`TokenVerifier`] trait; the gateway itself never issues tokens. Two
//! implementations ship here: an HTTP-backed verifier for production and
//! a timing-safe static-token verifier for single-operator deployments.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Identity attached to a verified connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub email: String,
}

/// External auth collaborator.
///
/// Returns `None` for any token that cannot be positively verified;
/// callers treat that as a fatal auth failure for the attempt.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Option<AuthenticatedUser>;
}

/// Timing-safe string equality.
pub fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut out = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        out |= x ^ y;
    }
    out == 0
}

/// Verifier backed by an external HTTP endpoint.
///
/// POSTs `{"token": "..."}` and expects `200` with
/// `{"userId": "...", "email": "..."}` on success.
pub struct HttpTokenVerifier {
    client: reqwest::Client,
    url: String,
}

impl HttpTokenVerifier {
    pub fn new(url: String) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, url }
    }
}

#[async_trait]
impl TokenVerifier for HttpTokenVerifier {
    async fn verify(&self, token: &str) -> Option<AuthenticatedUser> {
        let response = match self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                warn!(target: "gateway", error = %err, "auth verifier unreachable");
                return None;
            }
        };
        if !response.status().is_success() {
            return None;
        }
        match response.json::<AuthenticatedUser>().await {
            Ok(user) if !user.user_id.trim().is_empty() => Some(user),
            Ok(_) => None,
            Err(err) => {
                warn!(target: "gateway", error = %err, "auth verifier returned malformed identity");
                None
            }
        }
    }
}

/// Verifier comparing against one configured token.
///
/// Every accepted connection maps to the same operator identity; meant
/// for development and single-user installs, not multi-tenant use.
pub struct StaticTokenVerifier {
    token: String,
    identity: AuthenticatedUser,
}

impl StaticTokenVerifier {
    pub fn new(token: String, identity: AuthenticatedUser) -> Self {
        Self { token, identity }
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Option<AuthenticatedUser> {
        if timing_safe_eq(&self.token, token) {
            Some(self.identity.clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operator() -> AuthenticatedUser {
        AuthenticatedUser {
            user_id: "op-1".to_string(),
            email: "op@example.com".to_string(),
        }
    }

    #[test]
    fn test_timing_safe_eq() {
        assert!(timing_safe_eq("abc", "abc"));
        assert!(!timing_safe_eq("abc", "abd"));
        assert!(!timing_safe_eq("abc", "ab"));
        assert!(!timing_safe_eq("ab", "abc"));
        assert!(timing_safe_eq("", ""));
    }

    #[tokio::test]
    async fn test_static_verifier_accepts_exact_token() {
        let verifier = StaticTokenVerifier::new("secret".to_string(), operator());
        let user = verifier.verify("secret").await;
        assert_eq!(user, Some(operator()));
    }

    #[tokio::test]
    async fn test_static_verifier_rejects_wrong_token() {
        let verifier = StaticTokenVerifier::new("secret".to_string(), operator());
        assert!(verifier.verify("Secret").await.is_none());
        assert!(verifier.verify("").await.is_none());
    }
}
