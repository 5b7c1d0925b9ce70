//! Credential gate: verifies an API key before any dispatch is allowed.

use std::collections::BTreeMap;

use providers::GeminiClient;
use shared::settings::CredentialStatus;

/// Caches the validity of the configured API key and, once verified, the
/// models that key can use (name mapped to itself, for selection lists).
///
/// Verification never propagates an error: every failure is captured,
/// recorded as the cause, and reported as `Invalid`.
#[derive(Debug, Clone, Default)]
pub struct CredentialGate {
    api_key: Option<String>,
    status: CredentialStatus,
    available_models: BTreeMap<String, String>,
    last_error: Option<String>,
}

impl CredentialGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a new key. Any previous verdict is stale, so status reverts
    /// to `Unknown` and the cached model list is dropped.
    pub fn set_key(&mut self, key: impl Into<String>) {
        self.api_key = Some(key.into());
        self.status = CredentialStatus::Unknown;
        self.available_models.clear();
        self.last_error = None;
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    /// Calls the provider's model-listing endpoint with the configured key.
    pub async fn verify(&mut self, client: &GeminiClient) -> CredentialStatus {
        match client.list_models().await {
            Ok(models) => {
                self.available_models = models.into_iter().map(|name| (name.clone(), name)).collect();
                self.status = CredentialStatus::Valid;
                self.last_error = None;
            }
            Err(err) => {
                tracing::warn!(error = %err, "API key verification failed");
                self.mark_invalid(err.to_string());
            }
        }
        self.status
    }

    pub(crate) fn mark_invalid(&mut self, cause: impl Into<String>) {
        self.status = CredentialStatus::Invalid;
        self.available_models.clear();
        self.last_error = Some(cause.into());
    }

    pub fn status(&self) -> CredentialStatus {
        self.status
    }

    pub fn is_valid(&self) -> bool {
        self.status == CredentialStatus::Valid
    }

    /// Model names available to the verified key.
    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.available_models.keys().map(String::as_str)
    }

    /// Cause of the last failed verification, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn starts_unknown_and_goes_stale_on_key_change() {
        let mut gate = CredentialGate::new();
        assert_eq!(gate.status(), CredentialStatus::Unknown);

        gate.mark_invalid("bad key");
        assert_eq!(gate.status(), CredentialStatus::Invalid);
        assert_eq!(gate.last_error(), Some("bad key"));

        gate.set_key("K2");
        assert_eq!(gate.status(), CredentialStatus::Unknown);
        assert!(gate.last_error().is_none());
    }

    #[tokio::test]
    async fn verify_success_caches_models() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .and(query_param("key", "K1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "models": [{"name": "gemini-pro"}]
            })))
            .mount(&server)
            .await;

        let mut gate = CredentialGate::new();
        gate.set_key("K1");
        let client = GeminiClient::new("K1", "gemini-pro").with_base_url(server.uri());

        assert_eq!(gate.verify(&client).await, CredentialStatus::Valid);
        assert!(gate.is_valid());
        assert_eq!(gate.models().collect::<Vec<_>>(), vec!["gemini-pro"]);
    }

    #[tokio::test]
    async fn verify_failure_is_captured_not_thrown() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .mount(&server)
            .await;

        let mut gate = CredentialGate::new();
        gate.set_key("bad");
        let client = GeminiClient::new("bad", "gemini-pro").with_base_url(server.uri());

        assert_eq!(gate.verify(&client).await, CredentialStatus::Invalid);
        assert!(gate.last_error().is_some());
        assert_eq!(gate.models().count(), 0);
    }
}
