//! Turn dispatcher: drives one request/response cycle against the provider.
//!
//! A dispatch appends the user's turn to the store *before* the network call
//! so the user's own words survive a failed reply, then issues the request
//! under the hard timeout, and appends the model reply only on success. A
//! failed turn is never retried automatically; the caller decides (e.g. via
//! [`ChatSession::regenerate`]).
//!
//! Concurrency: one dispatch (or verification) per session at a time. A new
//! dispatch while one is pending is rejected with [`ChatError::Busy`] rather
//! than allowing out-of-order completion.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::{AbortHandle, Abortable};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

use providers::GeminiClient;
use shared::chat::{Message, Role};
use shared::error::{ChatError, StoreError};
use shared::settings::{ChatSettings, CredentialStatus};

use crate::gate::CredentialGate;
use crate::store::MessageStore;

/// One conversation: settings, transcript, and credential state.
///
/// All transcript mutation funnels through the store behind a mutex so a
/// spawned dispatch task can append the reply while the owner keeps reading.
pub struct ChatSession {
    settings: ChatSettings,
    store: Arc<Mutex<MessageStore>>,
    gate: CredentialGate,
    in_flight: Arc<AtomicBool>,
    base_url: Option<String>,
    request_timeout: Option<Duration>,
}

/// Serializable snapshot of a conversation, produced by an explicit export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatExport {
    pub chat_title: String,
    pub model_name: String,
    pub system_prompt: String,
    pub exported_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

/// A dispatch running on a background task.
///
/// The handle is the cancellation point: [`abort`](Self::abort) drops the
/// in-flight request deterministically, and [`join`](Self::join) yields the
/// outcome (`ChatError::Aborted` after an abort).
#[derive(Debug)]
pub struct DispatchHandle {
    abort: AbortHandle,
    task: JoinHandle<Result<Message, ChatError>>,
}

impl DispatchHandle {
    pub fn abort(&self) {
        self.abort.abort();
    }

    /// A detached abort trigger, usable while the handle itself is being
    /// joined elsewhere.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub async fn join(&mut self) -> Result<Message, ChatError> {
        (&mut self.task)
            .await
            .unwrap_or_else(|_| Err(ChatError::Aborted))
    }
}

/// Releases the single-flight flag on every exit path, abort included.
struct InFlightGuard {
    flag: Arc<AtomicBool>,
}

impl InFlightGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
            .is_ok()
            .then(|| Self {
                flag: Arc::clone(flag),
            })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl ChatSession {
    pub fn new(settings: ChatSettings) -> Self {
        let mut gate = CredentialGate::new();
        if let Some(key) = &settings.api_key {
            gate.set_key(key.clone());
        }
        Self {
            settings,
            store: Arc::new(Mutex::new(MessageStore::new())),
            gate,
            in_flight: Arc::new(AtomicBool::new(false)),
            base_url: None,
            request_timeout: None,
        }
    }

    /// Point the session at a different API root (mock servers in tests,
    /// proxies in deployments).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    // ---- settings -------------------------------------------------------

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.settings.system_prompt = prompt.into();
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.settings.model_name = model.into();
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.settings.chat_title = title.into();
    }

    /// Stores a new API key. The previous verification verdict goes stale:
    /// status reverts to `Unknown` until [`verify_key`](Self::verify_key).
    pub fn set_api_key(&mut self, key: impl Into<String>) {
        let key = key.into();
        self.settings.api_key = Some(key.clone());
        self.gate.set_key(key);
    }

    // ---- credentials ----------------------------------------------------

    /// Verifies the configured key against the provider's model listing.
    /// Never fails past this boundary; the verdict carries the outcome.
    pub async fn verify_key(&mut self) -> CredentialStatus {
        let Some(key) = self.gate.api_key().map(str::to_string) else {
            self.gate.mark_invalid("no API key set");
            return CredentialStatus::Invalid;
        };
        let client = self.client_for(&key);
        self.gate.verify(&client).await
    }

    pub fn credential_status(&self) -> CredentialStatus {
        self.gate.status()
    }

    pub fn available_models(&self) -> Vec<String> {
        self.gate.models().map(str::to_string).collect()
    }

    pub fn last_verify_error(&self) -> Option<String> {
        self.gate.last_error().map(str::to_string)
    }

    // ---- transcript -----------------------------------------------------

    /// Snapshot of the transcript in display order.
    pub fn messages(&self) -> Vec<Message> {
        self.store.lock().list().to_vec()
    }

    pub fn edit_message(&self, id: Uuid, new_content: &str) -> Result<(), StoreError> {
        self.store.lock().edit_content(id, new_content)
    }

    pub fn delete_messages(&self, ids: &HashSet<Uuid>) -> usize {
        self.store.lock().delete_many(ids)
    }

    pub fn export(&self) -> ChatExport {
        ChatExport {
            chat_title: self.settings.chat_title.clone(),
            model_name: self.settings.model_name.clone(),
            system_prompt: self.settings.system_prompt.clone(),
            exported_at: Utc::now(),
            messages: self.messages(),
        }
    }

    // ---- dispatch -------------------------------------------------------

    /// Sends one user turn and awaits the reply.
    ///
    /// Rejected before any mutation when the input trims to nothing, the
    /// key is unverified, or another dispatch is pending. On failure after
    /// that point the already-appended user turn stays (no rollback).
    pub async fn send(&self, text: &str) -> Result<Message, ChatError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ChatError::EmptyInput);
        }
        if !self.gate.is_valid() {
            return Err(ChatError::NotAuthorized);
        }
        let guard = InFlightGuard::acquire(&self.in_flight).ok_or(ChatError::Busy)?;
        self.dispatch_turn(trimmed.to_string(), guard).await
    }

    /// Runs [`send`](Self::send) on a background task and returns an
    /// abortable handle. Preconditions are checked here, synchronously, so
    /// a rejected dispatch never spawns.
    pub fn spawn_dispatch(&self, text: impl Into<String>) -> Result<DispatchHandle, ChatError> {
        let trimmed = text.into().trim().to_string();
        if trimmed.is_empty() {
            return Err(ChatError::EmptyInput);
        }
        if !self.gate.is_valid() {
            return Err(ChatError::NotAuthorized);
        }
        let guard = InFlightGuard::acquire(&self.in_flight).ok_or(ChatError::Busy)?;
        let view = self.task_view();
        let (abort, registration) = AbortHandle::new_pair();
        let task = tokio::spawn(async move {
            let turn = view.dispatch_turn(trimmed, guard);
            match Abortable::new(turn, registration).await {
                Ok(outcome) => outcome,
                Err(_aborted) => Err(ChatError::Aborted),
            }
        });
        Ok(DispatchHandle { abort, task })
    }

    /// Re-dispatches the content of the most recent user turn; the explicit
    /// retry path for a failed reply.
    pub async fn regenerate(&self) -> Result<Message, ChatError> {
        let last_user = {
            let store = self.store.lock();
            store
                .list()
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.clone())
        };
        match last_user {
            Some(text) => self.send(&text).await,
            None => Err(ChatError::EmptyInput),
        }
    }

    async fn dispatch_turn(
        &self,
        text: String,
        guard: InFlightGuard,
    ) -> Result<Message, ChatError> {
        let _guard = guard;
        let key = self
            .gate
            .api_key()
            .ok_or(ChatError::NotAuthorized)?
            .to_string();
        let client = self.client_for(&key);

        // The user's turn is recorded before the network call; history for
        // the payload is everything that came before it.
        let history = {
            let mut store = self.store.lock();
            let history = store.list().to_vec();
            store.append(Message::user(text.clone()))?;
            history
        };

        let started = Instant::now();
        let reply_text = client
            .generate(&self.settings.system_prompt, &history, &text)
            .await?;
        let latency = started.elapsed();

        let reply = Message::model(reply_text, latency, self.settings.model_name.clone());
        self.store.lock().append(reply.clone())?;
        tracing::debug!(
            latency_ms = latency.as_millis() as u64,
            tokens = reply.token_count,
            "turn completed"
        );
        Ok(reply)
    }

    fn client_for(&self, key: &str) -> GeminiClient {
        let mut client = GeminiClient::new(key, &self.settings.model_name);
        if let Some(base_url) = &self.base_url {
            client = client.with_base_url(base_url.clone());
        }
        if let Some(timeout) = self.request_timeout {
            client = client.with_timeout(timeout);
        }
        client
    }

    /// Lightweight copy for a spawned dispatch: shares the store and the
    /// single-flight flag, snapshots settings and credentials.
    fn task_view(&self) -> ChatSession {
        ChatSession {
            settings: self.settings.clone(),
            store: Arc::clone(&self.store),
            gate: self.gate.clone(),
            in_flight: Arc::clone(&self.in_flight),
            base_url: self.base_url.clone(),
            request_timeout: self.request_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MODEL: &str = "gemini-pro";

    async fn verified_session(server: &MockServer) -> ChatSession {
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "models": [{"name": MODEL}]
            })))
            .mount(server)
            .await;

        let mut session = ChatSession::new(ChatSettings::default()).with_base_url(server.uri());
        session.set_model(MODEL);
        session.set_api_key("K1");
        assert_eq!(session.verify_key().await, CredentialStatus::Valid);
        session
    }

    fn mock_reply(text: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": text}]}}]
        }))
    }

    #[tokio::test]
    async fn empty_input_never_dispatches_or_mutates() {
        let session = ChatSession::new(ChatSettings::default());
        let err = session.send("   \n\t ").await.unwrap_err();
        assert!(matches!(err, ChatError::EmptyInput));
        assert!(session.messages().is_empty());
    }

    #[tokio::test]
    async fn unverified_key_never_dispatches_or_mutates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/models/{MODEL}:generateContent")))
            .respond_with(mock_reply("never seen"))
            .expect(0)
            .mount(&server)
            .await;

        let mut session = ChatSession::new(ChatSettings::default()).with_base_url(server.uri());
        session.set_model(MODEL);
        session.set_api_key("unverified");

        let err = session.send("Hello").await.unwrap_err();
        assert!(matches!(err, ChatError::NotAuthorized));
        assert!(session.messages().is_empty());
    }

    #[tokio::test]
    async fn successful_turn_appends_user_then_reply() {
        let server = MockServer::start().await;
        let session = verified_session(&server).await;
        Mock::given(method("POST"))
            .and(path(format!("/models/{MODEL}:generateContent")))
            .respond_with(mock_reply("Hi there"))
            .expect(1)
            .mount(&server)
            .await;

        let reply = session.send("Hello").await.unwrap();
        assert_eq!(reply.content, "Hi there");

        let messages = session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "Hello");
        assert_eq!(messages[1].role, Role::Model);
        assert_eq!(messages[1].content, "Hi there");
        assert!(messages[1].latency.is_some());
        assert_eq!(messages[1].model_name.as_deref(), Some(MODEL));
    }

    #[tokio::test]
    async fn timeout_keeps_user_turn_and_reports_error() {
        let server = MockServer::start().await;
        let session = verified_session(&server)
            .await
            .with_request_timeout(Duration::from_millis(100));
        Mock::given(method("POST"))
            .and(path(format!("/models/{MODEL}:generateContent")))
            .respond_with(mock_reply("too late").set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let err = session.send("Hello").await.unwrap_err();
        assert!(matches!(err, ChatError::Timeout));

        let messages = session.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
    }

    #[tokio::test]
    async fn provider_failure_keeps_user_turn() {
        let server = MockServer::start().await;
        let session = verified_session(&server).await;
        Mock::given(method("POST"))
            .and(path(format!("/models/{MODEL}:generateContent")))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = session.send("Hello").await.unwrap_err();
        assert!(matches!(err, ChatError::Provider { .. }));
        assert_eq!(session.messages().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_dispatch_is_rejected_and_abort_is_clean() {
        let server = MockServer::start().await;
        let session = verified_session(&server).await;
        Mock::given(method("POST"))
            .and(path(format!("/models/{MODEL}:generateContent")))
            .respond_with(mock_reply("slow").set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let mut pending = session.spawn_dispatch("Hello").unwrap();
        let busy = session.spawn_dispatch("again").unwrap_err();
        assert!(matches!(busy, ChatError::Busy));

        // Let the task record the user turn and reach the network await.
        tokio::time::sleep(Duration::from_millis(50)).await;
        pending.abort();
        let err = pending.join().await.unwrap_err();
        assert!(matches!(err, ChatError::Aborted));

        // User turn stays, no reply was appended, and the slot is free again.
        assert_eq!(session.messages().len(), 1);
        let next = session.spawn_dispatch("free again").unwrap();
        next.abort();
    }

    #[tokio::test]
    async fn regenerate_resends_last_user_content() {
        let server = MockServer::start().await;
        let session = verified_session(&server).await;
        Mock::given(method("POST"))
            .and(path(format!("/models/{MODEL}:generateContent")))
            .respond_with(mock_reply("second answer"))
            .mount(&server)
            .await;

        // Simulate a failed earlier turn: user message present, no reply.
        {
            let mut store = session.store.lock();
            store.append(Message::user("Hello")).unwrap();
        }

        let reply = session.regenerate().await.unwrap();
        assert_eq!(reply.content, "second answer");
        let messages = session.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].content, "Hello");
    }

    #[tokio::test]
    async fn regenerate_on_empty_transcript_is_rejected() {
        let server = MockServer::start().await;
        let session = verified_session(&server).await;
        let err = session.regenerate().await.unwrap_err();
        assert!(matches!(err, ChatError::EmptyInput));
    }

    #[test]
    fn export_snapshots_settings_and_transcript() {
        let mut session = ChatSession::new(ChatSettings::default());
        session.set_title("Trip planning");
        {
            let mut store = session.store.lock();
            store.append(Message::user("Hello")).unwrap();
        }

        let export = session.export();
        assert_eq!(export.chat_title, "Trip planning");
        assert_eq!(export.messages.len(), 1);

        let json = serde_json::to_string_pretty(&export).unwrap();
        let back: ChatExport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.messages[0].content, "Hello");
    }
}
