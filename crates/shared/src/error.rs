//! Error taxonomy for the chat core.
//!
//! `StoreError` covers message-store integrity violations. These are
//! programmer errors and treated as fatal to the caller. `ChatError` covers
//! everything a dispatch or verification can hit at runtime; those are
//! expected, surfaced to the user as a notice, and never crash the session.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("message id {0} already exists")]
    DuplicateId(Uuid),
    #[error("no message with id {0}")]
    NotFound(Uuid),
}

#[derive(Debug, Error)]
pub enum ChatError {
    /// Input was empty after trimming; nothing was sent or recorded.
    #[error("nothing to send")]
    EmptyInput,
    /// No verified API key; nothing was sent or recorded.
    #[error("API key is missing or unverified")]
    NotAuthorized,
    /// Another dispatch is still in flight on this session.
    #[error("a request is already in flight")]
    Busy,
    /// The request exceeded its deadline and the in-flight call was aborted.
    #[error("request timed out")]
    Timeout,
    /// The caller aborted the dispatch through its handle.
    #[error("request aborted")]
    Aborted,
    /// The provider answered successfully but without usable content.
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
    /// The provider returned a failure status or the transport failed.
    #[error("provider error: {message}")]
    Provider {
        status: Option<u16>,
        message: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}
