//! In-memory, append-ordered store for conversation turns.

use std::collections::HashSet;
use uuid::Uuid;

use shared::chat::Message;
use shared::error::StoreError;
use shared::metrics;

/// Ordered collection of chat turns. Insertion order is display order.
///
/// All operations are synchronous and mutate nothing beyond the vector.
/// Integrity failures (`DuplicateId`, `NotFound`) indicate a caller bug.
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message at the end.
    pub fn append(&mut self, message: Message) -> Result<(), StoreError> {
        if self.messages.iter().any(|m| m.id == message.id) {
            return Err(StoreError::DuplicateId(message.id));
        }
        self.messages.push(message);
        Ok(())
    }

    /// Replaces the content of the message with the given id and recomputes
    /// its word/token metrics. Every other field is left untouched.
    pub fn edit_content(&mut self, id: Uuid, new_content: &str) -> Result<(), StoreError> {
        let msg = self
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(StoreError::NotFound(id))?;
        let estimate = metrics::estimate(new_content);
        msg.content = new_content.to_string();
        msg.word_count = estimate.word_count;
        msg.token_count = estimate.token_count;
        Ok(())
    }

    /// Removes every message whose id is in `ids`. Absent ids are ignored,
    /// so the operation is idempotent. Returns the count actually removed.
    pub fn delete_many(&mut self, ids: &HashSet<Uuid>) -> usize {
        let before = self.messages.len();
        self.messages.retain(|m| !ids.contains(&m.id));
        before - self.messages.len()
    }

    /// All messages in insertion order, unfiltered.
    pub fn list(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }
}
