//! Conversation session: message store, credential gate, turn dispatcher.

pub mod gate;
pub mod store;

mod dispatch;

pub use dispatch::{ChatExport, ChatSession, DispatchHandle};
pub use gate::CredentialGate;
pub use store::MessageStore;
