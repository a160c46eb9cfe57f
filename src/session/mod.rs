//! Session state and persistence

mod store;
mod types;

pub use store::SessionStore;
pub use types::{ConversationEntry, Session, SystemKind, ToolStatus};
