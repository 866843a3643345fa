//! Domain models for Encore
//!
//! - Messages and their structured content parts
//! - Rooms (persisted conversations)
//! - Artists and their knowledge base entries

pub mod artist;
pub mod chat;
pub mod room;

pub use artist::{Artist, KnowledgeEntry};
pub use chat::{Message, MessageContent, MessagePart, MessageRole, ToolInvocation, ToolResultState};
pub use room::{NewRoom, Room};
