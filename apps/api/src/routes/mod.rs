//! HTTP route handlers for the Encore API
//!
//! - Chat turn streaming
//! - Room management
//! - Health check and status endpoints

pub mod chat;
pub mod health;
pub mod rooms;

pub use chat::{chat_router, ChatState};
pub use health::{health_router, HealthState};
pub use rooms::{rooms_router, ForkResponse, RoomsState};
