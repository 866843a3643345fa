//! Middleware components for the Encore API
//!
//! - `AuthAccount`: requires a valid bearer token, returns 401 otherwise

pub mod auth;

pub use auth::{AuthAccount, AuthRejection};
