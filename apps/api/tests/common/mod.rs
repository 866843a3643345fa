//! Common test utilities for API integration tests
//!
//! Shared fixtures, scripted collaborators and helper functions.

#![allow(unused_imports)]

pub mod backends;
pub mod fixtures;
pub mod helpers;

pub use backends::*;
pub use fixtures::*;
pub use helpers::*;
