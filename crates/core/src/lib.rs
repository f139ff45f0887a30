//! Cart Core - Shared types library.
//!
//! This crate provides common types used across all cart components:
//! - `engine` - Cart consistency and concurrency engine
//! - `cli` - Command-line tools for migrations and reconciliation sweeps
//!
//! # Architecture
//!
//! The core crate contains only types and traits - no I/O, no database access,
//! no cache clients. This keeps it lightweight and allows it to be used anywhere.
//!
//! # Modules
//!
//! - [`types`] - Newtype wrappers for type-safe IDs, money, session tokens, and statuses

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
