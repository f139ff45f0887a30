//! Core types for the cart engine.
//!
//! This module provides type-safe wrappers for common domain concepts.

pub mod id;
pub mod money;
pub mod session;
pub mod status;

pub use id::*;
pub use money::{MONEY_SCALE, Money};
pub use session::{SessionToken, SessionTokenError};
pub use status::*;
