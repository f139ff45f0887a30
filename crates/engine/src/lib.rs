//! Cart Engine - consistency and concurrency core of a shopping cart.
//!
//! Keeps a persisted cart, a disposable view cache, and a changing product
//! catalog consistent under concurrent access.
//!
//! # Layers
//!
//! - [`lock`] - per-owner exclusive leases over a [`kv`] backend
//! - [`occ`] - version-checked row updates with bounded retry
//! - [`store`] - get-or-create and cart aggregate upkeep
//! - [`cache`] - read-through, invalidate-on-write cart views
//! - [`sync`] - reconciliation against the [`catalog`], single cart or sweep
//! - [`pricing`] - pure totals, discounts, shipping and points
//! - [`service`] - the public operations, composed from the above
//! - [`state`] - wiring for `PostgreSQL`/Redis or in-process backends

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod cache;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod kv;
pub mod lock;
pub mod models;
pub mod occ;
pub mod pricing;
pub mod service;
pub mod state;
pub mod store;
pub mod sync;

pub use config::{ConfigError, EngineConfig, EngineSettings};
pub use error::{CartError, PricingError, Result};
pub use models::{Cart, CartItem, CartOwner, Identity};
pub use service::{Backends, CartService, CheckoutQuote, ItemUpdate, MergeReport};
pub use state::{CartEngine, StartupError};
