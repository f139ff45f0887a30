//! Domain models for the cart engine.

pub mod cart;
pub mod catalog;

pub use cart::{Cart, CartItem, CartOwner, CartTotals, Identity, NewCartItem};
pub use catalog::{Offer, ProductInfo, SkuAttributes, SkuInfo};
