//! Guest cart expiry command.
//!
//! Moves active guest carts that have not changed for
//! `CART_GUEST_EXPIRY_DAYS` (default 30) to `expired`.

use super::{CommandError, connect, print_report};

/// Expire idle guest carts and print the counts.
pub async fn run() -> Result<(), CommandError> {
    let engine = connect().await?;
    let report = engine.service().expire_guest_carts().await?;
    print_report(&report)
}
