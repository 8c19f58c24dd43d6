//! The checkout event and its wire constants.
//!
//! One [`CheckoutEvent`] is published per completed purchase. It travels as a
//! JSON document on the `shopping_events` topic exchange under the routing key
//! `list.checkout.completed`; consumers bind `list.checkout.#` so future
//! sub-events (e.g. `list.checkout.refunded`) reach them without rebinding.
//!
//! Delivery is at-least-once, so consumers treat [`CheckoutEvent::list_id`] as
//! the idempotency key.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Topic exchange carrying all shopping events.
pub const SHOPPING_EXCHANGE: &str = "shopping_events";

/// Routing key for a completed checkout.
pub const CHECKOUT_COMPLETED: &str = "list.checkout.completed";

/// Binding pattern covering every checkout sub-event.
pub const CHECKOUT_PATTERN: &str = "list.checkout.#";

/// A checkout amount fell outside what [`Decimal`] can represent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("checkout amount out of range: {0}")]
pub struct AmountOverflow(pub String);

/// One purchased line of a checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutItem {
    /// Catalog item identifier
    pub item_id: String,
    /// Display name at the time of checkout
    pub item_name: String,
    /// Purchased quantity (fractional for weighed goods)
    #[serde(with = "rust_decimal::serde::float")]
    pub quantity: Decimal,
    /// Unit of measure ("un", "kg", ...)
    pub unit: String,
    /// Estimated unit price
    #[serde(with = "rust_decimal::serde::float")]
    pub estimated_price: Decimal,
}

impl CheckoutItem {
    /// Line subtotal (`estimated_price * quantity`).
    ///
    /// # Errors
    ///
    /// Returns [`AmountOverflow`] if the product does not fit a [`Decimal`].
    pub fn subtotal(&self) -> Result<Decimal, AmountOverflow> {
        self.estimated_price
            .checked_mul(self.quantity)
            .ok_or_else(|| AmountOverflow(format!("subtotal of item {}", self.item_id)))
    }
}

/// The user who completed the checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Customer {
    /// User identifier
    pub id: String,
    /// Contact e-mail for the receipt
    pub email: String,
    /// Full display name
    pub name: String,
}

/// A completed purchase, as published on the bus.
///
/// Fields are private: an event is immutable once constructed. Build one with
/// [`CheckoutEvent::new`] (which derives the total from the items) or receive
/// one by deserializing a bus message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutEvent {
    list_id: String,
    user_id: String,
    user_email: String,
    user_name: String,
    items: Vec<CheckoutItem>,
    #[serde(with = "rust_decimal::serde::float")]
    total: Decimal,
    timestamp: DateTime<Utc>,
}

impl CheckoutEvent {
    /// Create a checkout event.
    ///
    /// The total is the sum of item subtotals rounded to two decimal places.
    ///
    /// # Errors
    ///
    /// Returns [`AmountOverflow`] if a subtotal or the total does not fit a
    /// [`Decimal`].
    pub fn new(
        list_id: impl Into<String>,
        customer: Customer,
        items: Vec<CheckoutItem>,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, AmountOverflow> {
        let list_id = list_id.into();
        let mut total = Decimal::ZERO;
        for item in &items {
            total = total
                .checked_add(item.subtotal()?)
                .ok_or_else(|| AmountOverflow(format!("total of list {list_id}")))?;
        }

        Ok(Self {
            list_id,
            user_id: customer.id,
            user_email: customer.email,
            user_name: customer.name,
            items,
            total: total.round_dp(2),
            timestamp,
        })
    }

    /// Shopping list this checkout completed (idempotency key).
    #[must_use]
    pub fn list_id(&self) -> &str {
        &self.list_id
    }

    /// Purchasing user.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Receipt address.
    #[must_use]
    pub fn user_email(&self) -> &str {
        &self.user_email
    }

    /// Purchaser display name.
    #[must_use]
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Purchased lines in list order.
    #[must_use]
    pub fn items(&self) -> &[CheckoutItem] {
        &self.items
    }

    /// Checkout total.
    #[must_use]
    pub const fn total(&self) -> Decimal {
        self.total
    }

    /// When the checkout completed.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
