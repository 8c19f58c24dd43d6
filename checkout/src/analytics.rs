//! Running checkout statistics.

use axum::{Json, Router, extract::State, routing::get};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use shopmesh_core::event::{AmountOverflow, CheckoutEvent};
use std::sync::Arc;

use crate::dedup::SeenKeys;
use crate::worker::{CheckoutConsumer, Delivery};

/// Totals over every checkout seen by this process.
///
/// ```json
/// {
///   "totalCheckouts": 2,
///   "totalRevenue": 31.5,
///   "averageTicket": 15.75,
///   "lastCheckout": "2025-03-01T12:00:00Z"
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutStats {
    /// Distinct checkouts counted
    pub total_checkouts: u64,
    /// Sum of checkout totals
    #[serde(with = "rust_decimal::serde::float")]
    pub total_revenue: Decimal,
    /// `total_revenue / total_checkouts`, two decimal places
    #[serde(with = "rust_decimal::serde::float")]
    pub average_ticket: Decimal,
    /// Latest checkout timestamp
    pub last_checkout: Option<DateTime<Utc>>,
}

impl CheckoutStats {
    fn record(&mut self, event: &CheckoutEvent) -> Result<(), AmountOverflow> {
        let overflow = || AmountOverflow("checkout revenue".to_string());
        let total_checkouts = self.total_checkouts + 1;
        let total_revenue = self.total_revenue.checked_add(event.total()).ok_or_else(overflow)?;
        let average_ticket = total_revenue
            .checked_div(Decimal::from(total_checkouts))
            .ok_or_else(overflow)?;

        self.total_checkouts = total_checkouts;
        self.total_revenue = total_revenue;
        self.average_ticket = average_ticket.round_dp(2);
        self.last_checkout = self.last_checkout.max(Some(event.timestamp()));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Inner {
    stats: CheckoutStats,
    seen: SeenKeys,
}

/// Consumer folding checkout events into [`CheckoutStats`].
#[derive(Debug, Default)]
pub struct AnalyticsHandler {
    inner: Mutex<Inner>,
}

impl AnalyticsHandler {
    /// Handler with empty statistics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count `event` unless its list was already counted.
    ///
    /// # Errors
    ///
    /// Returns [`AmountOverflow`] if the running revenue would leave the
    /// [`Decimal`] range. The statistics are left unchanged and the list is
    /// not remembered.
    pub fn record(&self, event: &CheckoutEvent) -> Result<Delivery, AmountOverflow> {
        let mut inner = self.inner.lock();
        if inner.seen.contains(event.list_id()) {
            return Ok(Delivery::Duplicate);
        }
        inner.stats.record(event)?;
        inner.seen.insert(event.list_id());

        tracing::info!(
            list_id = %event.list_id(),
            total_checkouts = inner.stats.total_checkouts,
            total_revenue = %inner.stats.total_revenue,
            "Checkout recorded"
        );
        Ok(Delivery::Processed)
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> CheckoutStats {
        self.inner.lock().stats.clone()
    }
}

impl CheckoutConsumer for AnalyticsHandler {
    fn handle<'a>(&'a self, event: &'a CheckoutEvent) -> BoxFuture<'a, anyhow::Result<Delivery>> {
        Box::pin(futures::future::ready(self.record(event).map_err(anyhow::Error::from)))
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    success: bool,
    data: CheckoutStats,
}

#[allow(clippy::unused_async)]
async fn stats(State(analytics): State<Arc<AnalyticsHandler>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        success: true,
        data: analytics.stats(),
    })
}

/// `GET /stats` over `analytics`.
pub fn stats_router(analytics: Arc<AnalyticsHandler>) -> Router {
    Router::new().route("/stats", get(stats)).with_state(analytics)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use shopmesh_core::event::{CheckoutItem, Customer};
    use std::str::FromStr;

    fn event(list_id: &str, price: &str, hour: u32) -> CheckoutEvent {
        CheckoutEvent::new(
            list_id,
            Customer {
                id: "u1".to_string(),
                email: "ana@example.com".to_string(),
                name: "Ana Silva".to_string(),
            },
            vec![CheckoutItem {
                item_id: "i1".to_string(),
                item_name: "Coffee".to_string(),
                quantity: Decimal::ONE,
                unit: "un".to_string(),
                estimated_price: Decimal::from_str(price).unwrap(),
            }],
            Utc.with_ymd_and_hms(2025, 3, 1, hour, 0, 0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn totals_and_average_accumulate() {
        let analytics = AnalyticsHandler::new();

        analytics.record(&event("L1", "10.00", 12)).unwrap();
        analytics.record(&event("L2", "21.50", 9)).unwrap();

        let stats = analytics.stats();
        assert_eq!(stats.total_checkouts, 2);
        assert_eq!(stats.total_revenue, Decimal::from_str("31.50").unwrap());
        assert_eq!(stats.average_ticket, Decimal::from_str("15.75").unwrap());
        assert_eq!(stats.last_checkout, Some(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()));
    }

    #[test]
    fn duplicate_list_is_counted_once() {
        let analytics = AnalyticsHandler::new();

        assert_eq!(analytics.record(&event("L1", "10.00", 12)).unwrap(), Delivery::Processed);
        assert_eq!(analytics.record(&event("L1", "10.00", 12)).unwrap(), Delivery::Duplicate);

        let stats = analytics.stats();
        assert_eq!(stats.total_checkouts, 1);
        assert_eq!(stats.total_revenue, Decimal::from(10));
    }

    #[test]
    fn revenue_overflow_leaves_stats_untouched() {
        let analytics = AnalyticsHandler::new();
        let max = Decimal::MAX.to_string();

        analytics.record(&event("L1", &max, 12)).unwrap();
        assert!(analytics.record(&event("L2", &max, 13)).is_err());

        let stats = analytics.stats();
        assert_eq!(stats.total_checkouts, 1);
        assert_eq!(stats.total_revenue, Decimal::MAX);
        assert_eq!(stats.last_checkout, Some(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()));
        assert!(!analytics.inner.lock().seen.contains("L2"));
    }

    #[test]
    fn empty_stats_serialize_as_numbers() {
        let value = serde_json::to_value(AnalyticsHandler::new().stats()).unwrap();

        assert_eq!(value["totalCheckouts"], 0);
        assert_eq!(value["totalRevenue"], 0.0);
        assert_eq!(value["averageTicket"], 0.0);
        assert!(value["lastCheckout"].is_null());
    }
}
