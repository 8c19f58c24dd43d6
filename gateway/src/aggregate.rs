//! Dashboard and search: endpoints that fan out to several services.
//!
//! Sub-calls run one after another through the [`Dispatcher`], so each is
//! breaker-guarded like a proxied request. A failing section does not abort
//! the others; it is reported as `listsError` / `itemsError` next to the
//! sections that did succeed.

use axum::http::Method;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use shopmesh_web::{AppError, BearerToken, CorrelationId};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ITEM_SERVICE, LIST_SERVICE, USER_SERVICE};
use crate::dispatch::{Dispatcher, ProxyRequest};

const RECENT_LISTS: usize = 5;
const ITEM_SEARCH_LIMIT: u32 = 10;
const LIST_SEARCH_LIMIT: usize = 5;

/// The `{success, data, message, pagination}` envelope every downstream
/// service answers with.
#[derive(Debug, Deserialize)]
struct Upstream<T> {
    #[serde(default)]
    success: bool,
    data: Option<T>,
    message: Option<String>,
    pagination: Option<Pagination>,
}

#[derive(Debug, Default, Deserialize)]
struct Pagination {
    #[serde(default)]
    total: u64,
}

#[derive(Debug, Deserialize)]
struct Validation {
    user: UserSummary,
}

/// The authenticated user as reported by the user service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    /// User id
    #[serde(default)]
    pub id: serde_json::Value,
    /// Login name
    #[serde(default)]
    pub username: String,
    /// Given name
    #[serde(default)]
    pub first_name: Option<String>,
    /// Family name
    #[serde(default)]
    pub last_name: Option<String>,
    /// Free-form preferences
    #[serde(default)]
    pub preferences: serde_json::Value,
}

/// A shopping list as returned by the list service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShoppingList {
    #[serde(default)]
    id: serde_json::Value,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    summary: ListTotals,
    #[serde(default)]
    updated_at: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListTotals {
    #[serde(default)]
    total_items: u64,
    #[serde(default)]
    purchased_items: u64,
    #[serde(default)]
    estimated_total: Decimal,
}

/// Counters shown on the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    /// Lists owned by the user
    pub total_lists: usize,
    /// Lists with status `active`
    pub active_lists: usize,
    /// Lists with status `completed`
    pub completed_lists: usize,
    /// Active catalog items
    pub total_items: u64,
    /// Sum of the lists' estimated totals, two decimal places
    #[serde(with = "rust_decimal::serde::float")]
    pub total_estimated: Decimal,
}

/// One of the user's most recent lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentList {
    /// List id
    pub id: serde_json::Value,
    /// List name
    pub name: String,
    /// List status
    pub status: String,
    /// Items on the list
    pub item_count: u64,
    /// Items already bought
    pub purchased_count: u64,
    /// Estimated list total
    #[serde(with = "rust_decimal::serde::float")]
    pub estimated_total: Decimal,
    /// Last update as reported by the list service
    pub updated_at: Option<String>,
}

/// `GET /api/dashboard` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    /// Authenticated user
    pub user: UserSummary,
    /// Aggregated counters
    pub statistics: Statistics,
    /// First lists returned by the list service
    pub recent_lists: Vec<RecentList>,
    /// Why the list section is empty, if it failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lists_error: Option<String>,
    /// Why the item count is zero, if it failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_error: Option<String>,
}

/// `GET /api/search` result sections.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    /// Matching catalog items
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<serde_json::Value>>,
    /// Why item search failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_error: Option<String>,
    /// The caller's lists whose name contains the query
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lists: Option<Vec<serde_json::Value>>,
    /// Why list search failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lists_error: Option<String>,
}

/// Echo of the search request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchInfo {
    /// Query as received
    pub query: String,
    /// When the search ran
    pub timestamp: DateTime<Utc>,
}

/// Runs the aggregate endpoints.
#[derive(Debug, Clone)]
pub struct Aggregator {
    dispatcher: Arc<Dispatcher>,
    timeout: Duration,
}

impl Aggregator {
    /// Aggregator whose sub-calls each time out after `timeout`.
    #[must_use]
    pub const fn new(dispatcher: Arc<Dispatcher>, timeout: Duration) -> Self {
        Self { dispatcher, timeout }
    }

    /// Build the dashboard for the bearer of `token`.
    ///
    /// # Errors
    ///
    /// - 401 when the user service rejects the token
    /// - 503 when the user service cannot be reached
    ///
    /// List and item failures are reported inside the dashboard instead.
    pub async fn dashboard(
        &self,
        token: &BearerToken,
        correlation_id: CorrelationId,
    ) -> Result<Dashboard, AppError> {
        let user = self.validate(token, correlation_id).await?;

        let (lists, lists_error) = match self.user_lists(token, correlation_id).await {
            Ok(lists) => (lists, None),
            Err(error) => {
                tracing::warn!(%correlation_id, error = %error, "Dashboard list section failed");
                (Vec::new(), Some(error))
            }
        };

        let items = self
            .fetch::<IgnoredAny>(
                ITEM_SERVICE,
                ProxyRequest::get("/")
                    .with_param("active", "true")
                    .with_param("limit", "1")
                    .with_correlation_id(correlation_id.0),
            )
            .await;
        let (total_items, items_error) = match items {
            Ok(envelope) => (envelope.pagination.unwrap_or_default().total, None),
            Err(error) => {
                tracing::warn!(%correlation_id, error = %error, "Dashboard item section failed");
                (0, Some(error))
            }
        };

        Ok(Dashboard {
            user,
            statistics: statistics(&lists, total_items),
            recent_lists: lists.iter().take(RECENT_LISTS).map(recent).collect(),
            lists_error,
            items_error,
        })
    }

    /// Search items for everyone, and the caller's lists when authenticated.
    pub async fn search(
        &self,
        query: &str,
        token: Option<&BearerToken>,
        correlation_id: CorrelationId,
    ) -> SearchResults {
        let mut results = SearchResults::default();

        let items = self
            .fetch::<Vec<serde_json::Value>>(
                ITEM_SERVICE,
                ProxyRequest::get("/search")
                    .with_param("q", query)
                    .with_param("limit", ITEM_SEARCH_LIMIT.to_string())
                    .with_correlation_id(correlation_id.0),
            )
            .await;
        match items {
            Ok(envelope) => results.items = Some(envelope.data.unwrap_or_default()),
            Err(error) => {
                tracing::warn!(%correlation_id, error = %error, "Item search failed");
                results.items_error = Some(error);
            }
        }

        if let Some(token) = token {
            let lists = self
                .fetch::<Vec<serde_json::Value>>(
                    LIST_SERVICE,
                    ProxyRequest::get("/")
                        .with_authorization(&token.header_value())
                        .with_correlation_id(correlation_id.0),
                )
                .await;
            match lists {
                Ok(envelope) => {
                    results.lists = Some(matching_lists(envelope.data.unwrap_or_default(), query));
                }
                Err(error) => {
                    tracing::warn!(%correlation_id, error = %error, "List search failed");
                    results.lists_error = Some(error);
                }
            }
        }

        results
    }

    async fn validate(
        &self,
        token: &BearerToken,
        correlation_id: CorrelationId,
    ) -> Result<UserSummary, AppError> {
        let request = ProxyRequest::new(Method::POST, "/auth/validate")
            .with_json(&serde_json::json!({ "token": token.token() }))
            .with_correlation_id(correlation_id.0)
            .with_timeout(self.timeout);

        let response = self.dispatcher.dispatch(USER_SERVICE, request).await?;
        if response.status.is_server_error() {
            return Err(
                AppError::unavailable("Could not validate token").with_service(USER_SERVICE)
            );
        }

        match response.json::<Upstream<Validation>>() {
            Ok(Upstream {
                success: true,
                data: Some(validation),
                ..
            }) if response.is_success() => Ok(validation.user),
            _ => {
                tracing::info!(
                    %correlation_id,
                    status = %response.status,
                    "Token rejected by user service"
                );
                Err(AppError::unauthorized("Invalid token"))
            }
        }
    }

    async fn user_lists(
        &self,
        token: &BearerToken,
        correlation_id: CorrelationId,
    ) -> Result<Vec<ShoppingList>, String> {
        let envelope = self
            .fetch::<Vec<ShoppingList>>(
                LIST_SERVICE,
                ProxyRequest::get("/")
                    .with_authorization(&token.header_value())
                    .with_correlation_id(correlation_id.0),
            )
            .await?;
        Ok(envelope.data.unwrap_or_default())
    }

    /// One sub-call; every failure mode collapses into a section error message.
    async fn fetch<T: DeserializeOwned>(
        &self,
        service: &str,
        request: ProxyRequest,
    ) -> Result<Upstream<T>, String> {
        let response = self
            .dispatcher
            .dispatch(service, request.with_timeout(self.timeout))
            .await
            .map_err(|e| e.to_string())?;

        let envelope = response.json::<Upstream<T>>().map_err(|e| {
            if response.is_success() {
                format!("Invalid response from {service}: {e}")
            } else {
                format!("{service} responded with {}", response.status)
            }
        })?;

        if response.is_success() && envelope.success {
            Ok(envelope)
        } else {
            Err(envelope
                .message
                .unwrap_or_else(|| format!("{service} responded with {}", response.status)))
        }
    }
}

fn statistics(lists: &[ShoppingList], total_items: u64) -> Statistics {
    let count = |status: &str| lists.iter().filter(|l| l.status == status).count();
    Statistics {
        total_lists: lists.len(),
        active_lists: count("active"),
        completed_lists: count("completed"),
        total_items,
        total_estimated: lists
            .iter()
            .map(|l| l.summary.estimated_total)
            .sum::<Decimal>()
            .round_dp(2),
    }
}

fn recent(list: &ShoppingList) -> RecentList {
    RecentList {
        id: list.id.clone(),
        name: list.name.clone(),
        status: list.status.clone(),
        item_count: list.summary.total_items,
        purchased_count: list.summary.purchased_items,
        estimated_total: list.summary.estimated_total,
        updated_at: list.updated_at.clone(),
    }
}

fn matching_lists(lists: Vec<serde_json::Value>, query: &str) -> Vec<serde_json::Value> {
    let needle = query.to_lowercase();
    lists
        .into_iter()
        .filter(|list| {
            list.get("name")
                .and_then(serde_json::Value::as_str)
                .is_some_and(|name| name.to_lowercase().contains(&needle))
        })
        .take(LIST_SEARCH_LIMIT)
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dec(raw: &str) -> Decimal {
        raw.parse().unwrap()
    }

    fn lists() -> Vec<ShoppingList> {
        serde_json::from_value(json!([
            { "id": "a", "name": "Weekly", "status": "active",
              "summary": { "totalItems": 4, "purchasedItems": 1, "estimatedTotal": 10.104 } },
            { "id": "b", "name": "Party", "status": "completed",
              "summary": { "totalItems": 2, "purchasedItems": 2, "estimatedTotal": 5.2 } },
            { "id": "c", "name": "Empty", "status": "archived" }
        ]))
        .unwrap()
    }

    #[test]
    fn statistics_count_statuses_and_round_totals() {
        let stats = statistics(&lists(), 42);
        assert_eq!(stats.total_lists, 3);
        assert_eq!(stats.active_lists, 1);
        assert_eq!(stats.completed_lists, 1);
        assert_eq!(stats.total_items, 42);
        assert_eq!(stats.total_estimated, dec("15.30"));

        let rendered = serde_json::to_value(&stats).unwrap();
        assert_eq!(rendered["totalEstimated"], json!(15.3));
    }

    #[test]
    fn recent_lists_use_summary_counts() {
        let recent = recent(&lists()[0]);
        assert_eq!(recent.item_count, 4);
        assert_eq!(recent.purchased_count, 1);
        assert_eq!(recent.updated_at, None);
    }

    #[test]
    fn list_search_is_case_insensitive_and_capped() {
        let lists: Vec<serde_json::Value> = (0..8)
            .map(|i| json!({ "id": i, "name": format!("Weekly MILK run {i}") }))
            .chain([json!({ "id": 99, "name": "Party" }), json!({ "id": 100 })])
            .collect();

        let found = matching_lists(lists, "milk");
        assert_eq!(found.len(), 5);
        assert!(found.iter().all(|l| l["name"].as_str().unwrap().contains("MILK")));
    }

    #[test]
    fn empty_search_sections_are_omitted() {
        let rendered = serde_json::to_value(SearchResults {
            items: Some(vec![]),
            ..SearchResults::default()
        })
        .unwrap();
        assert_eq!(rendered, json!({ "items": [] }));
    }
}
