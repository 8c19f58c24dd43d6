//! HTTP request handlers shared by every service.

pub mod health;

pub use health::{ServiceHealth, health_report};
