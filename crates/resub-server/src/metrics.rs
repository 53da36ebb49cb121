//! Prometheus metrics for the subscription engine.
//!
//! This module provides:
//! - Change intake counters
//! - Notification outcomes and delivery latency
//! - Subscription lifecycle counters and the active subscription gauge

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    pub const CHANGES_TOTAL: &str = "resub_changes_total";
    pub const NOTIFICATIONS_TOTAL: &str = "resub_notifications_total";
    pub const DELIVERY_DURATION_SECONDS: &str = "resub_delivery_duration_seconds";

    pub const SUBSCRIPTIONS_CREATED_TOTAL: &str = "resub_subscriptions_created_total";
    pub const SUBSCRIPTIONS_REMOVED_TOTAL: &str = "resub_subscriptions_removed_total";
    pub const ACTIVE_SUBSCRIPTIONS: &str = "resub_active_subscriptions";
}

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }

            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

/// Record a change accepted by the dispatcher.
pub fn record_change(change_type: &'static str) {
    counter!(names::CHANGES_TOTAL, "type" => change_type).increment(1);
}

/// Record the outcome of one notification (`delivered`, `failed`, `skipped`).
pub fn record_notification(outcome: &'static str, duration: Duration) {
    counter!(names::NOTIFICATIONS_TOTAL, "outcome" => outcome).increment(1);
    histogram!(names::DELIVERY_DURATION_SECONDS, "outcome" => outcome)
        .record(duration.as_secs_f64());
}

pub fn record_subscriptions_created(count: usize) {
    counter!(names::SUBSCRIPTIONS_CREATED_TOTAL).increment(count as u64);
}

/// Record removals; `reason` is one of `unsubscribe`, `disconnect`, `expired`.
pub fn record_subscriptions_removed(reason: &'static str, count: usize) {
    counter!(names::SUBSCRIPTIONS_REMOVED_TOTAL, "reason" => reason).increment(count as u64);
}

pub fn set_active_subscriptions(count: usize) {
    gauge!(names::ACTIVE_SUBSCRIPTIONS).set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_a_noop() {
        record_change("created");
        record_notification("delivered", Duration::from_millis(3));
        record_subscriptions_created(2);
        record_subscriptions_removed("expired", 1);
        set_active_subscriptions(1);
    }
}
