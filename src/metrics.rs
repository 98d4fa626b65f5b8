//! Admission counters and the per-identity remaining-tokens gauge.
//!
//! The limiter only reports values through [`MetricsSink`]; rendering them
//! for scraping is left to [`MetricsRegistry::render_prometheus`].

use prometheus::{IntCounter, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::error::Result;

const TOKENS_REMAINING: &str = "rate_tokens_remaining";

/// Counters emitted by the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    /// Every admission check
    RequestsTotal,
    /// Checks that admitted the request
    RequestsAllowedTotal,
    /// Checks that rejected the request
    RequestsDeniedTotal,
    /// Checks whose bucket could not be read from the store
    StoreErrorsTotal,
    /// Checks whose updated bucket could not be written back
    PersistFailuresTotal,
}

impl Counter {
    /// All counters, in exposition order.
    pub const ALL: [Counter; 5] = [
        Counter::RequestsTotal,
        Counter::RequestsAllowedTotal,
        Counter::RequestsDeniedTotal,
        Counter::StoreErrorsTotal,
        Counter::PersistFailuresTotal,
    ];

    /// Exposition name of this counter.
    pub fn name(&self) -> &'static str {
        match self {
            Counter::RequestsTotal => "rate_requests_total",
            Counter::RequestsAllowedTotal => "rate_requests_allowed_total",
            Counter::RequestsDeniedTotal => "rate_requests_denied_total",
            Counter::StoreErrorsTotal => "rate_store_errors_total",
            Counter::PersistFailuresTotal => "rate_persist_failures_total",
        }
    }

    fn help(&self) -> &'static str {
        match self {
            Counter::RequestsTotal => "Total requests seen",
            Counter::RequestsAllowedTotal => "Total allowed requests",
            Counter::RequestsDeniedTotal => "Total denied requests",
            Counter::StoreErrorsTotal => "Total bucket store read failures",
            Counter::PersistFailuresTotal => "Total bucket writes that failed after a decision",
        }
    }

    fn index(&self) -> usize {
        match self {
            Counter::RequestsTotal => 0,
            Counter::RequestsAllowedTotal => 1,
            Counter::RequestsDeniedTotal => 2,
            Counter::StoreErrorsTotal => 3,
            Counter::PersistFailuresTotal => 4,
        }
    }
}

/// Receiver for limiter observations.
pub trait MetricsSink: Send + Sync {
    /// Increment a counter by one.
    fn increment(&self, counter: Counter);

    /// Record the last observed whole tokens for an identity.
    fn set_tokens_remaining(&self, identity: &str, remaining: u64);
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_allowed_total: u64,
    pub requests_denied_total: u64,
    pub store_errors_total: u64,
    pub persist_failures_total: u64,
}

/// Prometheus-backed metrics registry.
///
/// Owned by the process bootstrap and shared with the limiter by `Arc`.
/// The `rate_tokens_remaining` gauge keeps one series per sanitized user
/// label for the life of the process; series are not dropped when a bucket
/// expires from the store, so cardinality follows the number of distinct
/// identities seen.
#[derive(Debug)]
pub struct MetricsRegistry {
    registry: Registry,
    counters: [IntCounter; 5],
    tokens_remaining: IntGaugeVec,
}

impl MetricsRegistry {
    /// Create a registry with every counter and the gauge registered.
    ///
    /// # Errors
    /// Returns an error if a metric cannot be registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let counters = [
            register_counter(&registry, Counter::RequestsTotal)?,
            register_counter(&registry, Counter::RequestsAllowedTotal)?,
            register_counter(&registry, Counter::RequestsDeniedTotal)?,
            register_counter(&registry, Counter::StoreErrorsTotal)?,
            register_counter(&registry, Counter::PersistFailuresTotal)?,
        ];

        let tokens_remaining = IntGaugeVec::new(
            Opts::new(TOKENS_REMAINING, "Tokens remaining per user (debug)"),
            &["user"],
        )?;
        registry.register(Box::new(tokens_remaining.clone()))?;

        Ok(Self {
            registry,
            counters,
            tokens_remaining,
        })
    }

    /// Current value of a counter.
    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].get()
    }

    /// Last recorded remaining tokens for an identity, read back from the
    /// exposition.
    pub fn tokens_remaining(&self, identity: &str) -> Option<u64> {
        let series = format!("{TOKENS_REMAINING}{{user=\"{}\"}} ", sanitize_label(identity));
        self.render_prometheus()
            .ok()?
            .lines()
            .find_map(|line| line.strip_prefix(&series)?.parse().ok())
    }

    /// Copy all counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.get(Counter::RequestsTotal),
            requests_allowed_total: self.get(Counter::RequestsAllowedTotal),
            requests_denied_total: self.get(Counter::RequestsDeniedTotal),
            store_errors_total: self.get(Counter::StoreErrorsTotal),
            persist_failures_total: self.get(Counter::PersistFailuresTotal),
        }
    }

    /// Render counters and the gauge in the Prometheus text format.
    pub fn render_prometheus(&self) -> Result<String> {
        Ok(TextEncoder::new().encode_to_string(&self.registry.gather())?)
    }
}

impl MetricsSink for MetricsRegistry {
    fn increment(&self, counter: Counter) {
        self.counters[counter.index()].inc();
    }

    fn set_tokens_remaining(&self, identity: &str, remaining: u64) {
        let label = sanitize_label(identity);
        self.tokens_remaining
            .with_label_values(&[label.as_str()])
            .set(i64::try_from(remaining).unwrap_or(i64::MAX));
    }
}

fn register_counter(registry: &Registry, counter: Counter) -> Result<IntCounter> {
    let metric = IntCounter::new(counter.name(), counter.help())?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn sanitize_label(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gauge_lines(body: &str) -> Vec<&str> {
        body.lines()
            .filter(|line| line.starts_with("rate_tokens_remaining{"))
            .collect()
    }

    #[test]
    fn test_counters_start_at_zero() {
        let registry = MetricsRegistry::new().unwrap();
        assert_eq!(registry.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_increment_and_snapshot() {
        let registry = MetricsRegistry::new().unwrap();
        registry.increment(Counter::RequestsTotal);
        registry.increment(Counter::RequestsTotal);
        registry.increment(Counter::RequestsDeniedTotal);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.requests_total, 2);
        assert_eq!(snapshot.requests_allowed_total, 0);
        assert_eq!(snapshot.requests_denied_total, 1);
    }

    #[test]
    fn test_gauge_keeps_last_value() {
        let registry = MetricsRegistry::new().unwrap();
        registry.set_tokens_remaining("alice", 9);
        registry.set_tokens_remaining("alice", 4);

        assert_eq!(registry.tokens_remaining("alice"), Some(4));
        assert_eq!(registry.tokens_remaining("bob"), None);
    }

    #[test]
    fn test_render_prometheus() {
        let registry = MetricsRegistry::new().unwrap();
        registry.increment(Counter::RequestsTotal);
        registry.increment(Counter::RequestsAllowedTotal);
        registry.set_tokens_remaining("bob", 3);
        registry.set_tokens_remaining("alice@example.com", 7);

        let body = registry.render_prometheus().unwrap();

        assert!(body.contains("# HELP rate_requests_total Total requests seen\n"));
        assert!(body.contains("# TYPE rate_requests_total counter\nrate_requests_total 1\n"));
        assert!(body.contains("rate_requests_allowed_total 1\n"));
        assert!(body.contains("rate_requests_denied_total 0\n"));
        assert!(body.contains("rate_store_errors_total 0\n"));
        assert!(body.contains("rate_persist_failures_total 0\n"));
        assert!(body.contains("# TYPE rate_tokens_remaining gauge\n"));
        assert!(body.contains("rate_tokens_remaining{user=\"alice_example_com\"} 7\n"));
        assert!(body.contains("rate_tokens_remaining{user=\"bob\"} 3\n"));
    }

    #[test]
    fn test_colliding_labels_share_one_series() {
        let registry = MetricsRegistry::new().unwrap();
        registry.set_tokens_remaining("alice@x", 9);
        registry.set_tokens_remaining("alice.x", 2);

        let body = registry.render_prometheus().unwrap();
        assert_eq!(
            gauge_lines(&body),
            vec!["rate_tokens_remaining{user=\"alice_x\"} 2"]
        );
    }

    #[test]
    fn test_gauge_has_one_series_per_identity() {
        let registry = MetricsRegistry::new().unwrap();
        for n in 0..3 {
            registry.set_tokens_remaining(&format!("user{n}"), n);
        }
        registry.set_tokens_remaining("user1", 5);

        let body = registry.render_prometheus().unwrap();
        assert_eq!(gauge_lines(&body).len(), 3);
        assert_eq!(registry.tokens_remaining("user1"), Some(5));
    }

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("user-1.a b"), "user_1_a_b");
        assert_eq!(sanitize_label("plain_Name9"), "plain_Name9");
    }
}
