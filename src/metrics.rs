//! Metrics accumulation
//!
//! Counters produced by validators during a pass, bucketed per account plus
//! a synthetic `Global` bucket that aggregates across accounts. Flushed to
//! the sink at the end of each pass; the `Global` bucket and unresolved
//! `Unknown` accounts show up in the log summary only, never in the sink.

use crate::accounts::UNKNOWN_ACCOUNT;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Synthetic bucket aggregating every account.
pub const GLOBAL_BUCKET: &str = "Global";

/// Metric incremented once per resource seen by the validation chain.
pub const RESOURCES_METRIC: &str = "Resources";

#[derive(Debug, Default)]
struct Bucket {
    /// The 12-digit account id. Synthetic buckets have none.
    account_id: Option<String>,
    counters: BTreeMap<String, i64>,
}

/// Per-account metric counters for one pass.
#[derive(Debug, Default)]
pub struct MetricsAccumulator {
    buckets: Mutex<BTreeMap<String, Bucket>>,
}

impl MetricsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to `metric` in the account's bucket and in `Global`.
    pub fn add(&self, account_id: &str, account_name: &str, metric: &str, delta: i64) {
        let mut buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
        let bucket = buckets.entry(account_name.to_string()).or_default();
        bucket
            .account_id
            .get_or_insert_with(|| account_id.to_string());
        *bucket.counters.entry(metric.to_string()).or_default() += delta;

        let global = buckets.entry(GLOBAL_BUCKET.to_string()).or_default();
        *global.counters.entry(metric.to_string()).or_default() += delta;
    }

    /// Merge a validator's metric increments for one account.
    pub fn merge(
        &self,
        account_id: &str,
        account_name: &str,
        metrics: &std::collections::HashMap<String, i64>,
    ) {
        for (metric, delta) in metrics {
            self.add(account_id, account_name, metric, *delta);
        }
    }

    /// Count one resource handled for the account.
    pub fn record_resource(&self, account_id: &str, account_name: &str) {
        self.add(account_id, account_name, RESOURCES_METRIC, 1);
    }

    pub fn get(&self, account_name: &str, metric: &str) -> i64 {
        let buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
        buckets
            .get(account_name)
            .and_then(|b| b.counters.get(metric))
            .copied()
            .unwrap_or(0)
    }

    /// Render one sink document per real account, stamped with `timestamp`.
    ///
    /// The `Global` aggregate and accounts the directory could not resolve
    /// are excluded; a document carries both the account name and id.
    pub fn documents(&self, timestamp: &str) -> Vec<(String, serde_json::Value)> {
        let buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
        buckets
            .iter()
            .filter(|(account, _)| {
                account.as_str() != GLOBAL_BUCKET && account.as_str() != UNKNOWN_ACCOUNT
            })
            .map(|(account, bucket)| {
                let mut doc = json!({
                    "account": account,
                    "accountId": bucket.account_id,
                    "@timestamp": timestamp,
                });
                if let serde_json::Value::Object(map) = &mut doc {
                    for (metric, value) in &bucket.counters {
                        map.insert(metric.clone(), json!(value));
                    }
                }
                (account.clone(), doc)
            })
            .collect()
    }

    /// Human-readable pass summary, one line per bucket.
    pub fn report(&self) -> String {
        let buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
        let mut lines = Vec::new();
        for (account, bucket) in buckets.iter() {
            let rendered: Vec<String> = bucket
                .counters
                .iter()
                .map(|(metric, value)| format!("{}={}", metric, value))
                .collect();
            lines.push(format!("{}: {}", account, rendered.join(" ")));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_updates_account_and_global() {
        let metrics = MetricsAccumulator::new();
        metrics.add("111122223333", "prod", "Volumes", 2);
        metrics.add("444455556666", "dev", "Volumes", 1);

        assert_eq!(metrics.get("prod", "Volumes"), 2);
        assert_eq!(metrics.get("dev", "Volumes"), 1);
        assert_eq!(metrics.get(GLOBAL_BUCKET, "Volumes"), 3);
    }

    #[test]
    fn test_record_resource() {
        let metrics = MetricsAccumulator::new();
        metrics.record_resource("111122223333", "prod");
        metrics.record_resource("111122223333", "prod");

        assert_eq!(metrics.get("prod", RESOURCES_METRIC), 2);
        assert_eq!(metrics.get(GLOBAL_BUCKET, RESOURCES_METRIC), 2);
    }

    #[test]
    fn test_missing_metric_is_zero() {
        let metrics = MetricsAccumulator::new();
        assert_eq!(metrics.get("prod", "Nothing"), 0);
    }

    #[test]
    fn test_documents_carry_account_name_and_id() {
        let metrics = MetricsAccumulator::new();
        metrics.add("111122223333", "prod", "Volumes", 5);

        let docs = metrics.documents("2024-05-01T12:00:00Z");
        assert_eq!(docs.len(), 1);
        let (name, doc) = &docs[0];
        assert_eq!(name, "prod");
        assert_eq!(doc["account"], "prod");
        assert_eq!(doc["accountId"], "111122223333");
        assert_eq!(doc["Volumes"], 5);
        assert_eq!(doc["@timestamp"], "2024-05-01T12:00:00Z");
    }

    #[test]
    fn test_documents_exclude_global_and_unknown() {
        let metrics = MetricsAccumulator::new();
        metrics.add("111122223333", "prod", "Volumes", 5);
        metrics.record_resource("999999999999", UNKNOWN_ACCOUNT);

        let docs = metrics.documents("2024-05-01T12:00:00Z");
        let names: Vec<&str> = docs.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["prod"]);
        // Both still count into the aggregate and the log summary
        assert_eq!(metrics.get(GLOBAL_BUCKET, RESOURCES_METRIC), 1);
        assert!(metrics.report().contains("Unknown: Resources=1"));
    }

    #[test]
    fn test_report_mentions_every_bucket() {
        let metrics = MetricsAccumulator::new();
        metrics.add("111122223333", "prod", "Volumes", 5);
        let report = metrics.report();
        assert!(report.contains("prod: Volumes=5"));
        assert!(report.contains("Global: Volumes=5"));
    }
}
