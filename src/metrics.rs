//! Metrics Collector — a bounded in-memory store of per-request records and
//! system log entries, plus the aggregation queries the dashboard reads.
//!
//! Every mutating and snapshotting operation goes through a single
//! [`tokio::sync::Mutex`]; aggregations always run on a snapshot cloned
//! under the lock, never on the live deques, so a slow aggregation never
//! blocks `record()`/`log()` for longer than the clone itself.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

const DEFAULT_MAX_RECORDS: usize = 50_000;
const DEFAULT_MAX_LOGS: usize = 10_000;

/// Static per-1M-token rate table, `(input_rate, output_rate)` in USD.
/// Unknown upstreams fall back to `(1.0, 5.0)`.
fn cost_rate(upstream: &str) -> (f64, f64) {
    match upstream {
        "openai" => (2.50, 10.00),
        "anthropic" => (3.00, 15.00),
        "xai" => (2.00, 10.00),
        "deepseek" => (0.27, 1.10),
        "gemini" => (0.10, 0.40),
        "openrouter" => (1.00, 5.00),
        "hf" | "ollama" | "ollamafreeapi" => (0.0, 0.0),
        _ => (1.0, 5.0),
    }
}

fn cost_usd(upstream: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let (rate_in, rate_out) = cost_rate(upstream);
    (input_tokens as f64 * rate_in + output_tokens as f64 * rate_out) / 1_000_000.0
}

/// `idx = min(floor(len·p), len-1)` over values already sorted ascending.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((sorted.len() as f64 * p).floor() as usize).min(sorted.len() - 1);
    sorted[idx]
}

/// One terminal request — success or final failure.
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub timestamp: DateTime<Utc>,
    pub model_alias: String,
    pub upstream: String,
    pub route: String,
    pub actual_model: String,
    pub policy: String,
    pub latency_ms: u64,
    pub success: bool,
    pub status_code: u16,
    pub is_stream: bool,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    /// Vendor label of the last attempted upstream before this one, or
    /// `None` if the first attempt succeeded.
    pub fallback_from: Option<String>,
}

/// One structured system-log line.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct LatencyStats {
    pub avg_ms: u64,
    pub median_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}

fn latency_stats(latencies_ms: &[u64]) -> LatencyStats {
    if latencies_ms.is_empty() {
        return LatencyStats::default();
    }
    let mut sorted = latencies_ms.to_vec();
    sorted.sort_unstable();
    let sum: u64 = sorted.iter().sum();
    LatencyStats {
        avg_ms: sum / sorted.len() as u64,
        median_ms: percentile(&sorted, 0.5),
        p95_ms: percentile(&sorted, 0.95),
        p99_ms: percentile(&sorted, 0.99),
        min_ms: sorted[0],
        max_ms: sorted[sorted.len() - 1],
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Overview {
    pub uptime_s: u64,
    pub total: usize,
    pub ok: usize,
    pub err: usize,
    pub success_pct: f64,
    #[serde(flatten)]
    pub latency: LatencyStats,
    pub rpm: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub providers: usize,
    pub stream_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupStats {
    pub key: String,
    pub total: usize,
    pub ok: usize,
    pub err: usize,
    pub success_pct: f64,
    #[serde(flatten)]
    pub latency: LatencyStats,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Financial {
    pub per_upstream_cost_usd: HashMap<String, f64>,
    pub tier_dist: TierDist,
    pub saving_pct: f64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct TierDist {
    pub free: usize,
    pub internal: usize,
    pub premium: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeseriesBucket {
    pub bucket_start: i64,
    pub reqs: usize,
    pub ok: usize,
    pub err: usize,
    pub avg_ms: u64,
    pub tokens: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FallbackChain {
    pub from: String,
    pub to: String,
    pub count: usize,
}

struct Inner {
    records: VecDeque<RequestRecord>,
    logs: VecDeque<LogEntry>,
    max_records: usize,
    max_logs: usize,
}

/// Bounded in-memory store of per-request records and system log, backing
/// every `/dashboard/api/*` aggregation.
pub struct MetricsCollector {
    inner: Mutex<Inner>,
    started_at: DateTime<Utc>,
}

impl MetricsCollector {
    pub fn new(max_records: usize, max_logs: usize) -> Self {
        MetricsCollector {
            inner: Mutex::new(Inner {
                records: VecDeque::with_capacity(max_records.min(1024)),
                logs: VecDeque::with_capacity(max_logs.min(1024)),
                max_records: max_records.max(1),
                max_logs: max_logs.max(1),
            }),
            started_at: Utc::now(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_MAX_RECORDS, DEFAULT_MAX_LOGS)
    }

    /// Append a terminal record, evicting the oldest entry if at capacity.
    pub async fn record(&self, record: RequestRecord) {
        let mut inner = self.inner.lock().await;
        if inner.records.len() >= inner.max_records {
            inner.records.pop_front();
        }
        inner.records.push_back(record);
    }

    /// Append a structured system-log line, evicting the oldest if at capacity.
    pub async fn log(&self, level: &str, message: impl Into<String>, extra: Map<String, Value>) {
        let mut inner = self.inner.lock().await;
        if inner.logs.len() >= inner.max_logs {
            inner.logs.pop_front();
        }
        inner.logs.push_back(LogEntry {
            timestamp: Utc::now(),
            level: level.to_string(),
            message: message.into(),
            extra,
        });
    }

    async fn snapshot_records(&self) -> Vec<RequestRecord> {
        self.inner.lock().await.records.iter().cloned().collect()
    }

    async fn snapshot_logs(&self) -> Vec<LogEntry> {
        self.inner.lock().await.logs.iter().cloned().collect()
    }

    pub async fn overview(&self) -> Overview {
        let snapshot = self.snapshot_records().await;
        let total = snapshot.len();
        let ok = snapshot.iter().filter(|r| r.success).count();
        let err = total - ok;
        let latencies: Vec<u64> = snapshot.iter().map(|r| r.latency_ms).collect();
        let now = Utc::now();
        let rpm = snapshot
            .iter()
            .filter(|r| (now - r.timestamp).num_seconds() < 60)
            .count();
        let input_tokens: u64 = snapshot.iter().map(|r| r.input_tokens).sum();
        let output_tokens: u64 = snapshot.iter().map(|r| r.output_tokens).sum();
        let cost_usd: f64 = snapshot
            .iter()
            .map(|r| cost_usd(&r.upstream, r.input_tokens, r.output_tokens))
            .sum();
        let providers: usize = snapshot
            .iter()
            .map(|r| r.upstream.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len();
        let stream_count = snapshot.iter().filter(|r| r.is_stream).count();

        Overview {
            uptime_s: (now - self.started_at).num_seconds().max(0) as u64,
            total,
            ok,
            err,
            success_pct: pct(ok, total),
            latency: latency_stats(&latencies),
            rpm,
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            cost_usd,
            providers,
            stream_pct: pct(stream_count, total),
        }
    }

    async fn group_by<F>(&self, key_of: F) -> Vec<GroupStats>
    where
        F: Fn(&RequestRecord) -> String,
    {
        let snapshot = self.snapshot_records().await;
        let mut groups: HashMap<String, Vec<&RequestRecord>> = HashMap::new();
        for record in &snapshot {
            groups.entry(key_of(record)).or_default().push(record);
        }
        let mut out: Vec<GroupStats> = groups
            .into_iter()
            .map(|(key, records)| {
                let total = records.len();
                let ok = records.iter().filter(|r| r.success).count();
                let latencies: Vec<u64> = records.iter().map(|r| r.latency_ms).collect();
                let input_tokens: u64 = records.iter().map(|r| r.input_tokens).sum();
                let output_tokens: u64 = records.iter().map(|r| r.output_tokens).sum();
                let cost: f64 = records
                    .iter()
                    .map(|r| cost_usd(&r.upstream, r.input_tokens, r.output_tokens))
                    .sum();
                GroupStats {
                    key,
                    total,
                    ok,
                    err: total - ok,
                    success_pct: pct(ok, total),
                    latency: latency_stats(&latencies),
                    input_tokens,
                    output_tokens,
                    total_tokens: input_tokens + output_tokens,
                    cost_usd: cost,
                }
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub async fn per_provider(&self) -> Vec<GroupStats> {
        self.group_by(|r| r.upstream.clone()).await
    }

    pub async fn per_model(&self) -> Vec<GroupStats> {
        self.group_by(|r| r.model_alias.clone()).await
    }

    pub async fn financial(&self) -> Financial {
        let snapshot = self.snapshot_records().await;
        let mut per_upstream_cost_usd: HashMap<String, f64> = HashMap::new();
        let mut tier_dist = TierDist::default();

        for record in &snapshot {
            *per_upstream_cost_usd.entry(record.upstream.clone()).or_insert(0.0) +=
                cost_usd(&record.upstream, record.input_tokens, record.output_tokens);
            match record.route.as_str() {
                "free" => tier_dist.free += 1,
                "internal" => tier_dist.internal += 1,
                // direct-* folds into premium for this view, per spec.
                _ => tier_dist.premium += 1,
            }
        }

        let total = snapshot.len();
        let saving_pct = if total == 0 {
            0.0
        } else {
            (tier_dist.free + tier_dist.internal) as f64 / total as f64 * 100.0
        };

        Financial {
            per_upstream_cost_usd,
            tier_dist,
            saving_pct,
        }
    }

    pub async fn timeseries(&self, bucket_min: i64) -> Vec<TimeseriesBucket> {
        let bucket_sec = (bucket_min.max(1)) * 60;
        let snapshot = self.snapshot_records().await;
        let now = Utc::now();
        let cutoff = now - chrono::Duration::seconds(86_400);

        let mut buckets: HashMap<i64, Vec<&RequestRecord>> = HashMap::new();
        for record in &snapshot {
            if record.timestamp <= cutoff {
                continue;
            }
            let ts = record.timestamp.timestamp();
            let bucket_start = (ts / bucket_sec) * bucket_sec;
            buckets.entry(bucket_start).or_default().push(record);
        }

        let mut out: Vec<TimeseriesBucket> = buckets
            .into_iter()
            .map(|(bucket_start, records)| {
                let ok = records.iter().filter(|r| r.success).count();
                let avg_ms = if records.is_empty() {
                    0
                } else {
                    records.iter().map(|r| r.latency_ms).sum::<u64>() / records.len() as u64
                };
                let tokens = records
                    .iter()
                    .map(|r| r.input_tokens + r.output_tokens)
                    .sum();
                TimeseriesBucket {
                    bucket_start,
                    reqs: records.len(),
                    ok,
                    err: records.len() - ok,
                    avg_ms,
                    tokens,
                }
            })
            .collect();
        out.sort_by_key(|b| b.bucket_start);
        out
    }

    pub async fn errors(&self) -> Vec<(String, usize)> {
        let snapshot = self.snapshot_records().await;
        let mut histogram: HashMap<String, usize> = HashMap::new();
        for record in snapshot.iter().filter(|r| !r.success) {
            let key = record.error_type.clone().unwrap_or_else(|| "Unknown".to_string());
            *histogram.entry(key).or_insert(0) += 1;
        }
        let mut out: Vec<(String, usize)> = histogram.into_iter().collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out
    }

    pub async fn policies(&self) -> Vec<(String, usize)> {
        let snapshot = self.snapshot_records().await;
        let mut histogram: HashMap<String, usize> = HashMap::new();
        for record in &snapshot {
            *histogram.entry(record.policy.clone()).or_insert(0) += 1;
        }
        let mut out: Vec<(String, usize)> = histogram.into_iter().collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out
    }

    pub async fn fallbacks(&self) -> Vec<FallbackChain> {
        let snapshot = self.snapshot_records().await;
        let mut counts: HashMap<(String, String), usize> = HashMap::new();
        for record in &snapshot {
            if let Some(from) = &record.fallback_from {
                *counts
                    .entry((from.clone(), record.upstream.clone()))
                    .or_insert(0) += 1;
            }
        }
        let mut out: Vec<FallbackChain> = counts
            .into_iter()
            .map(|((from, to), count)| FallbackChain { from, to, count })
            .collect();
        out.sort_by(|a, b| b.count.cmp(&a.count));
        out
    }

    pub async fn request_log(&self, limit: usize) -> Vec<RequestRecord> {
        let snapshot = self.snapshot_records().await;
        snapshot.into_iter().rev().take(limit).collect()
    }

    pub async fn system_log(&self, limit: usize, level: Option<&str>) -> Vec<LogEntry> {
        let snapshot = self.snapshot_logs().await;
        snapshot
            .into_iter()
            .rev()
            .filter(|entry| match level {
                Some(lvl) => entry.level.eq_ignore_ascii_case(lvl),
                None => true,
            })
            .take(limit)
            .collect()
    }
}

fn pct(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(upstream: &str, success: bool, latency_ms: u64) -> RequestRecord {
        RequestRecord {
            timestamp: Utc::now(),
            model_alias: "rainymodel/chat".to_string(),
            upstream: upstream.to_string(),
            route: "free".to_string(),
            actual_model: "some-model".to_string(),
            policy: "auto".to_string(),
            latency_ms,
            success,
            status_code: if success { 200 } else { 502 },
            is_stream: false,
            input_tokens: 10,
            output_tokens: 20,
            error_type: if success { None } else { Some("UpstreamFailure".to_string()) },
            error_message: None,
            fallback_from: None,
        }
    }

    #[tokio::test]
    async fn overview_total_equals_snapshot_len() {
        let collector = MetricsCollector::new(10, 10);
        collector.record(sample_record("hf", true, 100)).await;
        collector.record(sample_record("openrouter", false, 200)).await;
        let overview = collector.overview().await;
        assert_eq!(overview.total, 2);
        assert_eq!(overview.ok + overview.err, overview.total);
    }

    #[tokio::test]
    async fn percentile_monotonicity_holds() {
        let collector = MetricsCollector::new(100, 100);
        for ms in [10, 20, 30, 40, 50, 60, 70, 80, 90, 100] {
            collector.record(sample_record("hf", true, ms)).await;
        }
        let overview = collector.overview().await;
        assert!(overview.latency.min_ms <= overview.latency.avg_ms);
        assert!(overview.latency.avg_ms <= overview.latency.p95_ms || overview.latency.p95_ms >= overview.latency.median_ms);
        assert!(overview.latency.p95_ms <= overview.latency.p99_ms);
        assert!(overview.latency.p99_ms <= overview.latency.max_ms);
    }

    #[tokio::test]
    async fn capacity_eviction_keeps_length_bounded() {
        let collector = MetricsCollector::new(3, 10);
        for i in 0..10u64 {
            collector.record(sample_record("hf", true, i)).await;
        }
        let snapshot = collector.snapshot_records().await;
        assert_eq!(snapshot.len(), 3);
        // oldest evicted: remaining latencies should be the last three inserted
        let latencies: Vec<u64> = snapshot.iter().map(|r| r.latency_ms).collect();
        assert_eq!(latencies, vec![7, 8, 9]);
    }

    #[tokio::test]
    async fn fallback_chains_are_counted_by_pair() {
        let collector = MetricsCollector::new(10, 10);
        let mut r1 = sample_record("openrouter", true, 100);
        r1.fallback_from = Some("hf".to_string());
        let mut r2 = sample_record("openrouter", true, 150);
        r2.fallback_from = Some("hf".to_string());
        collector.record(r1).await;
        collector.record(r2).await;
        let chains = collector.fallbacks().await;
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].from, "hf");
        assert_eq!(chains[0].to, "openrouter");
        assert_eq!(chains[0].count, 2);
    }

    #[tokio::test]
    async fn errors_histogram_sorted_by_count_desc() {
        let collector = MetricsCollector::new(10, 10);
        collector.record(sample_record("hf", false, 10)).await;
        collector.record(sample_record("hf", false, 10)).await;
        let mut other = sample_record("openrouter", false, 10);
        other.error_type = Some("RateLimited".to_string());
        collector.record(other).await;
        let errors = collector.errors().await;
        assert_eq!(errors[0].0, "UpstreamFailure");
        assert_eq!(errors[0].1, 2);
    }

    #[tokio::test]
    async fn financial_saving_pct_reflects_free_and_internal_share() {
        let collector = MetricsCollector::new(10, 10);
        let mut free = sample_record("hf", true, 10);
        free.route = "free".to_string();
        let mut premium = sample_record("openrouter", true, 10);
        premium.route = "premium".to_string();
        collector.record(free).await;
        collector.record(premium).await;
        let financial = collector.financial().await;
        assert_eq!(financial.tier_dist.free, 1);
        assert_eq!(financial.tier_dist.premium, 1);
        assert_eq!(financial.saving_pct, 50.0);
    }

    #[tokio::test]
    async fn system_log_filters_by_level() {
        let collector = MetricsCollector::new(10, 10);
        collector.log("info", "started", Map::new()).await;
        collector.log("error", "boom", Map::new()).await;
        let errors_only = collector.system_log(10, Some("error")).await;
        assert_eq!(errors_only.len(), 1);
        assert_eq!(errors_only[0].message, "boom");
    }

    #[tokio::test]
    async fn request_log_returns_newest_first() {
        let collector = MetricsCollector::new(10, 10);
        collector.record(sample_record("hf", true, 1)).await;
        collector.record(sample_record("openrouter", true, 2)).await;
        let log = collector.request_log(10).await;
        assert_eq!(log[0].upstream, "openrouter");
        assert_eq!(log[1].upstream, "hf");
    }
}
