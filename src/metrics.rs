//! Telemetry wiring: counters and gauges under the stable names spec.md §6
//! commits to, exported in Prometheus text format.
//!
//! Grounded in the teacher's hand-rolled `core/router/metrics.rs`
//! (`RouterMetrics`/`MetricsData` behind `Arc<RwLock<_>>`, manual
//! `export_prometheus` via `std::fmt::Write`) rather than pulling in the
//! `prometheus` crate, which the teacher also doesn't use for this. Metric
//! names are this crate's own contract, not the teacher's
//! `router_requests_total`-style names.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type RequestKey = (String, String, &'static str);
type TokenKey = (String, String, &'static str);
type AffinityKey = (String, &'static str);

#[derive(Debug, Default)]
struct DurationStats {
    sum: RwLock<f64>,
    count: AtomicU64,
}

/// Process-wide metrics registry. Cheap to clone (`Arc` internally); shared
/// between the [`crate::switchboard::Switchboard`] facade and its
/// collaborators so both can record without threading a reference through
/// every call.
#[derive(Clone, Default)]
pub struct Metrics {
    requests_total: Arc<DashMap<RequestKey, AtomicU64>>,
    duration: Arc<DashMap<RequestKey, DurationStats>>,
    tokens_total: Arc<DashMap<TokenKey, AtomicU64>>,
    session_affinity_events_total: Arc<DashMap<AffinityKey, AtomicU64>>,
}

/// Outcome label for [`Metrics::record_request`], matching spec.md §6's
/// `status={success,error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Token kind label for [`Metrics::record_tokens`], matching spec.md §6's
/// `kind={prompt,completion,cached}`. This crate never surfaces cached-token
/// counts (the underlying client doesn't report them), so only the first two
/// are ever recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Prompt,
    Completion,
}

impl TokenKind {
    fn as_str(self) -> &'static str {
        match self {
            TokenKind::Prompt => "prompt",
            TokenKind::Completion => "completion",
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, deployment: &str, model: &str, status: RequestStatus, duration_secs: f64) {
        let key = (deployment.to_string(), model.to_string(), status.as_str());
        self.requests_total.entry(key.clone()).or_default().fetch_add(1, Ordering::Relaxed);

        let stats = self.duration.entry(key).or_default();
        *stats.sum.write() += duration_secs;
        stats.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tokens(&self, deployment: &str, model: &str, kind: TokenKind, tokens: u64) {
        let key = (deployment.to_string(), model.to_string(), kind.as_str());
        self.tokens_total.entry(key).or_default().fetch_add(tokens, Ordering::Relaxed);
    }

    pub fn record_session_affinity(&self, deployment: &str, outcome: crate::selection::AffinityOutcome) {
        use crate::selection::AffinityOutcome;
        let label = match outcome {
            AffinityOutcome::Hit => "hit",
            AffinityOutcome::Miss => "miss",
            AffinityOutcome::Rebind => "rebind",
        };
        let key = (deployment.to_string(), label);
        self.session_affinity_events_total.entry(key).or_default().fetch_add(1, Ordering::Relaxed);
    }

    #[cfg(test)]
    fn requests_total_for(&self, deployment: &str, model: &str, status: RequestStatus) -> u64 {
        self.requests_total
            .get(&(deployment.to_string(), model.to_string(), status.as_str()))
            .map(|entry| entry.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn affinity_events_for(&self, deployment: &str, result: &str) -> u64 {
        self.session_affinity_events_total
            .get(&(deployment.to_string(), result))
            .map(|entry| entry.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Renders all counters plus the caller-supplied gauge readings
    /// (utilization and health, which live on [`crate::deployment::Deployment`]
    /// rather than here) as Prometheus text exposition format.
    pub fn export_prometheus(&self, gauges: &[(String, f64, f64, bool)]) -> String {
        let mut out = String::new();

        writeln!(out, "# HELP requests_total Total chat completion requests.").unwrap();
        writeln!(out, "# TYPE requests_total counter").unwrap();
        for entry in self.requests_total.iter() {
            let (deployment, model, status) = entry.key();
            writeln!(
                out,
                "requests_total{{deployment=\"{deployment}\",model=\"{model}\",status=\"{status}\"}} {}",
                entry.value().load(Ordering::Relaxed)
            )
            .unwrap();
        }

        writeln!(out, "# HELP request_duration_seconds Request latency in seconds.").unwrap();
        writeln!(out, "# TYPE request_duration_seconds summary").unwrap();
        for entry in self.duration.iter() {
            let (deployment, model, status) = entry.key();
            let sum = *entry.value().sum.read();
            let count = entry.value().count.load(Ordering::Relaxed);
            writeln!(
                out,
                "request_duration_seconds_sum{{deployment=\"{deployment}\",model=\"{model}\",status=\"{status}\"}} {sum}"
            )
            .unwrap();
            writeln!(
                out,
                "request_duration_seconds_count{{deployment=\"{deployment}\",model=\"{model}\",status=\"{status}\"}} {count}"
            )
            .unwrap();
        }

        writeln!(out, "# HELP tokens_total Total tokens accounted for.").unwrap();
        writeln!(out, "# TYPE tokens_total counter").unwrap();
        for entry in self.tokens_total.iter() {
            let (deployment, model, kind) = entry.key();
            writeln!(
                out,
                "tokens_total{{deployment=\"{deployment}\",model=\"{model}\",kind=\"{kind}\"}} {}",
                entry.value().load(Ordering::Relaxed)
            )
            .unwrap();
        }

        writeln!(out, "# HELP session_affinity_events_total Session affinity hits, misses, and rebinds.").unwrap();
        writeln!(out, "# TYPE session_affinity_events_total counter").unwrap();
        for entry in self.session_affinity_events_total.iter() {
            let (deployment, result) = entry.key();
            writeln!(
                out,
                "session_affinity_events_total{{deployment=\"{deployment}\",result=\"{result}\"}} {}",
                entry.value().load(Ordering::Relaxed)
            )
            .unwrap();
        }

        writeln!(out, "# HELP rpm_utilization Fraction of the requests-per-minute budget in use.").unwrap();
        writeln!(out, "# TYPE rpm_utilization gauge").unwrap();
        writeln!(out, "# HELP tpm_utilization Fraction of the tokens-per-minute budget in use.").unwrap();
        writeln!(out, "# TYPE tpm_utilization gauge").unwrap();
        writeln!(out, "# HELP deployment_healthy Whether the deployment currently accepts traffic.").unwrap();
        writeln!(out, "# TYPE deployment_healthy gauge").unwrap();
        for (name, rpm_utilization, tpm_utilization, healthy) in gauges {
            writeln!(out, "rpm_utilization{{deployment=\"{name}\"}} {rpm_utilization}").unwrap();
            writeln!(out, "tpm_utilization{{deployment=\"{name}\"}} {tpm_utilization}").unwrap();
            writeln!(out, "deployment_healthy{{deployment=\"{name}\"}} {}", if *healthy { 1 } else { 0 }).unwrap();
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::AffinityOutcome;

    #[test]
    fn record_and_export_round_trips_counters() {
        let metrics = Metrics::new();
        metrics.record_request("d1", "gpt-4o-mini", RequestStatus::Success, 0.25);
        metrics.record_tokens("d1", "gpt-4o-mini", TokenKind::Prompt, 10);
        metrics.record_tokens("d1", "gpt-4o-mini", TokenKind::Completion, 5);
        metrics.record_session_affinity("d1", AffinityOutcome::Hit);

        assert_eq!(metrics.requests_total_for("d1", "gpt-4o-mini", RequestStatus::Success), 1);
        assert_eq!(metrics.affinity_events_for("d1", "hit"), 1);

        let text = metrics.export_prometheus(&[("d1".to_string(), 0.1, 0.2, true)]);
        assert!(text.contains("requests_total{deployment=\"d1\",model=\"gpt-4o-mini\",status=\"success\"} 1"));
        assert!(text.contains("tokens_total{deployment=\"d1\",model=\"gpt-4o-mini\",kind=\"prompt\"} 10"));
        assert!(text.contains("session_affinity_events_total{deployment=\"d1\",result=\"hit\"} 1"));
        assert!(text.contains("deployment_healthy{deployment=\"d1\"} 1"));
    }
}
