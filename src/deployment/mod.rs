//! Deployment Client: one instance per configured Azure OpenAI endpoint.
//!
//! Owns immutable configuration, lock-free runtime state (mirroring the
//! teacher's `DeploymentState` atomics in `core/router/deployment.rs`), and a
//! pluggable [`InferenceClient`]. Exposes the capability interface spec.md §9
//! calls out: `create`, `probe`, `utilization`, `cooldown`, `reset_usage`.

pub mod client;

pub use client::{AzureInferenceClient, ChatStream, InferenceClient};

use crate::config::DeploymentDefinition;
use crate::error::{Result, SwitchboardError};
use crate::retry::BackoffPolicy;
use crate::types::{ChatMessage, ChatRequest, ChatResponse, MessageRole};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// The three states spec.md §4.1 defines. Collapsed from the teacher's
/// five-state `HealthStatus` (Unknown/Healthy/Degraded/Unhealthy/Cooldown) —
/// see DESIGN.md for the reasoning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    CoolingDown,
    Unhealthy,
}

/// Lock-free runtime state. `Relaxed` ordering throughout: routing tolerates
/// eventually-consistent counters and no cross-field invariant needs atomic
/// updates, following the teacher's `DeploymentState` design rationale.
#[derive(Debug)]
struct DeploymentState {
    healthy: AtomicBool,
    /// Unix seconds; 0 means "no cooldown set".
    cooldown_until: AtomicU64,
    tpm_used: AtomicU64,
    rpm_used: AtomicU64,
    in_flight: AtomicU32,
    last_reset_at: AtomicU64,
}

impl DeploymentState {
    fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            cooldown_until: AtomicU64::new(0),
            tpm_used: AtomicU64::new(0),
            rpm_used: AtomicU64::new(0),
            in_flight: AtomicU32::new(0),
            last_reset_at: AtomicU64::new(current_timestamp()),
        }
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX_EPOCH")
        .as_secs()
}

pub struct Deployment {
    config: DeploymentDefinition,
    state: Arc<DeploymentState>,
    client: Arc<dyn InferenceClient>,
    backoff: BackoffPolicy,
}

impl Deployment {
    pub fn new(config: DeploymentDefinition, client: Arc<dyn InferenceClient>) -> Self {
        let backoff = BackoffPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        Self {
            config,
            state: Arc::new(DeploymentState::new()),
            client,
            backoff,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &DeploymentDefinition {
        &self.config
    }

    pub fn in_flight(&self) -> u32 {
        self.state.in_flight.load(Ordering::Relaxed)
    }

    /// `false` whenever `now < cooldown_until`, otherwise the last
    /// probe/operation outcome.
    pub fn healthy(&self) -> bool {
        if self.is_in_cooldown() {
            return false;
        }
        self.state.healthy.load(Ordering::Relaxed)
    }

    pub fn is_in_cooldown(&self) -> bool {
        self.state.cooldown_until.load(Ordering::Relaxed) > current_timestamp()
    }

    pub fn health_status(&self) -> HealthStatus {
        if self.is_in_cooldown() {
            HealthStatus::CoolingDown
        } else if self.state.healthy.load(Ordering::Relaxed) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    /// Fraction of the requests-per-minute budget in use; 0 for unlimited.
    pub fn rpm_utilization(&self) -> f64 {
        if self.config.rpm_ratelimit == 0 {
            0.0
        } else {
            self.state.rpm_used.load(Ordering::Relaxed) as f64 / self.config.rpm_ratelimit as f64
        }
    }

    /// Fraction of the tokens-per-minute budget in use; 0 for unlimited.
    pub fn tpm_utilization(&self) -> f64 {
        if self.config.tpm_ratelimit == 0 {
            0.0
        } else {
            self.state.tpm_used.load(Ordering::Relaxed) as f64 / self.config.tpm_ratelimit as f64
        }
    }

    /// `max(rpm_utilization(), tpm_utilization())`, the combined score the
    /// selection engine compares candidates on.
    pub fn utilization(&self) -> f64 {
        self.rpm_utilization().max(self.tpm_utilization())
    }

    /// Sets `cooldown_until = now + (duration or cooldown_period)` and marks
    /// unhealthy.
    pub fn cooldown(&self, duration: Option<Duration>) {
        let secs = duration.unwrap_or_else(|| self.config.cooldown_period()).as_secs();
        self.state
            .cooldown_until
            .store(current_timestamp() + secs, Ordering::Relaxed);
        self.state.healthy.store(false, Ordering::Relaxed);
        warn!(deployment = self.name(), cooldown_secs = secs, "deployment entering cooldown");
    }

    /// Called by the Background Supervisor at window rollover.
    pub fn reset_usage(&self) {
        self.state.tpm_used.store(0, Ordering::Relaxed);
        self.state.rpm_used.store(0, Ordering::Relaxed);
        self.state.last_reset_at.store(current_timestamp(), Ordering::Relaxed);
    }

    /// Issues a minimal completion to verify reachability. Success clears any
    /// elapsed cooldown and marks healthy; failure marks unhealthy and starts
    /// a cooldown.
    pub async fn probe(&self) -> bool {
        let probe_request = ChatRequest::new(String::new())
            .with_message(ChatMessage::new(MessageRole::User, "ping"));
        let mut probe_request = probe_request;
        probe_request.max_tokens = Some(1);

        match self.client.complete(&probe_request).await {
            Ok(_) => {
                self.state.healthy.store(true, Ordering::Relaxed);
                if current_timestamp() >= self.state.cooldown_until.load(Ordering::Relaxed) {
                    self.state.cooldown_until.store(0, Ordering::Relaxed);
                }
                true
            }
            Err(err) => {
                debug!(deployment = self.name(), error = %err, "probe failed");
                self.state.healthy.store(false, Ordering::Relaxed);
                self.cooldown(None);
                false
            }
        }
    }

    /// Non-streaming completion. Accounts provisional usage before dispatch,
    /// retries transient failures in place with backoff+jitter, reconciles
    /// usage against the authoritative token count on success, and cools
    /// down the deployment on exhaustion.
    pub async fn create(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let estimate = request.estimate_input_tokens() as u64;
        self.state.in_flight.fetch_add(1, Ordering::Relaxed);
        self.state.tpm_used.fetch_add(estimate, Ordering::Relaxed);
        self.state.rpm_used.fetch_add(1, Ordering::Relaxed);

        let result = self.create_with_inner_retry(request).await;

        self.state.in_flight.fetch_sub(1, Ordering::Relaxed);

        match &result {
            Ok(response) => {
                let actual = response.usage.total_tokens;
                reconcile(&self.state.tpm_used, estimate, actual);
            }
            Err(err) => {
                if let Some(reason) = err.cooldown_reason() {
                    let duration = cooldown_duration_for(err, self.config.cooldown_period());
                    debug!(deployment = self.name(), ?reason, cooldown_secs = duration.as_secs(), "cooling down after exhausted retries");
                    self.cooldown(Some(duration));
                }
            }
        }

        result
    }

    async fn create_with_inner_retry(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.complete(request).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt < self.backoff.max_attempts => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    debug!(deployment = self.name(), attempt, ?delay, "retrying after transient error");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Streaming completion. Retries are not applied here: by the time the
    /// caller receives the stream, the first request has already succeeded
    /// at the HTTP level; per spec.md §4.5, streaming retries are only valid
    /// before the first byte.
    pub async fn create_stream(&self, request: &ChatRequest) -> Result<ChatStream> {
        let estimate = request.estimate_input_tokens() as u64;
        self.state.in_flight.fetch_add(1, Ordering::Relaxed);
        self.state.tpm_used.fetch_add(estimate, Ordering::Relaxed);
        self.state.rpm_used.fetch_add(1, Ordering::Relaxed);

        match self.client.complete_stream(request).await {
            Ok(inner) => Ok(wrap_stream(inner, self.state.clone(), self.name().to_string(), estimate)),
            Err(err) => {
                self.state.in_flight.fetch_sub(1, Ordering::Relaxed);
                if let Some(reason) = err.cooldown_reason() {
                    let duration = cooldown_duration_for(&err, self.config.cooldown_period());
                    debug!(deployment = self.name(), ?reason, cooldown_secs = duration.as_secs(), "cooling down after stream setup failure");
                    self.cooldown(Some(duration));
                }
                Err(err)
            }
        }
    }
}

/// Cooldown length for a cooldown-triggering error: a 429 carrying
/// `retry_after_secs` cools down for at least that long, since re-admitting
/// the deployment sooner than the server instructed would just draw another
/// rate-limit response. Other cooldown-triggering errors use `default`
/// (the deployment's configured `cooldown_period`).
fn cooldown_duration_for(err: &SwitchboardError, default: Duration) -> Duration {
    match err {
        SwitchboardError::RateLimited {
            retry_after_secs: Some(secs),
            ..
        } => Duration::from_secs(*secs).max(default),
        _ => default,
    }
}

/// Subtracts the provisional estimate and adds the authoritative count.
/// Saturating: concurrent resets may race this, which is an accepted
/// lost-update under the counters' "safe under lost-update tolerance"
/// invariant (spec.md §5).
fn reconcile(counter: &AtomicU64, estimate: u64, actual: u64) {
    let mut current = counter.load(Ordering::Relaxed);
    loop {
        let adjusted = current.saturating_sub(estimate).saturating_add(actual);
        match counter.compare_exchange_weak(current, adjusted, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

/// Wraps the raw client stream so `in_flight` is decremented and usage is
/// reconciled once the stream is fully drained, without altering any of the
/// yielded items (pass-through, spec.md §1 non-goal on transformation). Holds
/// its own `Arc<DeploymentState>` so it can outlive the `Deployment` borrow
/// that produced it.
fn wrap_stream(inner: ChatStream, state: Arc<DeploymentState>, name: String, estimate: u64) -> ChatStream {
    use futures::StreamExt;

    let stream = async_stream::stream! {
        futures::pin_mut!(inner);
        let mut last_usage = None;
        while let Some(item) = inner.next().await {
            if let Ok(chunk) = &item {
                if let Some(usage) = &chunk.usage {
                    last_usage = Some(usage.total_tokens);
                }
            }
            yield item;
        }
        state.in_flight.fetch_sub(1, Ordering::Relaxed);
        if let Some(actual) = last_usage {
            reconcile(&state.tpm_used, estimate, actual);
        }
        debug!(deployment = name, "stream drained");
    };

    Box::pin(stream)
}
