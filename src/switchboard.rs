//! The Switchboard facade: the only type most callers touch. Owns the
//! deployment set, selection engine, background supervisor, and metrics
//! registry, and implements the outer retry/failover loop.
//!
//! Grounded in the teacher's `Router::execute_with_retry`
//! (`core/router/execute_impl.rs`): select, invoke, retry retryable failures
//! against a freshly-selected deployment, cool down on exhaustion. The
//! teacher's `execute`'s cross-model fallback iteration has no counterpart
//! here — there's only one model per deployment, so failover is purely
//! across deployments within `execute_with_retry`'s loop shape.

use crate::config::SwitchboardConfig;
use crate::deployment::client::{AzureInferenceClient, ChatStream, InferenceClient};
use crate::deployment::Deployment;
use crate::error::{Result, SwitchboardError};
use crate::metrics::{Metrics, RequestStatus, TokenKind};
use crate::selection::SelectionEngine;
use crate::supervisor::BackgroundSupervisor;
use crate::types::{ChatRequest, ChatResponse};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Builds an [`InferenceClient`] for a deployment. Defaults to
/// [`AzureInferenceClient`]; override via [`Switchboard::new_with_factory`]
/// to substitute a test double or a different transport.
pub type ClientFactory = Arc<dyn Fn(&crate::config::DeploymentDefinition) -> Result<Arc<dyn InferenceClient>> + Send + Sync>;

fn default_client_factory() -> ClientFactory {
    Arc::new(|definition| {
        let client = AzureInferenceClient::new(
            definition.api_base.clone(),
            definition.api_key.clone(),
            definition.api_version.clone(),
            definition.name.clone(),
            definition.timeout(),
        )?;
        Ok(Arc::new(client) as Arc<dyn InferenceClient>)
    })
}

pub struct Switchboard {
    selection: Arc<SelectionEngine>,
    deployments: Vec<Arc<Deployment>>,
    metrics: Metrics,
    config: SwitchboardConfig,
    supervisor: Mutex<Option<BackgroundSupervisor>>,
}

impl Switchboard {
    /// Builds deployments from `config` using the default Azure client
    /// factory. Does not start the background supervisor; call
    /// [`Self::start`] before routing traffic.
    pub fn new(config: SwitchboardConfig) -> Result<Self> {
        Self::new_with_factory(config, default_client_factory())
    }

    /// Like [`Self::new`] but with a caller-supplied client factory, the
    /// seam test doubles plug into.
    pub fn new_with_factory(config: SwitchboardConfig, factory: ClientFactory) -> Result<Self> {
        if config.deployments.is_empty() {
            return Err(SwitchboardError::Config("no deployments configured".to_string()));
        }

        let mut deployments = Vec::with_capacity(config.deployments.len());
        for definition in &config.deployments {
            let client = factory(definition)?;
            deployments.push(Arc::new(Deployment::new(definition.clone(), client)));
        }

        let selection = Arc::new(SelectionEngine::new(deployments.clone(), config.session_capacity));

        Ok(Self {
            selection,
            deployments,
            metrics: Metrics::new(),
            config,
            supervisor: Mutex::new(None),
        })
    }

    /// Starts the background supervisor. Idempotent: a second call is a
    /// no-op while already started.
    pub async fn start(&self) {
        let mut guard = self.supervisor.lock().await;
        if guard.is_some() {
            debug!("switchboard already started");
            return;
        }
        let supervisor = BackgroundSupervisor::start(
            self.deployments.clone(),
            Duration::from_secs(self.config.healthcheck_interval_secs),
            Duration::from_secs(self.config.ratelimit_window_secs),
        );
        info!(deployments = self.deployments.len(), "switchboard started");
        *guard = Some(supervisor);
    }

    /// Stops the background supervisor. Idempotent: a second call is a
    /// no-op once already stopped.
    pub async fn stop(&self) {
        let supervisor = self.supervisor.lock().await.take();
        if let Some(supervisor) = supervisor {
            supervisor.stop().await;
            info!("switchboard stopped");
        }
    }

    /// Picks a deployment without dispatching a request; exposed for
    /// inspection and tests, mirroring the teacher's standalone
    /// `select_deployment`.
    pub fn select_deployment(&self, session_id: Option<&str>) -> Result<Arc<Deployment>> {
        self.selection.select(session_id).map(|(deployment, _)| deployment)
    }

    /// The configured deployment set, e.g. for building gauge readings to
    /// pass into [`Metrics::export_prometheus`].
    pub fn deployments(&self) -> &[Arc<Deployment>] {
        &self.deployments
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Routes a non-streaming chat completion, retrying retryable failures
    /// against a different healthy deployment up to `max_attempts` times.
    /// Exhausting retries surfaces [`SwitchboardError::AllDeploymentsFailed`].
    /// `request.stream` must be `false`; streaming callers use
    /// [`Self::create_stream`] instead.
    pub async fn create(&self, request: &ChatRequest) -> Result<ChatResponse> {
        if request.stream {
            return Err(SwitchboardError::Config(
                "request.stream is true; use Switchboard::create_stream instead".to_string(),
            ));
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut excluded = HashSet::new();
        let mut causes = Vec::new();

        for attempt in 1..=max_attempts {
            let deployment = match self.pick(request, &excluded) {
                Ok(deployment) => deployment,
                Err(err) => {
                    causes.push(err.to_string());
                    break;
                }
            };

            let start = Instant::now();
            let result = deployment.create(request).await;
            let elapsed = start.elapsed().as_secs_f64();

            match result {
                Ok(response) => {
                    self.metrics.record_request(deployment.name(), &request.model, RequestStatus::Success, elapsed);
                    self.metrics.record_tokens(deployment.name(), &request.model, TokenKind::Prompt, response.usage.prompt_tokens);
                    self.metrics.record_tokens(
                        deployment.name(),
                        &request.model,
                        TokenKind::Completion,
                        response.usage.completion_tokens,
                    );
                    return Ok(response);
                }
                Err(err) => {
                    self.metrics.record_request(deployment.name(), &request.model, RequestStatus::Error, elapsed);
                    causes.push(err.to_string());

                    if err.is_retryable() && attempt < max_attempts {
                        if let Some(session_id) = &request.session_id {
                            self.selection.evict_session(session_id);
                        }
                        excluded.insert(deployment.name().to_string());
                        warn!(deployment = deployment.name(), attempt, "retrying request on a different deployment");
                        continue;
                    }

                    if !err.is_retryable() {
                        return Err(err);
                    }
                    break;
                }
            }
        }

        Err(SwitchboardError::AllDeploymentsFailed {
            attempts: max_attempts,
            causes: causes.join("; "),
        })
    }

    /// Routes a streaming chat completion through the same select/retry
    /// loop as [`Self::create`]. Once a deployment's transport stream is
    /// obtained, it is returned to the caller unchanged: spec.md's streaming
    /// retry window closes at the first byte, so only stream-*setup*
    /// failures are retried against a different deployment here, never
    /// failures that occur after the caller starts consuming the stream.
    pub async fn create_stream(&self, request: &ChatRequest) -> Result<ChatStream> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut excluded = HashSet::new();
        let mut causes = Vec::new();

        for attempt in 1..=max_attempts {
            let deployment = match self.pick(request, &excluded) {
                Ok(deployment) => deployment,
                Err(err) => {
                    causes.push(err.to_string());
                    break;
                }
            };

            let start = Instant::now();
            let result = deployment.create_stream(request).await;
            let elapsed = start.elapsed().as_secs_f64();

            match result {
                Ok(stream) => {
                    self.metrics.record_request(deployment.name(), &request.model, RequestStatus::Success, elapsed);
                    return Ok(stream);
                }
                Err(err) => {
                    self.metrics.record_request(deployment.name(), &request.model, RequestStatus::Error, elapsed);
                    causes.push(err.to_string());

                    if err.is_retryable() && attempt < max_attempts {
                        if let Some(session_id) = &request.session_id {
                            self.selection.evict_session(session_id);
                        }
                        excluded.insert(deployment.name().to_string());
                        warn!(deployment = deployment.name(), attempt, "retrying stream setup on a different deployment");
                        continue;
                    }

                    if !err.is_retryable() {
                        return Err(err);
                    }
                    break;
                }
            }
        }

        Err(SwitchboardError::AllDeploymentsFailed {
            attempts: max_attempts,
            causes: causes.join("; "),
        })
    }

    fn pick(&self, request: &ChatRequest, excluded: &HashSet<String>) -> Result<Arc<Deployment>> {
        if excluded.is_empty() {
            let (deployment, outcome) = self.selection.select(request.session_id.as_deref())?;
            if let Some(outcome) = outcome {
                self.metrics.record_session_affinity(deployment.name(), outcome);
            }
            Ok(deployment)
        } else {
            self.selection.select_excluding(excluded)
        }
    }
}
