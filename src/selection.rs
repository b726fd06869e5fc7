//! Selection Engine: session affinity with a power-of-two-choices fallback.
//!
//! Grounded in the teacher's `core/router/strategy_impl.rs` (DashMap
//! iteration over candidates, `rand::thread_rng()` for the random draw) and
//! `core/cache_manager/manager.rs` for the affinity lookup shape. Diverges
//! from `strategy_impl::least_busy` in one deliberate way: ties are broken
//! deterministically (by `in_flight`, then by name) rather than randomly, so
//! routing decisions are reproducible under test.

use crate::deployment::Deployment;
use crate::error::{Result, SwitchboardError};
use crate::session_map::SessionMap;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::{debug, trace};

/// Which branch of the affinity algorithm produced a pick, for the
/// `session_affinity_events_total{hit|miss|rebind}` metric (spec.md §6).
/// Only meaningful when a `session_id` was supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffinityOutcome {
    /// The session's existing binding was still healthy.
    Hit,
    /// No prior binding existed; a fresh one was recorded.
    Miss,
    /// The prior binding's deployment had gone unhealthy; a new one replaced it.
    Rebind,
}

pub struct SelectionEngine {
    deployments: DashMap<String, Arc<Deployment>>,
    sessions: SessionMap,
}

impl SelectionEngine {
    pub fn new(deployments: Vec<Arc<Deployment>>, session_capacity: usize) -> Self {
        let map = DashMap::new();
        for deployment in deployments {
            map.insert(deployment.name().to_string(), deployment);
        }
        Self {
            deployments: map,
            sessions: SessionMap::new(session_capacity),
        }
    }

    pub fn deployment(&self, name: &str) -> Option<Arc<Deployment>> {
        self.deployments.get(name).map(|entry| entry.value().clone())
    }

    pub fn deployment_count(&self) -> usize {
        self.deployments.len()
    }

    fn healthy_candidates(&self) -> Vec<Arc<Deployment>> {
        self.deployments
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|deployment| deployment.healthy())
            .collect()
    }

    /// Like [`Self::select`] but skips deployments by name, for the outer
    /// retry loop re-selecting after a failed attempt. Ignores session
    /// affinity: once a session's pick has failed, the switchboard's retry
    /// loop is choosing a replacement, not re-confirming the binding.
    pub fn select_excluding(&self, excluded: &std::collections::HashSet<String>) -> Result<Arc<Deployment>> {
        let candidates: Vec<Arc<Deployment>> = self
            .healthy_candidates()
            .into_iter()
            .filter(|d| !excluded.contains(d.name()))
            .collect();

        match candidates.len() {
            0 => Err(SwitchboardError::NoHealthyDeployment),
            1 => Ok(candidates.into_iter().next().unwrap()),
            _ => {
                let mut rng = rand::thread_rng();
                let picks: Vec<&Arc<Deployment>> = candidates.choose_multiple(&mut rng, 2).collect();
                Ok(pick_winner(picks[0], picks[1]).clone())
            }
        }
    }

    /// Picks a deployment for `request`. When `session_id` is set and maps to
    /// a still-healthy deployment, that binding wins (session affinity);
    /// otherwise falls through to power-of-two-choices among healthy
    /// candidates, after which the binding (if any) is refreshed. The second
    /// return value is `None` for sessionless calls and otherwise reports
    /// which affinity branch fired.
    pub fn select(&self, session_id: Option<&str>) -> Result<(Arc<Deployment>, Option<AffinityOutcome>)> {
        let Some(session_id) = session_id else {
            return Ok((self.power_of_two_choices()?, None));
        };

        let mut rebinding = false;
        if let Some(bound_name) = self.sessions.get(session_id) {
            match self.deployment(&bound_name) {
                Some(deployment) if deployment.healthy() => {
                    trace!(session_id, deployment = deployment.name(), "session affinity hit");
                    return Ok((deployment, Some(AffinityOutcome::Hit)));
                }
                _ => {
                    debug!(session_id, deployment = bound_name, "session affinity target unhealthy, evicting");
                    self.sessions.evict(session_id);
                    rebinding = true;
                }
            }
        }

        let chosen = self.power_of_two_choices()?;
        self.sessions.put(session_id, chosen.name());

        let outcome = if rebinding { AffinityOutcome::Rebind } else { AffinityOutcome::Miss };
        Ok((chosen, Some(outcome)))
    }

    fn power_of_two_choices(&self) -> Result<Arc<Deployment>> {
        let candidates = self.healthy_candidates();
        match candidates.len() {
            0 => Err(SwitchboardError::NoHealthyDeployment),
            1 => Ok(candidates.into_iter().next().unwrap()),
            _ => {
                let mut rng = rand::thread_rng();
                let picks: Vec<&Arc<Deployment>> = candidates.choose_multiple(&mut rng, 2).collect();
                let (first, second) = (picks[0], picks[1]);
                Ok(pick_winner(first, second).clone())
            }
        }
    }

    /// Removes a session binding, e.g. after the deployment it pointed to
    /// just failed a request and failover moved on.
    pub fn evict_session(&self, session_id: &str) {
        self.sessions.evict(session_id);
    }
}

/// Lower `utilization()` wins; ties break on fewer `in_flight`, then on
/// lexicographically smaller name, so the outcome is deterministic given
/// identical atomic reads.
fn pick_winner<'a>(a: &'a Arc<Deployment>, b: &'a Arc<Deployment>) -> &'a Arc<Deployment> {
    let (util_a, util_b) = (a.utilization(), b.utilization());
    if util_a != util_b {
        return if util_a < util_b { a } else { b };
    }
    let (inflight_a, inflight_b) = (a.in_flight(), b.in_flight());
    if inflight_a != inflight_b {
        return if inflight_a < inflight_b { a } else { b };
    }
    if a.name() <= b.name() { a } else { b }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeploymentDefinition;
    use crate::deployment::client::{ChatStream, InferenceClient};
    use crate::types::{ChatRequest, ChatResponse};
    use async_trait::async_trait;

    struct NeverCalledClient;

    #[async_trait]
    impl InferenceClient for NeverCalledClient {
        async fn complete(&self, _request: &ChatRequest) -> Result<ChatResponse> {
            unimplemented!("selection tests never dispatch a request")
        }
        async fn complete_stream(&self, _request: &ChatRequest) -> Result<ChatStream> {
            unimplemented!("selection tests never dispatch a request")
        }
    }

    fn deployment(name: &str) -> Arc<Deployment> {
        let config = DeploymentDefinition {
            name: name.to_string(),
            api_base: "https://example.openai.azure.com".to_string(),
            api_key: "key".to_string(),
            api_version: "2024-02-01".to_string(),
            timeout_secs: 30,
            tpm_ratelimit: 1000,
            rpm_ratelimit: 10,
            healthcheck_interval_secs: 10,
            cooldown_period_secs: 5,
        };
        Arc::new(Deployment::new(config, Arc::new(NeverCalledClient)))
    }

    /// Always succeeds with a tiny, fixed usage count, so repeated
    /// `Deployment::create` calls perturb utilization enough for
    /// power-of-two-choices to actually balance load across trials.
    struct SucceedingClient;

    #[async_trait]
    impl InferenceClient for SucceedingClient {
        async fn complete(&self, _request: &ChatRequest) -> Result<ChatResponse> {
            use crate::types::{ChatChoice, ChatMessage, MessageRole, Usage};
            Ok(ChatResponse {
                id: "resp".to_string(),
                model: "gpt-4o-mini".to_string(),
                choices: vec![ChatChoice {
                    index: 0,
                    message: ChatMessage::new(MessageRole::Assistant, "ok"),
                    finish_reason: Some("stop".to_string()),
                }],
                usage: Usage {
                    prompt_tokens: 1,
                    completion_tokens: 1,
                    total_tokens: 2,
                },
            })
        }
        async fn complete_stream(&self, _request: &ChatRequest) -> Result<ChatStream> {
            unimplemented!("not exercised by this test")
        }
    }

    fn load_balanced_deployment(name: &str) -> Arc<Deployment> {
        let config = DeploymentDefinition {
            name: name.to_string(),
            api_base: "https://example.openai.azure.com".to_string(),
            api_key: "key".to_string(),
            api_version: "2024-02-01".to_string(),
            timeout_secs: 30,
            tpm_ratelimit: 100_000,
            rpm_ratelimit: 100_000,
            healthcheck_interval_secs: 10,
            cooldown_period_secs: 5,
        };
        Arc::new(Deployment::new(config, Arc::new(SucceedingClient)))
    }

    #[test]
    fn selects_healthy_deployment_when_only_one_present() {
        let d1 = deployment("d1");
        let engine = SelectionEngine::new(vec![d1.clone()], 16);
        let (chosen, outcome) = engine.select(None).unwrap();
        assert_eq!(chosen.name(), "d1");
        assert_eq!(outcome, None);
    }

    #[test]
    fn returns_no_healthy_deployment_when_all_are_cooling_down() {
        let d1 = deployment("d1");
        d1.cooldown(None);
        let engine = SelectionEngine::new(vec![d1], 16);
        let err = engine.select(None).unwrap_err();
        assert!(matches!(err, SwitchboardError::NoHealthyDeployment));
    }

    #[test]
    fn session_affinity_sticks_to_previous_pick() {
        let d1 = deployment("d1");
        let d2 = deployment("d2");
        let engine = SelectionEngine::new(vec![d1, d2], 16);
        let (first, first_outcome) = engine.select(Some("session-a")).unwrap();
        let (second, second_outcome) = engine.select(Some("session-a")).unwrap();
        assert_eq!(first.name(), second.name());
        assert_eq!(first_outcome, Some(AffinityOutcome::Miss));
        assert_eq!(second_outcome, Some(AffinityOutcome::Hit));
    }

    #[test]
    fn session_affinity_reroutes_when_bound_deployment_unhealthy() {
        let d1 = deployment("d1");
        let d2 = deployment("d2");
        let engine = SelectionEngine::new(vec![d1.clone(), d2.clone()], 16);
        engine.select(Some("session-a")).unwrap();
        d1.cooldown(None);
        let (rebound, outcome) = engine.select(Some("session-a")).unwrap();
        assert_eq!(rebound.name(), "d2");
        assert_eq!(outcome, Some(AffinityOutcome::Rebind));
    }

    #[test]
    fn session_affinity_surfaces_no_healthy_deployment_when_all_cooling_down() {
        let d1 = deployment("d1");
        let d2 = deployment("d2");
        let engine = SelectionEngine::new(vec![d1.clone(), d2.clone()], 16);
        engine.select(Some("session-a")).unwrap();
        d1.cooldown(None);
        d2.cooldown(None);
        let err = engine.select(Some("session-a")).unwrap_err();
        assert!(matches!(err, SwitchboardError::NoHealthyDeployment));
    }

    #[test]
    fn pick_winner_breaks_ties_deterministically_by_name() {
        let d1 = deployment("alpha");
        let d2 = deployment("beta");
        // Equal utilization (both empty) and equal in_flight (both 0): name wins.
        let winner = pick_winner(&d1, &d2);
        assert_eq!(winner.name(), "alpha");
    }

    /// Testable property #4 (two-choices fairness): over many sessionless
    /// selections among equally-capable, equally-loaded deployments,
    /// selection frequency converges toward 1/|DCs|. Each selection is
    /// followed by a real `Deployment::create` call so utilization actually
    /// moves between trials — power-of-two-choices balances load through
    /// that feedback, not through the (deliberately deterministic) tie-break
    /// rule alone.
    #[tokio::test]
    async fn power_of_two_choices_converges_to_uniform_selection_frequency_under_load() {
        let names = ["d1", "d2", "d3", "d4"];
        let deployments: Vec<Arc<Deployment>> = names.iter().map(|name| load_balanced_deployment(name)).collect();
        let engine = SelectionEngine::new(deployments, 16);
        let request = ChatRequest::new("gpt-4o-mini");

        let trials = 4000;
        let mut counts: std::collections::HashMap<String, u32> = std::collections::HashMap::new();
        for _ in 0..trials {
            let (chosen, _) = engine.select(None).unwrap();
            *counts.entry(chosen.name().to_string()).or_insert(0) += 1;
            chosen.create(&request).await.unwrap();
        }

        assert_eq!(counts.len(), names.len(), "every deployment should have been selected at least once");
        let expected = trials as f64 / names.len() as f64;
        for (name, count) in &counts {
            let deviation = (*count as f64 - expected).abs() / expected;
            assert!(
                deviation < 0.25,
                "deployment {name} was selected {count} times, expected roughly {expected} (deviation {deviation:.2})"
            );
        }
    }
}
