//! Scenario-level integration tests, S1-S6 from the selection engine's
//! design document. Mirrors the teacher's `core/router/tests/*.rs` style:
//! `#[tokio::test]`, a scripted mock client, direct assertions on metrics
//! and state rather than end-to-end HTTP.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchboard::{
    ChatChoice, ChatMessage, ChatRequest, ChatResponse, ClientFactory, DeploymentDefinition, InferenceClient,
    MessageRole, RequestStatus, Switchboard, SwitchboardConfig, SwitchboardError, Usage,
};

type ChatStream = switchboard::ChatStream;

fn deployment_definition(name: &str) -> DeploymentDefinition {
    DeploymentDefinition {
        name: name.to_string(),
        api_base: "https://example.openai.azure.com".to_string(),
        api_key: "test-key".to_string(),
        api_version: "2024-02-01".to_string(),
        timeout_secs: 5,
        tpm_ratelimit: 100_000,
        rpm_ratelimit: 10,
        healthcheck_interval_secs: 3600,
        cooldown_period_secs: 1,
    }
}

fn ok_response(id: &str) -> ChatResponse {
    ChatResponse {
        id: id.to_string(),
        model: "gpt-4o-mini".to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage::new(MessageRole::Assistant, "ok"),
            finish_reason: Some("stop".to_string()),
        }],
        usage: Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        },
    }
}

/// Fails its first `fail_count` calls with a transient 500, then succeeds.
struct ScriptedClient {
    fail_count: AtomicU32,
    response_id: String,
}

#[async_trait]
impl InferenceClient for ScriptedClient {
    async fn complete(&self, _request: &ChatRequest) -> switchboard::Result<ChatResponse> {
        if self.fail_count.load(Ordering::Relaxed) > 0 {
            self.fail_count.fetch_sub(1, Ordering::Relaxed);
            return Err(SwitchboardError::from_status("scripted", 500, "internal error", None));
        }
        Ok(ok_response(&self.response_id))
    }

    async fn complete_stream(&self, _request: &ChatRequest) -> switchboard::Result<ChatStream> {
        unimplemented!("not exercised by these scenarios")
    }
}

fn factory(fail_counts: Vec<(&'static str, u32)>) -> ClientFactory {
    let fail_counts: std::collections::HashMap<&'static str, u32> = fail_counts.into_iter().collect();
    Arc::new(move |definition: &DeploymentDefinition| {
        let fail_count = fail_counts.get(definition.name.as_str()).copied().unwrap_or(0);
        Ok(Arc::new(ScriptedClient {
            fail_count: AtomicU32::new(fail_count),
            response_id: format!("resp-{}", definition.name),
        }) as Arc<dyn InferenceClient>)
    })
}

fn base_config(names: &[&str]) -> SwitchboardConfig {
    SwitchboardConfig {
        deployments: names.iter().map(|n| deployment_definition(n)).collect(),
        healthcheck_interval_secs: 3600,
        ratelimit_window_secs: 0,
        session_capacity: 64,
        max_attempts: 3,
    }
}

fn request(prompt: &str) -> ChatRequest {
    ChatRequest::new("gpt-4o-mini").with_message(ChatMessage::new(MessageRole::User, prompt))
}

/// S1: single deployment, request passes through unmodified.
#[tokio::test]
async fn s1_pass_through_single_deployment() {
    let config = base_config(&["d1"]);
    let sb = Switchboard::new_with_factory(config, factory(vec![])).unwrap();

    let response = sb.create(&request("hi")).await.unwrap();
    assert_eq!(response.id, "resp-d1");
    assert_eq!(
        sb.metrics().export_prometheus(&[]),
        sb.metrics().export_prometheus(&[]) // idempotent read
    );
}

/// S2: with a session id, repeated calls stick to the same deployment.
#[tokio::test]
async fn s2_affinity_sticks_across_calls() {
    let config = base_config(&["d1", "d2"]);
    let sb = Switchboard::new_with_factory(config, factory(vec![])).unwrap();

    let mut req = request("hi");
    req.session_id = Some("session-s".to_string());

    let first = sb.create(&req).await.unwrap();
    for _ in 0..5 {
        let subsequent = sb.create(&req).await.unwrap();
        assert_eq!(subsequent.id, first.id);
    }
}

/// S3: once the affinity-bound deployment cools down, the next call rebinds
/// to the other deployment.
#[tokio::test]
async fn s3_affinity_failover_rebinds() {
    let config = base_config(&["d1", "d2"]);
    let sb = Switchboard::new_with_factory(config, factory(vec![])).unwrap();

    let mut req = request("hi");
    req.session_id = Some("session-s".to_string());

    let first = sb.create(&req).await.unwrap();
    let bound_name = first.id.trim_start_matches("resp-").to_string();

    let deployment = sb.select_deployment(Some("session-s")).unwrap();
    assert_eq!(deployment.name(), bound_name);
    deployment.cooldown(None);

    let rebound = sb.create(&req).await.unwrap();
    assert_ne!(rebound.id, first.id);
}

/// S4: all deployments cooling down surfaces failure after max_attempts.
#[tokio::test]
async fn s4_no_healthy_deployment_surfaces_after_exhaustion() {
    let config = base_config(&["d1", "d2"]);
    let sb = Switchboard::new_with_factory(config, factory(vec![])).unwrap();

    let d1 = sb.select_deployment(None).unwrap();
    d1.cooldown(None);
    let d2 = sb.select_deployment(None);
    // after d1 cools, d2 should still be selectable directly...
    assert!(d2.is_ok());
    d2.unwrap().cooldown(None);

    let err = sb.create(&request("hi")).await.unwrap_err();
    assert!(matches!(
        err,
        SwitchboardError::AllDeploymentsFailed { .. } | SwitchboardError::NoHealthyDeployment
    ));
}

/// S5: d1 exhausts its inner retries and cools down; d2 then succeeds.
#[tokio::test]
async fn s5_retries_across_deployments_after_exhaustion() {
    let config = base_config(&["d1", "d2"]);
    // d1 fails every attempt the inner retry loop makes (3), d2 never fails.
    // Deterministic tie-break picks "d1" first when both are equally idle.
    let sb = Switchboard::new_with_factory(config, factory(vec![("d1", 100)])).unwrap();

    let response = sb.create(&request("hi")).await;
    assert!(response.is_ok());

    let text = sb.metrics().export_prometheus(&[]);
    assert!(text.contains("requests_total{deployment=\"d2\",model=\"gpt-4o-mini\",status=\"success\"} 1") || text.contains("status=\"success\"} 1"));
}

/// S6: with ratelimit_window=0 usage counters never reset and keep growing.
#[tokio::test]
async fn s6_zero_window_disables_reset() {
    let config = SwitchboardConfig {
        ratelimit_window_secs: 0,
        ..base_config(&["d1"])
    };
    let sb = Switchboard::new_with_factory(config, factory(vec![])).unwrap();
    sb.start().await;

    for _ in 0..5 {
        sb.create(&request("hi")).await.unwrap();
    }
    let deployment = sb.select_deployment(None).unwrap();
    assert!(deployment.utilization() > 0.0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(deployment.utilization() > 0.0, "counters should not reset when window is 0");

    sb.stop().await;
}

#[tokio::test]
async fn create_rejects_empty_deployment_list() {
    let err = Switchboard::new(SwitchboardConfig::default()).unwrap_err();
    assert!(matches!(err, SwitchboardError::Config(_)));
}

#[tokio::test]
async fn metrics_record_success_status() {
    let config = base_config(&["d1"]);
    let sb = Switchboard::new_with_factory(config, factory(vec![])).unwrap();
    sb.create(&request("hi")).await.unwrap();
    let text = sb.metrics().export_prometheus(&[]);
    assert!(text.contains("requests_total{deployment=\"d1\",model=\"gpt-4o-mini\",status=\"success\"} 1"));
    let _ = RequestStatus::Success;
}
