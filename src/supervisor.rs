//! Background Supervisor: two independent periodic loops that keep
//! deployment health and rate-limit usage current without any request
//! needing to wait on them.
//!
//! Grounded in the teacher's `HealthChecker::start_background_checks`
//! (`core/router/health.rs`) for the probe-loop shape and
//! `Router::start_minute_reset_task` for the usage-reset loop. Cancellation
//! uses `tokio_util::sync::CancellationToken`, which the teacher doesn't
//! depend on directly but which is the idiomatic complement to its
//! tokio-heavy stack for cooperative shutdown — see DESIGN.md.

use crate::deployment::Deployment;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct BackgroundSupervisor {
    cancellation: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundSupervisor {
    /// Spawns the health-probe loop (skips deployments already in cooldown)
    /// and, when `ratelimit_window` is non-zero, the usage-reset loop.
    pub fn start(
        deployments: Vec<Arc<Deployment>>,
        healthcheck_interval: Duration,
        ratelimit_window: Duration,
    ) -> Self {
        let cancellation = CancellationToken::new();
        let mut handles = Vec::new();

        handles.push(spawn_health_probe_loop(
            deployments.clone(),
            healthcheck_interval,
            cancellation.clone(),
        ));

        if !ratelimit_window.is_zero() {
            handles.push(spawn_usage_reset_loop(deployments, ratelimit_window, cancellation.clone()));
        } else {
            debug!("usage-reset loop disabled: ratelimit_window_secs is 0");
        }

        Self { cancellation, handles }
    }

    /// Signals both loops to stop and waits for them to exit.
    pub async fn stop(self) {
        self.cancellation.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

fn spawn_health_probe_loop(
    deployments: Vec<Arc<Deployment>>,
    interval: Duration,
    cancellation: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    info!("health probe loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let probes = deployments
                        .iter()
                        .filter(|deployment| !deployment.is_in_cooldown())
                        .map(|deployment| deployment.probe());
                    join_all(probes).await;
                }
            }
        }
    })
}

fn spawn_usage_reset_loop(
    deployments: Vec<Arc<Deployment>>,
    window: Duration,
    cancellation: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(window);
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    info!("usage reset loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    for deployment in &deployments {
                        deployment.reset_usage();
                    }
                }
            }
        }
    })
}
