//! Routing and health behavior over live deployments: demotion, recovery,
//! eviction-driven redeploy, and teardown races.

mod support;

use std::time::Duration;

use aviary_orchestrator::error::OrchestratorError;
use aviary_orchestrator::record::DeploymentState;
use support::{deploy_params, descriptor, fast_config, TestFleet};

const WAIT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn repeated_probe_failures_remove_the_endpoint_from_routing() {
    // Effectively no eviction, so demotion is observable in isolation.
    let mut config = fast_config();
    config.health.eviction_intervals = 10_000;

    let fleet = TestFleet::spawn_with(config, support::MockProbe::healthy()).await;
    let desc = descriptor("w-sick");
    let worker_id = desc.worker_id;

    let deployment_id = fleet.orchestrator.deploy(desc, deploy_params()).await;
    fleet
        .wait_for_state(deployment_id, DeploymentState::Running, WAIT)
        .await;

    let url = fleet.orchestrator.endpoints(worker_id).await[0].url.clone();
    fleet.probe.set(&url, false);

    // threshold 3 at 25ms intervals: demoted well within a second.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let endpoints = fleet.orchestrator.endpoints(worker_id).await;
        let demoted = endpoints.is_empty() || !endpoints[0].healthy;
        if demoted {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "endpoint was never demoted"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let err = fleet.orchestrator.call(worker_id, "hi").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NoHealthyEndpoint(w) if w == worker_id));
}

#[tokio::test]
async fn eviction_triggers_a_redeploy_within_budget() {
    let fleet = TestFleet::spawn().await;
    let desc = descriptor("w-evicted");
    let worker_id = desc.worker_id;

    let deployment_id = fleet.orchestrator.deploy(desc, deploy_params()).await;
    fleet
        .wait_for_state(deployment_id, DeploymentState::Running, WAIT)
        .await;

    // Kill the first instance's health; the replacement instance (a fresh
    // URL) stays healthy, so the redeploy converges.
    let url = fleet.orchestrator.endpoints(worker_id).await[0].url.clone();
    fleet.probe.set(&url, false);

    // Eventually a second attempt reaches Running on a new endpoint.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let record = fleet.orchestrator.worker_status(worker_id).await.unwrap();
        if record.attempt >= 2 && record.state == DeploymentState::Running {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "worker was never redeployed (state {}, attempt {})",
            record.state,
            record.attempt
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let endpoints = fleet.orchestrator.endpoints(worker_id).await;
    assert_eq!(endpoints.len(), 1);
    assert_ne!(endpoints[0].url, url, "redeploy must use a fresh instance");

    // The dead instance was stopped.
    assert_eq!(fleet.launcher.live().len(), 1);
}

#[tokio::test]
async fn exhausted_redeploy_budget_abandons_the_worker() {
    let mut config = fast_config();
    config.redeploy_budget = 0;

    let fleet = TestFleet::spawn_with(config, support::MockProbe::healthy()).await;
    let desc = descriptor("w-doomed");
    let worker_id = desc.worker_id;

    let deployment_id = fleet.orchestrator.deploy(desc, deploy_params()).await;
    fleet
        .wait_for_state(deployment_id, DeploymentState::Running, WAIT)
        .await;

    let url = fleet.orchestrator.endpoints(worker_id).await[0].url.clone();
    fleet.probe.set(&url, false);

    // The record fails on eviction and no new attempt appears.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let record = fleet.orchestrator.worker_status(worker_id).await.unwrap();
        if record.state == DeploymentState::Failed {
            assert_eq!(record.attempt, 1);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "evicted worker record never failed"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    let record = fleet.orchestrator.worker_status(worker_id).await.unwrap();
    assert_eq!(record.attempt, 1, "no redeploy may happen with a zero budget");
    assert!(fleet.orchestrator.endpoints(worker_id).await.is_empty());
}

#[tokio::test]
async fn dispatch_failure_marks_endpoint_and_surfaces_cleanly() {
    let fleet = TestFleet::spawn().await;
    let desc = descriptor("w-refusing");
    let worker_id = desc.worker_id;

    let deployment_id = fleet.orchestrator.deploy(desc, deploy_params()).await;
    fleet
        .wait_for_state(deployment_id, DeploymentState::Running, WAIT)
        .await;

    let url = fleet.orchestrator.endpoints(worker_id).await[0].url.clone();
    fleet.dispatcher.refuse(&url);

    // Single replica: no failover candidate, the dispatch error surfaces.
    let err = fleet.orchestrator.call(worker_id, "hi").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Dispatch(_)));

    // The failure fed the endpoint's counter.
    let endpoints = fleet.orchestrator.endpoints(worker_id).await;
    assert_eq!(endpoints[0].consecutive_failures, 1);
}

#[tokio::test]
async fn teardown_during_in_flight_call_is_clean() {
    let fleet = TestFleet::spawn().await;
    let desc = descriptor("w-racing");
    let worker_id = desc.worker_id;

    let deployment_id = fleet.orchestrator.deploy(desc, deploy_params()).await;
    fleet
        .wait_for_state(deployment_id, DeploymentState::Running, WAIT)
        .await;

    // Slow every dispatch down so the call is in flight during teardown.
    fleet.dispatcher.set_delay(Duration::from_millis(100));

    let orchestrator = fleet.orchestrator.clone();
    let call = tokio::spawn(async move { orchestrator.call(worker_id, "racing").await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    fleet.orchestrator.teardown(worker_id).await.unwrap();

    // The in-flight call either completed against the still-registered
    // endpoint or failed cleanly; it must not hang or panic.
    match call.await.unwrap() {
        Ok(response) => assert_eq!(response, "echo:racing"),
        Err(err) => assert!(matches!(
            err,
            OrchestratorError::NoHealthyEndpoint(_) | OrchestratorError::Dispatch(_)
        )),
    }

    // After teardown completes, nothing routes.
    assert!(fleet.orchestrator.call(worker_id, "late").await.is_err());
    assert!(fleet.orchestrator.endpoints(worker_id).await.is_empty());
}
