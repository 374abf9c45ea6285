//! Dev server lifecycle tests over mock containers and routes

mod common;

use common::{orchestrator_config, Harness};
use devgate::config::OrchestratorConfig;
use devgate::error::Error;
use devgate::orchestrator::{Health, ServerStatus};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::test]
async fn test_start_allocates_container_and_route() {
    let h = Harness::new();
    h.add_project("p1", "My App", "u1");

    let started = h.orchestrator.start("p1", "u1").await.unwrap();
    assert_eq!(started.port, 5210);
    assert_eq!(started.custom_domain.as_deref(), Some("alice-my-app.dev.example.com"));
    assert_eq!(started.url.as_deref(), Some("http://alice-my-app.dev.example.com"));
    assert_eq!(started.status, ServerStatus::Starting);

    // Route points at the container's host port
    assert_eq!(
        h.backend.rules.lock().get("alice-my-app.dev.example.com"),
        Some(&5210)
    );
    let spec = h.runtime.started.lock()[0].clone();
    assert_eq!(spec.host_port, 5210);
    assert_eq!(spec.project_id, "p1");

    // Ports are persisted in the project's settings
    let record = h.db.get_project_record("p1").unwrap().unwrap();
    assert_eq!(record.settings["containerConfig"]["ports"]["frontend"], 5200);
    assert_eq!(record.settings["containerConfig"]["ports"]["backend"], 5210);

    h.wait_until_running("p1").await;
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let h = Harness::new();
    h.add_project("p1", "App", "u1");

    let first = h.orchestrator.start("p1", "u1").await.unwrap();
    let second = h.orchestrator.start("p1", "u1").await.unwrap();

    assert_eq!(first.container_id, second.container_id);
    assert_eq!(h.runtime.started.lock().len(), 1);
    assert_eq!(h.proxy.route_count(), 1);
}

#[tokio::test]
async fn test_route_failure_rolls_back_container() {
    let h = Harness::new();
    h.add_project("p1", "App", "u1");
    h.backend.fail_install.store(true, Ordering::SeqCst);

    let err = h.orchestrator.start("p1", "u1").await.unwrap_err();
    assert!(matches!(err, Error::ProxyCreate(_)));
    assert_eq!(err.public_message(), "failed to create custom domain");

    assert_eq!(h.runtime.running_count(), 0);
    assert_eq!(h.containers.tracked_count(), 0);
    assert!(h.orchestrator.get("p1").is_none());
    assert_eq!(h.proxy.route_count(), 0);
}

#[tokio::test]
async fn test_failed_rollback_leaves_container_for_stop_all() {
    let h = Harness::new();
    h.add_project("p1", "App", "u1");
    h.backend.fail_install.store(true, Ordering::SeqCst);
    h.runtime.fail_stop.store(true, Ordering::SeqCst);

    let err = h.orchestrator.start("p1", "u1").await.unwrap_err();
    assert!(matches!(err, Error::ProxyCreate(_)));

    // No record, but the container is still tracked and running
    assert!(h.orchestrator.get("p1").is_none());
    assert_eq!(h.containers.tracked_count(), 1);
    assert_eq!(h.runtime.running_count(), 1);

    h.runtime.fail_stop.store(false, Ordering::SeqCst);
    assert_eq!(h.orchestrator.stop_all().await, 0);
    assert_eq!(h.containers.tracked_count(), 0);
    assert_eq!(h.runtime.running_count(), 0);
}

#[tokio::test]
async fn test_container_failure_creates_nothing() {
    let h = Harness::new();
    h.add_project("p1", "App", "u1");
    h.runtime.fail_start.store(true, Ordering::SeqCst);

    let err = h.orchestrator.start("p1", "u1").await.unwrap_err();
    assert!(matches!(err, Error::ContainerStart(_)));
    assert_eq!(err.public_message(), "failed to start dev server");

    assert!(h.orchestrator.get("p1").is_none());
    assert_eq!(h.proxy.route_count(), 0);
    assert!(h.backend.rules.lock().is_empty());
}

#[tokio::test]
async fn test_start_unknown_project_or_user() {
    let h = Harness::new();
    h.add_project("p1", "App", "u1");
    h.add_project("gone", "Old", "u1");
    h.db.delete_project("gone").unwrap();

    let err = h.orchestrator.start("missing", "u1").await.unwrap_err();
    assert!(matches!(err, Error::ProjectNotFound(_)));

    let err = h.orchestrator.start("gone", "u1").await.unwrap_err();
    assert!(matches!(err, Error::ProjectNotFound(_)));

    let err = h.orchestrator.start("p1", "nobody").await.unwrap_err();
    assert!(matches!(err, Error::UserNotFound(_)));

    // Nothing allocated for failed lookups
    assert!(h.ports.list().is_empty());
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let h = Harness::new();
    h.add_project("p1", "App", "u1");
    h.orchestrator.start("p1", "u1").await.unwrap();

    assert!(h.orchestrator.stop("p1").await);
    assert!(!h.orchestrator.stop("p1").await);

    assert!(h.orchestrator.get("p1").is_none());
    assert!(h.backend.rules.lock().is_empty());
    assert_eq!(h.runtime.running_count(), 0);

    let status = h.orchestrator.status("p1").await;
    assert!(!status.is_running);
    assert_eq!(status.health, Health::Stopped);
    assert_eq!(status.status, ServerStatus::Stopped);
}

#[tokio::test]
async fn test_stop_with_container_failure_drops_record() {
    let h = Harness::new();
    h.add_project("p1", "App", "u1");
    h.orchestrator.start("p1", "u1").await.unwrap();
    h.runtime.fail_stop.store(true, Ordering::SeqCst);

    assert!(h.orchestrator.stop("p1").await);
    assert!(h.orchestrator.get("p1").is_none());

    // Route went away, the container is left tracked for a later sweep
    assert!(h.backend.rules.lock().is_empty());
    assert_eq!(h.proxy.route_count(), 0);
    assert_eq!(h.containers.tracked_count(), 1);
    assert_eq!(h.runtime.running_count(), 1);
}

#[tokio::test]
async fn test_stop_with_route_failure_drops_record() {
    let h = Harness::new();
    h.add_project("p1", "App", "u1");
    h.orchestrator.start("p1", "u1").await.unwrap();
    h.backend.fail_remove.store(true, Ordering::SeqCst);

    assert!(h.orchestrator.stop("p1").await);
    assert!(h.orchestrator.get("p1").is_none());
    assert_eq!(h.runtime.running_count(), 0);
    assert_eq!(h.proxy.route_count(), 1);
}

#[tokio::test]
async fn test_stop_keeps_record_when_everything_fails() {
    let h = Harness::new();
    h.add_project("p1", "App", "u1");
    let started = h.orchestrator.start("p1", "u1").await.unwrap();
    h.runtime.fail_stop.store(true, Ordering::SeqCst);
    h.backend.fail_remove.store(true, Ordering::SeqCst);

    assert!(!h.orchestrator.stop("p1").await);
    let record = h.orchestrator.get("p1").unwrap();
    assert_eq!(record.container_id, started.container_id);
    assert_eq!(h.runtime.running_count(), 1);
    assert_eq!(h.proxy.route_count(), 1);

    // Retry once the runtime and route store recover
    h.runtime.fail_stop.store(false, Ordering::SeqCst);
    h.backend.fail_remove.store(false, Ordering::SeqCst);
    assert!(h.orchestrator.stop("p1").await);
    assert!(h.orchestrator.get("p1").is_none());
}

#[tokio::test]
async fn test_restart_reuses_ports() {
    let h = Harness::new();
    h.add_project("p1", "App", "u1");

    let first = h.orchestrator.start("p1", "u1").await.unwrap();
    h.orchestrator.stop("p1").await;
    let second = h.orchestrator.start("p1", "u1").await.unwrap();

    assert_eq!(first.port, second.port);
    assert_eq!(first.custom_domain, second.custom_domain);
    assert_ne!(first.container_id, second.container_id);
}

#[tokio::test]
async fn test_status_reports_crash_as_unhealthy() {
    let h = Harness::new();
    h.add_project("p1", "App", "u1");
    let started = h.orchestrator.start("p1", "u1").await.unwrap();
    h.wait_until_running("p1").await;

    let status = h.orchestrator.status("p1").await;
    assert!(status.is_running);
    assert_eq!(status.health, Health::Healthy);
    assert_eq!(status.status, ServerStatus::Running);
    let usage = status.resource_usage.unwrap();
    assert_eq!(usage.memory_bytes, 128 * 1024 * 1024);
    assert!((usage.cpu_percent - 20.0).abs() < 1e-9);

    h.runtime.crash(&started.container_id);

    let status = h.orchestrator.status("p1").await;
    assert!(!status.is_running);
    assert_eq!(status.health, Health::Unhealthy);
    assert_eq!(status.status, ServerStatus::Error);
    assert!(status.resource_usage.is_none());

    // A crashed server can be started again
    let restarted = h.orchestrator.start("p1", "u1").await.unwrap();
    assert_ne!(restarted.container_id, started.container_id);
    assert_eq!(restarted.status, ServerStatus::Starting);
}

#[tokio::test]
async fn test_cleanup_idle_only_reaps_old_servers() {
    let h = Harness::new();
    h.add_project("p1", "App", "u1");
    h.orchestrator.start("p1", "u1").await.unwrap();
    h.wait_until_running("p1").await;

    assert_eq!(h.orchestrator.cleanup_idle(Duration::from_secs(3600)).await, 0);
    assert!(h.orchestrator.get("p1").is_some());

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(h.orchestrator.cleanup_idle(Duration::ZERO).await, 1);
    assert!(h.orchestrator.get("p1").is_none());
    assert_eq!(h.runtime.running_count(), 0);
}

#[tokio::test]
async fn test_cleanup_idle_skips_starting_servers() {
    let h = Harness::with_config(OrchestratorConfig {
        start_grace_period_ms: 60_000,
        ..orchestrator_config()
    });
    h.add_project("p1", "App", "u1");
    h.orchestrator.start("p1", "u1").await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(h.orchestrator.cleanup_idle(Duration::ZERO).await, 0);
    assert_eq!(h.orchestrator.get("p1").unwrap().status, ServerStatus::Starting);
}

#[tokio::test]
async fn test_idle_reaper_runs_and_shuts_down() {
    let h = Harness::with_config(OrchestratorConfig {
        idle_timeout_secs: 0,
        cleanup_interval_secs: 1,
        ..orchestrator_config()
    });
    h.add_project("p1", "App", "u1");
    h.orchestrator.start("p1", "u1").await.unwrap();
    h.wait_until_running("p1").await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = tokio::spawn(h.orchestrator.clone().run_idle_reaper(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(h.orchestrator.get("p1").is_none());

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), reaper)
        .await
        .expect("reaper should stop on shutdown")
        .unwrap();
}

#[tokio::test]
async fn test_metrics_snapshot() {
    let h = Harness::new();
    h.add_project("p1", "One", "u1");
    h.add_project("p2", "Two", "u2");
    h.orchestrator.start("p1", "u1").await.unwrap();
    h.orchestrator.start("p2", "u2").await.unwrap();
    h.wait_until_running("p1").await;
    h.wait_until_running("p2").await;

    let metrics = h.orchestrator.metrics().await;
    assert_eq!(metrics.total_servers, 2);
    assert_eq!(metrics.running_servers, 2);
    assert_eq!(metrics.starting_servers, 0);
    assert_eq!(metrics.total_memory_bytes, 2 * 128 * 1024 * 1024);
    assert!((metrics.average_cpu_percent - 20.0).abs() < 1e-9);
    assert_eq!(metrics.active_routes, 2);
    assert_eq!(metrics.running_containers, 2);
    assert_eq!(metrics.allocated_projects, 2);
}

#[tokio::test]
async fn test_scale_user_servers_stops_oldest() {
    let h = Harness::new();
    for (id, name) in [("p1", "One"), ("p2", "Two"), ("p3", "Three")] {
        h.add_project(id, name, "u1");
        h.orchestrator.start(id, "u1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    h.add_project("p4", "Other", "u2");
    h.orchestrator.start("p4", "u2").await.unwrap();

    assert_eq!(h.orchestrator.scale_user_servers("u1").await, 1);
    assert!(h.orchestrator.get("p1").is_none());
    assert!(h.orchestrator.get("p2").is_some());
    assert!(h.orchestrator.get("p3").is_some());
    assert_eq!(h.orchestrator.list_user_servers("u1").len(), 2);

    // Already within the limit
    assert_eq!(h.orchestrator.scale_user_servers("u1").await, 0);
    assert_eq!(h.orchestrator.scale_user_servers("u2").await, 0);
    assert_eq!(h.orchestrator.list_servers().len(), 3);
}

#[tokio::test]
async fn test_port_changes_refused_while_running() {
    let h = Harness::new();
    h.add_project("p1", "App", "u1");
    h.orchestrator.start("p1", "u1").await.unwrap();

    let err = h.orchestrator.release_ports("p1").unwrap_err();
    assert!(matches!(err, Error::PortConflict(_)));
    let err = h.orchestrator.reserve_ports("p1", 6000, 6001, &[]).unwrap_err();
    assert!(matches!(err, Error::PortConflict(_)));
    assert_eq!(h.orchestrator.get_ports("p1").unwrap().frontend_port, 5200);

    h.orchestrator.stop("p1").await;

    let reserved = h.orchestrator.reserve_ports("p1", 6000, 6001, &[6002]).unwrap();
    assert_eq!(reserved.backend_port, 6001);
    assert!(h.orchestrator.release_ports("p1").unwrap());
    assert!(!h.orchestrator.release_ports("p1").unwrap());

    let record = h.db.get_project_record("p1").unwrap().unwrap();
    assert!(record.settings.pointer("/containerConfig/ports").is_none());
}

#[tokio::test]
async fn test_allocate_ports_without_starting() {
    let h = Harness::new();
    h.add_project("p1", "App", "u1");

    let allocation = h
        .orchestrator
        .allocate_ports("p1", Some(devgate::ports::AllocationStrategy::BlockBased))
        .unwrap();
    assert_eq!(allocation.frontend_port, 5200);
    assert_eq!(allocation.backend_port, 5201);
    assert!(h.orchestrator.get("p1").is_none());

    let err = h.orchestrator.allocate_ports("missing", None).unwrap_err();
    assert!(matches!(err, Error::ProjectNotFound(_)));
}

#[tokio::test]
async fn test_stop_all() {
    let h = Harness::new();
    h.add_project("p1", "One", "u1");
    h.add_project("p2", "Two", "u2");
    h.orchestrator.start("p1", "u1").await.unwrap();
    h.orchestrator.start("p2", "u2").await.unwrap();

    assert_eq!(h.orchestrator.stop_all().await, 2);
    assert!(h.orchestrator.list_servers().is_empty());
    assert_eq!(h.runtime.running_count(), 0);
    assert_eq!(h.proxy.route_count(), 0);
}
