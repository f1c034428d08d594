//! Tests for the administrative surface and background lifecycle

use std::time::Duration;

use super::production_engine;
use crate::alerts::{AlertKind, MonitorState};
use crate::config::{CascadeConfig, EngineConfig};
use crate::context::RequestContext;
use crate::handler::ResilienceEngine;
use crate::types::AppError;

#[tokio::test(start_paused = true)]
async fn test_monitoring_start_stop() {
    let engine = production_engine();
    assert_eq!(engine.get_monitoring_status().state, MonitorState::Stopped);

    assert!(engine.start_monitoring());
    assert!(!engine.start_monitoring());
    let status = engine.get_monitoring_status();
    assert!(status.is_monitoring);
    assert_eq!(status.check_interval_secs, 30);

    engine.stop_monitoring();
    assert!(!engine.get_monitoring_status().is_monitoring);
}

#[tokio::test(start_paused = true)]
async fn test_start_and_shutdown_background_tasks() {
    let engine = production_engine();
    let mut alerts = engine.subscribe_alerts();

    engine.start();
    for _ in 0..4 {
        engine
            .handle(AppError::internal("inventory invariant violated"), &RequestContext::new("GET", "/api/stock"))
            .await;
    }

    tokio::time::sleep(Duration::from_secs(31)).await;

    let mut kinds = Vec::new();
    while let Ok(alert) = alerts.try_recv() {
        kinds.push(alert.kind);
    }
    assert!(kinds.contains(&AlertKind::CriticalErrors));
    assert!(engine.get_monitoring_status().last_check.is_some());

    engine.shutdown();
    assert_eq!(engine.get_monitoring_status().state, MonitorState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_error_report() {
    let config = EngineConfig {
        cascade: CascadeConfig {
            frequency_threshold: 1,
            count_threshold: 1,
        },
        ..EngineConfig::default()
    };
    let engine = ResilienceEngine::new(config);

    let products = RequestContext::new("GET", "/api/products");
    let orders = RequestContext::new("POST", "/api/orders");
    for _ in 0..3 {
        engine.handle(AppError::conflict("stale cache"), &products).await;
    }
    engine.handle(AppError::bad_request("empty order"), &orders).await;

    let report = engine.get_error_report();

    assert_eq!(report.summary.total_errors, 4);
    assert_eq!(report.top_correlations.len(), 2);
    assert_eq!(report.top_correlations[0].key, "ConflictError:GET:/api/products:anonymous");
    assert_eq!(report.top_correlations[0].count, 3);
    assert_eq!(report.breakers.len(), 1);
    assert_eq!(report.breakers[0].name, "GET /api/products");
    assert!(report.recommendations.iter().any(|r| r.contains("cascade")));

    let value = serde_json::to_value(&report).unwrap();
    assert_eq!(value["breakers"][0]["state"], "FORCED_OPEN");
}

#[tokio::test(start_paused = true)]
async fn test_reset_metrics_and_reset() {
    let engine = production_engine();
    let ctx = RequestContext::new("GET", "/api/occasions");

    engine.handle(AppError::not_found("Occasion", 1), &ctx).await;
    engine.reset_metrics();
    assert_eq!(engine.get_metrics().total_errors, 0);
    // correlation history survives a metrics reset
    assert_eq!(engine.correlator().len(), 1);

    engine.handle(AppError::not_found("Occasion", 1), &ctx).await;
    engine.breakers().get_or_create("GET /api/occasions").force_open("test");
    engine.reset();

    assert_eq!(engine.get_metrics().total_errors, 0);
    assert!(engine.correlator().is_empty());
    assert!(engine.breakers().names().is_empty());

    let response = engine.handle(AppError::not_found("Occasion", 1), &ctx).await;
    assert!(response.body.get("correlation").is_none());
}
