mod support;

use chrono::{Duration as TtlDuration, Utc};
use larder_sync::{ReportError, ReportSpec};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use support::{engine, eventually, SalesReport};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sales_body() -> serde_json::Value {
    json!({"total": 1250.5, "orders": 42})
}

async fn mount_sales(server: &MockServer, expected: u64) {
    Mock::given(method("GET"))
        .and(path("/api/reports/sales"))
        .respond_with(ResponseTemplate::new(200).set_body_json(sales_body()))
        .expect(expected)
        .mount(server)
        .await;
}

// --- Initial load ---

#[tokio::test]
async fn online_miss_fetches_and_caches() {
    let server = MockServer::start().await;
    mount_sales(&server, 1).await;
    let engine = engine(&server, true);
    let report = engine.report::<SalesReport>(ReportSpec::sales());

    let state = report.load().await.unwrap();
    assert_eq!(state.data, Some(SalesReport { total: 1250.5, orders: 42 }));
    assert!(!state.is_from_cache);
    assert!(!state.loading);
    assert!(state.error.is_none());
    assert!(state.last_fetched.is_some());

    let entry = engine.store().get_cache_entry("sales_report").unwrap().unwrap();
    assert_eq!(entry.expiry - entry.timestamp, 30 * 60 * 1000);
}

#[tokio::test]
async fn fresh_cache_is_served_without_a_request() {
    let server = MockServer::start().await;
    mount_sales(&server, 0).await;
    let engine = engine(&server, true);
    let fetched = Utc::now() - TtlDuration::minutes(2);
    engine
        .store()
        .cache_data_at("sales_report", sales_body(), TtlDuration::minutes(30), fetched)
        .unwrap();

    let state = engine.report::<SalesReport>(ReportSpec::sales()).load().await.unwrap();
    assert!(state.is_from_cache);
    assert_eq!(state.data.unwrap().orders, 42);
    assert_eq!(
        state.last_fetched.unwrap().timestamp_millis(),
        fetched.timestamp_millis()
    );
}

#[tokio::test]
async fn offline_within_ttl_serves_cache() {
    let server = MockServer::start().await;
    let engine = engine(&server, false);
    engine
        .store()
        .cache_data_at(
            "sales_report",
            sales_body(),
            TtlDuration::minutes(30),
            Utc::now() - TtlDuration::minutes(20),
        )
        .unwrap();

    let state = engine.report::<SalesReport>(ReportSpec::sales()).load().await.unwrap();
    assert!(state.is_from_cache);
    assert!(state.data.is_some());
}

#[tokio::test]
async fn offline_after_45_minutes_is_unavailable() {
    let server = MockServer::start().await;
    let engine = engine(&server, false);
    engine
        .store()
        .cache_data_at(
            "sales_report",
            sales_body(),
            TtlDuration::minutes(30),
            Utc::now() - TtlDuration::minutes(45),
        )
        .unwrap();

    let state = engine.report::<SalesReport>(ReportSpec::sales()).load().await.unwrap();
    assert!(state.data.is_none());
    assert_eq!(state.error, Some(ReportError::UnavailableOffline));
    assert!(!state.is_from_cache);
    assert!(engine.store().get_cache_entry("sales_report").unwrap().is_none());
}

#[tokio::test]
async fn online_fetch_failure_surfaces_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/reports/sales"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let engine = engine(&server, true);

    let state = engine.report::<SalesReport>(ReportSpec::sales()).load().await.unwrap();
    assert!(state.data.is_none());
    assert!(matches!(state.error, Some(ReportError::Fetch(_))));
    assert!(engine.store().get_cache_entry("sales_report").unwrap().is_none());
}

// --- Refresh ---

#[tokio::test]
async fn offline_refetch_is_a_no_op() {
    let server = MockServer::start().await;
    mount_sales(&server, 0).await;
    let engine = engine(&server, false);
    let report = engine.report::<SalesReport>(ReportSpec::sales());
    report.load().await.unwrap();

    assert!(!report.refetch().await.unwrap());
    assert_eq!(report.state().error, Some(ReportError::UnavailableOffline));
}

#[tokio::test]
async fn refetch_replaces_cached_data() {
    let server = MockServer::start().await;
    mount_sales(&server, 1).await;
    let engine = engine(&server, true);
    engine
        .store()
        .cache_data("sales_report", json!({"total": 1.0, "orders": 1}), TtlDuration::minutes(30))
        .unwrap();
    let report = engine.report::<SalesReport>(ReportSpec::sales());
    assert_eq!(report.load().await.unwrap().data.unwrap().orders, 1);

    assert!(report.refetch().await.unwrap());
    let state = report.state();
    assert_eq!(state.data.unwrap().orders, 42);
    assert!(!state.is_from_cache);
    assert_eq!(engine.store().get_cached_data("sales_report").unwrap(), Some(sales_body()));
}

#[tokio::test]
async fn failed_refetch_keeps_cached_data() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/reports/sales"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let engine = engine(&server, true);
    engine
        .store()
        .cache_data("sales_report", sales_body(), TtlDuration::minutes(30))
        .unwrap();
    let report = engine.report::<SalesReport>(ReportSpec::sales());
    report.load().await.unwrap();

    assert!(!report.refetch().await.unwrap());
    let state = report.state();
    assert!(state.data.is_some());
    assert!(state.is_from_cache);
    assert!(matches!(state.error, Some(ReportError::Fetch(_))));
}

#[tokio::test]
async fn stale_cache_refreshes_in_background() {
    let server = MockServer::start().await;
    mount_sales(&server, 1).await;
    let engine = engine(&server, true);
    engine
        .store()
        .cache_data_at(
            "sales_report",
            json!({"total": 1.0, "orders": 1}),
            TtlDuration::minutes(30),
            Utc::now() - TtlDuration::minutes(20),
        )
        .unwrap();
    let report = engine.report::<SalesReport>(ReportSpec::sales());

    let first = report.load().await.unwrap();
    assert!(first.is_from_cache);
    assert_eq!(first.data.unwrap().orders, 1);

    let mut rx = report.subscribe();
    let refreshed = tokio::time::timeout(
        Duration::from_secs(2),
        rx.wait_for(|s| !s.is_from_cache && s.data.is_some()),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();
    assert_eq!(refreshed.data.unwrap().orders, 42);
}

// --- Reconnect ---

#[tokio::test]
async fn reconnect_refetches_cache_sourced_report() {
    let server = MockServer::start().await;
    mount_sales(&server, 1).await;
    let engine = engine(&server, false);
    engine
        .store()
        .cache_data("sales_report", json!({"total": 1.0, "orders": 1}), TtlDuration::minutes(30))
        .unwrap();
    let report = engine.report::<SalesReport>(ReportSpec::sales());
    report.load().await.unwrap();
    let _task = report.spawn_reconnect_refresh();

    engine.set_online(true);
    assert!(eventually(|| report.state().data.as_ref().is_some_and(|d| d.orders == 42)).await);
    assert!(!report.state().is_from_cache);
}

#[tokio::test]
async fn reconnect_recovers_unavailable_report() {
    let server = MockServer::start().await;
    mount_sales(&server, 1).await;
    let engine = engine(&server, false);
    let report = engine.report::<SalesReport>(ReportSpec::sales());
    assert_eq!(report.load().await.unwrap().error, Some(ReportError::UnavailableOffline));
    let _task = report.spawn_reconnect_refresh();

    engine.set_online(true);
    assert!(eventually(|| report.state().data.is_some()).await);
    assert!(report.state().error.is_none());
}

#[tokio::test]
async fn reconnect_skips_live_report() {
    let server = MockServer::start().await;
    mount_sales(&server, 1).await;
    let engine = engine(&server, true);
    let report = engine.report::<SalesReport>(ReportSpec::sales());
    report.load().await.unwrap();
    let _task = report.spawn_reconnect_refresh();

    engine.set_online(false);
    engine.set_online(true);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!report.state().is_from_cache);
}

#[tokio::test]
async fn reconnect_task_ends_when_report_is_dropped() {
    let server = MockServer::start().await;
    let engine = engine(&server, false);
    let report = engine.report::<SalesReport>(ReportSpec::sales());
    let task = report.spawn_reconnect_refresh();

    drop(report);
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("task still parked after the report was dropped")
        .unwrap();
    assert!(!engine.is_online());
}
