#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::Json;
use base64::Engine as _;
use fpbridge_adapter::http::{
    abort_enrollment, capture_fingerprint, clear_logs, disconnect_scanner, initialize_scanner,
    logs_since, recent_logs, scanner_status, test_connection, test_enrollment, SharedRuntime,
};
use fpbridge_adapter::{
    http::build_router, BridgeConfig, BridgeRuntime, CaptureRequest, LogsSinceQuery,
    TestEnrollmentRequest,
};
use fpbridge_os::simulated::{SimulatedScanner, SimulatedScannerConfig};

fn fast_config() -> BridgeConfig {
    BridgeConfig {
        capture_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
        lift_delay: Duration::ZERO,
        sim_finger_delay: Duration::ZERO,
        ..BridgeConfig::default_local()
    }
}

fn runtime_with(sim: SimulatedScannerConfig, config: BridgeConfig) -> SharedRuntime {
    Arc::new(BridgeRuntime::new(config, Box::new(SimulatedScanner::new(sim))))
}

fn runtime() -> SharedRuntime {
    runtime_with(SimulatedScannerConfig::instant(), fast_config())
}

fn positions(messages: &[String], needle: &str) -> Vec<usize> {
    messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.contains(needle))
        .map(|(i, _)| i)
        .collect()
}

#[test]
fn at_http_surface_01_router_builds_with_root_and_api_prefix() {
    let _router = build_router(runtime());
}

#[tokio::test]
async fn at_http_surface_02_test_endpoint_reports_running() {
    let Json(resp) = test_connection(State(runtime())).await;
    assert!(resp.success);
    assert_eq!(resp.message, "Desktop Bridge API is running");
    assert_eq!(resp.timestamp.len(), "YYYY-MM-DD HH:MM:SS".len());
}

#[tokio::test]
async fn at_http_surface_03_end_to_end_enrollment_matches_client_contract() {
    let rt = runtime();
    let Json(init) = initialize_scanner(State(rt.clone())).await;
    assert!(init.success, "{}", init.message);

    let body: CaptureRequest =
        serde_json::from_str(r#"{"subject_id":"E-0001","finger_index":1}"#).unwrap();
    let Json(resp) = capture_fingerprint(State(rt.clone()), Json(body)).await;

    assert!(resp.success, "{}", resp.message);
    assert_eq!(resp.quality_score, Some(60));
    assert_eq!(resp.finger_index, Some(1));
    let template = base64::engine::general_purpose::STANDARD
        .decode(resp.template_data.as_deref().unwrap())
        .unwrap();
    assert_eq!(Some(template.len()), resp.template_size);

    let wire = serde_json::to_value(&resp).unwrap();
    for key in [
        "success",
        "template_data",
        "template_size",
        "quality_score",
        "message",
    ] {
        assert!(wire.get(key).is_some(), "missing {key}");
    }

    let Json(logs) = logs_since(State(rt.clone()), Query(LogsSinceQuery::default())).await;
    assert!(logs.success);
    let messages: Vec<String> = logs.logs.iter().map(|l| l.message.clone()).collect();
    let waiting = positions(&messages, "WAITING");
    let scanning = positions(&messages, "SCANNING");
    let ok = positions(&messages, " OK - ");
    assert_eq!((waiting.len(), scanning.len(), ok.len()), (3, 3, 3));
    for i in 0..3 {
        assert!(waiting[i] < scanning[i] && scanning[i] < ok[i]);
        let n = i + 1;
        assert!(messages[waiting[i]].contains(&format!("LẦN {n} ")));
    }
    let seqs: Vec<u64> = logs.logs.iter().map(|l| l.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn at_http_surface_04_capture_before_initialize_is_rejected() {
    let rt = runtime();
    let Json(resp) = capture_fingerprint(
        State(rt),
        Json(CaptureRequest {
            subject_id: Some("E-0001".to_string()),
            finger_index: Some(1),
        }),
    )
    .await;
    assert!(!resp.success);
    assert_eq!(resp.message, "Scanner not connected");
    let wire = serde_json::to_value(&resp).unwrap();
    assert!(wire.get("template_data").is_none());
}

#[tokio::test]
async fn at_http_surface_05_timeout_on_second_scan_fails_the_capture() {
    let rt = runtime_with(
        SimulatedScannerConfig {
            withhold_from_capture: Some(2),
            ..SimulatedScannerConfig::instant()
        },
        BridgeConfig {
            capture_timeout: Duration::from_millis(100),
            ..fast_config()
        },
    );
    initialize_scanner(State(rt.clone())).await;
    let Json(resp) = capture_fingerprint(
        State(rt.clone()),
        Json(CaptureRequest {
            subject_id: Some("E-0002".to_string()),
            finger_index: Some(6),
        }),
    )
    .await;
    assert!(!resp.success);
    assert_eq!(resp.status, "failed");
    assert!(resp.message.contains("Timeout"));

    let Json(logs) = recent_logs(State(rt.clone())).await;
    let messages: Vec<String> = logs.logs.iter().map(|l| l.message.clone()).collect();
    assert_eq!(positions(&messages, " OK - ").len(), 1);
    assert_eq!(positions(&messages, " FAIL - ").len(), 1);

    let Json(status) = scanner_status(State(rt)).await;
    assert!(status.status.connected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn at_http_surface_06_concurrent_capture_is_rejected_and_abort_ends_the_first() {
    let rt = runtime_with(
        SimulatedScannerConfig {
            finger_delay: Duration::from_secs(60),
            ..SimulatedScannerConfig::instant()
        },
        BridgeConfig {
            capture_timeout: Duration::from_secs(30),
            ..fast_config()
        },
    );
    initialize_scanner(State(rt.clone())).await;

    let first = tokio::spawn(capture_fingerprint(
        State(rt.clone()),
        Json(CaptureRequest {
            subject_id: Some("E-0001".to_string()),
            finger_index: Some(1),
        }),
    ));
    while !rt.is_enrolling() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let Json(second) = test_enrollment(
        State(rt.clone()),
        Some(Json(TestEnrollmentRequest {
            finger_index: Some(2),
        })),
    )
    .await;
    assert!(!second.success);
    assert_eq!(second.status, "rejected");

    let Json(status) = scanner_status(State(rt.clone())).await;
    assert_eq!(status.status.state, "busy");

    let Json(abort) = abort_enrollment(State(rt.clone())).await;
    assert!(abort.success);
    let Json(first) = first.await.unwrap();
    assert!(!first.success);
    assert_eq!(first.status, "aborted");

    let Json(status) = scanner_status(State(rt.clone())).await;
    assert_eq!(status.status.state, "ready");
}

#[tokio::test]
async fn at_http_surface_07_test_enrollment_defaults_to_left_index_finger() {
    let rt = runtime();
    initialize_scanner(State(rt.clone())).await;
    let Json(resp) = test_enrollment(State(rt.clone()), None).await;
    assert!(resp.success, "{}", resp.message);
    assert_eq!(resp.finger_index, Some(1));
    assert_eq!(resp.message, "Test enrollment completed for Ngón trỏ trái");

    let Json(logs) = logs_since(State(rt), Query(LogsSinceQuery::default())).await;
    assert!(logs
        .logs
        .iter()
        .any(|l| l.message.contains("Starting enrollment for subject TEST")));
}

#[tokio::test]
async fn at_http_surface_08_cursor_polling_returns_only_new_events() {
    let rt = runtime();
    initialize_scanner(State(rt.clone())).await;
    let Json(first) = logs_since(State(rt.clone()), Query(LogsSinceQuery::default())).await;
    let cursor = first.logs.last().map(|l| l.seq).unwrap();

    disconnect_scanner(State(rt.clone())).await;
    let Json(next) = logs_since(
        State(rt.clone()),
        Query(LogsSinceQuery {
            since: None,
            cursor: Some(cursor),
        }),
    )
    .await;
    assert_eq!(next.logs.len(), 1);
    assert_eq!(next.logs[0].message, "🔌 Scanner disconnected");

    let Json(cleared) = clear_logs(State(rt.clone())).await;
    assert!(cleared.success);
    let Json(recent) = recent_logs(State(rt)).await;
    assert_eq!(recent.total_logs, 1);
}
