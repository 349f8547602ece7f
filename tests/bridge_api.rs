//! HTTP bridge contract tests, driven through the router without a socket.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use diskbench::config::ServiceConfig;
use diskbench::orchestrator::Orchestrator;
use serde_json::Value;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tower::ServiceExt;

const QUICK_RESULT: &str = r#"{
  "fio version": "fio-3.37",
  "jobs": [
    {
      "jobname": "quick_speed_test",
      "job_runtime": 60000,
      "read": {"bw": 614400, "iops": 30000, "lat_ns": {"mean": 1500000}},
      "write": {"bw": 0, "iops": 0, "lat_ns": {"mean": 0}}
    }
  ]
}"#;

struct Bridge {
    _dir: TempDir,
    router: Router,
    target: PathBuf,
}

async fn bridge() -> Bridge {
    let dir = TempDir::new().unwrap();

    let worker = dir.path().join("fake-fio");
    let mut file = std::fs::File::create(&worker).unwrap();
    write!(
        file,
        "#!/bin/sh\nout=\"\"\nfor arg in \"$@\"; do\n  case \"$arg\" in\n    --output=*) out=\"${{arg#--output=}}\" ;;\n  esac\ndone\ncat > \"$out\" <<'RESULT'\n{QUICK_RESULT}\nRESULT\nexit 0\n"
    )
    .unwrap();
    drop(file);
    let mut perms = std::fs::metadata(&worker).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&worker, perms).unwrap();

    let target = dir.path().join("volume");
    std::fs::create_dir_all(&target).unwrap();

    let mut config = ServiceConfig::with_state_dir(dir.path().join("state"));
    config.scratch_dir = dir.path().join("scratch");
    config.worker_path = Some(worker);

    let (orchestrator, _) = Orchestrator::init(config).await.unwrap();
    Bridge {
        _dir: dir,
        router: diskbench::server::build_router(orchestrator),
        target,
    }
}

async fn get(router: &Router, path: &str) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn post(router: &Router, path: &str, body: &str) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(path)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn version_reports_service_version() {
    let bridge = bridge().await;
    let (status, body) = get(&bridge.router, "/api/version").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["service_version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn unknown_route_is_404_with_json_error() {
    let bridge = bridge().await;
    let (status, body) = get(&bridge.router, "/api/warp-drive").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn current_test_defaults_to_not_running() {
    let bridge = bridge().await;
    let (status, body) = get(&bridge.router, "/api/test/current").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["test_running"], false);
}

#[tokio::test]
async fn start_rejects_malformed_bodies() {
    let bridge = bridge().await;

    let (status, body) = post(&bridge.router, "/api/test/start", "this is not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let (status, _) = post(&bridge.router, "/api/test/start", r#"{"disk_path": "/x"}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post(
        &bridge.router,
        "/api/test/start",
        r#"{"test_type": "quick_max_mix", "disk_path": "/x", "size_gb": "huge"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn start_with_unknown_profile_is_handled_domain_error() {
    let bridge = bridge().await;
    let (status, body) = post(
        &bridge.router,
        "/api/test/start",
        r#"{"test_type": "warp_drive", "disk_path": "/tmp", "size_gb": 1}"#,
    )
    .await;
    // The body was well-formed JSON, so the rejection is a handled domain
    // error, not a protocol failure.
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("unknown test profile"));
}

#[tokio::test]
async fn missing_test_lookup_is_handled_domain_error() {
    let bridge = bridge().await;
    let (status, body) = get(&bridge.router, "/api/test/test_absent").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn disks_payload_shape() {
    let bridge = bridge().await;
    let (status, body) = get(&bridge.router, "/api/disks").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(body["disks"].is_array());
    assert_eq!(
        body["count"].as_u64().unwrap(),
        body["disks"].as_array().unwrap().len() as u64
    );
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn validate_reports_structured_checks() {
    let bridge = bridge().await;
    let (status, body) = get(&bridge.router, "/api/validate").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let checks = body["checks"].as_array().unwrap();
    assert!(!checks.is_empty());
    for check in checks {
        assert!(check["name"].is_string());
        assert!(check["passed"].is_boolean());
    }
}

#[tokio::test]
async fn setup_requires_known_action() {
    let bridge = bridge().await;
    let (status, _) = post(&bridge.router, "/api/setup", r#"{"action": "reticulate"}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = post(&bridge.router, "/api/setup", r#"{"action": "install_worker"}"#).await;
    assert_eq!(status, StatusCode::OK);
    // Worker is pinned in this harness, so the shim reports availability.
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn full_lifecycle_over_http() {
    let bridge = bridge().await;
    let start_body = format!(
        r#"{{"test_type": "quick_max_speed", "disk_path": "{}", "size_gb": 1}}"#,
        bridge.target.display()
    );

    let (status, body) = post(&bridge.router, "/api/test/start", &start_body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["estimated_duration"], 60);
    let test_id = body["test_id"].as_str().unwrap().to_string();

    // Poll until terminal.
    let deadline = Instant::now() + Duration::from_secs(15);
    let record = loop {
        let (status, body) = get(&bridge.router, &format!("/api/test/{test_id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        let info = body["test_info"].clone();
        let state = info["state"].as_str().unwrap().to_string();
        if ["completed", "failed", "stopped", "timeout", "unknown"].contains(&state.as_str()) {
            break info;
        }
        assert!(Instant::now() < deadline, "test stuck in {state}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    assert_eq!(record["state"], "completed");
    assert_eq!(record["profile"], "quick_max_mix");
    assert_eq!(record["requested_profile"], "quick_max_speed");
    assert_eq!(record["grading"]["verdict"], "excellent");
    assert_eq!(record["progress"], 100.0);

    // The slot is free again.
    let (_, body) = get(&bridge.router, "/api/test/current").await;
    assert_eq!(body["test_running"], false);
}
