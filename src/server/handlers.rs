//! Bridge endpoint handlers.

use crate::disks;
use crate::error::BenchError;
use crate::models::TestId;
use crate::orchestrator::Orchestrator;
use crate::worker;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

type Reply = (StatusCode, Json<Value>);

fn ok(mut body: Value) -> Reply {
    if let Some(object) = body.as_object_mut() {
        object.insert("success".to_string(), Value::Bool(true));
    }
    (StatusCode::OK, Json(body))
}

fn fail(status: StatusCode, error: impl Into<String>) -> Reply {
    (
        status,
        Json(json!({"success": false, "error": error.into()})),
    )
}

/// Domain errors surface as handled JSON failures at HTTP 200; 4xx is
/// reserved for malformed input, which the handlers reject before ever
/// reaching the orchestrator.
fn domain_fail(error: &BenchError) -> Reply {
    fail(StatusCode::OK, error.user_message())
}

pub async fn list_disks() -> Reply {
    let entries = tokio::task::spawn_blocking(disks::list_disks)
        .await
        .unwrap_or_default();
    let count = entries.len();
    ok(json!({
        "disks": entries,
        "count": count,
        "timestamp": Utc::now().to_rfc3339(),
        "note": "Showing mounted filesystems only - tests realistic QLab performance",
    }))
}

pub async fn service_status(State(orchestrator): State<Orchestrator>) -> Reply {
    let worker = match worker_probe(&orchestrator).await {
        Ok(info) => json!({
            "available": true,
            "path": info.path,
            "version": info.version,
            "source": info.source,
        }),
        Err(e) => json!({"available": false, "error": e.to_string(), "hint": e.hint()}),
    };
    ok(json!({
        "worker": worker,
        "environment": {
            "platform": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "cpu_count": num_cpus::get(),
            "state_dir": orchestrator.config().state_dir,
            "scratch_dir": orchestrator.config().scratch_dir,
        },
    }))
}

pub async fn version(State(orchestrator): State<Orchestrator>) -> Reply {
    let worker_version = match worker_probe(&orchestrator).await {
        Ok(info) => Value::String(info.version),
        Err(_) => Value::Null,
    };
    ok(json!({
        "service_version": env!("CARGO_PKG_VERSION"),
        "worker_version": worker_version,
    }))
}

pub async fn validate(State(orchestrator): State<Orchestrator>) -> Reply {
    let mut checks = Vec::new();

    match worker_probe(&orchestrator).await {
        Ok(info) => checks.push(json!({
            "name": "worker_available",
            "passed": true,
            "details": format!("{} ({})", info.path.display(), info.version),
        })),
        Err(e) => checks.push(json!({
            "name": "worker_available",
            "passed": false,
            "details": e.to_string(),
        })),
    }

    let state_writable = dir_writable(&orchestrator.config().state_dir);
    checks.push(json!({
        "name": "state_dir_writable",
        "passed": state_writable,
        "details": orchestrator.config().state_dir,
    }));

    let scratch_writable = dir_writable(&orchestrator.config().scratch_dir);
    checks.push(json!({
        "name": "scratch_dir_writable",
        "passed": scratch_writable,
        "details": orchestrator.config().scratch_dir,
    }));

    let suitable_disks = tokio::task::spawn_blocking(disks::list_disks)
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|d| d.suitable_for_testing)
        .count();
    checks.push(json!({
        "name": "testable_volume_present",
        "passed": suitable_disks > 0,
        "details": format!("{suitable_disks} suitable volumes"),
    }));

    let all_passed = checks
        .iter()
        .all(|check| check["passed"].as_bool().unwrap_or(false));
    ok(json!({"checks": checks, "all_passed": all_passed}))
}

pub async fn current_test(State(orchestrator): State<Orchestrator>) -> Reply {
    match orchestrator.current() {
        Ok(Some(record)) => ok(json!({"test_running": true, "test_info": record})),
        Ok(None) => ok(json!({"test_running": false})),
        Err(e) => domain_fail(&e),
    }
}

pub async fn test_status(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<String>,
) -> Reply {
    match orchestrator.status(&TestId::from(id.as_str())) {
        Ok(record) => ok(json!({"test_info": record})),
        Err(e) => domain_fail(&e),
    }
}

pub async fn background_tests(State(orchestrator): State<Orchestrator>) -> Reply {
    match orchestrator.background() {
        Ok(records) => {
            let count = records.len();
            ok(json!({
                "background_tests": records,
                "count": count,
            }))
        }
        Err(e) => domain_fail(&e),
    }
}

pub async fn start_test(
    State(orchestrator): State<Orchestrator>,
    body: Result<Json<Value>, JsonRejection>,
) -> Reply {
    let Ok(Json(body)) = body else {
        return fail(StatusCode::BAD_REQUEST, "request body must be JSON");
    };
    let Some(test_type) = body.get("test_type").and_then(Value::as_str) else {
        return fail(StatusCode::BAD_REQUEST, "missing field: test_type");
    };
    let Some(disk_path) = body.get("disk_path").and_then(Value::as_str) else {
        return fail(StatusCode::BAD_REQUEST, "missing field: disk_path");
    };
    let size_gb = match body.get("size_gb") {
        None => 1.0,
        Some(value) => match value.as_f64() {
            Some(size) => size,
            None => return fail(StatusCode::BAD_REQUEST, "size_gb must be a number"),
        },
    };

    match orchestrator.start_test(test_type, disk_path, size_gb).await {
        Ok(started) => ok(json!({
            "test_id": started.test_id,
            "status": "started",
            "estimated_duration": started.estimated_duration_secs,
            "warning": started.warning,
        })),
        Err(e) => domain_fail(&e),
    }
}

pub async fn stop_test(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<String>,
) -> Reply {
    match orchestrator.stop_test(&TestId::from(id.as_str())).await {
        Ok(report) => ok(json!({
            "message": format!("Test {} stopped", report.id),
            "killed_pids": report.killed_pids,
        })),
        Err(e) => domain_fail(&e),
    }
}

pub async fn stop_all(State(orchestrator): State<Orchestrator>) -> Reply {
    match orchestrator.stop_all().await {
        Ok(stopped) => ok(json!({
            "message": format!("Stopped {} tests", stopped.len()),
            "stopped_tests": stopped,
        })),
        Err(e) => domain_fail(&e),
    }
}

pub async fn cleanup_background(
    State(orchestrator): State<Orchestrator>,
    body: Result<Json<Value>, JsonRejection>,
) -> Reply {
    let target = match body {
        Ok(Json(body)) => body
            .get("test_id")
            .and_then(Value::as_str)
            .map(|id| TestId::from(id)),
        Err(_) => None,
    };
    match orchestrator.cleanup_background(target.as_ref()).await {
        Ok(report) => ok(json!({
            "message": format!(
                "Cleaned up {} background tests ({} processes killed)",
                report.removed.len(),
                report.killed_pids.len()
            ),
            "cleaned_tests": report.removed,
            "killed_pids": report.killed_pids,
        })),
        Err(e) => domain_fail(&e),
    }
}

/// Worker installation is an external concern; this shim reports whether a
/// worker already satisfies the acceptance criterion and, if not, how to
/// install one.
pub async fn setup(
    State(orchestrator): State<Orchestrator>,
    body: Result<Json<Value>, JsonRejection>,
) -> Reply {
    let Ok(Json(body)) = body else {
        return fail(StatusCode::BAD_REQUEST, "request body must be JSON");
    };
    match body.get("action").and_then(Value::as_str) {
        Some("install_worker") => match worker_probe(&orchestrator).await {
            Ok(info) => ok(json!({
                "message": format!(
                    "worker already available: {} ({})",
                    info.path.display(),
                    info.version
                ),
                "worker": info,
            })),
            Err(e) => fail(StatusCode::OK, format!("{} ({})", e, e.hint())),
        },
        Some(other) => fail(StatusCode::BAD_REQUEST, format!("unknown action: {other}")),
        None => fail(StatusCode::BAD_REQUEST, "missing field: action"),
    }
}

pub async fn not_found() -> Reply {
    fail(StatusCode::NOT_FOUND, "not found")
}

async fn worker_probe(
    orchestrator: &Orchestrator,
) -> Result<worker::WorkerInfo, crate::error::ResolverError> {
    if let Some(path) = &orchestrator.config().worker_path {
        return Ok(worker::WorkerInfo {
            path: path.clone(),
            version: "pinned".to_string(),
            source: worker::WorkerSource::Bundled,
            supports_json: true,
        });
    }
    worker::resolve().await
}

fn dir_writable(dir: &std::path::Path) -> bool {
    let probe = dir.join(".diskbench-write-probe");
    match std::fs::write(&probe, b"probe") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}
