//! Worker output parsing: raw stdout (log lines followed by a JSON
//! document, across several historical worker schema versions) into a
//! canonical [`Summary`].
//!
//! Field resolution rules:
//! - bandwidth: `bw` (KiB/s) when present and non-zero, else `bw_bytes`/1024
//! - IOPS: `iops`, else `iops_mean`, else 0
//! - latency: `lat_ns.mean`, converted to milliseconds
//!
//! Malformed numeric fields count as zero and never fail the parse; only a
//! structurally broken document does.

use crate::error::ParseError;
use crate::models::Summary;
use serde_json::Value;

/// Longest output excerpt embedded in a parse failure.
const EXCERPT_LEN: usize = 160;

/// Parse raw worker output into a canonical summary.
pub fn parse(raw_output: &str) -> Result<Summary, ParseError> {
    let (json_text, position) = extract_json(raw_output)?;
    let document: Value = serde_json::from_str(json_text).map_err(|_| ParseError::InvalidJson {
        excerpt: excerpt_of(&raw_output[position..]),
    })?;
    Ok(summarize(&document))
}

/// Parse an already-isolated JSON document (e.g. the worker's artifact
/// file, which carries no log preamble).
pub fn parse_document(document: &Value) -> Summary {
    summarize(document)
}

/// Locate the first balanced JSON object in mixed log/JSON output.
///
/// Scans for the first line beginning with `{`, then tracks brace depth to
/// the balanced end. Everything outside the object is discarded.
fn extract_json(output: &str) -> Result<(&str, usize), ParseError> {
    let mut start = None;
    let mut offset = 0;
    for line in output.split_inclusive('\n') {
        if line.trim_start().starts_with('{') {
            let indent = line.len() - line.trim_start().len();
            start = Some(offset + indent);
            break;
        }
        offset += line.len();
    }

    let start = start.ok_or_else(|| ParseError::NoJsonObject {
        position: 0,
        excerpt: excerpt_of(output),
    })?;

    let mut depth = 0usize;
    for (idx, ch) in output[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + idx + 1;
                    return Ok((&output[start..end], start));
                }
            }
            _ => {}
        }
    }

    Err(ParseError::NoJsonObject {
        position: start,
        excerpt: excerpt_of(&output[start..]),
    })
}

fn excerpt_of(text: &str) -> String {
    let trimmed = text.trim();
    let mut end = trimmed.len().min(EXCERPT_LEN);
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].to_string()
}

/// Aggregate the per-job records into one summary.
fn summarize(document: &Value) -> Summary {
    let jobs = match document.get("jobs").and_then(Value::as_array) {
        Some(jobs) => jobs,
        None => return Summary::default(),
    };

    let mut summary = Summary::default();
    let mut read_latencies_ms = Vec::new();
    let mut write_latencies_ms = Vec::new();
    let mut sum_bw_min = 0.0;
    let mut sum_bw_mean = 0.0;
    let mut saw_stability_fields = false;

    for job in jobs {
        let read = job.get("read");
        let write = job.get("write");

        summary.read_bw_kib += bandwidth_kib(read);
        summary.write_bw_kib += bandwidth_kib(write);
        summary.read_iops += iops(read);
        summary.write_iops += iops(write);

        let read_lat = latency_ms(read);
        if read_lat > 0.0 {
            read_latencies_ms.push(read_lat);
        }
        let write_lat = latency_ms(write);
        if write_lat > 0.0 {
            write_latencies_ms.push(write_lat);
        }

        summary.max_runtime_ms = summary.max_runtime_ms.max(runtime_ms(job));

        if let Some(read) = read {
            if read.get("bw_min").is_some() && read.get("bw_mean").is_some() {
                saw_stability_fields = true;
                sum_bw_min += non_negative(read.get("bw_min"));
                sum_bw_mean += non_negative(read.get("bw_mean"));
            }
        }
    }

    if !read_latencies_ms.is_empty() {
        summary.avg_read_latency_ms =
            read_latencies_ms.iter().sum::<f64>() / read_latencies_ms.len() as f64;
    }
    if !write_latencies_ms.is_empty() {
        summary.avg_write_latency_ms =
            write_latencies_ms.iter().sum::<f64>() / write_latencies_ms.len() as f64;
    }
    if saw_stability_fields && sum_bw_mean > 0.0 {
        summary.stability_ratio = Some(sum_bw_min / sum_bw_mean);
    }

    summary
}

/// Bandwidth in KiB/s with the `bw` / `bw_bytes` preference rule.
fn bandwidth_kib(io: Option<&Value>) -> f64 {
    let bw = non_negative(io.and_then(|v| v.get("bw")));
    if bw > 0.0 {
        return bw;
    }
    non_negative(io.and_then(|v| v.get("bw_bytes"))) / 1024.0
}

/// IOPS with the `iops` / `iops_mean` preference rule.
fn iops(io: Option<&Value>) -> f64 {
    match io.and_then(|v| v.get("iops")).and_then(Value::as_f64) {
        Some(value) if value >= 0.0 => value,
        _ => non_negative(io.and_then(|v| v.get("iops_mean"))),
    }
}

/// Mean total latency in milliseconds.
fn latency_ms(io: Option<&Value>) -> f64 {
    let mean_ns = non_negative(io.and_then(|v| v.get("lat_ns")).and_then(|l| l.get("mean")));
    mean_ns / 1_000_000.0
}

/// Per-job runtime in milliseconds: `job_runtime` when present, otherwise
/// the longest of the read/write leg runtimes.
fn runtime_ms(job: &Value) -> u64 {
    let job_runtime = non_negative(job.get("job_runtime"));
    if job_runtime > 0.0 {
        return job_runtime as u64;
    }
    let read_runtime = non_negative(job.get("read").and_then(|v| v.get("runtime")));
    let write_runtime = non_negative(job.get("write").and_then(|v| v.get("runtime")));
    read_runtime.max(write_runtime) as u64
}

/// Numeric field value clamped to zero; malformed values count as zero.
fn non_negative(value: Option<&Value>) -> f64 {
    value.and_then(Value::as_f64).unwrap_or(0.0).max(0.0)
}
