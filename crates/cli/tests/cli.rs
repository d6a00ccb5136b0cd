use std::path::Path;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use clap::Parser;
use serde_json::{json, Value};

use simbridge_audit::store::LocalFileStore;
use simbridge_audit::AuditSink;
use simbridge_cli::{execute, Cli, EXIT_INTEGRITY_FAILURE};

async fn seed(dir: &Path) {
    let store = Arc::new(LocalFileStore::open(dir).await.unwrap());
    let sink = AuditSink::open(store).await.unwrap();
    let day = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
    sink.record_event_at("job.sim.a.queued", json!({"steps": 1}), day)
        .await
        .unwrap();
    sink.record_event_at("job.sim.a.running", json!({"steps": 2}), day)
        .await
        .unwrap();
    sink.record_event_at("tool.run_simulation.invoked", json!({"steps": 3}), day)
        .await
        .unwrap();
}

async fn run(args: &[&str]) -> (u8, String, String) {
    let cli = Cli::try_parse_from(args.iter().copied()).unwrap();
    let mut out = Vec::new();
    let mut err = Vec::new();
    let code = execute(cli, &mut out, &mut err).await.unwrap();
    (
        code,
        String::from_utf8(out).unwrap(),
        String::from_utf8(err).unwrap(),
    )
}

#[tokio::test]
async fn verify_reports_an_intact_chain() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path()).await;
    let path = dir.path().to_str().unwrap();

    let (code, out, err) = run(&["simbridge", "verify", "--path", path]).await;
    assert_eq!(code, 0);
    assert_eq!(out.trim(), "ok: 3 events verified across 1 partitions");
    assert!(err.is_empty());

    let (code, out, _) = run(&["simbridge", "verify", "--path", path, "--json"]).await;
    assert_eq!(code, 0);
    let report: Value = serde_json::from_str(&out).unwrap();
    assert_eq!(report["ok"], true);
    assert_eq!(report["checked"], 3);
}

#[tokio::test]
async fn verify_fails_on_a_tampered_entry() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path()).await;
    let file = LocalFileStore::at(dir.path()).partition_path("2026-03-01");
    let original = std::fs::read_to_string(&file).unwrap();
    let tampered = original.replacen("\"steps\":2", "\"steps\":20", 1);
    assert_ne!(original, tampered);
    std::fs::write(&file, tampered).unwrap();

    let (code, out, err) = run(&[
        "simbridge",
        "verify",
        "--path",
        dir.path().to_str().unwrap(),
    ])
    .await;
    assert_eq!(code, EXIT_INTEGRITY_FAILURE);
    assert!(out.is_empty());
    assert!(err.contains("partition 2026-03-01 offset 1"), "{err}");
    assert!(err.contains("hash mismatch"), "{err}");
}

#[tokio::test]
async fn verify_outside_the_range_checks_nothing() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path()).await;

    let (code, out, _) = run(&[
        "simbridge",
        "verify",
        "--path",
        dir.path().to_str().unwrap(),
        "--from",
        "2026-04-01",
    ])
    .await;
    assert_eq!(code, 0);
    assert!(out.contains("0 events verified across 0 partitions"));
}

#[tokio::test]
async fn verify_rejects_a_missing_directory() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope");
    let cli = Cli::try_parse_from(["simbridge", "verify", "--path", missing.to_str().unwrap()])
        .unwrap();
    let result = execute(cli, &mut Vec::new(), &mut Vec::new()).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn events_filters_by_type_and_limit() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path()).await;
    let path = dir.path().to_str().unwrap();

    let (code, out, _) = run(&["simbridge", "events", "--path", path, "--type", "job."]).await;
    assert_eq!(code, 0);
    let types: Vec<String> = out
        .lines()
        .map(|l| serde_json::from_str::<Value>(l).unwrap()["event_type"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(types, vec!["job.sim.a.running", "job.sim.a.queued"]);

    let (_, out, _) = run(&["simbridge", "events", "--path", path, "--limit", "1"]).await;
    assert_eq!(out.lines().count(), 1);
    assert!(out.contains("tool.run_simulation.invoked"));
}
