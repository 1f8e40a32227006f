// Backup pass integration tests driven by a fake etcdctl

#![cfg(unix)]

mod common;

use chrono::Local;
use common::*;
use etcd_archiver::{Endpoint, EndpointState, NotifyError};
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;

fn endpoints(specs: &[(&str, &str)]) -> Vec<Endpoint> {
    specs
        .iter()
        .map(|(name, address)| Endpoint {
            name: name.to_string(),
            address: address.to_string(),
        })
        .collect()
}

fn block(card: &Value, index: usize) -> String {
    card["elements"][index]["content"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

/// All endpoints snapshot and upload cleanly
#[tokio::test]
async fn test_all_endpoints_succeed() {
    let temp_dir = TempDir::new().unwrap();
    let etcdctl = write_fake_etcdctl(temp_dir.path());
    let dump_dir = temp_dir.path().join("dumps");

    let store = Arc::new(FakeStore::default());
    let chat = Arc::new(FakeChat::with_chats(&[("oc_1", "ops-alerts")]));
    let job = backup_job(
        snapshot_config(&etcdctl, &dump_dir, 10),
        store.clone(),
        chat.clone(),
    );

    let targets = endpoints(&[
        ("a", "https://10.0.0.1:2379"),
        ("b", "https://10.0.0.2:2379"),
        ("c", "https://10.0.0.3:2379"),
    ]);
    let (result, report) = job.run(&targets).await.unwrap();

    assert_eq!(result.cluster_name, "prod");
    assert_eq!(result.successes.len(), 3);
    assert!(result.failures.is_empty());
    let names: Vec<&str> = result
        .successes
        .iter()
        .map(|o| o.endpoint.name.as_str())
        .collect();
    assert_eq!(names, vec!["a", "b", "c"]);

    let prefix = format!("prod/{}/", Local::now().format("%Y/%m/%d"));
    let keys = store.keys();
    assert_eq!(keys.len(), 3);
    for (key, name) in keys.iter().zip(["a", "b", "c"]) {
        assert!(key.starts_with(&prefix), "unexpected key {}", key);
        assert!(key.ends_with(&format!("-{}.db", name)), "unexpected key {}", key);
    }
    assert_eq!(
        result.successes[0].detail,
        format!("etcd-backups.s3.example.com/{}", keys[0])
    );

    // uploaded snapshots are removed locally
    assert!(files_in(&dump_dir).is_empty());

    assert_eq!(report.delivered, vec!["ops-alerts".to_string()]);
    let cards = chat.sent_cards();
    assert_eq!(cards.len(), 1);
    let card = &cards[0].1;
    assert_eq!(card["header"]["template"], "green");
    let success_block = block(card, 1);
    assert!(success_block.contains("Backup succeeded"));
    assert_eq!(success_block.lines().filter(|l| l.contains(" > ")).count(), 3);
}

/// A hung snapshot is killed and the rest of the batch continues
#[tokio::test]
async fn test_timed_out_endpoint_does_not_abort_batch() {
    let temp_dir = TempDir::new().unwrap();
    let etcdctl = write_fake_etcdctl(temp_dir.path());
    let dump_dir = temp_dir.path().join("dumps");

    let store = Arc::new(FakeStore::default());
    let chat = Arc::new(FakeChat::with_chats(&[("oc_1", "ops-alerts")]));
    let job = backup_job(
        snapshot_config(&etcdctl, &dump_dir, 1),
        store.clone(),
        chat.clone(),
    );

    let targets = endpoints(&[
        ("a", "https://hang.example:2379"),
        ("b", "https://10.0.0.2:2379"),
        ("c", "https://10.0.0.3:2379"),
    ]);
    let (result, _) = job.run(&targets).await.unwrap();

    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.successes.len(), 2);
    let failure = &result.failures[0];
    assert_eq!(failure.endpoint.name, "a");
    assert_eq!(failure.state, EndpointState::SnapshotFailed);
    assert!(failure.detail.contains("timed out"), "detail: {}", failure.detail);
    assert_eq!(store.keys().len(), 2);

    let cards = chat.sent_cards();
    let card = &cards[0].1;
    assert_eq!(card["header"]["template"], "red");
    let failure_block = block(card, 1);
    let success_block = block(card, 3);
    assert!(failure_block.contains("Backup failed"));
    assert!(failure_block.contains("**a**"));
    assert!(success_block.contains("Backup succeeded"));
    assert!(success_block.contains("**b**"));
    assert!(success_block.contains("**c**"));
    assert!(!success_block.contains("**a**"));
}

/// Failed or unconfirmed snapshots are never uploaded
#[tokio::test]
async fn test_snapshot_failures_skip_upload() {
    let temp_dir = TempDir::new().unwrap();
    let etcdctl = write_fake_etcdctl(temp_dir.path());
    let dump_dir = temp_dir.path().join("dumps");

    let store = Arc::new(FakeStore::default());
    let chat = Arc::new(FakeChat::with_chats(&[("oc_1", "ops-alerts")]));
    let job = backup_job(
        snapshot_config(&etcdctl, &dump_dir, 10),
        store.clone(),
        chat,
    );

    let targets = endpoints(&[
        ("exit", "https://fail.example:2379"),
        ("quiet", "https://nomarker.example:2379"),
    ]);
    let result = job.backup_all(&targets).await;

    assert!(result.successes.is_empty());
    assert_eq!(result.failures.len(), 2);
    assert!(store.keys().is_empty());

    assert_eq!(result.failures[0].state, EndpointState::SnapshotFailed);
    assert!(result.failures[0].detail.contains("exited with code Some(1)"));
    assert!(result.failures[0].detail.contains("context deadline exceeded"));

    assert_eq!(result.failures[1].state, EndpointState::SnapshotFailed);
    assert!(result.failures[1].detail.contains("Snapshot saved at"));
}

/// A failed upload leaves the snapshot on disk
#[tokio::test]
async fn test_failed_upload_keeps_artifact() {
    let temp_dir = TempDir::new().unwrap();
    let etcdctl = write_fake_etcdctl(temp_dir.path());
    let dump_dir = temp_dir.path().join("dumps");

    let store = Arc::new(FakeStore::failing_on("-b.db"));
    let chat = Arc::new(FakeChat::with_chats(&[("oc_1", "ops-alerts")]));
    let job = backup_job(
        snapshot_config(&etcdctl, &dump_dir, 10),
        store.clone(),
        chat,
    );

    let targets = endpoints(&[
        ("a", "https://10.0.0.1:2379"),
        ("b", "https://10.0.0.2:2379"),
    ]);
    let result = job.backup_all(&targets).await;

    assert_eq!(result.successes.len(), 1);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].endpoint.name, "b");
    assert_eq!(result.failures[0].state, EndpointState::UploadFailed);
    assert!(result.failures[0].detail.contains("AccessDenied"));

    let left = files_in(&dump_dir);
    assert_eq!(left.len(), 1);
    assert!(left[0].ends_with("-b.db"));
}

/// Every endpoint ends up in exactly one list
#[tokio::test]
async fn test_one_outcome_per_endpoint() {
    let temp_dir = TempDir::new().unwrap();
    let etcdctl = write_fake_etcdctl(temp_dir.path());
    let dump_dir = temp_dir.path().join("dumps");

    let store = Arc::new(FakeStore::failing_on("-up.db"));
    let chat = Arc::new(FakeChat::default());
    let job = backup_job(snapshot_config(&etcdctl, &dump_dir, 10), store, chat);

    let targets = endpoints(&[
        ("ok", "https://10.0.0.1:2379"),
        ("exit", "https://fail.example:2379"),
        ("up", "https://10.0.0.3:2379"),
        ("quiet", "https://nomarker.example:2379"),
    ]);
    let result = job.backup_all(&targets).await;

    assert_eq!(result.total(), targets.len());
    for endpoint in &targets {
        let in_successes = result.successes.iter().filter(|o| o.endpoint == *endpoint).count();
        let in_failures = result.failures.iter().filter(|o| o.endpoint == *endpoint).count();
        assert_eq!(in_successes + in_failures, 1, "endpoint {}", endpoint.name);
    }
}

/// A missing etcdctl binary is an endpoint failure, not a crash
#[tokio::test]
async fn test_missing_etcdctl_is_recorded() {
    let temp_dir = TempDir::new().unwrap();
    let dump_dir = temp_dir.path().join("dumps");

    let store = Arc::new(FakeStore::default());
    let chat = Arc::new(FakeChat::default());
    let job = backup_job(
        snapshot_config(&temp_dir.path().join("no-such-etcdctl"), &dump_dir, 10),
        store,
        chat,
    );

    let result = job
        .backup_all(&endpoints(&[("a", "https://10.0.0.1:2379")]))
        .await;
    assert_eq!(result.failures.len(), 1);
    assert!(result.failures[0].detail.contains("could not be started"));
}

/// Chat lookup errors abort the run after the backups were taken
#[tokio::test]
async fn test_destination_lookup_error_is_fatal() {
    let temp_dir = TempDir::new().unwrap();
    let etcdctl = write_fake_etcdctl(temp_dir.path());
    let dump_dir = temp_dir.path().join("dumps");

    let store = Arc::new(FakeStore::default());
    let chat = Arc::new(FakeChat {
        list_error_code: Some(99991663),
        ..FakeChat::default()
    });
    let job = backup_job(
        snapshot_config(&etcdctl, &dump_dir, 10),
        store.clone(),
        chat.clone(),
    );

    let err = job
        .run(&endpoints(&[("a", "https://10.0.0.1:2379")]))
        .await
        .unwrap_err();
    assert!(matches!(err, NotifyError::Api { code: 99991663, .. }));
    assert_eq!(store.keys().len(), 1);
    assert!(chat.sent_cards().is_empty());
}
