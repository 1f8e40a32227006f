// Test doubles shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use etcd_archiver::config::SnapshotConfig;
use etcd_archiver::progress::UploadProgress;
use etcd_archiver::{
    ArchiveStore, Archiver, BackupJob, ChatApi, ChatDestination, NotifyError, Notifier,
    StorageError,
};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const CONSOLE_URL: &str = "https://console.example.com/ufile?id=etcd-backups";

/// Object store that keeps uploads in memory and can refuse some keys
#[derive(Default)]
pub struct FakeStore {
    pub uploads: Mutex<Vec<(String, Vec<u8>)>>,
    pub fail_when_key_contains: Option<String>,
}

impl FakeStore {
    pub fn failing_on(fragment: &str) -> Self {
        Self {
            fail_when_key_contains: Some(fragment.to_string()),
            ..Self::default()
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.uploads
            .lock()
            .unwrap()
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }
}

#[async_trait]
impl ArchiveStore for FakeStore {
    async fn put_archive(
        &self,
        key: &str,
        path: &Path,
        progress: Arc<UploadProgress>,
    ) -> Result<(), StorageError> {
        if let Some(ref fragment) = self.fail_when_key_contains {
            if key.contains(fragment.as_str()) {
                return Err(StorageError::Service {
                    operation: "PutObject",
                    message: "AccessDenied".to_string(),
                });
            }
        }
        let data = fs::read(path)?;
        progress.update(data.len() as u64);
        self.uploads.lock().unwrap().push((key.to_string(), data));
        Ok(())
    }

    fn location(&self, key: &str) -> String {
        format!("etcd-backups.s3.example.com/{}", key)
    }
}

/// Chat platform double recording every card it receives
#[derive(Default)]
pub struct FakeChat {
    pub joined: Vec<ChatDestination>,
    pub list_error_code: Option<i64>,
    pub rejecting: Vec<String>,
    pub sent: Mutex<Vec<(String, Value)>>,
}

impl FakeChat {
    pub fn with_chats(chats: &[(&str, &str)]) -> Self {
        Self {
            joined: chats
                .iter()
                .map(|(id, name)| ChatDestination {
                    id: id.to_string(),
                    display_name: name.to_string(),
                })
                .collect(),
            ..Self::default()
        }
    }

    pub fn sent_cards(&self) -> Vec<(String, Value)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatApi for FakeChat {
    async fn list_joined_chats(&self) -> Result<Vec<ChatDestination>, NotifyError> {
        if let Some(code) = self.list_error_code {
            return Err(NotifyError::Api {
                api: "im/v1/chats",
                code,
                msg: "tenant access token invalid".to_string(),
            });
        }
        Ok(self.joined.clone())
    }

    async fn send_interactive(&self, chat_id: &str, card: &Value) -> Result<(), NotifyError> {
        if self.rejecting.iter().any(|id| id == chat_id) {
            return Err(NotifyError::Api {
                api: "im/v1/messages",
                code: 230002,
                msg: "bot is not in the chat".to_string(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((chat_id.to_string(), card.clone()));
        Ok(())
    }
}

/// Stand-in for etcdctl. The endpoint address selects the behaviour:
/// `hang` sleeps, `fail` exits 1, `nomarker` exits 0 without the marker.
pub const FAKE_ETCDCTL: &str = r#"#!/bin/sh
addr=""
out=""
for arg in "$@"; do
  case "$arg" in
    --endpoints=*) addr="${arg#--endpoints=}" ;;
  esac
  out="$arg"
done
case "$addr" in
  *hang*) exec sleep 30 ;;
  *fail*) echo "context deadline exceeded" >&2; exit 1 ;;
  *nomarker*) echo "snapshot written"; exit 0 ;;
esac
printf 'snapshot of %s' "$addr" > "$out"
echo "Snapshot saved at $out"
"#;

#[cfg(unix)]
pub fn write_fake_etcdctl(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("etcdctl");
    fs::write(&path, FAKE_ETCDCTL).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub fn snapshot_config(etcdctl: &Path, dump_dir: &Path, timeout_secs: u64) -> SnapshotConfig {
    SnapshotConfig {
        etcdctl: etcdctl.to_path_buf(),
        dump_dir: dump_dir.to_path_buf(),
        timeout_secs,
        ..SnapshotConfig::default()
    }
}

pub fn notifier(chat: Arc<FakeChat>) -> Notifier {
    Notifier::new(chat, vec!["ops-alerts".to_string()], CONSOLE_URL.to_string())
}

pub fn backup_job(
    snapshot: SnapshotConfig,
    store: Arc<FakeStore>,
    chat: Arc<FakeChat>,
) -> BackupJob {
    BackupJob::new("prod", snapshot, Archiver::new("prod", store), notifier(chat))
}

pub fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
