use crate::command::{run_command, CommandOutcome, CommandSpec};
use crate::config::{EndpointConfig, SnapshotConfig};
use crate::error::{BackupFailure, NotifyError};
use crate::notifier::{DeliveryReport, Notifier};
use crate::storage::Archiver;
use chrono::{DateTime, Local};
use futures::FutureExt;
use std::any::Any;
use std::fs;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

/// One etcd member to snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub address: String,
}

impl From<&EndpointConfig> for Endpoint {
    fn from(config: &EndpointConfig) -> Self {
        Self {
            name: config.name.clone(),
            address: config.address.clone(),
        }
    }
}

/// Where an endpoint's processing stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Pending,
    Snapshotting,
    SnapshotFailed,
    Uploading,
    UploadFailed,
    Done,
    /// Processing panicked; the state it was in is unknown.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupOutcome {
    pub endpoint: Endpoint,
    pub state: EndpointState,
    /// Remote address on success, the failure description otherwise.
    pub detail: String,
}

impl BackupOutcome {
    fn done(endpoint: &Endpoint, location: String) -> Self {
        Self {
            endpoint: endpoint.clone(),
            state: EndpointState::Done,
            detail: location,
        }
    }

    fn failed(endpoint: &Endpoint, state: EndpointState, failure: BackupFailure) -> Self {
        Self {
            endpoint: endpoint.clone(),
            state,
            detail: failure.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == EndpointState::Done
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    pub cluster_name: String,
    pub successes: Vec<BackupOutcome>,
    pub failures: Vec<BackupOutcome>,
}

impl RunResult {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            ..Self::default()
        }
    }

    pub fn record(&mut self, outcome: BackupOutcome) {
        if outcome.is_success() {
            self.successes.push(outcome);
        } else {
            self.failures.push(outcome);
        }
    }

    pub fn total(&self) -> usize {
        self.successes.len() + self.failures.len()
    }
}

/// `<YYYY-mm-dd-HH-MM-SS>-<name>.db`
pub fn artifact_file_name(endpoint_name: &str, now: DateTime<Local>) -> String {
    format!("{}-{}.db", now.format("%Y-%m-%d-%H-%M-%S"), endpoint_name)
}

/// `etcdctl snapshot save` against one endpoint, writing to `output`.
pub fn snapshot_command(config: &SnapshotConfig, address: &str, output: &Path) -> CommandSpec {
    CommandSpec::new(&config.etcdctl)
        .env("ETCDCTL_API", "3")
        .arg(format!("--endpoints={}", address))
        .arg(format!("--cacert={}", config.cacert.display()))
        .arg(format!("--cert={}", config.cert.display()))
        .arg(format!("--key={}", config.key.display()))
        .arg("snapshot")
        .arg("save")
        .arg(output)
}

/// Snapshot, archive and report every configured endpoint, one at a time.
pub struct BackupJob {
    cluster: String,
    snapshot: SnapshotConfig,
    archiver: Archiver,
    notifier: Notifier,
}

impl BackupJob {
    pub fn new(
        cluster: impl Into<String>,
        snapshot: SnapshotConfig,
        archiver: Archiver,
        notifier: Notifier,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            snapshot,
            archiver,
            notifier,
        }
    }

    /// Back up all endpoints and post the report. Only a failure to resolve
    /// chat destinations is returned as an error.
    pub async fn run(&self, endpoints: &[Endpoint]) -> Result<(RunResult, DeliveryReport), NotifyError> {
        let result = self.backup_all(endpoints).await;
        info!(
            "Backup pass finished: {} succeeded, {} failed",
            result.successes.len(),
            result.failures.len()
        );
        let report = self.notifier.notify(&result).await?;
        Ok((result, report))
    }

    /// Every endpoint yields exactly one outcome, in configuration order.
    pub async fn backup_all(&self, endpoints: &[Endpoint]) -> RunResult {
        let mut result = RunResult::new(&self.cluster);

        if let Err(e) = fs::create_dir_all(&self.snapshot.dump_dir) {
            warn!(
                "Failed to create dump directory {}: {}",
                self.snapshot.dump_dir.display(),
                e
            );
        }

        for endpoint in endpoints {
            info!(
                "[BACKUP] [START] Backup: {}, etcd address: {}",
                endpoint.name, endpoint.address
            );

            let outcome = match AssertUnwindSafe(self.backup_endpoint(endpoint))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(panic) => BackupOutcome::failed(
                    endpoint,
                    EndpointState::Aborted,
                    BackupFailure::Panicked(panic_message(panic.as_ref())),
                ),
            };

            if outcome.is_success() {
                info!(
                    "[BACKUP] [SUCCESS] Backup: {}, etcd address: {}",
                    endpoint.name, endpoint.address
                );
            } else {
                error!(
                    "[BACKUP] [FAILED] Backup: {}, etcd address: {}, state: {:?}, reason: {}",
                    endpoint.name, endpoint.address, outcome.state, outcome.detail
                );
            }
            result.record(outcome);
        }

        result
    }

    async fn backup_endpoint(&self, endpoint: &Endpoint) -> BackupOutcome {
        let mut state = EndpointState::Pending;
        let artifact = artifact_path(&self.snapshot, endpoint, Local::now());

        advance(endpoint, &mut state, EndpointState::Snapshotting);
        if let Err(failure) = self.take_snapshot(endpoint, &artifact).await {
            advance(endpoint, &mut state, EndpointState::SnapshotFailed);
            return BackupOutcome::failed(endpoint, state, failure);
        }

        advance(endpoint, &mut state, EndpointState::Uploading);
        let key = match self.archiver.upload(&artifact).await {
            Ok(key) => key,
            Err(e) => {
                advance(endpoint, &mut state, EndpointState::UploadFailed);
                error!(
                    "[UPLOAD] Upload failed, keeping {} for manual recovery",
                    artifact.display()
                );
                return BackupOutcome::failed(endpoint, state, e.into());
            }
        };

        let location = self.archiver.location(&key);
        info!("[UPLOAD] [SUCCESS] Upload finished: {}", location);
        remove_artifact(&artifact);
        advance(endpoint, &mut state, EndpointState::Done);
        BackupOutcome::done(endpoint, location)
    }

    async fn take_snapshot(&self, endpoint: &Endpoint, artifact: &Path) -> Result<(), BackupFailure> {
        let command = snapshot_command(&self.snapshot, &endpoint.address, artifact);
        let timeout = Duration::from_secs(self.snapshot.timeout_secs);

        match run_command(&command, timeout).await {
            CommandOutcome::Succeeded { stdout, .. } => {
                if stdout.contains(&self.snapshot.success_marker) {
                    Ok(())
                } else {
                    Err(BackupFailure::MissingMarker {
                        marker: self.snapshot.success_marker.clone(),
                        stdout,
                    })
                }
            }
            CommandOutcome::Failed { code, stderr, .. } => {
                Err(BackupFailure::SnapshotExited { code, stderr })
            }
            CommandOutcome::TimedOut { after } => Err(BackupFailure::SnapshotTimedOut(after)),
            CommandOutcome::SpawnFailed { reason } => Err(BackupFailure::SnapshotSpawn(reason)),
        }
    }
}

fn advance(endpoint: &Endpoint, state: &mut EndpointState, next: EndpointState) {
    tracing::debug!("[BACKUP] {}: {:?} -> {:?}", endpoint.name, state, next);
    *state = next;
}

/// Delete an uploaded artifact. The upload already succeeded, so a failure
/// here only leaves a stray file behind.
pub fn remove_artifact(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => info!("[UPLOAD] Cleared file: {}", path.display()),
        Err(e) => warn!("[UPLOAD] Failed to remove {}: {}", path.display(), e),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Path the artifact for `endpoint` would get if snapshotted at `now`.
pub fn artifact_path(config: &SnapshotConfig, endpoint: &Endpoint, now: DateTime<Local>) -> PathBuf {
    config.dump_dir.join(artifact_file_name(&endpoint.name, now))
}
