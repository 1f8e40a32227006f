//! Snapshot etcd members with `etcdctl`, archive the snapshots to
//! S3-compatible cold storage and post a summary card to Lark chats.

pub mod backup;
pub mod command;
pub mod config;
pub mod error;
pub mod logging;
pub mod notifier;
pub mod progress;
pub mod storage;

pub use backup::{BackupJob, BackupOutcome, Endpoint, EndpointState, RunResult};
pub use config::AppConfig;
pub use error::{BackupFailure, NotifyError, StorageError};
pub use notifier::{ChatApi, ChatDestination, LarkClient, Notifier};
pub use storage::{ArchiveStore, Archiver, S3Store};
