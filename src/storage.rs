use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::progress::UploadProgress;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, StorageClass};
use aws_sdk_s3::{config::Region, Client as S3Client, Config};
use chrono::{Local, NaiveDate};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use url::Url;

/// Destination for finished snapshot files.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Store the file at `path` under `key`, feeding transferred byte counts
    /// into `progress`.
    async fn put_archive(
        &self,
        key: &str,
        path: &Path,
        progress: Arc<UploadProgress>,
    ) -> Result<(), StorageError>;

    /// Human-readable address of `key`, as shown in reports.
    fn location(&self, key: &str) -> String;
}

/// `<cluster>/YYYY/MM/DD/<file>`
pub fn remote_key(cluster: &str, date: NaiveDate, file_name: &str) -> String {
    format!("{}/{}/{}", cluster, date.format("%Y/%m/%d"), file_name)
}

/// Uploads snapshot files under date-partitioned keys.
pub struct Archiver {
    cluster: String,
    store: Arc<dyn ArchiveStore>,
}

impl Archiver {
    pub fn new(cluster: impl Into<String>, store: Arc<dyn ArchiveStore>) -> Self {
        Self {
            cluster: cluster.into(),
            store,
        }
    }

    /// Upload `path` under today's key and return that key.
    pub async fn upload(&self, path: &Path) -> Result<String, StorageError> {
        self.upload_dated(path, Local::now().date_naive()).await
    }

    pub async fn upload_dated(&self, path: &Path, date: NaiveDate) -> Result<String, StorageError> {
        let file_name = path.file_name().and_then(|n| n.to_str()).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a file path: {}", path.display()),
            )
        })?;
        let key = remote_key(&self.cluster, date, file_name);
        let progress = Arc::new(UploadProgress::for_file(path)?);

        info!(
            "[UPLOAD] Uploading file: {} ({:.2} MB) -> {}",
            path.display(),
            progress.total() as f64 / 1_048_576.0,
            key
        );

        match self.store.put_archive(&key, path, progress).await {
            Ok(()) => Ok(key),
            Err(e) => {
                error!("[UPLOAD] {}", e);
                Err(e)
            }
        }
    }

    pub fn location(&self, key: &str) -> String {
        self.store.location(key)
    }
}

/// The object storage calls an upload is made of.
#[async_trait]
pub trait ObjectApi: Send + Sync {
    async fn put_object(&self, key: &str, path: &Path) -> Result<(), StorageError>;

    /// Returns the upload id.
    async fn create_multipart(&self, key: &str) -> Result<String, StorageError>;

    /// Returns the part's ETag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        number: i32,
        data: Vec<u8>,
    ) -> Result<Option<String>, StorageError>;

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StorageError>;

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StorageError>;
}

/// aws-sdk-s3 client bound to one bucket and storage class.
struct S3Api {
    client: S3Client,
    bucket: String,
    storage_class: StorageClass,
}

#[async_trait]
impl ObjectApi for S3Api {
    async fn put_object(&self, key: &str, path: &Path) -> Result<(), StorageError> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .storage_class(self.storage_class.clone())
            .body(body)
            .send()
            .await
            .map_err(|e| StorageError::service("PutObject", e))?;
        Ok(())
    }

    async fn create_multipart(&self, key: &str) -> Result<String, StorageError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .storage_class(self.storage_class.clone())
            .send()
            .await
            .map_err(|e| StorageError::service("CreateMultipartUpload", e))?;
        created
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StorageError::MissingUploadId {
                key: key.to_string(),
            })
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        number: i32,
        data: Vec<u8>,
    ) -> Result<Option<String>, StorageError> {
        let uploaded = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(number)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StorageError::service("UploadPart", e))?;
        Ok(uploaded.e_tag().map(str::to_string))
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StorageError> {
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| StorageError::service("CompleteMultipartUpload", e))?;
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StorageError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| StorageError::service("AbortMultipartUpload", e))?;
        Ok(())
    }
}

/// S3-compatible store writing every object with a fixed storage class.
///
/// Files up to one part are sent with a single PutObject; larger files go
/// through a multipart upload with at most `concurrency` parts in flight.
pub struct S3Store {
    api: Arc<dyn ObjectApi>,
    bucket: String,
    host: String,
    part_size: u64,
    concurrency: usize,
}

impl S3Store {
    pub async fn from_config(config: &StorageConfig) -> Result<Self> {
        let endpoint = normalize_endpoint(&config.endpoint)?;
        let host = endpoint
            .host_str()
            .context("storage.endpoint has no host")?
            .to_string();
        let region = Region::new(config.region().to_string());

        let builder = match config.static_credentials() {
            Some((access_key, secret_key)) => {
                use aws_credential_types::Credentials;
                let credentials =
                    Credentials::new(access_key, secret_key, None, None, "etcd-archiver");
                Config::builder().credentials_provider(credentials)
            }
            None => {
                let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .region(region.clone())
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
        };

        let s3_config = builder
            .endpoint_url(endpoint.as_str().trim_end_matches('/'))
            .region(region)
            .force_path_style(config.force_path_style.unwrap_or(false))
            .build();

        let api = S3Api {
            client: S3Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            storage_class: StorageClass::from(config.storage_class()),
        };

        Ok(Self {
            api: Arc::new(api),
            bucket: config.bucket.clone(),
            host,
            part_size: config.part_size(),
            concurrency: config.upload_concurrency(),
        })
    }

    async fn put_multipart(
        &self,
        key: &str,
        path: &Path,
        progress: Arc<UploadProgress>,
    ) -> Result<(), StorageError> {
        let upload_id = self.api.create_multipart(key).await?;

        let parts = match self.upload_parts(key, &upload_id, path, progress).await {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(abort) = self.api.abort_multipart(key, &upload_id).await {
                    warn!("Failed to abort multipart upload {}: {}", upload_id, abort);
                }
                return Err(e);
            }
        };

        self.api.complete_multipart(key, &upload_id, parts).await
    }

    /// Upload every part, keeping `concurrency` of them in flight. On the
    /// first failure the remaining part tasks are cancelled and drained
    /// before returning, so nothing is still uploading once the caller aborts.
    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        path: &Path,
        progress: Arc<UploadProgress>,
    ) -> Result<Vec<CompletedPart>, StorageError> {
        let mut pending = plan_parts(progress.total(), self.part_size).into_iter();
        let mut tasks = JoinSet::new();
        let mut parts = Vec::new();

        loop {
            while tasks.len() < self.concurrency {
                let Some(part) = pending.next() else { break };
                tasks.spawn(upload_part(
                    Arc::clone(&self.api),
                    key.to_string(),
                    upload_id.to_string(),
                    path.to_path_buf(),
                    part,
                    Arc::clone(&progress),
                ));
            }

            let Some(joined) = tasks.join_next().await else { break };
            let uploaded = joined.unwrap_or_else(|e| {
                Err(StorageError::PartTask {
                    message: e.to_string(),
                })
            });
            match uploaded {
                Ok(part) => parts.push(part),
                Err(e) => {
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    return Err(e);
                }
            }
        }

        parts.sort_by_key(|p| p.part_number());
        Ok(parts)
    }
}

async fn upload_part(
    api: Arc<dyn ObjectApi>,
    key: String,
    upload_id: String,
    path: PathBuf,
    part: PartPlan,
    progress: Arc<UploadProgress>,
) -> Result<CompletedPart, StorageError> {
    let data = read_part(&path, part.offset, part.len).await?;
    let e_tag = api.upload_part(&key, &upload_id, part.number, data).await?;
    progress.update(part.len);

    Ok(CompletedPart::builder()
        .part_number(part.number)
        .set_e_tag(e_tag)
        .build())
}

#[async_trait]
impl ArchiveStore for S3Store {
    async fn put_archive(
        &self,
        key: &str,
        path: &Path,
        progress: Arc<UploadProgress>,
    ) -> Result<(), StorageError> {
        if progress.total() <= self.part_size {
            self.api.put_object(key, path).await?;
            progress.update(progress.total());
            Ok(())
        } else {
            self.put_multipart(key, path, progress).await
        }
    }

    fn location(&self, key: &str) -> String {
        format!("{}.{}/{}", self.bucket, self.host, key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    pub number: i32,
    pub offset: u64,
    pub len: u64,
}

/// Split `size` bytes into consecutive parts of at most `part_size` bytes,
/// numbered from 1.
pub fn plan_parts(size: u64, part_size: u64) -> Vec<PartPlan> {
    let mut parts = Vec::new();
    let mut offset = 0;
    let mut number = 1;
    while offset < size {
        let len = part_size.min(size - offset);
        parts.push(PartPlan {
            number,
            offset,
            len,
        });
        offset += len;
        number += 1;
    }
    parts
}

async fn read_part(path: &Path, offset: u64, len: u64) -> io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

fn normalize_endpoint(endpoint: &str) -> Result<Url> {
    let endpoint = endpoint.trim();
    let with_scheme = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("https://{}", endpoint)
    };
    Url::parse(&with_scheme).with_context(|| format!("Invalid storage endpoint: {}", endpoint))
}
