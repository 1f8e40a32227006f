use crate::command::DEFAULT_TIMEOUT;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

const DEFAULT_LARK_API_BASE: &str = "https://open.feishu.cn/open-apis";
const DEFAULT_CONSOLE_URL: &str = "https://console.ucloud.cn/ufile/ufile/detail?id={bucket}&tab=overview";
const MIN_PART_SIZE_MB: u64 = 5;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub cluster: ClusterConfig,
    pub lark: LarkConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct LarkConfig {
    pub app_id: String,
    /// Falls back to `LARK_APP_SECRET`.
    pub app_secret: Option<String>,
    /// Comma-separated chat names the report is posted to.
    pub groups: String,
    pub api_base: Option<String>,
    pub timeout_secs: Option<u64>,
    pub console_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    pub endpoint: String,
    pub region: Option<String>,
    pub bucket: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub storage_class: Option<String>,
    pub force_path_style: Option<bool>,
    pub part_size_mb: Option<u64>,
    pub upload_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub etcdctl: PathBuf,
    pub cacert: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub dump_dir: PathBuf,
    pub timeout_secs: u64,
    pub success_marker: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            etcdctl: PathBuf::from("./etcdctl"),
            cacert: PathBuf::from("./certs/ca.pem"),
            cert: PathBuf::from("./certs/cert.pem"),
            key: PathBuf::from("./certs/cert.key"),
            dump_dir: PathBuf::from("./dumps"),
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            success_marker: "Snapshot saved at".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub file_name: String,
    pub max_bytes: u64,
    pub max_files: usize,
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./logs"),
            file_name: "runtime.log".to_string(),
            max_bytes: 20 * 1024 * 1024,
            max_files: 10,
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn file_path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub address: String,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.cluster.name.trim().is_empty() {
            bail!("cluster.name must not be empty");
        }
        if self.storage.bucket.trim().is_empty() {
            bail!("storage.bucket must not be empty");
        }
        if self.endpoints.is_empty() {
            bail!("at least one [[endpoints]] entry is required");
        }

        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.name.trim().is_empty() || endpoint.address.trim().is_empty() {
                bail!("endpoint entries need both a name and an address");
            }
            if !is_plain_file_component(&endpoint.name) {
                bail!(
                    "endpoint name {:?} must not contain path separators or be \".\" / \"..\"",
                    endpoint.name
                );
            }
            if !seen.insert(endpoint.name.as_str()) {
                bail!("duplicate endpoint name: {}", endpoint.name);
            }
        }

        if self.storage.part_size_mb.unwrap_or(16) < MIN_PART_SIZE_MB {
            bail!("storage.part_size_mb must be at least {}", MIN_PART_SIZE_MB);
        }
        if self.storage.upload_concurrency == Some(0) {
            bail!("storage.upload_concurrency must be at least 1");
        }
        Ok(())
    }
}

/// Endpoint names end up in snapshot file names inside the dump directory.
fn is_plain_file_component(name: &str) -> bool {
    !name.contains(['/', '\\']) && name != "." && name != ".."
}

impl LarkConfig {
    pub fn app_secret(&self) -> Result<String> {
        self.app_secret
            .clone()
            .or_else(|| std::env::var("LARK_APP_SECRET").ok())
            .context("lark.app_secret is not set (config or LARK_APP_SECRET)")
    }

    pub fn allow_list(&self) -> Vec<String> {
        parse_allow_list(&self.groups)
    }

    pub fn api_base(&self) -> &str {
        self.api_base
            .as_deref()
            .unwrap_or(DEFAULT_LARK_API_BASE)
            .trim_end_matches('/')
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(5))
    }

    pub fn console_url(&self, bucket: &str) -> String {
        self.console_url
            .as_deref()
            .unwrap_or(DEFAULT_CONSOLE_URL)
            .replace("{bucket}", bucket)
    }
}

impl StorageConfig {
    pub fn region(&self) -> &str {
        self.region.as_deref().unwrap_or("us-east-1")
    }

    pub fn storage_class(&self) -> &str {
        self.storage_class.as_deref().unwrap_or("DEEP_ARCHIVE")
    }

    pub fn part_size(&self) -> u64 {
        self.part_size_mb.unwrap_or(16) * 1024 * 1024
    }

    pub fn upload_concurrency(&self) -> usize {
        self.upload_concurrency.unwrap_or(4)
    }

    /// Static keys from config, then the usual AWS variables. `None` means the
    /// default credential chain is used.
    pub fn static_credentials(&self) -> Option<(String, String)> {
        let access = self
            .access_key
            .clone()
            .or_else(|| std::env::var("AWS_ACCESS_KEY_ID").ok())?;
        let secret = self
            .secret_key
            .clone()
            .or_else(|| std::env::var("AWS_SECRET_ACCESS_KEY").ok())?;
        Some((access, secret))
    }
}

pub fn parse_allow_list(groups: &str) -> Vec<String> {
    groups
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn generate_example_config(output_path: &Path) -> Result<()> {
    let example_config = r#"# etcd-archiver configuration

[cluster]
# Prefix of every archived object: <name>/YYYY/MM/DD/<file>
name = "prod-k8s"

[lark]
app_id = "cli_xxxxxxxxxxxx"
app_secret = "your-app-secret"  # Optional: can also use LARK_APP_SECRET env var
# Chats (by display name) that receive the report, comma separated
groups = "ops-alerts,sre"
# api_base = "https://open.feishu.cn/open-apis"
# timeout_secs = 5
# console_url = "https://console.ucloud.cn/ufile/ufile/detail?id={bucket}&tab=overview"

[storage]
# Any S3-compatible endpoint; https:// is assumed when no scheme is given
endpoint = "s3-cn-bj.ufileos.com"
region = "us-east-1"
bucket = "etcd-backups"
access_key = "your-access-key"  # Optional: AWS_ACCESS_KEY_ID
secret_key = "your-secret-key"  # Optional: AWS_SECRET_ACCESS_KEY
storage_class = "DEEP_ARCHIVE"
# force_path_style = false
# part_size_mb = 16
# upload_concurrency = 4

[snapshot]
etcdctl = "./etcdctl"
cacert = "./certs/ca.pem"
cert = "./certs/cert.pem"
key = "./certs/cert.key"
dump_dir = "./dumps"
timeout_secs = 180
success_marker = "Snapshot saved at"

[logging]
dir = "./logs"
file_name = "runtime.log"
max_bytes = 20971520
max_files = 10
level = "info"

# Processed in the order listed
[[endpoints]]
name = "etcd-1"
address = "https://10.0.0.11:2379"

[[endpoints]]
name = "etcd-2"
address = "https://10.0.0.12:2379"

[[endpoints]]
name = "etcd-3"
address = "https://10.0.0.13:2379"
"#;

    fs::write(output_path, example_config)
        .with_context(|| format!("Failed to write config file: {}", output_path.display()))?;
    Ok(())
}
