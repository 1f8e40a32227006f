use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

/// Byte counter for one file upload that logs every tenth percent.
///
/// The storage client reports finished parts from several tasks at once, so
/// the counter and the last logged percentage live behind one lock and are
/// updated together.
#[derive(Debug)]
pub struct UploadProgress {
    path: PathBuf,
    total: u64,
    state: Mutex<ProgressState>,
}

#[derive(Debug, Default)]
struct ProgressState {
    seen: u64,
    logged_percent: u64,
}

impl UploadProgress {
    pub fn for_file(path: &Path) -> std::io::Result<Self> {
        let total = std::fs::metadata(path)?.len();
        Ok(Self::new(path, total))
    }

    pub fn new(path: &Path, total: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            total,
            state: Mutex::new(ProgressState::default()),
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn seen(&self) -> u64 {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).seen
    }

    /// Record `bytes` more bytes transferred. Returns the percentage when a
    /// progress line was written.
    pub fn update(&self, bytes: u64) -> Option<u64> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.seen = state.seen.saturating_add(bytes);

        let current = percent_complete(state.seen, self.total);
        if !should_log(state.logged_percent, current) {
            return None;
        }
        state.logged_percent = current;

        info!(
            "Uploading: {} [{:03}%] {:.2}/{:.2} MB",
            self.path.display(),
            current,
            state.seen as f64 / 1_048_576.0,
            self.total as f64 / 1_048_576.0
        );
        Some(current)
    }
}

/// Whole percent of `total` covered by `seen`. An empty file is complete.
pub fn percent_complete(seen: u64, total: u64) -> u64 {
    if total == 0 {
        return 100;
    }
    ((seen as u128 * 100) / total as u128) as u64
}

pub fn should_log(last_logged: u64, current: u64) -> bool {
    current != last_logged && current % 10 == 0
}
