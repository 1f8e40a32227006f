use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{error, info};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

/// A program invocation with explicit argv and environment; no shell involved.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.envs {
            write!(f, "{}={} ", key.to_string_lossy(), value.to_string_lossy())?;
        }
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Succeeded { stdout: String, stderr: String },
    Failed {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    TimedOut { after: Duration },
    SpawnFailed { reason: String },
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Succeeded { .. })
    }

    /// Captured standard output; empty for timeouts and spawn failures.
    pub fn stdout(&self) -> &str {
        match self {
            CommandOutcome::Succeeded { stdout, .. } | CommandOutcome::Failed { stdout, .. } => {
                stdout
            }
            CommandOutcome::TimedOut { .. } | CommandOutcome::SpawnFailed { .. } => "",
        }
    }
}

/// Run `spec`, killing it if it is still running after `timeout`.
///
/// Never returns an error: every way the command can go wrong is folded into
/// the outcome and logged.
pub async fn run_command(spec: &CommandSpec, timeout: Duration) -> CommandOutcome {
    info!(
        "[COMMAND] RUN CMD: [{}], CWD: [{:?}], TIMEOUT: [{}s]",
        spec,
        spec.cwd,
        timeout.as_secs()
    );

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(spec.envs.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(ref cwd) = spec.cwd {
        command.current_dir(cwd);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!("[COMMAND] EXCEPTION:[{}]: {:?}", spec, e);
            return CommandOutcome::SpawnFailed {
                reason: e.to_string(),
            };
        }
    };

    let stdout_task = tokio::spawn(read_to_string(child.stdout.take()));
    let stderr_task = tokio::spawn(read_to_string(child.stderr.take()));
    let readers = [stdout_task.abort_handle(), stderr_task.abort_handle()];

    // The deadline covers draining both pipes as well: a background process
    // can keep them open after the child itself has exited.
    let finished = tokio::time::timeout(timeout, async {
        let status = child.wait().await?;
        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        Ok::<_, std::io::Error>((status, stdout, stderr))
    })
    .await;

    let (status, stdout, stderr) = match finished {
        Ok(Ok(collected)) => collected,
        Ok(Err(e)) => {
            error!("[COMMAND] EXCEPTION:[{}]: {:?}", spec, e);
            readers.iter().for_each(|reader| reader.abort());
            let _ = child.kill().await;
            return CommandOutcome::SpawnFailed {
                reason: e.to_string(),
            };
        }
        Err(_) => {
            if !matches!(child.try_wait(), Ok(Some(_))) {
                if let Err(e) = child.kill().await {
                    error!("[COMMAND] failed to kill timed out process: {}", e);
                }
            }
            readers.iter().for_each(|reader| reader.abort());
            error!("[COMMAND] EXEC TIMEOUT: [{}]", spec);
            return CommandOutcome::TimedOut { after: timeout };
        }
    };

    if status.success() {
        info!("[COMMAND] SUCCESS:[{}], CODE:[{:?}]", spec, status.code());
        if !stdout.is_empty() {
            info!("[COMMAND] STDOUT: {}", stdout);
        }
        CommandOutcome::Succeeded { stdout, stderr }
    } else {
        error!(
            "[COMMAND] FAILED:[{}], CODE:[{:?}],\nSTDOUT:[\n{}\n]\nSTDERR:[\n{}\n]",
            spec,
            status.code(),
            stdout,
            stderr
        );
        CommandOutcome::Failed {
            code: status.code(),
            stdout,
            stderr,
        }
    }
}

async fn read_to_string<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}
