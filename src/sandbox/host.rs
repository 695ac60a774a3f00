use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};

use super::{RunSpec, SandboxError, SandboxRunner};
use crate::protocol::ShimInput;

/// Hard ceiling on captured child stdout (the response channel).
const MAX_OUTPUT_BYTES: usize = 512 * 1024;
/// Stderr is diagnostics only; keep a tail.
const MAX_STDERR_BYTES: usize = 64 * 1024;
/// Window between the graceful signal and the forced kill.
const KILL_GRACE: Duration = Duration::from_millis(250);

/// One isolated child process per invocation.
///
/// The child is this same executable run with the hidden `sandbox-exec`
/// subcommand: environment cleared, cwd moved to a throwaway scratch
/// directory, bundle and payload streamed over stdin, response read from
/// stdout. No state survives the invocation.
pub struct ProcessSandboxHost {
    program: PathBuf,
    args: Vec<String>,
    scratch_root: PathBuf,
    max_output_bytes: usize,
}

impl ProcessSandboxHost {
    pub fn new(scratch_root: PathBuf) -> std::io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: vec!["sandbox-exec".into()],
            scratch_root,
            max_output_bytes: MAX_OUTPUT_BYTES,
        })
    }

    /// Run an arbitrary command instead of the built-in shim. Test seam.
    #[allow(dead_code)]
    pub fn with_command(program: PathBuf, args: Vec<String>, scratch_root: PathBuf) -> Self {
        Self {
            program,
            args,
            scratch_root,
            max_output_bytes: MAX_OUTPUT_BYTES,
        }
    }

    async fn run_in(&self, scratch: &PathBuf, spec: RunSpec) -> Result<Value, SandboxError> {
        let input = ShimInput {
            data_url: spec.data_url,
            payload: spec.payload,
            net: spec.net,
        };
        let input_json =
            serde_json::to_string(&input).map_err(|e| SandboxError::BadResponse(e.to_string()))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env_clear()
            .current_dir(scratch)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Spawn(e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(input_json.as_bytes()).await;
            drop(stdin);
        }

        let stdout_task = read_capped(child.stdout.take(), self.max_output_bytes);
        let stderr_task = read_capped(child.stderr.take(), MAX_STDERR_BYTES);

        let status = match tokio::time::timeout(spec.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(SandboxError::Io(e)),
            Err(_) => {
                terminate(child).await;
                return Err(SandboxError::Timeout);
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        if !stderr.is_empty() {
            tracing::debug!(stderr = %String::from_utf8_lossy(&stderr), "sandbox stderr");
        }

        if !status.success() {
            let tail = String::from_utf8_lossy(&stderr);
            return Err(SandboxError::Crash(format!(
                "exit={:?}: {}",
                status.code(),
                tail.trim()
            )));
        }

        parse_response(&stdout)
    }
}

#[async_trait]
impl SandboxRunner for ProcessSandboxHost {
    async fn run(&self, spec: RunSpec) -> Result<Value, SandboxError> {
        let scratch = self.scratch_root.join(uuid::Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&scratch).await?;

        let result = self.run_in(&scratch, spec).await;

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            tracing::warn!(path = %scratch.display(), error = %e, "failed to remove scratch dir");
        }
        result
    }
}

/// The response is the final non-empty stdout line.
fn parse_response(stdout: &[u8]) -> Result<Value, SandboxError> {
    let text = String::from_utf8_lossy(stdout);
    let line = text
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| SandboxError::Crash("no output".into()))?;
    serde_json::from_str(line.trim()).map_err(|e| SandboxError::BadResponse(e.to_string()))
}

fn read_capped(
    pipe: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
    max_bytes: usize,
) -> tokio::task::JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let Some(pipe) = pipe else { return buf };
        let mut reader = BufReader::new(pipe);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    if buf.len() + line.len() <= max_bytes {
                        buf.extend_from_slice(line.as_bytes());
                    }
                }
                Err(_) => break,
            }
        }
        buf
    })
}

/// SIGTERM first so the child can flush, then a forced kill.
async fn terminate(mut child: Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        tokio::time::sleep(KILL_GRACE).await;
    }
    let _ = child.kill().await;
}
