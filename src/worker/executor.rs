use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::CronError;
use crate::scheduler::{ExecutionRecord, ExecutionResult};
use crate::store::SharedStore;
use crate::worker::lock::JobLock;

/// How long to wait for output pipes to drain after the child exits. A
/// grandchild that escaped the process group can hold them open forever.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Runs dispatched executions: takes the job's distributed lock, runs the
/// command through the shell, and reports the outcome.
#[derive(Clone)]
pub struct JobExecutor {
    store: SharedStore,
    lock_ttl_secs: i64,
    shell: String,
}

impl JobExecutor {
    pub fn new(store: SharedStore, lock_ttl_secs: i64) -> Self {
        Self {
            store,
            lock_ttl_secs,
            shell: "/bin/sh".to_string(),
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Run `record` on its own task and post the result to `result_tx`.
    pub fn spawn(
        &self,
        record: ExecutionRecord,
        result_tx: mpsc::Sender<ExecutionResult>,
    ) -> JoinHandle<()> {
        let executor = self.clone();
        tokio::spawn(async move {
            let result = executor.execute(record).await;
            if result_tx.send(result).await.is_err() {
                tracing::debug!("Scheduler gone, dropping execution result");
            }
        })
    }

    /// Execute one dispatch end to end. Never fails: every outcome, lock
    /// contention included, is carried in the returned result.
    pub async fn execute(&self, record: ExecutionRecord) -> ExecutionResult {
        let lock = JobLock::new(self.store.clone(), &record.job.name, self.lock_ttl_secs);

        let start_time = Utc::now();
        let guard = match lock.try_lock().await {
            Ok(guard) => guard,
            Err(e) => {
                if !e.is_lock_contention() {
                    tracing::warn!(job = %record.job.name, error = %e, "Could not take execution lock, skipping run");
                }
                return ExecutionResult {
                    record,
                    output: Vec::new(),
                    error: Some(e),
                    start_time,
                    end_time: Utc::now(),
                };
            }
        };

        let start_time = Utc::now();
        tracing::info!(
            job = %record.job.name,
            execution_id = %record.id,
            command = %record.job.command,
            "Executing job"
        );

        let (output, error) =
            match run_command(&self.shell, &record.job.command, &record.cancel).await {
                Ok(output) => (output, None),
                Err((output, CronError::Cancelled)) if record.interrupt.is_cancelled() => {
                    (output, Some(CronError::Interrupted))
                }
                Err((output, e)) => (output, Some(e)),
            };
        let end_time = Utc::now();

        guard.release().await;

        ExecutionResult {
            record,
            output,
            error,
            start_time,
            end_time,
        }
    }
}

/// Run `<shell> -c <command>` in a fresh process group.
///
/// Returns stdout followed by stderr. On failure the output captured so far
/// is returned alongside the error. Cancelling `cancel` kills the whole
/// process group.
pub async fn run_command(
    shell: &str,
    command: &str,
    cancel: &CancellationToken,
) -> std::result::Result<Vec<u8>, (Vec<u8>, CronError)> {
    let mut cmd = Command::new(shell);
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|e| {
        (
            Vec::new(),
            CronError::CommandFailed(format!("failed to spawn {}: {}", shell, e)),
        )
    })?;

    let stdout = tokio::spawn(read_all(child.stdout.take()));
    let stderr = tokio::spawn(read_all(child.stderr.take()));

    let status = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => None,
    };

    let outcome = match status {
        Some(Ok(status)) if status.success() => Ok(()),
        Some(Ok(status)) => Err(CronError::CommandFailed(status.to_string())),
        Some(Err(e)) => Err(CronError::Io(e)),
        None => {
            kill_process_group(&mut child);
            let _ = child.wait().await;
            Err(CronError::Cancelled)
        }
    };

    let mut output = collect(stdout).await;
    output.extend(collect(stderr).await);

    match outcome {
        Ok(()) => Ok(output),
        Err(e) => Err((output, e)),
    }
}

fn kill_process_group(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // The child leads its own group, so its pid is the group id.
        // SAFETY: killpg has no memory-safety preconditions.
        let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if rc != 0 {
            tracing::debug!(pid, error = %std::io::Error::last_os_error(), "killpg failed");
        }
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "Child already exited");
    }
}

async fn read_all<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            tracing::debug!(error = %e, "Error reading command output");
        }
    }
    buf
}

async fn collect(reader: JoinHandle<Vec<u8>>) -> Vec<u8> {
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "Output reader task failed");
            Vec::new()
        }
        Err(_) => {
            tracing::debug!("Timed out draining command output");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run_shell(shell: &str, command: &str) -> Result<Vec<u8>, CronError> {
        run_command(shell, command, &CancellationToken::new())
            .await
            .map_err(|(_, e)| e)
    }

    #[tokio::test]
    async fn captures_stdout_then_stderr() {
        let output = run_shell("/bin/sh", "echo out; echo err 1>&2").await.unwrap();
        assert_eq!(String::from_utf8_lossy(&output), "out\nerr\n");
    }

    #[tokio::test]
    async fn nonzero_exit_keeps_output() {
        let err = run_command("/bin/sh", "echo partial; exit 3", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(String::from_utf8_lossy(&err.0), "partial\n");
        assert!(matches!(err.1, CronError::CommandFailed(_)));
    }

    #[tokio::test]
    async fn cancellation_kills_process_group() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        // The subshell keeps a grandchild alive holding the pipes open.
        let err = run_command("/bin/sh", "sleep 600 & sleep 600", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err.1, CronError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_shell_is_command_failure() {
        let err = run_shell("/nonexistent/shell", "true").await.unwrap_err();
        assert!(matches!(err, CronError::CommandFailed(_)));
    }
}
