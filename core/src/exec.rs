//! Invocation supervisor: runs one provider CLI against a task, streams and
//! size-caps its output, enforces an activity-based watchdog, and writes the
//! invocation record.
//!
//! The watchdog is not a wall-clock deadline: every observed stdout/stderr
//! byte re-arms it, so long silent periods are what kill a child, not long
//! legitimate computations.

use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::error::SteroidsErr;
use crate::providers::Classification;
use crate::providers::ProviderKind;
use steroids_state::InvocationCloseParams;
use steroids_state::InvocationCreateParams;
use steroids_state::InvocationRole;
use steroids_state::InvocationStatus;
use steroids_state::OUTPUT_CAPTURE_LIMIT_BYTES;
use steroids_state::ProjectStore;

/// Grace between the polite terminate and the forceful kill, and again
/// between the kill and declaring forced resolution.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// last_activity_at_ms writes are throttled to this cadence.
const ACTIVITY_STAMP_INTERVAL: Duration = Duration::from_secs(1);

const READ_CHUNK_BYTES: usize = 8192;

pub type ActivityCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub task_id: String,
    pub role: InvocationRole,
    pub provider: ProviderKind,
    pub model: String,
    pub prompt: String,
    pub cwd: PathBuf,
    pub idle_timeout: Duration,
    /// Operator-supplied invocation template; `{model}` and `{prompt}`
    /// expand. Only templates that deliberately use shell syntax run under a
    /// shell.
    pub custom_template: Option<String>,
    pub stream_to_parent_stdio: bool,
    pub rejection_number: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub invocation_id: i64,
    pub success: bool,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: i64,
    pub timed_out: bool,
    pub classification: Classification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamSource {
    Stdout,
    Stderr,
}

impl StreamSource {
    const fn as_str(self) -> &'static str {
        match self {
            StreamSource::Stdout => "stdout",
            StreamSource::Stderr => "stderr",
        }
    }
}

pub struct InvocationSupervisor {
    store: ProjectStore,
    kill_grace: Duration,
}

impl InvocationSupervisor {
    pub fn new(store: ProjectStore) -> Self {
        Self {
            store,
            kill_grace: KILL_GRACE,
        }
    }

    /// Shorter grace for tests that exercise the kill escalation.
    pub fn with_kill_grace(store: ProjectStore, kill_grace: Duration) -> Self {
        Self { store, kill_grace }
    }

    /// Run one child process to completion (or forced resolution) and record
    /// it. Returns `CancellationRequested` after the invocation row is
    /// closed when the token fires mid-run.
    pub async fn invoke(
        &self,
        request: &InvocationRequest,
        cancel: &CancellationToken,
        on_activity: Option<ActivityCallback>,
    ) -> Result<InvocationOutcome, SteroidsErr> {
        let tmp_dir = self.store.paths().tmp_dir();
        tokio::fs::create_dir_all(&tmp_dir)
            .await
            .map_err(anyhow::Error::from)?;
        let prompt_path = tmp_dir.join(format!("prompt-{}.md", uuid::Uuid::new_v4()));
        tokio::fs::write(&prompt_path, &request.prompt)
            .await
            .map_err(anyhow::Error::from)?;

        let started_at_ms = chrono::Utc::now().timestamp_millis();
        let invocation_id = self
            .store
            .open_invocation(&InvocationCreateParams {
                task_id: request.task_id.clone(),
                role: request.role,
                provider: request.provider.as_str().to_string(),
                model: request.model.clone(),
                prompt: request.prompt.clone(),
                started_at_ms,
                rejection_number: request.rejection_number,
            })
            .await?;

        let mut transcript =
            Transcript::open(&self.store.paths().invocation_log_path(invocation_id)).await?;
        transcript
            .write_event("spawn", &format!("{} {}", request.provider.as_str(), request.model))
            .await;

        let outcome = self
            .run_child(request, &prompt_path, invocation_id, cancel, on_activity, &mut transcript)
            .await;

        if let Err(err) = tokio::fs::remove_file(&prompt_path).await {
            debug!("failed to remove prompt file: {err}");
        }

        let (close, result) = match outcome {
            Ok(run) => {
                let status = if run.cancelled {
                    InvocationStatus::Failed
                } else if run.timed_out {
                    InvocationStatus::Timeout
                } else if run.exit_code == 0 {
                    InvocationStatus::Completed
                } else {
                    InvocationStatus::Failed
                };
                let classification = request.provider.classify(run.exit_code, &run.stderr);
                let completed_at_ms = chrono::Utc::now().timestamp_millis();
                let close = InvocationCloseParams {
                    status,
                    exit_code: run.exit_code,
                    response: Some(run.stdout.clone()),
                    error: (!run.stderr.is_empty()).then(|| run.stderr.clone()),
                    completed_at_ms,
                    success: status == InvocationStatus::Completed,
                    timed_out: run.timed_out,
                };
                let outcome = InvocationOutcome {
                    invocation_id,
                    success: close.success,
                    exit_code: run.exit_code,
                    stdout: run.stdout,
                    stderr: run.stderr,
                    duration_ms: completed_at_ms - started_at_ms,
                    timed_out: run.timed_out,
                    classification,
                };
                let result = if run.cancelled {
                    Err(SteroidsErr::CancellationRequested)
                } else {
                    Ok(outcome)
                };
                (close, result)
            }
            Err(err) => {
                let completed_at_ms = chrono::Utc::now().timestamp_millis();
                let close = InvocationCloseParams {
                    status: InvocationStatus::Failed,
                    exit_code: -1,
                    response: None,
                    error: Some(err.to_string()),
                    completed_at_ms,
                    success: false,
                    timed_out: false,
                };
                (close, Err(err))
            }
        };

        transcript
            .write_event("exit", &format!("code={} status={}", close.exit_code, close.status.as_str()))
            .await;
        self.store.close_invocation(invocation_id, &close).await?;
        result
    }

    async fn run_child(
        &self,
        request: &InvocationRequest,
        prompt_path: &Path,
        invocation_id: i64,
        cancel: &CancellationToken,
        on_activity: Option<ActivityCallback>,
        transcript: &mut Transcript,
    ) -> Result<ChildRun, SteroidsErr> {
        let mut command = build_command(request, prompt_path)?;
        command
            .current_dir(&request.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                SteroidsErr::ProviderUnavailable {
                    cli: request.provider.cli_binary().to_string(),
                }
            } else {
                SteroidsErr::Other(anyhow::anyhow!("failed to spawn provider: {err}"))
            }
        })?;

        let (tx, mut rx) = mpsc::channel::<(StreamSource, Vec<u8>)>(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_stream(stdout, StreamSource::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_stream(stderr, StreamSource::Stderr, tx.clone()));
        }
        drop(tx);

        let stream_json =
            request.provider.speaks_stream_json() && request.custom_template.is_none();
        let mut stdout_buf = String::new();
        let mut stderr_buf = String::new();
        let mut json_state = StreamJsonState::default();
        let mut last_activity = tokio::time::Instant::now();
        let mut last_db_stamp: Option<tokio::time::Instant> = None;
        let mut timed_out = false;
        let mut cancelled = false;

        loop {
            let deadline = last_activity + request.idle_timeout;
            tokio::select! {
                chunk = rx.recv() => {
                    let Some((source, bytes)) = chunk else {
                        // Both pipes closed: the child is exiting.
                        break;
                    };
                    last_activity = tokio::time::Instant::now();
                    if last_db_stamp.is_none_or(|at| at.elapsed() >= ACTIVITY_STAMP_INTERVAL) {
                        last_db_stamp = Some(last_activity);
                        let now_ms = chrono::Utc::now().timestamp_millis();
                        if let Err(err) = self
                            .store
                            .record_invocation_activity(invocation_id, now_ms)
                            .await
                        {
                            warn!("failed to stamp invocation activity: {err}");
                        }
                    }
                    if let Some(on_activity) = on_activity.as_ref() {
                        on_activity();
                    }
                    if request.stream_to_parent_stdio {
                        forward_to_parent(source, &bytes).await;
                    }
                    let text = String::from_utf8_lossy(&bytes);
                    transcript.write_event(source.as_str(), &text).await;
                    match source {
                        StreamSource::Stdout if stream_json => {
                            json_state.push(&text, &mut stdout_buf);
                        }
                        StreamSource::Stdout => {
                            append_capped(&mut stdout_buf, &text, OUTPUT_CAPTURE_LIMIT_BYTES);
                        }
                        StreamSource::Stderr => {
                            append_capped(&mut stderr_buf, &text, OUTPUT_CAPTURE_LIMIT_BYTES);
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        invocation_id,
                        idle_secs = request.idle_timeout.as_secs(),
                        "no output activity; terminating child"
                    );
                    timed_out = true;
                    terminate_child(&mut child, self.kill_grace).await;
                    break;
                }
                _ = cancel.cancelled() => {
                    cancelled = true;
                    terminate_child(&mut child, self.kill_grace).await;
                    break;
                }
            }
        }

        let exit_code = if timed_out || cancelled {
            match tokio::time::timeout(self.kill_grace, child.wait()).await {
                Ok(Ok(status)) => status.code().map(i64::from).unwrap_or(-1),
                _ => -1,
            }
        } else {
            match child.wait().await {
                Ok(status) => status.code().map(i64::from).unwrap_or(-1),
                Err(err) => {
                    warn!("failed to reap child: {err}");
                    -1
                }
            }
        };

        // Drain whatever arrived between the last poll and pipe close.
        while let Ok((source, bytes)) = rx.try_recv() {
            let text = String::from_utf8_lossy(&bytes);
            transcript.write_event(source.as_str(), &text).await;
            match source {
                StreamSource::Stdout if stream_json => json_state.push(&text, &mut stdout_buf),
                StreamSource::Stdout => {
                    append_capped(&mut stdout_buf, &text, OUTPUT_CAPTURE_LIMIT_BYTES);
                }
                StreamSource::Stderr => {
                    append_capped(&mut stderr_buf, &text, OUTPUT_CAPTURE_LIMIT_BYTES);
                }
            }
        }
        json_state.flush(&mut stdout_buf);

        let stdout = json_state.final_result.unwrap_or(stdout_buf);
        Ok(ChildRun {
            exit_code,
            stdout,
            stderr: stderr_buf,
            timed_out,
            cancelled,
        })
    }
}

struct ChildRun {
    exit_code: i64,
    stdout: String,
    stderr: String,
    timed_out: bool,
    cancelled: bool,
}

fn build_command(
    request: &InvocationRequest,
    prompt_path: &Path,
) -> Result<Command, SteroidsErr> {
    let Some(template) = request.custom_template.as_deref() else {
        let mut command = Command::new(request.provider.cli_binary());
        command.args(request.provider.build_argv(&request.model, prompt_path));
        return Ok(command);
    };

    let rendered = template
        .replace("{model}", &request.model)
        .replace("{prompt}", &prompt_path.display().to_string());
    if template_uses_shell(template) {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(rendered);
        return Ok(command);
    }
    let parts = shlex::split(&rendered)
        .ok_or_else(|| anyhow::anyhow!("unparseable invocation template: {template}"))?;
    let Some((program, args)) = parts.split_first() else {
        return Err(anyhow::anyhow!("empty invocation template").into());
    };
    let mut command = Command::new(program);
    command.args(args);
    Ok(command)
}

/// A template only runs under a shell when it deliberately uses shell
/// syntax; plain argv templates stay shell-free so prompt contents can never
/// trigger command substitution.
fn template_uses_shell(template: &str) -> bool {
    ["$(", "`", "|", "&&", "||", ">", "<", ";"]
        .iter()
        .any(|token| template.contains(token))
}

async fn pump_stream(
    mut reader: impl tokio::io::AsyncRead + Unpin,
    source: StreamSource,
    tx: mpsc::Sender<(StreamSource, Vec<u8>)>,
) {
    let mut buf = [0u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send((source, buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Polite terminate, grace, forceful kill, grace.
async fn terminate_child(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        // SAFETY: signalling our own child by pid.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return;
    }
    if let Err(err) = child.start_kill() {
        warn!("failed to kill child: {err}");
    }
}

async fn forward_to_parent(source: StreamSource, bytes: &[u8]) {
    let result = match source {
        StreamSource::Stdout => tokio::io::stdout().write_all(bytes).await,
        StreamSource::Stderr => tokio::io::stderr().write_all(bytes).await,
    };
    if let Err(err) = result {
        debug!("failed to forward child output: {err}");
    }
}

/// Append up to the byte budget; the final byte that fits is stored, later
/// bytes are dropped (they still count as activity at the call site).
fn append_capped(buf: &mut String, text: &str, limit: usize) {
    let remaining = limit.saturating_sub(buf.len());
    if remaining == 0 {
        return;
    }
    if text.len() <= remaining {
        buf.push_str(text);
        return;
    }
    for ch in text.chars() {
        if buf.len() + ch.len_utf8() > limit {
            break;
        }
        buf.push(ch);
    }
}

/// Line-buffered parser for providers that emit
/// `{"type": "message" | "tool_call" | "result", ...}` events.
#[derive(Default)]
struct StreamJsonState {
    line_buffer: String,
    final_result: Option<String>,
}

impl StreamJsonState {
    fn push(&mut self, text: &str, stdout_buf: &mut String) {
        self.line_buffer.push_str(text);
        while let Some(newline) = self.line_buffer.find('\n') {
            let line: String = self.line_buffer.drain(..=newline).collect();
            self.handle_line(line.trim_end_matches('\n'), stdout_buf);
        }
    }

    /// Treat a trailing unterminated line as complete at stream end.
    fn flush(&mut self, stdout_buf: &mut String) {
        if self.line_buffer.is_empty() {
            return;
        }
        let line = std::mem::take(&mut self.line_buffer);
        self.handle_line(&line, stdout_buf);
    }

    fn handle_line(&mut self, line: &str, stdout_buf: &mut String) {
        if line.is_empty() {
            return;
        }
        let Ok(event) = serde_json::from_str::<Value>(line) else {
            // Malformed lines pass through as raw text.
            append_capped(stdout_buf, line, OUTPUT_CAPTURE_LIMIT_BYTES);
            append_capped(stdout_buf, "\n", OUTPUT_CAPTURE_LIMIT_BYTES);
            return;
        };
        match event.get("type").and_then(Value::as_str) {
            Some("message") => {
                if let Some(text) = event_text(&event) {
                    append_capped(stdout_buf, text, OUTPUT_CAPTURE_LIMIT_BYTES);
                    append_capped(stdout_buf, "\n", OUTPUT_CAPTURE_LIMIT_BYTES);
                }
            }
            Some("tool_call") => {
                // Surfaces as activity only; nothing is stored.
            }
            Some("result") => {
                self.final_result = event_text(&event).map(str::to_string);
            }
            _ => {
                append_capped(stdout_buf, line, OUTPUT_CAPTURE_LIMIT_BYTES);
                append_capped(stdout_buf, "\n", OUTPUT_CAPTURE_LIMIT_BYTES);
            }
        }
    }
}

fn event_text(event: &Value) -> Option<&str> {
    event
        .get("text")
        .or_else(|| event.get("content"))
        .and_then(Value::as_str)
}

/// One JSONL transcript per invocation under `.steroids/invocations/`.
struct Transcript {
    file: Option<tokio::fs::File>,
}

impl Transcript {
    async fn open(path: &Path) -> Result<Self, SteroidsErr> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(anyhow::Error::from)?;
        }
        let file = match tokio::fs::File::create(path).await {
            Ok(file) => Some(file),
            Err(err) => {
                warn!("failed to open invocation transcript {}: {err}", path.display());
                None
            }
        };
        Ok(Self { file })
    }

    async fn write_event(&mut self, event: &str, data: &str) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let line = serde_json::json!({
            "ts": chrono::Utc::now().timestamp_millis(),
            "event": event,
            "data": data,
        });
        let mut bytes = line.to_string().into_bytes();
        bytes.push(b'\n');
        if let Err(err) = file.write_all(&bytes).await {
            debug!("failed to append invocation transcript: {err}");
            self.file = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn capped_append_stores_the_final_fitting_byte() {
        let mut buf = String::new();
        append_capped(&mut buf, "abcdef", 4);
        assert_eq!(buf, "abcd");
        // Later bytes are dropped without error.
        append_capped(&mut buf, "ghi", 4);
        assert_eq!(buf, "abcd");
    }

    #[test]
    fn capped_append_respects_utf8_boundaries() {
        let mut buf = String::new();
        append_capped(&mut buf, "aé", 2);
        assert_eq!(buf, "a");
    }

    #[test]
    fn stream_json_routes_events() {
        let mut state = StreamJsonState::default();
        let mut stdout = String::new();
        state.push("{\"type\":\"message\",\"text\":\"hello\"}\n", &mut stdout);
        state.push("{\"type\":\"tool_call\",\"name\":\"edit\"}\n", &mut stdout);
        state.push("not json at all\n", &mut stdout);
        state.push("{\"type\":\"result\",\"content\":\"final answer\"}\n", &mut stdout);
        state.flush(&mut stdout);

        assert_eq!(stdout, "hello\nnot json at all\n");
        assert_eq!(state.final_result.as_deref(), Some("final answer"));
    }

    #[test]
    fn stream_json_reassembles_split_lines() {
        let mut state = StreamJsonState::default();
        let mut stdout = String::new();
        state.push("{\"type\":\"mess", &mut stdout);
        state.push("age\",\"text\":\"split\"}\n", &mut stdout);
        assert_eq!(stdout, "split\n");
    }

    #[test]
    fn shell_detection_only_fires_on_shell_syntax() {
        assert!(template_uses_shell("mytool {prompt} | tee out.log"));
        assert!(template_uses_shell("mytool $(cat {prompt})"));
        assert!(!template_uses_shell("mytool --model {model} {prompt}"));
    }
}
