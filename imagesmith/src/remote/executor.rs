//! Supervises the external configuration program.

use super::ssh::{ChannelTarget, SshClient};
use super::{ProvisionerSpec, RemoteError};
use crate::cancellation::CancellationToken;
use crate::config::{ConnectionCredentials, Redactor};
use crate::core::{BuildEvent, BuildState, EventKind, OutputStream};
use crate::events::{EventSink, NoOpEventSink};
use crate::retry::{with_retry, RetryConfig, RetryError};
use crate::watcher::{ChannelProbe, ProbeOutcome};
use regex::Regex;
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Combined output kept for diagnostics.
pub const DEFAULT_OUTPUT_LIMIT: usize = 1024 * 1024;

static TARGET_PLACEHOLDER: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"\{\{\s*\.(Host|Port|User)\s*\}\}"));

/// Result of one provisioner run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRun {
    /// Exit code; `None` if killed by a signal.
    pub exit_code: Option<i32>,
    /// Tail of the combined, redacted output.
    pub output: String,
    /// Whether earlier output was dropped from `output`.
    pub truncated: bool,
    /// Wall time of the run.
    pub duration: Duration,
}

impl RemoteRun {
    /// Returns true for exit code 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs a [`ProvisionerSpec`] against a reachable guest.
pub struct RemoteExecutor {
    probe: Arc<dyn ChannelProbe>,
    retry: RetryConfig,
    redactor: Redactor,
    sink: Arc<dyn EventSink>,
    build_id: Uuid,
    guest: String,
    output_limit: usize,
}

impl std::fmt::Debug for RemoteExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteExecutor")
            .field("retry", &self.retry)
            .field("build_id", &self.build_id)
            .field("guest", &self.guest)
            .field("output_limit", &self.output_limit)
            .finish_non_exhaustive()
    }
}

impl RemoteExecutor {
    /// Creates an executor that confirms the channel through `probe`.
    #[must_use]
    pub fn new(probe: Arc<dyn ChannelProbe>, retry: RetryConfig, redactor: Redactor) -> Self {
        Self {
            probe,
            retry,
            redactor,
            sink: Arc::new(NoOpEventSink),
            build_id: Uuid::nil(),
            guest: String::new(),
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    /// Streams output lines to `sink`, tagged with the build and guest.
    #[must_use]
    pub fn with_events(mut self, sink: Arc<dyn EventSink>, build_id: Uuid, guest: impl Into<String>) -> Self {
        self.sink = sink;
        self.build_id = build_id;
        self.guest = guest.into();
        self
    }

    /// Caps the retained output.
    #[must_use]
    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit = bytes.max(1);
        self
    }

    /// Confirms the channel, then runs the program to completion.
    ///
    /// A non-zero exit is a successful call; the caller decides what it means.
    pub async fn run(
        &self,
        target: &ChannelTarget,
        credentials: &ConnectionCredentials,
        spec: &ProvisionerSpec,
        cancel: &CancellationToken,
    ) -> Result<RemoteRun, RemoteError> {
        self.confirm_channel(target, credentials, cancel).await?;

        let args: Vec<String> = spec
            .args
            .iter()
            .map(|a| substitute_target(a, target, credentials))
            .collect();
        info!(
            program = %spec.command,
            args = %self.redactor.redact(&args.join(" ")),
            target = %target,
            "Starting remote provisioner"
        );

        let mut cmd = Command::new(&spec.command);
        cmd.args(&args)
            .envs(&spec.env)
            .envs(connection_env(target, credentials))
            .env("IMAGESMITH_BUILD_ID", self.build_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = spec.working_dir {
            cmd.current_dir(dir);
        }

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| RemoteError::Spawn {
            program: spec.command.clone(),
            reason: e.to_string(),
        })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_lines(stdout, OutputStream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_lines(stderr, OutputStream::Stderr, tx.clone()));
        }
        drop(tx);

        let deadline = spec.timeout.map(|t| started + t);
        let mut tail = OutputTail::new(self.output_limit);

        let status = loop {
            tokio::select! {
                Some((stream, line)) = rx.recv() => self.record(&mut tail, stream, &line).await,
                status = child.wait() => break status,
                () = cancel.cancelled() => {
                    warn!(program = %spec.command, "Cancelling remote provisioner");
                    let _ = child.kill().await;
                    return Err(RemoteError::Cancelled);
                }
                () = tokio::time::sleep_until(deadline.unwrap_or(started)), if deadline.is_some() => {
                    warn!(program = %spec.command, "Remote provisioner timed out");
                    let _ = child.kill().await;
                    while let Ok((stream, line)) = rx.try_recv() {
                        self.record(&mut tail, stream, &line).await;
                    }
                    return Err(RemoteError::TimedOut {
                        program: spec.command.clone(),
                        after: spec.timeout.unwrap_or_default(),
                        output: tail.into_text(),
                    });
                }
            }
        };

        // The readers finish at EOF; drain what they still hold.
        while let Some((stream, line)) = rx.recv().await {
            self.record(&mut tail, stream, &line).await;
        }

        let status = status.map_err(|e| RemoteError::Spawn {
            program: spec.command.clone(),
            reason: e.to_string(),
        })?;
        let run = RemoteRun {
            exit_code: status.code(),
            truncated: tail.truncated,
            output: tail.into_text(),
            duration: started.elapsed(),
        };
        info!(
            program = %spec.command,
            exit_code = ?run.exit_code,
            duration_s = run.duration.as_secs(),
            "Remote provisioner finished"
        );
        Ok(run)
    }

    /// Waits for a session with backoff. Rejected credentials are not retried.
    async fn confirm_channel(
        &self,
        target: &ChannelTarget,
        credentials: &ConnectionCredentials,
        cancel: &CancellationToken,
    ) -> Result<(), RemoteError> {
        let attempt = move || async move {
            match self.probe.probe(target, credentials).await? {
                ProbeOutcome::Reachable => Ok(()),
                ProbeOutcome::AuthRejected(reason) => Err(RemoteError::AuthRejected {
                    target: credentials.target(&target.host, target.port),
                    reason,
                }),
                ProbeOutcome::Unreachable(reason) | ProbeOutcome::Listening(reason) => {
                    Err(RemoteError::Unreachable {
                        target: target.to_string(),
                        reason,
                    })
                }
            }
        };

        with_retry(&self.retry, "remote.channel", cancel, RemoteError::is_unreachable, attempt)
            .await
            .map_err(|e| match e {
                RetryError::Failed(err) => err,
                RetryError::Cancelled => RemoteError::Cancelled,
            })
    }

    async fn record(&self, tail: &mut OutputTail, stream: OutputStream, line: &str) {
        let line = self.redactor.redact(line);
        tail.push(&line);
        let event = BuildEvent::new(
            self.build_id,
            self.guest.clone(),
            BuildState::RemoteProvisioning,
            EventKind::Output { stream, line },
        );
        self.sink.emit(&event).await;
    }
}

/// Forwards output line by line until EOF.
///
/// Bytes that are not UTF-8 are replaced, never fatal: the pipe must stay
/// drained or the program blocks or dies on its next write.
async fn read_lines<R>(reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<(OutputStream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut forwarding = true;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if !forwarding {
                    continue;
                }
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                }
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                forwarding = tx.send((stream, line)).is_ok();
            }
            Err(e) => {
                let _ = tx.send((stream, format!("[unreadable output: {e}]")));
                break;
            }
        }
    }
}

/// Substitutes `{{ .Host }}`, `{{ .Port }}` and `{{ .User }}`.
fn substitute_target(arg: &str, target: &ChannelTarget, credentials: &ConnectionCredentials) -> String {
    let Ok(re) = TARGET_PLACEHOLDER.as_ref() else {
        return arg.to_string();
    };
    re.replace_all(arg, |caps: &regex::Captures<'_>| match &caps[1] {
        "Host" => target.host.clone(),
        "Port" => target.port.to_string(),
        _ => credentials.username.clone(),
    })
    .into_owned()
}

/// Connection details handed to the program through its environment.
fn connection_env(target: &ChannelTarget, credentials: &ConnectionCredentials) -> Vec<(String, String)> {
    let mut env = vec![
        ("IMAGESMITH_SSH_HOST".to_string(), target.host.clone()),
        ("IMAGESMITH_SSH_PORT".to_string(), target.port.to_string()),
        ("IMAGESMITH_SSH_USER".to_string(), credentials.username.clone()),
        ("IMAGESMITH_SSH_OPTIONS".to_string(), SshClient::options_string()),
    ];
    if let Some(ref password) = credentials.password {
        env.push(("IMAGESMITH_SSH_PASSWORD".to_string(), password.expose().to_string()));
    }
    if let Some(ref key) = credentials.private_key_file {
        env.push((
            "IMAGESMITH_SSH_PRIVATE_KEY_FILE".to_string(),
            key.display().to_string(),
        ));
    }
    env
}

/// The last `limit` bytes of output, cut at a character boundary.
#[derive(Debug)]
struct OutputTail {
    text: String,
    limit: usize,
    truncated: bool,
}

impl OutputTail {
    fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, line: &str) {
        self.text.push_str(line);
        self.text.push('\n');
        if self.text.len() > self.limit {
            let mut cut = self.text.len() - self.limit;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
            self.truncated = true;
        }
    }

    fn into_text(self) -> String {
        self.text
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::retry::JitterStrategy;
    use crate::testing::ScriptedProbe;

    fn target() -> ChannelTarget {
        ChannelTarget::new("10.0.0.7", 2222)
    }

    fn creds() -> ConnectionCredentials {
        ConnectionCredentials::password("root", "Sup3rS3cret")
    }

    fn executor(probe: ScriptedProbe) -> RemoteExecutor {
        let retry = RetryConfig::new()
            .with_max_attempts(3)
            .with_base_delay_ms(10)
            .with_jitter(JitterStrategy::None);
        RemoteExecutor::new(Arc::new(probe), retry, Redactor::new(["Sup3rS3cret"]))
    }

    fn sh(script: &str) -> ProvisionerSpec {
        ProvisionerSpec::new("sh", ["-c", script])
    }

    #[tokio::test]
    async fn test_streams_and_redacts_output() {
        let sink = Arc::new(CollectingEventSink::new());
        let exec = executor(ScriptedProbe::reachable())
            .with_events(sink.clone(), Uuid::nil(), "rhel9");

        let run = exec
            .run(
                &target(),
                &creds(),
                &sh("echo host=$IMAGESMITH_SSH_HOST; echo pw=$IMAGESMITH_SSH_PASSWORD >&2"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(run.success());
        assert!(run.output.contains("host=10.0.0.7"));
        assert!(run.output.contains("pw=<sensitive>"));
        assert!(!run.output.contains("Sup3rS3cret"));

        let lines: Vec<String> = sink.events().iter().map(BuildEvent::text).collect();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| !l.contains("Sup3rS3cret")));
    }

    #[tokio::test]
    async fn test_nonzero_exit_keeps_output() {
        let run = executor(ScriptedProbe::reachable())
            .run(
                &target(),
                &creds(),
                &sh("echo 'TASK [cis : 5.2.1] failed'; exit 2"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(run.exit_code, Some(2));
        assert!(run.output.contains("5.2.1"));
    }

    #[tokio::test]
    async fn test_args_substituted() {
        let run = executor(ScriptedProbe::reachable())
            .run(
                &target(),
                &creds(),
                &ProvisionerSpec::new("echo", ["{{ .User }}@{{.Host}}:{{ .Port }}"]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(run.output, "root@10.0.0.7:2222\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_program() {
        let err = executor(ScriptedProbe::reachable())
            .run(
                &target(),
                &creds(),
                &sh("echo started; sleep 30").with_timeout(Duration::from_millis(300)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_kills_program() {
        let cancel = Arc::new(CancellationToken::new());
        let trigger = Arc::clone(&cancel);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel("SIGTERM");
        });

        let started = std::time::Instant::now();
        let err = executor(ScriptedProbe::reachable())
            .run(&target(), &creds(), &sh("sleep 30"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_auth_rejected_not_retried() {
        let probe = ScriptedProbe::new(ProbeOutcome::AuthRejected("Permission denied".into()));
        let exec = executor(probe.clone());
        let err = exec
            .run(&target(), &creds(), &sh("true"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::AuthRejected { .. }));
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test]
    async fn test_channel_retried_until_up() {
        let probe = ScriptedProbe::reachable()
            .then(ProbeOutcome::Unreachable("Connection refused".into()))
            .then(ProbeOutcome::Unreachable("Connection refused".into()));
        let exec = executor(probe.clone());
        let run = exec
            .run(&target(), &creds(), &sh("true"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(run.success());
        assert_eq!(probe.calls(), 3);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let err = executor(ScriptedProbe::reachable())
            .run(
                &target(),
                &creds(),
                &ProvisionerSpec::new("/nonexistent/ansible-playbook", Vec::<String>::new()),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_stop_the_program() {
        let sink = Arc::new(CollectingEventSink::new());
        let exec = executor(ScriptedProbe::reachable())
            .with_events(sink.clone(), Uuid::nil(), "rhel9");
        let script = r#"printf 'changed: \377\n'
i=0
while [ $i -lt 3000 ]; do
  echo "ok: [rhel9] => (item=/etc/security/limits.d/$i.conf)"
  i=$((i+1))
done
echo done
exit 0"#;

        let run = exec
            .run(&target(), &creds(), &sh(script), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.exit_code, Some(0));
        assert!(run.output.starts_with("changed: \u{FFFD}\n"));
        assert!(run.output.ends_with("done\n"));
        assert!(run.output.len() > 64 * 1024);
        assert_eq!(sink.events().len(), 3002);
    }

    #[test]
    fn test_output_tail_keeps_end() {
        let mut tail = OutputTail::new(8);
        tail.push("abcdef");
        tail.push("ghij");
        assert!(tail.truncated);
        assert_eq!(tail.into_text(), "ef\nghij\n");
    }
}
