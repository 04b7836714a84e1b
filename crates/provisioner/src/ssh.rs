//! The Remote Execution Helper: local and SSH command execution.
//!
//! Pool instances are ephemeral and get reinstalled constantly, so host key
//! verification is disabled and authentication is key-based only. Every
//! remote call carries an explicit timeout; a timed-out command counts as a
//! failed attempt and is consumed by the retry budget in [`SshOptions`].

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Captured output of a finished command.
#[derive(Clone, Debug, Default)]
pub struct Output {
    /// Everything the command wrote to stdout.
    pub stdout: String,
    /// Everything the command wrote to stderr.
    pub stderr: String,
}

impl Output {
    /// stdout with surrounding whitespace removed, for single-line answers
    /// like join tokens.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// Per-call options for SSH execution.
#[derive(Clone, Debug)]
pub struct SshOptions {
    /// Budget for a single attempt, including connection setup.
    pub timeout: Duration,
    /// Total attempts before the call fails.
    pub retries: u32,
    /// Payload piped to the remote command's stdin, used to write file
    /// contents without a separate copy step.
    pub stdin: Option<String>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            retries: 3,
            stdin: None,
        }
    }
}

impl SshOptions {
    /// Options with a custom single-attempt timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    /// Options that pipe `payload` into the remote command.
    pub fn with_stdin(payload: String) -> Self {
        Self {
            stdin: Some(payload),
            ..Self::default()
        }
    }
}

/// Runs commands locally and on remote hosts.
///
/// **Note**: defined with [async-trait](https://crates.io/crates/async-trait);
/// implementations write plain `async fn`s under `#[async_trait]`.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs a command on the local machine through the shell.
    async fn exec(&self, command: &str) -> anyhow::Result<Output>;

    /// Runs a command on `host` over SSH.
    async fn ssh(&self, host: IpAddr, command: &str, options: &SshOptions)
        -> anyhow::Result<Output>;
}

/// The production [`CommandRunner`], shelling out to the system `ssh`.
#[derive(Clone, Debug)]
pub struct Ssh {
    /// Remote user to authenticate as.
    pub user: String,
    /// Private key used for authentication.
    pub key_path: PathBuf,
    /// TCP connect budget handed to ssh itself.
    pub connect_timeout: Duration,
}

impl Ssh {
    /// A runner for the given user and key.
    pub fn new(user: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            key_path: key_path.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    fn ssh_command(&self, host: IpAddr, command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs()))
            .arg("-i")
            .arg(&self.key_path)
            .arg(format!("{}@{}", self.user, host))
            .arg(command);
        cmd
    }
}

async fn run(mut cmd: Command, stdin: Option<&str>, timeout: Duration) -> anyhow::Result<Output> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let raw = if let Some(payload) = stdin {
        cmd.stdin(Stdio::piped());
        let mut child = cmd.spawn().context("failed to spawn command")?;
        if let Some(mut handle) = child.stdin.take() {
            handle
                .write_all(payload.as_bytes())
                .await
                .context("failed to write stdin payload")?;
            // Dropping the handle closes the pipe so the remote side sees EOF.
        }
        tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow!("command timed out after {:?}", timeout))??
    } else {
        cmd.stdin(Stdio::null());
        tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| anyhow!("command timed out after {:?}", timeout))??
    };

    let output = Output {
        stdout: String::from_utf8_lossy(&raw.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&raw.stderr).into_owned(),
    };
    if raw.status.success() {
        Ok(output)
    } else {
        Err(anyhow!(
            "command exited with {}: {}",
            raw.status,
            output.stderr.trim()
        ))
    }
}

#[async_trait]
impl CommandRunner for Ssh {
    async fn exec(&self, command: &str) -> anyhow::Result<Output> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        run(cmd, None, Duration::from_secs(60))
            .await
            .with_context(|| format!("local command failed: {}", command))
    }

    async fn ssh(
        &self,
        host: IpAddr,
        command: &str,
        options: &SshOptions,
    ) -> anyhow::Result<Output> {
        let attempts = options.retries.max(1);
        let mut last = None;
        for attempt in 1..=attempts {
            let cmd = self.ssh_command(host, command);
            match run(cmd, options.stdin.as_deref(), options.timeout).await {
                Ok(output) => {
                    debug!(%host, attempt, "ssh command succeeded");
                    return Ok(output);
                }
                Err(e) => {
                    warn!(%host, attempt, error = %e, "ssh command failed");
                    last = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(last
            .unwrap_or_else(|| anyhow!("ssh to {} failed with no attempts made", host))
            .context(format!("ssh to {} exhausted {} attempts", host, attempts)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn exec_captures_stdout() {
        let runner = Ssh::new("root", "/tmp/key");
        let output = runner.exec("echo hello").await.unwrap();
        assert_eq!(output.stdout_trimmed(), "hello");
    }

    #[tokio::test]
    async fn exec_surfaces_failure_with_stderr() {
        let runner = Ssh::new("root", "/tmp/key");
        let err = runner.exec("echo broken >&2; exit 3").await.unwrap_err();
        assert!(err.to_string().contains("broken") || format!("{:#}", err).contains("broken"));
    }

    #[test]
    fn ssh_command_disables_host_key_checks() {
        let runner = Ssh::new("root", "/tmp/key");
        let cmd = runner.ssh_command("192.0.2.7".parse().unwrap(), "true");
        let rendered = format!("{:?}", cmd.as_std());
        assert!(rendered.contains("StrictHostKeyChecking=no"));
        assert!(rendered.contains("BatchMode=yes"));
        assert!(rendered.contains("root@192.0.2.7"));
    }
}
