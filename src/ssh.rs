//! Remote command sessions over SSH.
//!
//! The bootstrap flow only needs one capability from SSH: run a bash script
//! on `user@host` and collect its exit status and combined output. The
//! [`SshClient`] and [`RemoteSession`] traits describe that capability so the
//! address race can be driven by the real `ssh` binary in production and by
//! scripted fakes in tests.

use std::{io, path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::debug;

/// Account used for every bootstrap SSH session.
pub const BOOTSTRAP_USER: &str = "ubuntu";

/// Build the `user@host` target for a bootstrap session.
///
/// # Examples
///
/// ```
/// use clusterboot::ssh::bootstrap_target;
///
/// assert_eq!(bootstrap_target("10.0.0.5"), "ubuntu@10.0.0.5");
/// ```
#[must_use]
pub fn bootstrap_target(host: &str) -> String { format!("{BOOTSTRAP_USER}@{host}") }

/// Exit status and combined output of a remote script.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit code, or `None` if the remote side was terminated by a signal.
    pub status: Option<i32>,
    /// Standard output followed by standard error.
    pub combined: String,
}

impl CommandOutput {
    /// Whether the script exited with status zero.
    #[must_use]
    pub const fn success(&self) -> bool { matches!(self.status, Some(0)) }

    /// The combined output with surrounding whitespace removed.
    #[must_use]
    pub fn trimmed(&self) -> &str { self.combined.trim() }
}

/// Transport-level failures running a remote session.
#[derive(Debug, Error, Clone)]
pub enum SessionError {
    /// The SSH program could not be started.
    #[error("failed to start {program}: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
    /// Feeding the script or collecting output failed.
    #[error("remote session I/O failed: {0}")]
    Io(#[source] Arc<io::Error>),
}

impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> Self { Self::Io(Arc::new(err)) }
}

/// Why a single verification attempt against a host failed.
#[derive(Debug, Error, Clone)]
pub enum ProbeError {
    /// The script failed and printed something.
    #[error("{0}")]
    Remote(String),
    /// The script failed without printing anything.
    #[error("{}", describe_exit(.0))]
    Exit(Option<i32>),
    /// The session could not be established or driven.
    #[error(transparent)]
    Transport(#[from] SessionError),
}

fn describe_exit(status: &Option<i32>) -> String {
    status.map_or_else(
        || "remote script terminated by signal".to_owned(),
        |code| format!("exit status {code}"),
    )
}

/// One remote command session.
#[async_trait]
pub trait RemoteSession: Send {
    /// Run `script` through `/bin/bash` on the remote side.
    ///
    /// A non-zero exit is reported in [`CommandOutput::status`], not as an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if the session could not be driven at all.
    async fn run(self: Box<Self>, script: &str) -> Result<CommandOutput, SessionError>;
}

/// Opens remote command sessions.
pub trait SshClient: Send + Sync {
    /// Prepare a session against `user_host` (for example `ubuntu@10.0.0.5`).
    fn command(&self, user_host: &str) -> Box<dyn RemoteSession>;
}

/// Run `script` on `host` as the bootstrap user and require a zero exit.
///
/// # Errors
///
/// Returns [`ProbeError::Remote`] with the trimmed output when the script
/// failed and printed something, [`ProbeError::Exit`] when it failed
/// silently, or [`ProbeError::Transport`] when no session could be run.
pub async fn check_host(client: &dyn SshClient, host: &str, script: &str) -> Result<(), ProbeError> {
    let output = client.command(&bootstrap_target(host)).run(script).await?;
    if output.success() {
        return Ok(());
    }
    let text = output.trimmed();
    if text.is_empty() {
        Err(ProbeError::Exit(output.status))
    } else {
        Err(ProbeError::Remote(text.to_owned()))
    }
}

/// Default time `ssh` waits for the TCP connection to open.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// [`SshClient`] backed by the OpenSSH command-line client.
#[derive(Debug, Clone)]
pub struct OpenSshClient {
    program: PathBuf,
    connect_timeout: Duration,
}

impl OpenSshClient {
    /// Use `program` as the SSH executable.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Locate `program` on `PATH`, returning `None` if it is unavailable.
    #[must_use]
    pub fn detect(program: &str) -> Option<Self> {
        match which::which(program) {
            Ok(path) => Some(Self::new(path)),
            Err(error) => {
                debug!(program, %error, "ssh client not found");
                None
            }
        }
    }

    /// Override the TCP connect timeout passed to `ssh`.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn arguments(&self, user_host: &str) -> Vec<String> {
        vec![
            "-o".to_owned(),
            "StrictHostKeyChecking no".to_owned(),
            "-o".to_owned(),
            "PasswordAuthentication no".to_owned(),
            "-o".to_owned(),
            format!("ConnectTimeout {}", self.connect_timeout.as_secs().max(1)),
            "-T".to_owned(),
            user_host.to_owned(),
            "/bin/bash".to_owned(),
        ]
    }
}

impl SshClient for OpenSshClient {
    fn command(&self, user_host: &str) -> Box<dyn RemoteSession> {
        Box::new(OpenSshSession {
            program: self.program.clone(),
            args: self.arguments(user_host),
        })
    }
}

struct OpenSshSession {
    program: PathBuf,
    args: Vec<String>,
}

#[async_trait]
impl RemoteSession for OpenSshSession {
    async fn run(self: Box<Self>, script: &str) -> Result<CommandOutput, SessionError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| SessionError::Spawn {
                program: self.program.display().to_string(),
                source: Arc::new(err),
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            // ssh closes stdin early when the connection fails; its stderr
            // still explains why, so a broken pipe is not fatal here.
            match stdin.write_all(script.as_bytes()).await {
                Ok(()) => stdin.shutdown().await?,
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {}
                Err(err) => return Err(err.into()),
            }
        }
        let output = child.wait_with_output().await?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(CommandOutput {
            status: output.status.code(),
            combined,
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::test_helpers::ScriptedSsh;

    #[rstest]
    fn ssh_arguments_target_bash() {
        let client = OpenSshClient::new("ssh").with_connect_timeout(Duration::from_secs(3));
        let args = client.arguments("ubuntu@10.0.0.5");

        assert_eq!(args.last().map(String::as_str), Some("/bin/bash"));
        assert!(args.contains(&"ConnectTimeout 3".to_owned()));
        assert!(args.contains(&"ubuntu@10.0.0.5".to_owned()));
    }

    #[rstest]
    #[tokio::test]
    async fn check_host_reports_trimmed_output() {
        let ssh = ScriptedSsh::new();
        ssh.fail("10.0.0.5", 1, "  /var/lib/clusterboot/nonce.txt does not exist\n");

        let err = check_host(&ssh, "10.0.0.5", "true")
            .await
            .expect_err("script must fail");

        assert_eq!(err.to_string(), "/var/lib/clusterboot/nonce.txt does not exist");
        assert_eq!(ssh.targets(), vec!["ubuntu@10.0.0.5".to_owned()]);
    }

    #[rstest]
    #[tokio::test]
    async fn check_host_reports_silent_exit_status() {
        let ssh = ScriptedSsh::new();
        ssh.fail("10.0.0.5", 255, "");

        let err = check_host(&ssh, "10.0.0.5", "true")
            .await
            .expect_err("script must fail");

        assert_eq!(err.to_string(), "exit status 255");
    }

    #[rstest]
    #[tokio::test]
    async fn check_host_accepts_zero_exit() {
        let ssh = ScriptedSsh::new();
        ssh.succeed("10.0.0.5");

        check_host(&ssh, "10.0.0.5", "true").await.expect("script passes");
    }

    #[rstest]
    #[tokio::test]
    async fn missing_program_is_a_transport_error() {
        let client = OpenSshClient::new("/nonexistent/clusterboot-ssh");

        let err = check_host(&client, "10.0.0.5", "true")
            .await
            .expect_err("spawn must fail");

        assert!(matches!(err, ProbeError::Transport(SessionError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[rstest]
    #[tokio::test]
    async fn session_output_puts_stdout_before_stderr() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().expect("tempdir");
        let program = dir.path().join("fake-ssh");
        std::fs::write(&program, "#!/bin/sh\nexec /bin/bash -s\n").expect("write fake ssh");
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755))
            .expect("chmod fake ssh");
        let client = OpenSshClient::new(&program);

        let output = client
            .command("ubuntu@10.0.0.5")
            .run("echo err >&2; echo out; exit 3")
            .await
            .expect("session runs");

        assert_eq!(output.status, Some(3));
        assert_eq!(output.combined, "out\nerr\n");
        assert_eq!(output.trimmed(), "out\nerr");
    }
}
