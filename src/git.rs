//! Thin wrapper over the `git` binary for the GitOps working copy.
//!
//! Every command runs non-interactively (`GIT_TERMINAL_PROMPT=0`, batch-mode
//! ssh), aborts HTTP transfers that stall below 1 KB/s and is killed once it
//! outlives the repository's deadline. Access tokens are embedded in HTTPS
//! remote URLs and scrubbed from every error message.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;

use reqwest::Url;
use thiserror::Error;
use wait_timeout::ChildExt;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to execute git ({0}). Is git installed?")]
    Spawn(#[source] std::io::Error),

    #[error("git {command} failed: {stderr}")]
    Failed { command: String, stderr: String },

    #[error("git {command} timed out after {secs}s")]
    TimedOut { command: String, secs: u64 },

    #[error("failed to prepare {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A local clone plus the settings every command runs with.
#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
    stall_secs: u64,
    timeout: Duration,
    secrets: Vec<String>,
}

impl Repository {
    /// Open an existing working copy at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            stall_secs: 30,
            timeout: DEFAULT_TIMEOUT,
            secrets: Vec::new(),
        }
    }

    pub fn with_stall_secs(mut self, secs: u64) -> Self {
        self.stall_secs = secs;
        self
    }

    /// Wall-clock limit for a single git command.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Token to scrub from error output, both raw and as it appears
    /// percent-encoded inside a remote URL.
    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        self.secrets.clear();
        if let Some(secret) = secret.filter(|s| !s.is_empty()) {
            if let Some(encoded) = encoded_userinfo(&secret).filter(|e| *e != secret) {
                self.secrets.push(encoded);
            }
            self.secrets.push(secret);
        }
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_cloned(&self) -> bool {
        self.root.join(".git").exists()
    }

    /// Single-branch clone of `url` into this repository's root.
    pub fn clone_from(&self, url: &str, branch: &str) -> Result<(), GitError> {
        if let Some(parent) = self.root.parent() {
            std::fs::create_dir_all(parent).map_err(|source| GitError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let dest = self.root.to_string_lossy().into_owned();
        self.run_in(
            None,
            &["clone", "--branch", branch, "--single-branch", url, &dest],
        )?;
        Ok(())
    }

    /// Point `origin` at `url`. Used when the token changed between runs.
    pub fn set_remote(&self, url: &str) -> Result<(), GitError> {
        self.run(&["remote", "set-url", "origin", url])?;
        Ok(())
    }

    /// Fetch `branch` and hard-reset the working tree to it. Leftovers from
    /// an aborted upgrade are discarded.
    pub fn sync(&self, branch: &str) -> Result<(), GitError> {
        self.run(&["fetch", "origin", branch])?;
        let remote_ref = format!("origin/{}", branch);
        self.run(&["reset", "--hard", &remote_ref])?;
        Ok(())
    }

    pub fn set_identity(&self, name: &str, email: &str) -> Result<(), GitError> {
        self.run(&["config", "user.name", name])?;
        self.run(&["config", "user.email", email])?;
        Ok(())
    }

    /// Stage modifications to tracked files only.
    pub fn stage_tracked(&self) -> Result<(), GitError> {
        self.run(&["add", "--update"])?;
        Ok(())
    }

    pub fn has_staged_changes(&self) -> Result<bool, GitError> {
        let output = self.execute(Some(&self.root), &["diff", "--cached", "--quiet"])?;
        match output.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(self.failure("diff", &output.stderr)),
        }
    }

    pub fn commit(&self, subject: &str, body: &str) -> Result<(), GitError> {
        self.run(&["commit", "-m", subject, "-m", body])?;
        Ok(())
    }

    pub fn push(&self, branch: &str) -> Result<(), GitError> {
        let refspec = format!("HEAD:{}", branch);
        self.run(&["push", "origin", &refspec])?;
        Ok(())
    }

    pub fn head(&self) -> Result<String, GitError> {
        Ok(self.run(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    fn run(&self, args: &[&str]) -> Result<String, GitError> {
        self.run_in(Some(&self.root), args)
    }

    fn run_in(&self, cwd: Option<&Path>, args: &[&str]) -> Result<String, GitError> {
        let output = self.execute(cwd, args)?;
        if !output.status.success() {
            return Err(self.failure(args[0], &output.stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run git to completion or kill it at the deadline. Pipes are drained on
    /// their own threads so a chatty command cannot block on a full buffer.
    fn execute(&self, cwd: Option<&Path>, args: &[&str]) -> Result<Output, GitError> {
        tracing::debug!(command = %self.redact(&args.join(" ")), "git");
        let mut child = self
            .command(cwd, args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(GitError::Spawn)?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let Some(status) = child.wait_timeout(self.timeout).map_err(GitError::Spawn)? else {
            let _ = child.kill();
            let _ = child.wait();
            // Readers are left behind: a helper that inherited the pipes may
            // still hold them open.
            tracing::warn!(command = args[0], secs = self.timeout.as_secs(), "git killed at deadline");
            return Err(GitError::TimedOut {
                command: args[0].to_string(),
                secs: self.timeout.as_secs(),
            });
        };

        Ok(Output {
            status,
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        })
    }

    fn command(&self, cwd: Option<&Path>, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        if std::env::var_os("GIT_SSH_COMMAND").is_none() {
            cmd.env(
                "GIT_SSH_COMMAND",
                format!(
                    "ssh -o BatchMode=yes -o ConnectTimeout={}",
                    self.timeout.as_secs().max(1)
                ),
            );
        }
        cmd.arg("-c")
            .arg("http.lowSpeedLimit=1000")
            .arg("-c")
            .arg(format!("http.lowSpeedTime={}", self.stall_secs))
            .args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn failure(&self, command: &str, stderr: &[u8]) -> GitError {
        GitError::Failed {
            command: command.to_string(),
            stderr: self.redact(String::from_utf8_lossy(stderr).trim()),
        }
    }

    fn redact(&self, text: &str) -> String {
        self.secrets
            .iter()
            .fold(text.to_string(), |acc, secret| redact(&acc, secret))
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// `value` as it is written in the userinfo part of a URL.
fn encoded_userinfo(value: &str) -> Option<String> {
    let mut url = Url::parse("https://host.invalid/").ok()?;
    url.set_password(Some(value)).ok()?;
    url.password().map(str::to_string)
}

/// Embed `oauth2:<token>@` into an HTTPS remote, replacing any credentials
/// already present. The token is percent-encoded as needed. Other URLs,
/// including scp-style ssh remotes, are returned unchanged, as is
/// everything when no token is given.
pub fn authenticated_url(url: &str, token: Option<&str>) -> String {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return url.to_string();
    };
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_string();
    };
    if parsed.scheme() != "https" {
        return url.to_string();
    }
    if parsed.set_username("oauth2").is_err() || parsed.set_password(Some(token)).is_err() {
        return url.to_string();
    }
    parsed.to_string()
}

pub fn redact(text: &str, secret: &str) -> String {
    if secret.is_empty() {
        return text.to_string();
    }
    text.replace(secret, "***")
}
