//! Subprocess plumbing for the `git` executable.
//!
//! Every invocation runs with a deadline. A process that outlives it is killed
//! and reported as [`GitchronError::Timeout`].

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use gitchron_types::{GitchronError, Result};
use tracing::{debug, warn};

/// How `git` gets launched on this platform. Selected once with [`GitCommand::detect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitCommand {
    Posix,
    /// Windows checkouts hit MAX_PATH without `core.longpaths`.
    WindowsLongPaths,
}

/// Captured result of a finished git process.
#[derive(Debug)]
pub struct GitOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

impl Default for GitCommand {
    fn default() -> Self {
        GitCommand::detect()
    }
}

impl GitCommand {
    pub fn detect() -> Self {
        if cfg!(windows) {
            GitCommand::WindowsLongPaths
        } else {
            GitCommand::Posix
        }
    }

    /// Leading arguments placed before the subcommand.
    pub fn prefix_args(&self) -> &'static [&'static str] {
        match self {
            GitCommand::Posix => &[],
            GitCommand::WindowsLongPaths => &["-c", "core.longpaths=true"],
        }
    }

    /// Builds an unstarted `git` command for `args`.
    pub fn command(&self, args: &[&str], cwd: Option<&Path>) -> Command {
        let mut cmd = Command::new("git");
        cmd.args(self.prefix_args());
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        // Never block on an interactive credential prompt.
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd
    }

    /// Runs git and returns stdout, or an error carrying stderr on a non-zero exit.
    pub fn run(&self, args: &[&str], cwd: Option<&Path>, timeout: Duration) -> Result<Vec<u8>> {
        let output = self.run_raw(args, cwd, None, timeout)?;
        into_stdout(args, output)
    }

    /// Like [`GitCommand::run`], feeding `input` to the process's stdin.
    pub fn run_with_input(
        &self,
        args: &[&str],
        cwd: Option<&Path>,
        input: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let output = self.run_raw(args, cwd, Some(input), timeout)?;
        into_stdout(args, output)
    }

    /// Runs git to completion without interpreting the exit status.
    pub fn run_raw(
        &self,
        args: &[&str],
        cwd: Option<&Path>,
        input: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<GitOutput> {
        let description = describe(args);
        debug!(command = %description, "running git");

        let mut cmd = self.command(args, cwd);
        cmd.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                GitchronError::Ingest("git executable not found on PATH".into())
            } else {
                GitchronError::Ingest(format!("failed to start {}: {}", description, e))
            }
        })?;

        // Stdin is written and both pipes drained on their own threads so a
        // chatty process can never stall on a full pipe buffer.
        let writer = match (input, child.stdin.take()) {
            (Some(bytes), Some(mut stdin)) => Some(thread::spawn(move || {
                let _ = stdin.write_all(&bytes);
            })),
            _ => None,
        };
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = wait_with_deadline(&mut child, timeout, &description)?;

        if let Some(handle) = writer {
            let _ = handle.join();
        }
        let stdout = collect(stdout);
        let stderr = String::from_utf8_lossy(&collect(stderr)).trim().to_string();

        Ok(GitOutput {
            status,
            stdout,
            stderr,
        })
    }
}

fn into_stdout(args: &[&str], output: GitOutput) -> Result<Vec<u8>> {
    if output.success() {
        Ok(output.stdout)
    } else {
        Err(GitchronError::Ingest(format!(
            "{} failed: {}",
            describe(args),
            output.stderr
        )))
    }
}

fn describe(args: &[&str]) -> String {
    let mut text = String::from("git");
    for arg in args.iter().take(6) {
        text.push(' ');
        text.push_str(arg);
    }
    if args.len() > 6 {
        text.push_str(" ...");
    }
    text
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        buf
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// Polls the child until it exits or the deadline passes.
fn wait_with_deadline(
    child: &mut Child,
    timeout: Duration,
    description: &str,
) -> Result<ExitStatus> {
    let start = Instant::now();
    let mut pause = Duration::from_millis(2);

    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {
                if start.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    warn!(
                        command = %description,
                        secs = timeout.as_secs(),
                        "git timed out, killed"
                    );
                    // Reader threads are left detached: helpers spawned by git
                    // may still hold the pipes open.
                    return Err(GitchronError::Timeout {
                        command: description.to_string(),
                        secs: timeout.as_secs(),
                    });
                }
                thread::sleep(pause);
                pause = (pause * 2).min(Duration::from_millis(50));
            }
            Err(e) => {
                return Err(GitchronError::Ingest(format!(
                    "failed to wait for {}: {}",
                    description, e
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_args_per_platform() {
        assert!(GitCommand::Posix.prefix_args().is_empty());
        assert_eq!(
            GitCommand::WindowsLongPaths.prefix_args(),
            &["-c", "core.longpaths=true"]
        );
    }

    #[test]
    fn test_command_carries_prefix() {
        let cmd = GitCommand::WindowsLongPaths.command(&["status"], None);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, vec!["-c", "core.longpaths=true", "status"]);
    }

    #[test]
    fn test_run_version() {
        let out = GitCommand::detect()
            .run(&["--version"], None, Duration::from_secs(30))
            .expect("git --version");
        assert!(String::from_utf8_lossy(&out).starts_with("git version"));
    }

    #[test]
    fn test_non_zero_exit_is_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = GitCommand::detect()
            .run(&["rev-parse", "HEAD"], Some(dir.path()), Duration::from_secs(30))
            .unwrap_err();
        assert!(matches!(err, GitchronError::Ingest(_)), "got {err:?}");
    }

    #[test]
    fn test_stdin_is_forwarded() {
        let dir = tempfile::tempdir().expect("tempdir");
        git2::Repository::init(dir.path()).expect("init");
        let out = GitCommand::detect()
            .run_with_input(
                &["hash-object", "--stdin"],
                Some(dir.path()),
                b"hello\n".to_vec(),
                Duration::from_secs(30),
            )
            .expect("hash-object");
        // Well-known blob id of "hello\n".
        assert_eq!(
            String::from_utf8_lossy(&out).trim(),
            "ce013625030ba8dba906f756967f9e9ca394464a"
        );
    }

    #[test]
    fn test_zero_deadline_times_out() {
        let err = GitCommand::detect()
            .run(&["--version"], None, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, GitchronError::Timeout { .. }), "got {err:?}");
    }

    #[test]
    fn test_describe_truncates() {
        let args = ["a", "b", "c", "d", "e", "f", "g"];
        assert_eq!(describe(&args), "git a b c d e f ...");
    }
}
