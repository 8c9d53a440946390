//! Child process execution with captured output

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Lines of tool output kept in error messages
pub const DEFAULT_TAIL_LINES: usize = 20;

/// Env var the registry token is read from
pub const TOKEN_ENV_VAR: &str = "DOCKHAND_TOKEN";

/// Inherited variables that never reach a child process
const SCRUBBED_ENV: &[&str] = &[TOKEN_ENV_VAR];

/// How long to keep reading output after killing a timed-out child
const KILL_GRACE: Duration = Duration::from_millis(250);

/// Error types for process execution
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Carries whatever the child printed before it was killed
    #[error("Timed out after {limit:?}")]
    Timeout {
        limit: Duration,
        output: ProcessOutput,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A process to run
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,

    /// Written to the child's stdin, which is then closed
    pub stdin: Option<String>,

    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// `<shell> -c <script>`
    pub fn shell(shell: &str, script: &str) -> Self {
        Self::new(shell).arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn envs(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, duration: Option<Duration>) -> Self {
        self.timeout = duration;
        self
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        match (self.stdout.trim_end().is_empty(), self.stderr.trim_end().is_empty()) {
            (_, true) => self.stdout.trim_end().to_string(),
            (true, false) => self.stderr.trim_end().to_string(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
        }
    }

    /// Last `lines` lines of the combined output
    pub fn tail(&self, lines: usize) -> String {
        let combined = self.combined();
        let all: Vec<&str> = combined.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }

    /// Human description of the exit status
    pub fn status_line(&self) -> String {
        match self.exit_code {
            Some(code) => format!("exited with code {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Runs child processes
///
/// Children are spawned with `kill_on_drop`, so an abandoned future does not
/// leave the process behind. The environment is inherited minus
/// [`TOKEN_ENV_VAR`].
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run a process to completion and capture its output
    pub async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput, ProcessError> {
        debug!("Spawning {} with {} args", spec.program, spec.args.len());

        let output = self.spawn_and_wait(spec).await?;
        if !output.success() {
            warn!("{} {}", spec.program, output.status_line());
        }
        Ok(output)
    }

    async fn spawn_and_wait(&self, spec: &CommandSpec) -> Result<ProcessOutput, ProcessError> {
        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        for name in SCRUBBED_ENV {
            command.env_remove(name);
        }
        command
            .envs(&spec.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        if let Some(dir) = &spec.cwd {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let stdout = Captured::default();
        let stderr = Captured::default();
        let mut readers = Vec::new();
        if let Some(pipe) = child.stdout.take() {
            readers.push(tokio::spawn(stdout.clone().drain(pipe)));
        }
        if let Some(pipe) = child.stderr.take() {
            readers.push(tokio::spawn(stderr.clone().drain(pipe)));
        }

        if let (Some(input), Some(mut stdin)) = (&spec.stdin, child.stdin.take()) {
            stdin.write_all(input.as_bytes()).await?;
            // Dropping closes the pipe so the child sees EOF
            drop(stdin);
        }

        let status = match spec.timeout {
            Some(limit) => match timeout(limit, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    warn!("{} timed out after {:?}, killing it", spec.program, limit);
                    if let Err(e) = child.kill().await {
                        debug!("Kill failed, child already gone: {}", e);
                    }
                    join_readers(&mut readers, Some(KILL_GRACE)).await;
                    return Err(ProcessError::Timeout {
                        limit,
                        output: ProcessOutput {
                            exit_code: None,
                            stdout: stdout.text(),
                            stderr: stderr.text(),
                        },
                    });
                }
            },
            None => child.wait().await?,
        };
        join_readers(&mut readers, None).await;

        Ok(ProcessOutput {
            exit_code: status.code(),
            stdout: stdout.text(),
            stderr: stderr.text(),
        })
    }
}

/// Output pipe contents, readable while the pipe is still being drained
#[derive(Debug, Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    async fn drain<R: AsyncRead + Unpin>(self, mut pipe: R) -> std::io::Result<()> {
        let mut chunk = [0u8; 8192];
        loop {
            let read = pipe.read(&mut chunk).await?;
            if read == 0 {
                return Ok(());
            }
            if let Ok(mut buffer) = self.0.lock() {
                buffer.extend_from_slice(&chunk[..read]);
            }
        }
    }

    fn text(&self) -> String {
        self.0
            .lock()
            .map(|buffer| String::from_utf8_lossy(&buffer).into_owned())
            .unwrap_or_default()
    }
}

/// Wait for the pipe readers, at most `grace` when given, then stop them
///
/// A grandchild holding the pipe open keeps a reader alive, hence the limit
/// after a kill.
async fn join_readers(readers: &mut [JoinHandle<std::io::Result<()>>], grace: Option<Duration>) {
    let joined = async {
        for reader in readers.iter_mut() {
            if let Ok(Err(e)) = reader.await {
                debug!("Reading child output failed: {}", e);
            }
        }
    };
    match grace {
        Some(limit) => {
            if timeout(limit, joined).await.is_err() {
                debug!("Output pipes still open after {:?}", limit);
            }
        }
        None => joined.await,
    }
    for reader in readers.iter() {
        reader.abort();
    }
}
