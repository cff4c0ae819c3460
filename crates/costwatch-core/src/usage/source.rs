//! Guarded usage source backed by an external command.

use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tracing::debug;

use super::types::{UsageReport, UsageSnapshot};
use crate::error::FetchError;
use crate::guard::SingleFlightGuard;

/// How long a fetch waits for another in-flight fetch before giving up
pub const DEFAULT_GUARD_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on a single run of the usage command
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(120);
/// Hard cap on captured command output
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Provider of usage snapshots for the scheduler
pub trait UsageSource: Send + Sync {
    /// Fetch usage for `period` (`YYYY-MM`).
    ///
    /// `Ok(None)` means the report has no entry for the period.
    fn fetch_usage(
        &self,
        period: &str,
    ) -> impl Future<Output = Result<Option<UsageSnapshot>, FetchError>> + Send;

    /// Fail any callers still queued for a fetch. Called once at shutdown.
    fn close(&self) {}
}

/// The external collaborator that emits the usage document
pub trait UsageCommand: Send + Sync {
    fn spawn(&self) -> Result<UsageProcess, FetchError>;
}

/// A running usage command: its output stream plus the child to reap
pub struct UsageProcess {
    output: Box<dyn AsyncRead + Send + Unpin>,
    child: Option<Child>,
}

impl UsageProcess {
    /// Wrap an in-process reader (no child to wait on)
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            output: Box::new(reader),
            child: None,
        }
    }

    /// Read at most `limit` bytes, then wait for the child to exit
    async fn collect(mut self, limit: usize) -> Result<Vec<u8>, FetchError> {
        let mut buf = Vec::new();
        (&mut self.output)
            .take((limit as u64).saturating_add(1))
            .read_to_end(&mut buf)
            .await
            .map_err(FetchError::Io)?;

        if buf.len() > limit {
            // Dropping the child kills it
            return Err(FetchError::TooLarge { limit });
        }

        if let Some(mut child) = self.child.take() {
            let status = child.wait().await.map_err(FetchError::Io)?;
            if !status.success() {
                return Err(FetchError::CommandFailed { status });
            }
        }
        Ok(buf)
    }
}

/// Runs a program and reads the usage document from its stdout
#[derive(Debug, Clone)]
pub struct ProcessUsageCommand {
    program: String,
    args: Vec<String>,
}

impl ProcessUsageCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from an argv-style list; `None` if it is empty
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }
}

impl UsageCommand for ProcessUsageCommand {
    fn spawn(&self) -> Result<UsageProcess, FetchError> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(FetchError::Spawn)?;

        let stdout = child.stdout.take().ok_or_else(|| {
            FetchError::Spawn(std::io::Error::other("usage command stdout not captured"))
        })?;

        Ok(UsageProcess {
            output: Box::new(stdout),
            child: Some(child),
        })
    }
}

/// [`UsageSource`] that runs a [`UsageCommand`] under a single-flight guard,
/// an execution timeout and an output size cap.
pub struct CommandUsageSource<C> {
    command: C,
    guard: Arc<SingleFlightGuard>,
    guard_timeout: Duration,
    fetch_timeout: Duration,
    max_output_bytes: usize,
}

impl<C: UsageCommand> CommandUsageSource<C> {
    pub fn new(command: C) -> Self {
        Self {
            command,
            guard: Arc::new(SingleFlightGuard::new()),
            guard_timeout: DEFAULT_GUARD_TIMEOUT,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    /// Share a guard with other sources
    pub fn with_guard(mut self, guard: Arc<SingleFlightGuard>) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_guard_timeout(mut self, timeout: Duration) -> Self {
        self.guard_timeout = timeout;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_max_output_bytes(mut self, limit: usize) -> Self {
        self.max_output_bytes = limit;
        self
    }

    pub fn guard(&self) -> &Arc<SingleFlightGuard> {
        &self.guard
    }

    /// Fetch and parse the full report. The guard is held for the whole
    /// run and released on every return path by the permit's drop.
    pub async fn fetch_report(&self) -> Result<UsageReport, FetchError> {
        let Some(_permit) = self.guard.lock(self.guard_timeout).await else {
            return Err(FetchError::GuardTimeout {
                waited: self.guard_timeout,
            });
        };

        let bytes = match tokio::time::timeout(self.fetch_timeout, self.run_command()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(FetchError::Timeout {
                    after: self.fetch_timeout,
                })
            }
        };
        debug!(bytes = bytes.len(), "Usage command output captured");

        UsageReport::parse(&bytes)
    }

    async fn run_command(&self) -> Result<Vec<u8>, FetchError> {
        let process = self.command.spawn()?;
        process.collect(self.max_output_bytes).await
    }
}

impl<C: UsageCommand> UsageSource for CommandUsageSource<C> {
    async fn fetch_usage(&self, period: &str) -> Result<Option<UsageSnapshot>, FetchError> {
        let report = self.fetch_report().await?;
        Ok(report.snapshot_for(period))
    }

    fn close(&self) {
        self.guard.force_release();
    }
}
