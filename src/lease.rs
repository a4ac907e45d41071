//! Exclusive, scoped hold on a job while one stage works on it.
//!
//! [`work`] acquires a job for a [`StageWork`], runs the stage body and
//! always resolves the job to the stage's done state or to `failed`,
//! whatever the body did: returned a [`WorkError`], returned a defect, or
//! panicked.

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::error::{StageError, StoreError, WorkError};
use crate::runner::{self, CommandOutput, LogStreams, RunOptions};
use crate::state_machine::{Job, Stage, State};
use crate::store::JobStore;

/// Directory inside the job directory that holds the unpacked code.
pub const CODE_DIR: &str = "code";

/// One pipeline step. Implementations hold only configuration, never job state.
#[async_trait]
pub trait StageWork: Send + Sync {
    fn stage(&self) -> Stage;

    /// Processes the leased job.
    async fn process(&self, lease: &mut Lease) -> Result<(), StageError>;
}

/// How a lease ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Done { job: String, state: State },
    Failed { job: String },
}

/// A job held in its stage's transient state.
///
/// Commands run on behalf of the job get the job directory or
/// [`Lease::code_dir`] as their working directory; the process-wide
/// current directory is never touched.
pub struct Lease {
    store: Arc<dyn JobStore>,
    job: Job,
    dir: PathBuf,
    stage: Stage,
    timeout: Duration,
    committed: bool,
}

impl Lease {
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_mut(&mut self) -> &mut Job {
        &mut self.job
    }

    pub fn code_dir(&self) -> PathBuf {
        self.dir.join(CODE_DIR)
    }

    /// Reads a job attribute an earlier stage must have recorded.
    pub fn require_attr(&self, key: &str) -> Result<String, WorkError> {
        self.job
            .attr(key)
            .map(str::to_string)
            .ok_or_else(|| WorkError::msg(format!("missing job attribute {key}")))
    }

    /// Appends free text to the job log.
    pub async fn log(&mut self, text: &str) -> Result<(), StoreError> {
        self.store.log(&mut self.job, text).await
    }

    /// Runs a command and logs it.
    ///
    /// When `opts` carries no directory the command runs in the job
    /// directory, and without a timeout it gets the lease's. Pass
    /// `log_stdout = false` when stdout is the artifact.
    pub async fn run(
        &mut self,
        cmd: &[String],
        mut opts: RunOptions,
        log_stdout: bool,
    ) -> Result<CommandOutput, StageError> {
        if opts.cwd.is_none() {
            opts.cwd = Some(self.dir.clone());
        }
        opts.timeout.get_or_insert(self.timeout);
        let output = runner::run(cmd, &opts).await?;
        let streams = if log_stdout {
            LogStreams::BOTH
        } else {
            LogStreams::STDERR_ONLY
        };
        self.log(&runner::command_log_entry(cmd, &output, streams))
            .await?;
        Ok(output)
    }

    async fn commit(
        mut self,
        result: Result<Result<(), StageError>, Box<dyn Any + Send>>,
    ) -> Result<LeaseOutcome, StoreError> {
        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(StageError::Work(err))) => Some(err.to_string()),
            Ok(Err(StageError::Defect(err))) => Some(format!("{err:?}")),
            Err(payload) => Some(format!(
                "stage {} panicked: {}\n{}",
                self.stage,
                panic_message(payload.as_ref()),
                Backtrace::force_capture()
            )),
        };

        let message = match failure {
            None => {
                let done = self.stage.done();
                match self.store.set_state(&mut self.job, done).await {
                    Ok(()) => {
                        self.committed = true;
                        tracing::info!(job = %self.job.name, state = %done, "stage done");
                        return Ok(LeaseOutcome::Done {
                            job: self.job.name.clone(),
                            state: done,
                        });
                    }
                    Err(err) => {
                        tracing::error!(
                            job = %self.job.name,
                            state = %done,
                            error = %err,
                            "could not commit stage result"
                        );
                        format!("could not record state {done}: {err}")
                    }
                }
            }
            Some(message) => message,
        };

        tracing::warn!(job = %self.job.name, stage = %self.stage, "stage failed");
        let logged = self.store.log(&mut self.job, &message).await;
        self.store.set_state(&mut self.job, State::Failed).await?;
        self.committed = true;
        logged?;
        Ok(LeaseOutcome::Failed {
            job: self.job.name.clone(),
        })
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.committed {
            tracing::warn!(
                job = %self.job.name,
                state = %self.job.state,
                "lease released without commit; job is stranded"
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Acquires one job for `stage_work`, processes it and commits the result.
///
/// Returns `Ok(None)` if `cancel` fires while waiting for a job; a job that
/// was already acquired always runs to completion.
pub async fn work(
    store: &Arc<dyn JobStore>,
    stage_work: &dyn StageWork,
    cancel: &CancellationToken,
    timeout: Duration,
) -> Result<Option<LeaseOutcome>, StoreError> {
    let stage = stage_work.stage();
    let (old, transient, _) = stage.triple();

    let job = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(None),
        job = store.acquire(old, transient) => job?,
    };
    tracing::info!(job = %job.name, %stage, "acquired job");

    let dir = store.job_dir(&job.name);
    let mut lease = Lease {
        store: Arc::clone(store),
        job,
        dir,
        stage,
        timeout,
        committed: false,
    };

    let result = AssertUnwindSafe(stage_work.process(&mut lease))
        .catch_unwind()
        .await;
    lease.commit(result).await.map(Some)
}
