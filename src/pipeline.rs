use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::BuildbotConfig;
use crate::lease::{self, LeaseOutcome, StageWork};
use crate::stages;
use crate::store::JobStore;

/// Drives one stage forever: acquire a job, process it, repeat.
///
/// The loop only stops when its token is cancelled. A failing job never
/// ends it; a failing store is logged and retried after `pause`.
pub struct WorkerLoop {
    store: Arc<dyn JobStore>,
    stage: Arc<dyn StageWork>,
    cancel: CancellationToken,
    command_timeout: Duration,
    pause: Duration,
}

impl WorkerLoop {
    pub fn new(
        store: Arc<dyn JobStore>,
        stage: Arc<dyn StageWork>,
        cancel: CancellationToken,
        config: &BuildbotConfig,
    ) -> Self {
        Self {
            store,
            stage,
            cancel,
            command_timeout: config.command_timeout(),
            pause: config.poll_interval(),
        }
    }

    /// Runs until cancelled, returning how many jobs it processed.
    pub async fn run(self) -> usize {
        let stage = self.stage.stage();
        tracing::info!(%stage, "worker started");
        let mut processed = 0;

        while !self.cancel.is_cancelled() {
            match lease::work(
                &self.store,
                self.stage.as_ref(),
                &self.cancel,
                self.command_timeout,
            )
            .await
            {
                Ok(Some(outcome)) => {
                    processed += 1;
                    match outcome {
                        LeaseOutcome::Done { job, state } => {
                            tracing::debug!(%stage, %job, %state, "job advanced");
                        }
                        LeaseOutcome::Failed { job } => {
                            tracing::debug!(%stage, %job, "job failed");
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::error!(%stage, error = %err, "job store error");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.pause) => {}
                    }
                }
            }
        }

        tracing::info!(%stage, processed, "worker stopped");
        processed
    }
}

/// One worker loop per stage, all sharing one store.
pub struct Pipeline {
    store: Arc<dyn JobStore>,
    config: Arc<BuildbotConfig>,
    stages: Vec<Arc<dyn StageWork>>,
}

impl Pipeline {
    /// The standard four-stage pipeline.
    pub fn new(store: Arc<dyn JobStore>, config: Arc<BuildbotConfig>) -> Self {
        let stages = stages::all(Arc::clone(&config));
        Self::with_stages(store, config, stages)
    }

    pub fn with_stages(
        store: Arc<dyn JobStore>,
        config: Arc<BuildbotConfig>,
        stages: Vec<Arc<dyn StageWork>>,
    ) -> Self {
        Self {
            store,
            config,
            stages,
        }
    }

    /// Spawns every worker loop on the current runtime.
    pub fn start(self) -> PipelineHandle {
        let cancel = CancellationToken::new();
        let mut workers = JoinSet::new();
        for stage in self.stages {
            let worker = WorkerLoop::new(
                Arc::clone(&self.store),
                stage,
                cancel.child_token(),
                &self.config,
            );
            workers.spawn(worker.run());
        }
        PipelineHandle { cancel, workers }
    }
}

/// Running pipeline; dropping it leaves the workers running.
pub struct PipelineHandle {
    cancel: CancellationToken,
    workers: JoinSet<usize>,
}

impl PipelineHandle {
    /// Stops accepting new jobs, lets in-flight jobs finish, and waits for
    /// every worker. Returns the total number of jobs processed.
    pub async fn shutdown(mut self) -> usize {
        self.cancel.cancel();
        let mut processed = 0;
        while let Some(result) = self.workers.join_next().await {
            match result {
                Ok(count) => processed += count,
                Err(err) => tracing::error!(error = %err, "worker task ended abnormally"),
            }
        }
        processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StageError, WorkError};
    use crate::lease::Lease;
    use crate::state_machine::{Stage, State};
    use crate::testutil::Fixture;
    use async_trait::async_trait;

    async fn wait_for_terminal(fx: &Fixture, names: &[&str]) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        loop {
            if names.iter().all(|n| fx.job(n).state.is_terminal()) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "jobs did not finish: {:?}",
                names.iter().map(|n| (n, fx.job(n).state)).collect::<Vec<_>>()
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn uploaded_job_ends_synthed() {
        let fx = Fixture::new();
        fx.submit("j1", &[("vsadd.sea", "decl a: float[10];")]);

        let handle = Pipeline::new(fx.dyn_store(), fx.config()).start();
        wait_for_terminal(&fx, &["j1"]).await;
        let processed = handle.shutdown().await;
        assert_eq!(processed, 4);

        let job = fx.job("j1");
        assert_eq!(job.state, State::Synthed);
        assert_eq!(
            job.states_visited(),
            vec![
                State::Uploaded,
                State::Unpacking,
                State::Unpacked,
                State::Seashelling,
                State::Seashelled,
                State::Hlsing,
                State::Hlsed,
                State::Synthing,
                State::Synthed,
            ]
        );
        // unzip, seashell compiler, platform info, hw compile, link.
        assert_eq!(job.log.len(), 5);
        assert!(job.log.iter().all(|e| e.text.starts_with("$ ")));
        assert!(fx.code_dir("j1").join("vsadd.cpp").is_file());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failing_job_does_not_stop_the_pipeline() {
        let fx = Fixture::new();
        fx.submit("broken", &[("notes.txt", "no source")]);
        fx.submit("good", &[("vsadd.sea", "x")]);

        let handle = Pipeline::new(fx.dyn_store(), fx.config()).start();
        wait_for_terminal(&fx, &["broken", "good"]).await;
        handle.shutdown().await;

        let broken = fx.job("broken");
        assert_eq!(broken.state, State::Failed);
        assert_eq!(
            broken.states_visited(),
            vec![
                State::Uploaded,
                State::Unpacking,
                State::Unpacked,
                State::Seashelling,
                State::Failed,
            ]
        );
        assert_eq!(fx.job("good").state, State::Synthed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_jobs_flow_through_in_parallel() {
        let fx = Fixture::new();
        let names: Vec<String> = (0..6).map(|i| format!("job-{i}")).collect();
        for name in &names {
            fx.submit(name, &[("kernel.sea", "x")]);
        }

        let handle = Pipeline::new(fx.dyn_store(), fx.config()).start();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        wait_for_terminal(&fx, &refs).await;
        assert_eq!(handle.shutdown().await, 24);

        for name in &names {
            let job = fx.job(name);
            assert_eq!(job.state, State::Synthed);
            // Each stage saw the job exactly once.
            assert_eq!(job.state_history.len(), 8);
        }
    }

    #[tokio::test]
    async fn shutdown_stops_idle_workers() {
        let fx = Fixture::new();
        let handle = Pipeline::new(fx.dyn_store(), fx.config()).start();
        let processed = tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("workers ignored cancellation");
        assert_eq!(processed, 0);
    }

    struct Flaky;

    #[async_trait]
    impl StageWork for Flaky {
        fn stage(&self) -> Stage {
            Stage::Unpack
        }

        async fn process(&self, lease: &mut Lease) -> Result<(), StageError> {
            match lease.job().name.as_str() {
                "panics" => panic!("boom"),
                "errors" => Err(WorkError::msg("nope").into()),
                _ => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn worker_loop_survives_panics_and_errors() {
        let fx = Fixture::new();
        fx.submit("panics", &[]);
        tokio::time::sleep(Duration::from_millis(2)).await;
        fx.submit("errors", &[]);
        tokio::time::sleep(Duration::from_millis(2)).await;
        fx.submit("fine", &[]);

        let cancel = CancellationToken::new();
        let worker = WorkerLoop::new(fx.dyn_store(), Arc::new(Flaky), cancel.clone(), &fx.config());
        let task = tokio::spawn(worker.run());

        wait_for_terminal_or_unpacked(&fx, &["panics", "errors", "fine"]).await;
        cancel.cancel();
        assert_eq!(task.await.unwrap(), 3);

        assert_eq!(fx.job("panics").state, State::Failed);
        assert_eq!(fx.job("errors").state, State::Failed);
        assert_eq!(fx.job("fine").state, State::Unpacked);
    }

    async fn wait_for_terminal_or_unpacked(fx: &Fixture, names: &[&str]) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !names
            .iter()
            .all(|n| matches!(fx.job(n).state, State::Failed | State::Unpacked))
        {
            assert!(tokio::time::Instant::now() < deadline, "worker stalled");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
