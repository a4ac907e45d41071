//! Shared fixture for stage and pipeline tests.
//!
//! Real toolchains are swapped for shell one-liners through the ordinary
//! configuration fields:
//! - an "archive" is a shell script that recreates the uploaded tree, and
//!   the unzip command runs it inside the code directory;
//! - the Seashell compiler is `cat`;
//! - HLS tool invocations append their argv to `code/hls.log`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::config::BuildbotConfig;
use crate::lease::{self, CODE_DIR, LeaseOutcome, StageWork};
use crate::state_machine::{Job, Stage};
use crate::store::{FileStore, JobStore};

const FAKE_UNZIP: &str = r#"mkdir -p "$2" && cd "$2" && sh ../"$3""#;
const FAKE_HLS: &str = r#"echo "$@" >> hls.log"#;
pub const TOOLCHAIN_LOG: &str = "hls.log";

pub struct Fixture {
    pub tmp: TempDir,
    pub store: Arc<FileStore>,
    config: Arc<BuildbotConfig>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut BuildbotConfig)) -> Self {
        let tmp = TempDir::new().unwrap();
        let mut config = BuildbotConfig {
            jobs_dir: tmp.path().join("jobs"),
            seashell_compiler: "cat".into(),
            hls_command_prefix: ["sh", "-c", FAKE_HLS, "hls"].map(String::from).to_vec(),
            unzip_command: ["sh", "-c", FAKE_UNZIP, "unzip"].map(String::from).to_vec(),
            command_timeout_secs: 30,
            poll_interval_ms: 20,
            ..BuildbotConfig::default()
        };
        tweak(&mut config);
        let store = FileStore::open(&config.jobs_dir, config.poll_interval()).unwrap();
        Self {
            tmp,
            store: Arc::new(store),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> Arc<BuildbotConfig> {
        Arc::clone(&self.config)
    }

    pub fn dyn_store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    /// Submits a job whose archive unpacks to `files` (path, contents).
    pub fn submit(&self, name: &str, files: &[(&str, &str)]) -> Job {
        let script: String = files
            .iter()
            .map(|(path, contents)| {
                format!("mkdir -p \"$(dirname '{path}')\"\nprintf '%s' '{contents}' > '{path}'\n")
            })
            .collect();
        let archive = self.tmp.path().join(format!("{name}.upload"));
        std::fs::write(&archive, script).unwrap();
        self.store.submit(name, &archive).unwrap()
    }

    /// Runs one lease of `stage`, failing the test if no job shows up.
    pub async fn step(&self, stage: &dyn StageWork) -> LeaseOutcome {
        let store = self.dyn_store();
        let cancel = CancellationToken::new();
        let pending = lease::work(&store, stage, &cancel, self.config.command_timeout());
        tokio::time::timeout(Duration::from_secs(10), pending)
            .await
            .expect("no job became available")
            .unwrap()
            .expect("not cancelled")
    }

    /// Walks a job through `stages` without doing any work.
    pub async fn force_state(&self, name: &str, stages: &[Stage]) {
        let store = self.dyn_store();
        for stage in stages {
            let mut job = store.acquire(stage.old(), stage.transient()).await.unwrap();
            assert_eq!(job.name, name);
            store.set_state(&mut job, stage.done()).await.unwrap();
        }
    }

    pub fn job(&self, name: &str) -> Job {
        self.store.get(name).unwrap()
    }

    pub fn code_dir(&self, name: &str) -> PathBuf {
        self.store.job_dir(name).join(CODE_DIR)
    }

    /// Argument lines recorded by the fake HLS tool, in call order.
    pub fn toolchain_calls(&self, name: &str) -> Vec<String> {
        std::fs::read_to_string(self.code_dir(name).join(TOOLCHAIN_LOG))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}
