//! Durable job storage.
//!
//! [`JobStore`] is the only thing the engine knows about persistence.
//! [`FileStore`] implements it with one directory per job under a root,
//! each holding a `job.json` record next to the job's working files.
//!
//! All mutations go through one mutex-guarded index, which makes
//! [`JobStore::acquire`] a compare-and-set: two workers can never walk away
//! with the same job.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use crate::error::StoreError;
use crate::state_machine::{Job, LogEntry, State};

/// File name of the job record inside its directory.
pub const RECORD_NAME: &str = "job.json";
/// File name the uploaded archive is stored under.
pub const ARCHIVE_NAME: &str = "code.zip";

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Moves one job from `old` to `transient` and returns it, waiting until
    /// such a job exists.
    ///
    /// Implementations must be cancel-safe: once a job has been transitioned
    /// the call returns without suspending again.
    async fn acquire(&self, old: State, transient: State) -> Result<Job, StoreError>;

    /// Commits `state` for `job`, persisting its attributes along with it.
    async fn set_state(&self, job: &mut Job, state: State) -> Result<(), StoreError>;

    /// The job's private working directory.
    fn job_dir(&self, name: &str) -> PathBuf;

    /// Appends an entry to the job's log.
    async fn log(&self, job: &mut Job, text: &str) -> Result<(), StoreError>;
}

/// Directory-backed store.
pub struct FileStore {
    index: Arc<Index>,
}

/// State shared with the blocking pool.
struct Index {
    root: PathBuf,
    jobs: Mutex<BTreeMap<String, Job>>,
    /// Records that failed to load; warned about once each.
    unreadable: Mutex<HashSet<PathBuf>>,
    changed: Notify,
    poll_interval: Duration,
}

impl FileStore {
    /// Opens (creating if needed) a store rooted at `root` and loads every
    /// job record found there.
    pub fn open(root: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let index = Index {
            root,
            jobs: Mutex::new(BTreeMap::new()),
            unreadable: Mutex::new(HashSet::new()),
            changed: Notify::new(),
            poll_interval,
        };
        let found = index.discover()?;
        tracing::debug!(root = %index.root.display(), jobs = found, "opened job store");
        Ok(Self {
            index: Arc::new(index),
        })
    }

    /// Creates a job in `uploaded` with `archive` copied into its directory.
    pub fn submit(&self, name: &str, archive: &Path) -> Result<Job, StoreError> {
        check_name(name)?;
        let index = &*self.index;
        let mut jobs = index.lock();
        let dir = index.job_dir(name);
        if jobs.contains_key(name) || dir.join(RECORD_NAME).exists() {
            return Err(StoreError::JobExists(name.to_string()));
        }
        fs::create_dir_all(&dir)?;
        fs::copy(archive, dir.join(ARCHIVE_NAME))?;

        let job = Job::new(name);
        index.persist(&job)?;
        jobs.insert(name.to_string(), job.clone());
        drop(jobs);

        tracing::info!(job = name, "submitted");
        index.changed.notify_waiters();
        Ok(job)
    }

    pub fn get(&self, name: &str) -> Result<Job, StoreError> {
        self.index
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::JobNotFound(name.to_string()))
    }

    /// All jobs, oldest first.
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.index.lock().values().cloned().collect();
        jobs.sort_by(|a, b| (a.created_at, &a.name).cmp(&(b.created_at, &b.name)));
        jobs
    }

    /// Picks up job records written by other processes. Returns how many
    /// new jobs were found.
    pub fn discover(&self) -> Result<usize, StoreError> {
        self.index.discover()
    }

    /// Runs `f` against the index on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Index) -> Result<T, StoreError> + Send + 'static,
    {
        let index = Arc::clone(&self.index);
        match tokio::task::spawn_blocking(move || f(&index)).await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => Err(StoreError::Io(io::Error::other(err))),
        }
    }
}

impl Index {
    fn job_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn discover(&self) -> Result<usize, StoreError> {
        let mut jobs = self.lock();
        let mut found = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if jobs.contains_key(&name) {
                continue;
            }
            let record = entry.path().join(RECORD_NAME);
            if !record.is_file() {
                continue;
            }
            match read_record(&record) {
                Ok(job) => {
                    self.unreadable().remove(&record);
                    jobs.insert(name, job);
                    found += 1;
                }
                Err(err) => {
                    if self.unreadable().insert(record.clone()) {
                        tracing::warn!(
                            record = %record.display(),
                            error = %err,
                            "skipping unreadable job record"
                        );
                    }
                }
            }
        }
        drop(jobs);
        if found > 0 {
            self.changed.notify_waiters();
        }
        Ok(found)
    }

    /// The compare-and-set at the heart of `acquire`.
    fn try_acquire(&self, old: State, transient: State) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.lock();
        let candidate = jobs
            .values()
            .filter(|job| job.state == old)
            .min_by(|a, b| (a.created_at, &a.name).cmp(&(b.created_at, &b.name)))
            .map(|job| job.name.clone());
        let Some(name) = candidate else {
            return Ok(None);
        };

        let mut job = jobs[&name].clone();
        transition(&mut job, transient)?;
        self.persist(&job)?;
        jobs.insert(name, job.clone());
        Ok(Some(job))
    }

    fn commit_state(&self, held: &Job, state: State) -> Result<Job, StoreError> {
        let mut jobs = self.lock();
        let stored = stored(&mut jobs, held)?;
        let mut next = stored.clone();
        next.attributes = held.attributes.clone();
        transition(&mut next, state)?;
        self.persist(&next)?;
        *stored = next.clone();
        drop(jobs);

        self.changed.notify_waiters();
        Ok(next)
    }

    fn append_log(&self, held: &Job, text: String) -> Result<LogEntry, StoreError> {
        let entry = LogEntry {
            at: Utc::now(),
            text,
        };
        let mut jobs = self.lock();
        let stored = stored(&mut jobs, held)?;
        let mut next = stored.clone();
        next.log.push(entry.clone());
        next.updated_at = entry.at;
        self.persist(&next)?;
        *stored = next;
        Ok(entry)
    }

    fn persist(&self, job: &Job) -> Result<(), StoreError> {
        let dir = self.job_dir(&job.name);
        let tmp = dir.join(format!("{RECORD_NAME}.tmp"));
        fs::write(&tmp, serde_json::to_vec_pretty(job)?)?;
        fs::rename(&tmp, dir.join(RECORD_NAME))?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Job>> {
        // The index holds plain data; a panic elsewhere cannot leave it torn.
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn unreadable(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.unreadable
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Job names become directory names, so each must be one plain path
/// component.
fn check_name(name: &str) -> Result<(), StoreError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) if part == name => Ok(()),
        _ => Err(StoreError::InvalidName(name.to_string())),
    }
}

fn read_record(path: &Path) -> Result<Job, StoreError> {
    Ok(serde_json::from_slice(&fs::read(path)?)?)
}

/// Looks up the stored record and checks the caller still agrees on its state.
fn stored<'a>(jobs: &'a mut BTreeMap<String, Job>, job: &Job) -> Result<&'a mut Job, StoreError> {
    let stored = jobs
        .get_mut(&job.name)
        .ok_or_else(|| StoreError::JobNotFound(job.name.clone()))?;
    if stored.state != job.state {
        return Err(StoreError::Stale {
            job: job.name.clone(),
            held: job.state,
            actual: stored.state,
        });
    }
    Ok(stored)
}

fn transition(job: &mut Job, next: State) -> Result<(), StoreError> {
    if !job.state.can_transition_to(next) {
        return Err(StoreError::InvalidTransition {
            job: job.name.clone(),
            from: job.state,
            to: next,
        });
    }
    job.state_history.push(job.state);
    job.state = next;
    job.updated_at = Utc::now();
    Ok(())
}

#[async_trait]
impl JobStore for FileStore {
    async fn acquire(&self, old: State, transient: State) -> Result<Job, StoreError> {
        loop {
            let notified = self.index.changed.notified();
            tokio::pin!(notified);
            // Register before looking so a change between the scan and the
            // wait still wakes us.
            notified.as_mut().enable();

            // Stays on this thread: after the compare-and-set there must be
            // no await point before the job is returned.
            if let Some(job) = self.index.try_acquire(old, transient)? {
                tracing::debug!(job = %job.name, from = %old, to = %transient, "acquired");
                return Ok(job);
            }

            if tokio::time::timeout(self.index.poll_interval, notified)
                .await
                .is_err()
            {
                self.blocking(|index| index.discover()).await?;
            }
        }
    }

    async fn set_state(&self, job: &mut Job, state: State) -> Result<(), StoreError> {
        let held = job.clone();
        *job = self
            .blocking(move |index| index.commit_state(&held, state))
            .await?;
        Ok(())
    }

    fn job_dir(&self, name: &str) -> PathBuf {
        self.index.job_dir(name)
    }

    async fn log(&self, job: &mut Job, text: &str) -> Result<(), StoreError> {
        let held = job.clone();
        let text = text.to_string();
        let entry = self
            .blocking(move |index| index.append_log(&held, text))
            .await?;
        job.log.push(entry);
        Ok(())
    }
}
