use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::State;

/// One entry of a job's append-only log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub text: String,
}

/// A single unit of work tracked by the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub state: State,
    #[serde(default)]
    pub state_history: Vec<State>,
    /// Facts recorded by one stage for the stages after it.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub log: Vec<LogEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A freshly uploaded job.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            state: State::Uploaded,
            state_history: Vec::new(),
            attributes: BTreeMap::new(),
            log: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn set_attr(&mut self, key: &str, value: impl Into<String>) {
        self.attributes.insert(key.to_string(), value.into());
    }

    /// Every state the job has been in, oldest first, ending with the current one.
    pub fn states_visited(&self) -> Vec<State> {
        let mut states = self.state_history.clone();
        states.push(self.state);
        states
    }
}
