mod job;
mod state;

pub use job::{Job, LogEntry};
pub use state::{Stage, State};
