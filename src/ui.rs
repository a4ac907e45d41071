//! Terminal output for the CLI, coloured with `console`.
//!
//! Green for jobs that reached the end of the pipeline, red for failed
//! ones, yellow for everything still in flight.

use console::Style;

use crate::state_machine::{Job, State};

pub struct JobView {
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl Default for JobView {
    fn default() -> Self {
        Self {
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }
}

impl JobView {
    fn state_style(&self, state: State) -> &Style {
        match state {
            State::Failed => &self.red,
            state if state.is_terminal() => &self.green,
            _ => &self.yellow,
        }
    }

    /// One line per job: name, state, last update.
    pub fn status_lines(&self, jobs: &[Job]) -> Vec<String> {
        let width = jobs.iter().map(|j| j.name.len()).max().unwrap_or(0);
        jobs.iter()
            .map(|job| {
                let state = format!("{:<12}", job.state.to_string());
                format!(
                    "{:<width$}  {} {}",
                    job.name,
                    self.state_style(job.state).apply_to(state),
                    self.dim
                        .apply_to(job.updated_at.format("%Y-%m-%d %H:%M:%S")),
                )
            })
            .collect()
    }

    pub fn print_status(&self, jobs: &[Job]) {
        if jobs.is_empty() {
            println!("{}", self.dim.apply_to("no jobs"));
            return;
        }
        for line in self.status_lines(jobs) {
            println!("{line}");
        }
    }

    /// Attributes, then every log entry with its timestamp.
    pub fn print_log(&self, job: &Job) {
        println!(
            "{} {}",
            job.name,
            self.state_style(job.state).apply_to(job.state.to_string())
        );
        let history: Vec<String> = job.states_visited().iter().map(State::to_string).collect();
        println!("  {}", self.dim.apply_to(history.join(" -> ")));
        for (key, value) in &job.attributes {
            println!("  {} = {value}", self.dim.apply_to(key));
        }
        for entry in &job.log {
            println!();
            println!(
                "{}",
                self.dim
                    .apply_to(format!("[{}]", entry.at.format("%Y-%m-%d %H:%M:%S")))
            );
            println!("{}", entry.text);
        }
    }
}
