//! Command-line interface built on clap.
//!
//! [`Cli`] carries the global flags (`--config`, `--verbose`) and the
//! [`Command`] subcommands: run, submit, status, log.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Buildbot: drives uploaded Seashell projects through the HLS toolchain.
#[derive(Debug, Parser)]
#[command(name = "buildbot", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (defaults to ./buildbot.toml when present).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs one worker per stage until interrupted.
    Run,

    /// Creates a job from a zip archive.
    Submit {
        /// Path to the zip archive.
        archive: PathBuf,

        /// Job name; a random one is generated if omitted.
        #[arg(long)]
        name: Option<String>,
    },

    /// Shows the state of every job, or of one job.
    Status {
        name: Option<String>,
    },

    /// Prints a job's attributes and log.
    Log {
        name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from(["buildbot", "run"]);
        assert!(matches!(cli.command, Command::Run));
        assert!(!cli.verbose);
        assert!(cli.config.is_none());
    }

    #[test]
    fn cli_parses_submit_with_name() {
        let cli = Cli::parse_from(["buildbot", "submit", "proj.zip", "--name", "vsadd"]);
        match cli.command {
            Command::Submit { archive, name } => {
                assert_eq!(archive, PathBuf::from("proj.zip"));
                assert_eq!(name.as_deref(), Some("vsadd"));
            }
            _ => panic!("expected Submit command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from(["buildbot", "--config", "ci.toml", "-v", "status"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("ci.toml")));
        assert!(matches!(cli.command, Command::Status { name: None }));
    }

    #[test]
    fn cli_requires_log_job_name() {
        assert!(Cli::try_parse_from(["buildbot", "log"]).is_err());
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
