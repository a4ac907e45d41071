//! Buildbot configuration loaded from `buildbot.toml`.
//!
//! [`BuildbotConfig`] holds the toolchain locations and flags the stages
//! forward to external commands. Missing keys fall back to defaults.
//! `SEASHELL_COMPILER` and `BUILDBOT_JOBS_DIR` take precedence over the file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildbotConfig {
    /// Root directory of the job store.
    #[serde(default = "default_jobs_dir")]
    pub jobs_dir: PathBuf,

    /// Seashell compiler executable; reads source on stdin, writes HLS C on stdout.
    #[serde(default = "default_seashell_compiler")]
    pub seashell_compiler: String,

    /// Prepended to every HLS toolchain command (environment wrappers and such).
    #[serde(default)]
    pub hls_command_prefix: Vec<String>,

    #[serde(default = "default_hls_tool")]
    pub hls_tool: String,

    /// Target platform when the job does not name one.
    #[serde(default = "default_platform")]
    pub platform: String,

    #[serde(default = "default_clock_id")]
    pub clock_id: String,

    /// Flags for object compilation.
    #[serde(default = "default_compile_flags")]
    pub compile_flags: Vec<String>,

    /// Flags for the final link/synthesis.
    #[serde(default = "default_link_flags")]
    pub link_flags: Vec<String>,

    /// Output name of the synthesized bitstream.
    #[serde(default = "default_bitstream_name")]
    pub bitstream_name: String,

    /// Archive extraction command; `-d <dir> <archive>` is appended.
    #[serde(default = "default_unzip_command")]
    pub unzip_command: Vec<String>,

    /// Per-command timeout in seconds.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// How often a waiting worker rescans the store for new jobs.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_jobs_dir() -> PathBuf {
    PathBuf::from("jobs")
}

fn default_seashell_compiler() -> String {
    "seac".to_string()
}

fn default_hls_tool() -> String {
    "sds++".to_string()
}

fn default_platform() -> String {
    "zed".to_string()
}

fn default_clock_id() -> String {
    "3".to_string()
}

fn default_compile_flags() -> Vec<String> {
    ["-poll-mode", "1", "-verbose", "-Wall", "-O3"]
        .map(String::from)
        .to_vec()
}

fn default_link_flags() -> Vec<String> {
    ["-poll-mode", "1", "-verbose", "-O3"].map(String::from).to_vec()
}

fn default_bitstream_name() -> String {
    "sdsoc".to_string()
}

fn default_unzip_command() -> Vec<String> {
    vec!["unzip".to_string()]
}

// 30 minutes.
fn default_command_timeout_secs() -> u64 {
    60 * 30
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for BuildbotConfig {
    fn default() -> Self {
        Self {
            jobs_dir: default_jobs_dir(),
            seashell_compiler: default_seashell_compiler(),
            hls_command_prefix: Vec::new(),
            hls_tool: default_hls_tool(),
            platform: default_platform(),
            clock_id: default_clock_id(),
            compile_flags: default_compile_flags(),
            link_flags: default_link_flags(),
            bitstream_name: default_bitstream_name(),
            unzip_command: default_unzip_command(),
            command_timeout_secs: default_command_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl BuildbotConfig {
    /// Loads `buildbot.toml` from the current directory, or defaults if absent.
    pub fn load() -> Result<Self> {
        let path = Path::new("buildbot.toml");
        let config = if path.exists() {
            Self::parse_file(path)?
        } else {
            Self::default()
        };
        Ok(config.with_env_overrides())
    }

    /// Loads an explicit configuration file, which must exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        Ok(Self::parse_file(path)?.with_env_overrides())
    }

    fn parse_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = toml::from_str::<BuildbotConfig>(&contents)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    fn with_env_overrides(mut self) -> Self {
        if let Some(compiler) = non_empty_env("SEASHELL_COMPILER") {
            self.seashell_compiler = compiler;
        }
        if let Some(dir) = non_empty_env("BUILDBOT_JOBS_DIR") {
            self.jobs_dir = PathBuf::from(dir);
        }
        self
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = BuildbotConfig::default();
        assert_eq!(config.jobs_dir, PathBuf::from("jobs"));
        assert_eq!(config.hls_tool, "sds++");
        assert_eq!(config.platform, "zed");
        assert_eq!(config.unzip_command, vec!["unzip"]);
        assert!(config.hls_command_prefix.is_empty());
        assert_eq!(config.command_timeout(), Duration::from_secs(1800));
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            seashell_compiler = "/opt/seashell/bin/seac"
            hls_command_prefix = ["env", "XILINX=1"]
            command_timeout_secs = 60
        "#;
        let config: BuildbotConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.seashell_compiler, "/opt/seashell/bin/seac");
        assert_eq!(config.hls_command_prefix, vec!["env", "XILINX=1"]);
        assert_eq!(config.command_timeout(), Duration::from_secs(60));
        assert_eq!(config.platform, "zed");
        assert_eq!(config.compile_flags, default_compile_flags());
    }

    #[test]
    fn load_from_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "platform = \"zcu102\"\npoll_interval_ms = 50\n").unwrap();

        let config = BuildbotConfig::load_from(&path).unwrap();
        assert_eq!(config.platform, "zcu102");
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
    }

    #[test]
    fn load_from_missing_file_fails() {
        let result = BuildbotConfig::load_from(Path::new("/definitely/not/here.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn load_from_rejects_bad_toml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "command_timeout_secs = \"soon\"").unwrap();
        assert!(BuildbotConfig::load_from(&path).is_err());
    }
}
