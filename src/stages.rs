//! The four pipeline stages.
//!
//! Each stage locates its inputs, fails cleanly when they are missing, runs
//! its toolchain commands through the lease, and leaves facts for later
//! stages in job attributes. Command flags come from [`BuildbotConfig`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::BuildbotConfig;
use crate::error::{StageError, WorkError};
use crate::lease::{CODE_DIR, Lease, StageWork};
use crate::runner::RunOptions;
use crate::state_machine::Stage;
use crate::store::ARCHIVE_NAME;

pub const SEASHELL_EXT: &str = "sea";
pub const C_EXT: &str = "cpp";
pub const OBJ_EXT: &str = "o";

/// Host program compiled alongside the hardware function when present.
pub const HOST_SOURCE: &str = "main.cpp";

// Job attributes.
pub const ATTR_SEASHELL_MAIN: &str = "seashell_main";
pub const ATTR_FUNC_MAIN: &str = "func_main";
pub const ATTR_C_MAIN: &str = "c_main";
pub const ATTR_OBJ_MAIN: &str = "obj_main";
pub const ATTR_OBJ_HOST: &str = "obj_host";
pub const ATTR_PLATFORM: &str = "platform";

/// Every stage in pipeline order, sharing one configuration.
pub fn all(config: Arc<BuildbotConfig>) -> Vec<Arc<dyn StageWork>> {
    vec![
        Arc::new(Unpack::new(Arc::clone(&config))),
        Arc::new(Seashell::new(Arc::clone(&config))),
        Arc::new(Hls::new(Arc::clone(&config))),
        Arc::new(Synth::new(config)),
    ]
}

/// Unpacks the uploaded archive into the code directory.
pub struct Unpack {
    config: Arc<BuildbotConfig>,
}

impl Unpack {
    pub fn new(config: Arc<BuildbotConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StageWork for Unpack {
    fn stage(&self) -> Stage {
        Stage::Unpack
    }

    async fn process(&self, lease: &mut Lease) -> Result<(), StageError> {
        let mut cmd = self.config.unzip_command.clone();
        cmd.extend(["-d", CODE_DIR, ARCHIVE_NAME].map(String::from));
        lease.run(&cmd, RunOptions::default(), true).await?;

        // Archives often wrap everything in one top-level directory.
        if let Some(name) = collapse_single_dir(&lease.code_dir()).await? {
            lease.log(&format!("collapsed directory {name}")).await?;
        }
        Ok(())
    }
}

/// If `dir` holds exactly one entry and it is a directory, hoists that
/// directory's contents into `dir` and removes it. Returns the name of the
/// collapsed directory.
pub async fn collapse_single_dir(dir: &Path) -> std::io::Result<Option<String>> {
    let entries = list_dir(dir).await?;
    let [(name, is_dir)] = entries.as_slice() else {
        return Ok(None);
    };
    if !is_dir {
        return Ok(None);
    }

    // Move it aside first so a child sharing its name can take its place.
    let staging = dir.join(format!(".collapse-{}", uuid::Uuid::new_v4()));
    tokio::fs::rename(dir.join(name), &staging).await?;
    for (child, _) in list_dir(&staging).await? {
        tokio::fs::rename(staging.join(&child), dir.join(&child)).await?;
    }
    tokio::fs::remove_dir(&staging).await?;
    Ok(Some(name.clone()))
}

/// Entry names with a "is a directory" flag, sorted by name. Symlinks are
/// reported as non-directories.
async fn list_dir(dir: &Path) -> std::io::Result<Vec<(String, bool)>> {
    let mut out = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        out.push((name, entry.file_type().await?.is_dir()));
    }
    out.sort();
    Ok(out)
}

/// Compiles the Seashell source to HLS C.
pub struct Seashell {
    config: Arc<BuildbotConfig>,
}

impl Seashell {
    pub fn new(config: Arc<BuildbotConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StageWork for Seashell {
    fn stage(&self) -> Stage {
        Stage::Seashell
    }

    async fn process(&self, lease: &mut Lease) -> Result<(), StageError> {
        let code_dir = lease.code_dir();
        let sources = find_sources(&code_dir).await?;
        let Some(source) = sources.first().cloned() else {
            return Err(WorkError::msg("no source file found").into());
        };
        if sources.len() > 1 {
            lease
                .log(&format!(
                    "multiple source files found ({}); using {source}",
                    sources.join(", ")
                ))
                .await?;
        }
        lease.job_mut().set_attr(ATTR_SEASHELL_MAIN, &source);

        let code = tokio::fs::read(code_dir.join(&source)).await?;
        let cmd = vec![self.config.seashell_compiler.clone()];
        let hls_code = lease
            .run(&cmd, RunOptions::default().input(code), false)
            .await?
            .stdout;

        let base = Path::new(&source)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let c_name = format!("{base}.{C_EXT}");
        let obj_name = format!("{base}.{OBJ_EXT}");
        let job = lease.job_mut();
        job.set_attr(ATTR_FUNC_MAIN, &base);
        job.set_attr(ATTR_C_MAIN, &c_name);
        job.set_attr(ATTR_OBJ_MAIN, &obj_name);

        tokio::fs::write(code_dir.join(&c_name), hls_code).await?;
        Ok(())
    }
}

/// Regular files in `dir` carrying the Seashell extension, sorted by name.
async fn find_sources(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut sources = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_source = path.extension().is_some_and(|ext| ext == SEASHELL_EXT);
        if is_source && entry.file_type().await?.is_file() {
            sources.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    sources.sort();
    Ok(sources)
}

/// Fixed pieces of every toolchain invocation that builds against the
/// hardware function.
struct HwTarget {
    platform: String,
    func: String,
    c_src: String,
}

impl HwTarget {
    fn from_lease(lease: &Lease, config: &BuildbotConfig) -> Result<Self, WorkError> {
        let platform = lease
            .job()
            .attr(ATTR_PLATFORM)
            .unwrap_or(&config.platform)
            .to_string();
        Ok(Self {
            platform,
            func: lease.require_attr(ATTR_FUNC_MAIN)?,
            c_src: lease.require_attr(ATTR_C_MAIN)?,
        })
    }

    fn args(&self, config: &BuildbotConfig) -> Vec<String> {
        [
            "-sds-pf",
            self.platform.as_str(),
            "-sds-hw",
            self.func.as_str(),
            self.c_src.as_str(),
            "-sds-end",
            "-clkid",
            config.clock_id.as_str(),
        ]
        .map(String::from)
        .to_vec()
    }
}

/// Prefix, tool, then `args`.
fn hls_command(config: &BuildbotConfig, args: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut cmd = config.hls_command_prefix.clone();
    cmd.push(config.hls_tool.clone());
    cmd.extend(args);
    cmd
}

fn compile_command(
    config: &BuildbotConfig,
    target: &HwTarget,
    extra: &[&str],
    src: &str,
    obj: &str,
) -> Vec<String> {
    let stem = Path::new(src)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut args = target.args(config);
    args.extend(config.compile_flags.iter().cloned());
    args.extend(extra.iter().map(|s| s.to_string()));
    args.extend(["-c", "-MMD", "-MP"].map(String::from));
    args.extend([format!("-MF{stem}.d"), src.to_string()]);
    args.extend(["-o".to_string(), obj.to_string()]);
    hls_command(config, args)
}

/// Compiles the HLS C (and the host program, if any) to object files.
pub struct Hls {
    config: Arc<BuildbotConfig>,
}

impl Hls {
    pub fn new(config: Arc<BuildbotConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StageWork for Hls {
    fn stage(&self) -> Stage {
        Stage::Hls
    }

    async fn process(&self, lease: &mut Lease) -> Result<(), StageError> {
        let config = &*self.config;
        let target = HwTarget::from_lease(lease, config)?;
        let obj_hw = lease.require_attr(ATTR_OBJ_MAIN)?;
        let code_dir = lease.code_dir();

        let pf_info = hls_command(config, ["-sds-pf-info".to_string(), target.platform.clone()]);
        lease.run(&pf_info, RunOptions::in_dir(&code_dir), true).await?;

        let hw = compile_command(config, &target, &[], &target.c_src, &obj_hw);
        lease.run(&hw, RunOptions::in_dir(&code_dir), true).await?;

        if code_dir.join(HOST_SOURCE).is_file() {
            let obj_host = host_object_name();
            let host = compile_command(config, &target, &["-DSDSOC"], HOST_SOURCE, &obj_host);
            lease.run(&host, RunOptions::in_dir(&code_dir), true).await?;
            lease.job_mut().set_attr(ATTR_OBJ_HOST, obj_host);
        }
        Ok(())
    }
}

fn host_object_name() -> String {
    let stem = Path::new(HOST_SOURCE)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{stem}.{OBJ_EXT}")
}

/// Links the object files into the final bitstream.
pub struct Synth {
    config: Arc<BuildbotConfig>,
}

impl Synth {
    pub fn new(config: Arc<BuildbotConfig>) -> Self {
        Self { config }
    }

    /// Where the bitstream ends up for a leased job.
    pub fn bitstream_path(&self, lease: &Lease) -> PathBuf {
        lease.code_dir().join(&self.config.bitstream_name)
    }
}

#[async_trait]
impl StageWork for Synth {
    fn stage(&self) -> Stage {
        Stage::Synth
    }

    async fn process(&self, lease: &mut Lease) -> Result<(), StageError> {
        let config = &*self.config;
        let target = HwTarget::from_lease(lease, config)?;
        let mut objects = vec![lease.require_attr(ATTR_OBJ_MAIN)?];
        if let Some(host) = lease.job().attr(ATTR_OBJ_HOST) {
            objects.push(host.to_string());
        }

        let mut args = target.args(config);
        args.extend(config.link_flags.iter().cloned());
        args.extend(objects);
        args.extend(["-o".to_string(), config.bitstream_name.clone()]);
        let cmd = hls_command(config, args);
        let code_dir = lease.code_dir();
        lease.run(&cmd, RunOptions::in_dir(code_dir), true).await?;

        let bitstream = self.bitstream_path(lease);
        tracing::debug!(job = %lease.job().name, bitstream = %bitstream.display(), "synthesized");
        Ok(())
    }
}
