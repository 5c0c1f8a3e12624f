use anyhow::{Context, Result};
use clap::ValueHint;
use log::info;
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::OffsetDateTime;

use super::{missing_tools, SourceArgs};
use crate::builders::tools::HostRunner;
use crate::builders::{self, BuildError, BuildOpts};
use crate::manifest::{ImageType, Manifest};
use crate::{print_object, OutputFormat};

/// Overlay directories must carry this file, it marks them as image configuration.
const CONFIGDIR_MARKER: &str = "README-devel.md";

/// Build command.
#[derive(Clone, Debug, clap::Parser)]
pub struct BuildArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Directory with files copied onto live media.
    ///
    /// `@@FSLABEL@@` and `@@KERNEL-ARGS@@` are substituted in every copied file.
    #[arg(long, short = 'c', value_name = "DIR", value_hint = ValueHint::DirPath)]
    pub configdir: Option<PathBuf>,

    /// Output image file.
    ///
    /// Defaults to '<osname>-<timestamp>-<arch>' with an extension matching the image type.
    #[arg(long, short = 'o', value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub output: Option<PathBuf>,

    /// Filesystem label of live media (at most 32 bytes, longer labels are truncated).
    #[arg(long, value_name = "LABEL")]
    pub fslabel: Option<String>,

    /// Overwrite existing output file.
    #[arg(long, short = 'f')]
    pub force: bool,

    /// Directory with isolinux binaries.
    #[arg(
        long,
        value_name = "DIR",
        value_hint = ValueHint::DirPath,
        default_value = "/usr/share/syslinux"
    )]
    pub syslinux_dir: PathBuf,
}

impl BuildArgs {
    /// Run build subcommand.
    pub fn run(&self, format: OutputFormat) -> Result<()> {
        let manifest = self.source.load_manifest()?;
        check_options(&manifest, self.fslabel.as_deref(), self.configdir.as_deref())?;

        // SAFETY: geteuid() has no preconditions and cannot fail.
        if unsafe { libc::geteuid() } != 0 {
            return Err(BuildError::Precondition("Please run this as root!".to_string()).into());
        }

        let tools = builders::required_tools(&manifest, &self.source.arch);
        let missing = missing_tools(&tools);
        if !missing.is_empty() {
            return Err(BuildError::Precondition(format!(
                "Required tools not found in PATH: {}",
                missing.join(", ")
            ))
            .into());
        }

        let timestamp = build_timestamp(OffsetDateTime::now_utc())?;
        let output = match &self.output {
            Some(output) => output.clone(),
            None => default_output(&manifest, &timestamp, &self.source.arch),
        };
        let output = std::path::absolute(&output)
            .context(format!("invalid output path {}", output.display()))?;

        let opts = BuildOpts {
            manifest,
            arch: self.source.arch.clone(),
            workdir: self.source.workdir.clone(),
            configdir: self.configdir.clone(),
            output,
            fslabel: self.fslabel.clone(),
            force: self.force,
            syslinux_dir: self.syslinux_dir.clone(),
            timestamp,
        };
        info!(
            "building {} image for {}",
            opts.manifest.image_type, opts.arch
        );
        let summary = builders::build(&opts, &HostRunner)?;
        print_object(format, &summary)
    }
}

/// Reject option combinations that make no sense for the manifest.
fn check_options(
    manifest: &Manifest,
    fslabel: Option<&str>,
    configdir: Option<&Path>,
) -> Result<(), BuildError> {
    if fslabel.is_some() && manifest.image_type != ImageType::Live {
        return Err(BuildError::Precondition(format!(
            "'--fslabel' is only valid for live images, not {}",
            manifest.image_type
        )));
    }
    if let Some(configdir) = configdir {
        if !configdir.join(CONFIGDIR_MARKER).is_file() {
            return Err(BuildError::Precondition(format!(
                "'{}' is not an image configuration directory (no {} found)",
                configdir.display(),
                CONFIGDIR_MARKER
            )));
        }
    }
    Ok(())
}

/// Timestamp embedded in default names, `YYYYmmddHHMM`.
fn build_timestamp(now: OffsetDateTime) -> Result<String> {
    now.format(format_description!("[year][month][day][hour][minute]"))
        .context("failed to format build timestamp")
}

fn default_output(manifest: &Manifest, timestamp: &str, arch: &str) -> PathBuf {
    PathBuf::from(format!(
        "{}-{}-{}.{}",
        manifest.osname,
        timestamp,
        arch,
        manifest.image_type.extension()
    ))
}
