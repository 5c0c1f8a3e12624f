//! Command line commands.

use anyhow::{Context, Result};
use clap::ValueHint;
use std::path::PathBuf;

use crate::manifest::Manifest;

pub mod build;
pub mod estimate;

/// Where the tree comes from and for which architecture.
#[derive(Clone, Debug, clap::Args)]
pub struct SourceArgs {
    /// Image manifest (YAML).
    #[arg(long, short = 'm', value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub manifest: PathBuf,

    /// Work directory.
    ///
    /// Temporary build files and the mirrored repository are kept here.
    #[arg(
        long,
        short = 'w',
        value_name = "DIR",
        value_hint = ValueHint::DirPath,
        default_value = "/var/tmp"
    )]
    pub workdir: PathBuf,

    /// Target architecture.
    #[arg(long, value_name = "ARCH", default_value = std::env::consts::ARCH)]
    pub arch: String,

    /// Use local OSTree repository instead of the remote one from the manifest.
    #[arg(long, value_name = "DIR", value_hint = ValueHint::DirPath)]
    pub repo: Option<PathBuf>,
}

impl SourceArgs {
    /// Load manifest, applying `--repo` override.
    pub fn load_manifest(&self) -> Result<Manifest> {
        let mut manifest = Manifest::load(&self.manifest)
            .context(format!("failed to load {}", self.manifest.display()))?;
        if let Some(repo) = &self.repo {
            let repo = std::path::absolute(repo)
                .context(format!("invalid repository path {}", repo.display()))?;
            manifest.use_local_repo(&repo);
        }
        Ok(manifest)
    }
}

/// External programs from `tools` not found in `PATH`.
pub fn missing_tools<'t>(tools: &[&'t str]) -> Vec<&'t str> {
    tools
        .iter()
        .copied()
        .filter(|tool| which::which(tool).is_err())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_tools() {
        assert!(missing_tools(&["sh"]).is_empty());
        assert_eq!(
            missing_tools(&["sh", "osimgcreate-no-such-tool"]),
            vec!["osimgcreate-no-such-tool"]
        );
    }
}
