use anyhow::{Context, Result};
use bytesize::ByteSize;
use serde::Serialize;

use super::{missing_tools, SourceArgs};
use crate::builders::tools::HostRunner;
use crate::builders::tree::{EstimateOpts, SizeEstimate, Tree};
use crate::builders::{self, BuildError};
use crate::{print_object, OutputFormat};

/// Estimate command.
#[derive(Clone, Debug, clap::Parser)]
pub struct EstimateArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Filesystem block size in bytes.
    #[arg(long, value_name = "BYTES", default_value_t = EstimateOpts::default().block_size)]
    pub block_size: u64,

    /// Inode size in bytes.
    #[arg(long, value_name = "BYTES", default_value_t = EstimateOpts::default().inode_size)]
    pub inode_size: u64,

    /// Filesystem overhead and safety margin, in percent.
    #[arg(long, value_name = "PERCENT", default_value_t = EstimateOpts::default().margin_percent)]
    pub margin: u64,
}

/// Printed result of the estimate command.
#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct EstimateReport {
    #[serde(rename = "ref")]
    refspec: String,
    commit: String,
    size: String,
    estimate: SizeEstimate,
}

impl EstimateArgs {
    /// Run estimate subcommand.
    pub fn run(&self, format: OutputFormat) -> Result<()> {
        let manifest = self.source.load_manifest()?;
        if !missing_tools(&["ostree"]).is_empty() {
            return Err(BuildError::Precondition("ostree not found in PATH".to_string()).into());
        }

        let runner = HostRunner;
        let tree = Tree::new(&runner, &manifest, &self.source.arch, &self.source.workdir);
        builders::prepare_tree(&tree, &manifest.remote_url)?;
        let commit = tree.resolve_commit()?;
        let opts = EstimateOpts {
            block_size: self.block_size,
            inode_size: self.inode_size,
            margin_percent: self.margin,
        };
        let estimate = tree
            .estimate_disk_size(&commit, &opts)
            .context(format!("failed to estimate size of {}", commit))?;

        let report = EstimateReport {
            refspec: tree.main_ref().to_string(),
            commit,
            size: ByteSize::b(estimate.bytes()).to_string_as(true),
            estimate,
        };
        print_object(format, &report)
    }
}
