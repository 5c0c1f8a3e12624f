use clap::{CommandFactory as _, Parser as _};
use clap_complete::Shell;
use log::error;
use patharg::OutputArg;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

mod builders;
mod commands;
mod manifest;
mod utils;
mod version;

use builders::BuildError;
use commands::*;
use utils::*;
use version::get_long_version;

/// Create bootable OS images from OSTree repositories.
#[derive(Clone, Debug, clap::Parser)]
#[command(version, long_version = get_long_version(), about)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Sets the output format.
    #[arg(
        global = true,
        short = 'F',
        long,
        default_value_t,
        env = "OSIMGCREATE_FORMAT"
    )]
    format: OutputFormat,
}

impl Cli {
    /// Match the command and run it.
    pub fn run(&self) -> anyhow::Result<()> {
        match &self.command {
            Command::Build(build_args) => build_args.run(self.format),
            Command::Estimate(estimate_args) => estimate_args.run(self.format),
            Command::GenerateCompletion { shell, file } => {
                generate_completion(*shell, file.path_ref())
            }
        }
    }
}

/// Main commands of the CLI application.
#[derive(Clone, Debug, clap::Subcommand)]
pub enum Command {
    /// Build a disk or live image described by a manifest.
    Build(build::BuildArgs),

    /// Estimate the size of a filesystem holding the OS tree.
    Estimate(estimate::EstimateArgs),

    /// Generate shell completion scripts.
    GenerateCompletion {
        /// The shell to generate the completion scripts for.
        shell: clap_complete::Shell,

        /// The file to write the completion scripts to or '-' to write to stdout.
        #[arg(short, long, default_value_t)]
        file: OutputArg,
    },
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_target(false)
        .format_module_path(false)
        .init();
}

fn main() -> ExitCode {
    init_logger();
    match Cli::parse().run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<BuildError>() {
                Some(BuildError::Precondition(message)) => error!("{}", message),
                _ => error!("{:#}", err),
            }
            ExitCode::FAILURE
        }
    }
}

/// Generates shell completion scripts for the command-line tool.
fn generate_completion(shell: Shell, path: Option<&PathBuf>) -> anyhow::Result<()> {
    eprintln!("Generating completion file for {shell}...");
    let mut cmd = Cli::command();
    let name = env!("CARGO_PKG_NAME");
    if let Some(file) = path {
        let mut file = File::create(file)?;
        clap_complete::generate(shell, &mut cmd, name, &mut file);
    } else {
        clap_complete::generate(shell, &mut cmd, name, &mut io::stdout());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::Cli;
    use clap::CommandFactory as _;

    #[test]
    fn test_cli() {
        Cli::command().debug_assert();
    }
}
