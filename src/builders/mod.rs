//! Image builders.
//!
//! [`build`] is the entry point: it checks preconditions and runs either the disk
//! or the live pipeline.

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::manifest::{ImageType, Manifest};

pub mod bootloader;
mod core;
mod deploy;
mod directory;
mod disk;
mod filesystem;
mod live;
pub mod partition;
mod scope;
pub mod tools;
pub mod tree;

pub use self::core::{Pipeline, Step, Steps};

use self::tools::{Tool, ToolRunner};
use self::tree::{Tree, DEFAULT_PRUNE_HORIZON};

/// User-defined build options.
///
/// These options should be used as read-only during build.
/// Mutable state lives in the build context of each builder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildOpts {
    pub manifest: Manifest,

    /// Target architecture, e.g. `x86_64`.
    pub arch: String,

    /// Parent of the temporary workspace and home of the mirrored repository.
    pub workdir: PathBuf,

    /// Overlay copied onto the live media.
    pub configdir: Option<PathBuf>,

    /// Final artifact path.
    pub output: PathBuf,

    /// Filesystem label of live media. Defaults to the volume identifier.
    pub fslabel: Option<String>,

    /// Overwrite existing output.
    pub force: bool,

    /// Directory with isolinux binaries.
    pub syslinux_dir: PathBuf,

    /// Build timestamp, `YYYYmmddHHMM`.
    pub timestamp: String,
}

/// Build failure categories that callers handle specially.
#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    /// The build refuses to start. Nothing was acquired.
    #[error("{0}")]
    Precondition(String),

    /// Deploy tooling reported success but the deployment is not there.
    #[error("deployment of commit {commit} not found at {path}")]
    MissingDeployment { commit: String, path: PathBuf },

    /// Cannot perform action because required element in the context wasn't found.
    #[error("internal builder error: cannot {action:?}: {context_elem:?} not found")]
    InvalidContext {
        action: String,
        context_elem: String,
    },
}

impl BuildError {
    pub fn invalid_context(action: &str, context_elem: &str) -> Self {
        Self::InvalidContext {
            action: action.to_string(),
            context_elem: context_elem.to_string(),
        }
    }
}

/// Summary of a finished build.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BuildSummary {
    pub image_type: ImageType,
    pub arch: String,
    pub commit: String,
    pub output: PathBuf,
}

/// Build the image described by `opts`.
pub fn build(opts: &BuildOpts, runner: &dyn ToolRunner) -> Result<BuildSummary> {
    check_output(&opts.output, opts.force)?;
    let commit = if opts.manifest.image_type.is_disk() {
        disk::build(opts, runner)?
    } else {
        live::build(opts, runner)?
    };
    info!("image written to {}", opts.output.display());
    Ok(BuildSummary {
        image_type: opts.manifest.image_type,
        arch: opts.arch.clone(),
        commit,
        output: opts.output.clone(),
    })
}

/// Refuse to overwrite existing output unless forced.
pub fn check_output(output: &Path, force: bool) -> Result<(), BuildError> {
    if output.exists() && !force {
        return Err(BuildError::Precondition(format!(
            "Output file '{}' already exists. Use '--force' to overwrite it.",
            output.display()
        )));
    }
    Ok(())
}

/// External programs needed to build `manifest` for `arch`.
pub fn required_tools(manifest: &Manifest, arch: &str) -> Vec<&'static str> {
    let mut tools = vec!["ostree", "mkfs.ext4", "mount", "umount"];
    if manifest.selinux {
        tools.extend(["matchpathcon", "chcon"]);
    }
    if manifest.image_type.is_disk() {
        tools.extend(["losetup", "sfdisk", "sync", "mkfs.fat", "chattr", "fstrim"]);
        if partition::has_bios_boot(arch) {
            tools.push("grub2-install");
        }
        if matches!(manifest.image_type, ImageType::Qemu | ImageType::Vmware) {
            tools.push("qemu-img");
        }
    } else {
        tools.extend(["mksquashfs", "genisoimage", "implantisomd5"]);
        if partition::has_bios_boot(arch) {
            tools.push("isohybrid");
        }
    }
    tools
}

/// Make the tree available locally: mirror remote repositories, use local ones in place.
///
/// A failed mirror removes the repository. A failed prune is only a warning.
pub(crate) fn prepare_tree(tree: &Tree<'_>, url: &str) -> Result<()> {
    if tree.is_local() {
        info!("using local repository {}", tree.repo_path().display());
        return Ok(());
    }

    info!("mirroring {} into {}", url, tree.repo_path().display());
    if let Err(err) = tree.mirror(url) {
        if let Err(rm_err) = fs::remove_dir_all(tree.repo_path()) {
            warn!(
                "failed to remove repository {}: {}",
                tree.repo_path().display(),
                rm_err
            );
        }
        return Err(anyhow!(err).context("failed to mirror tree"));
    }

    if let Err(err) = tree.prune(DEFAULT_PRUNE_HORIZON) {
        warn!("failed to prune repository: {}", err);
    }
    Ok(())
}

/// Move finished image to `output` and hand it to the invoking user.
pub(crate) fn finalize(image: &Path, output: &Path) -> Result<()> {
    debug!("moving {} to {}", image.display(), output.display());
    fs::rename(image, output).context(format!(
        "failed to move image to {}",
        output.display()
    ))?;
    if let Some((uid, gid)) = sudo_ids(std::env::var("SUDO_UID").ok(), std::env::var("SUDO_GID").ok()) {
        if let Err(err) = std::os::unix::fs::chown(output, Some(uid), Some(gid)) {
            warn!(
                "failed to change owner of {} to {}:{}: {}",
                output.display(),
                uid,
                gid,
                err
            );
        }
    }
    Ok(())
}

/// Invoking user behind `sudo`.
fn sudo_ids(uid: Option<String>, gid: Option<String>) -> Option<(u32, u32)> {
    let uid = uid?.parse().ok()?;
    let gid = gid?.parse().ok()?;
    Some((uid, gid))
}

/// Convert raw disk image into the format of `image_type`.
///
/// Returns path of the converted image, or `raw` itself for raw types.
pub(crate) fn convert_image(
    runner: &dyn ToolRunner,
    image_type: ImageType,
    raw: &Path,
) -> Result<PathBuf> {
    let tool = match image_type {
        ImageType::Qemu => Tool::new("qemu-img").args(["convert", "-c", "-O", "qcow2"]),
        ImageType::Vmware => Tool::new("qemu-img").args([
            "convert",
            "-O",
            "vmdk",
            "-o",
            "adapter_type=lsilogic,subformat=streamOptimized,compat6",
        ]),
        _ => return Ok(raw.to_path_buf()),
    };
    let converted = raw.with_extension(image_type.extension());
    info!("converting image to {}", image_type.extension());
    runner
        .run(&tool.arg(raw).arg(&converted))
        .context("failed to convert image")?;
    Ok(converted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::tools::fake::FakeRunner;
    use tempdir::TempDir;

    fn manifest(image_type: &str, remote: &str) -> Manifest {
        Manifest::parse(&format!(
            "type: {}\nosname: liri\nmain-ref: os/x86_64/stable\nremote-url: {}\n",
            image_type, remote
        ))
        .expect("valid manifest")
    }

    #[test]
    fn test_check_output() -> Result<()> {
        let tmp = TempDir::new("builders-test")?;
        let output = tmp.path().join("out.img");
        check_output(&output, false)?;
        fs::write(&output, b"")?;
        assert!(matches!(
            check_output(&output, false),
            Err(BuildError::Precondition(_))
        ));
        check_output(&output, true)?;
        Ok(())
    }

    #[test]
    fn test_sudo_ids() {
        assert_eq!(
            sudo_ids(Some("1000".to_string()), Some("100".to_string())),
            Some((1000, 100))
        );
        assert_eq!(sudo_ids(Some("1000".to_string()), None), None);
        assert_eq!(sudo_ids(Some("abc".to_string()), Some("1".to_string())), None);
    }

    #[test]
    fn test_required_tools() {
        let disk = required_tools(&manifest("qemu", "https://example.org"), "x86_64");
        assert!(disk.contains(&"grub2-install"));
        assert!(disk.contains(&"qemu-img"));
        assert!(!disk.contains(&"genisoimage"));
        let live = required_tools(&manifest("live", "https://example.org"), "aarch64");
        assert!(live.contains(&"mksquashfs"));
        assert!(!live.contains(&"isohybrid"));
        assert!(!live.contains(&"losetup"));
    }

    #[test]
    fn test_mirror_failure_removes_repository() -> Result<()> {
        let tmp = TempDir::new("builders-test")?;
        let runner = FakeRunner::new();
        runner.on_arg("ostree", "pull", |_| {
            Err(tools::ToolError::failed("ostree", "exit status: 1", "timeout"))
        });
        let manifest = manifest("disk", "https://example.org");
        let tree = Tree::new(&runner, &manifest, "x86_64", tmp.path());
        assert!(prepare_tree(&tree, &manifest.remote_url).is_err());
        assert!(!tmp.path().join("repo").exists());
        assert_eq!(runner.count("ostree", "prune"), 0);
        Ok(())
    }

    #[test]
    fn test_prune_failure_is_not_fatal() -> Result<()> {
        let tmp = TempDir::new("builders-test")?;
        let runner = FakeRunner::new();
        runner.on_arg("ostree", "prune", |_| {
            Err(tools::ToolError::failed("ostree", "exit status: 1", "locked"))
        });
        let manifest = manifest("disk", "https://example.org");
        let tree = Tree::new(&runner, &manifest, "x86_64", tmp.path());
        prepare_tree(&tree, &manifest.remote_url)?;
        assert_eq!(runner.count("ostree", "prune"), 1);
        Ok(())
    }

    #[test]
    fn test_local_repository_is_not_mirrored() -> Result<()> {
        let tmp = TempDir::new("builders-test")?;
        let runner = FakeRunner::new();
        let manifest = manifest("disk", "file:///srv/repo");
        let tree = Tree::new(&runner, &manifest, "x86_64", tmp.path());
        prepare_tree(&tree, &manifest.remote_url)?;
        assert!(runner.calls().is_empty());
        Ok(())
    }

    #[test]
    fn test_convert_image() -> Result<()> {
        let runner = FakeRunner::new();
        let raw = Path::new("/work/disk.img");
        assert_eq!(convert_image(&runner, ImageType::Metal, raw)?, raw);
        assert_eq!(
            convert_image(&runner, ImageType::Qemu, raw)?,
            PathBuf::from("/work/disk.qcow2")
        );
        assert_eq!(
            runner.lines_of("qemu-img"),
            vec!["qemu-img convert -c -O qcow2 /work/disk.img /work/disk.qcow2"]
        );
        Ok(())
    }

    #[test]
    fn test_finalize_moves_image() -> Result<()> {
        let tmp = TempDir::new("builders-test")?;
        let image = tmp.path().join("disk.img");
        let output = tmp.path().join("liri.img");
        fs::write(&image, b"image")?;
        finalize(&image, &output)?;
        assert!(!image.exists());
        assert_eq!(fs::read(&output)?, b"image");
        Ok(())
    }
}
