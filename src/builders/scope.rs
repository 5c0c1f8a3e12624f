//! Scoped resources: workspace directory, loop devices and mounts.
//!
//! Each resource is released exactly once, on success and on every failure path.
//! Nested resources are released innermost first. Release failures never mask
//! the error that caused the unwinding: they are logged as warnings.

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tempdir::TempDir;
use thiserror::Error;

use super::tools::{Tool, ToolError, ToolRunner};

/// Failure while releasing a resource.
#[derive(Error, Debug)]
pub enum CleanupError {
    #[error("failed to detach loop device {device}: {source}")]
    Detach {
        device: PathBuf,
        #[source]
        source: ToolError,
    },

    #[error("failed to unmount {path}: {source}")]
    Unmount {
        path: PathBuf,
        #[source]
        source: ToolError,
    },

    #[error("failed to remove workspace {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Resource with a release action.
pub trait Scoped {
    /// Human-readable description for logs.
    fn describe(&self) -> String;

    /// Release the resource.
    ///
    /// Only the first call does anything, later calls return `Ok(())`.
    fn release(&mut self) -> Result<(), CleanupError>;
}

fn release_quietly<S: Scoped + ?Sized>(scope: &mut S) {
    if let Err(err) = scope.release() {
        warn!("{}", err);
    }
}

/// Stack of nested resources.
///
/// Unwinding (explicit or on drop) releases resources in reverse order of acquisition.
#[derive(Default)]
pub struct ScopeStack<'r> {
    scopes: Vec<Box<dyn Scoped + 'r>>,
}

impl<'r> ScopeStack<'r> {
    pub fn new() -> Self {
        Self { scopes: Vec::new() }
    }

    /// Take ownership of an acquired resource.
    pub fn push<S: Scoped + 'r>(&mut self, scope: S) {
        debug!("acquired {}", scope.describe());
        self.scopes.push(Box::new(scope));
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Release every resource, innermost first.
    ///
    /// All resources are attempted even if some fail. Failures are logged and returned.
    pub fn unwind(&mut self) -> Vec<CleanupError> {
        let mut errors = Vec::new();
        while let Some(mut scope) = self.scopes.pop() {
            debug!("releasing {}", scope.describe());
            if let Err(err) = scope.release() {
                warn!("{}", err);
                errors.push(err);
            }
        }
        errors
    }
}

impl Drop for ScopeStack<'_> {
    fn drop(&mut self) {
        self.unwind();
    }
}

/// Private working directory, removed with all its content on release.
pub struct Workspace {
    path: PathBuf,
    dir: Option<TempDir>,
}

impl Workspace {
    /// Create a fresh directory under `parent`.
    ///
    /// `parent` is created if missing.
    pub fn create(parent: &Path) -> Result<Self> {
        fs::create_dir_all(parent).context(format!(
            "failed to create work directory {}",
            parent.display()
        ))?;
        let dir = TempDir::new_in(parent, "osimgcreate").context(format!(
            "failed to create workspace in {}",
            parent.display()
        ))?;
        debug!("workspace: {}", dir.path().display());
        Ok(Self {
            path: dir.path().to_path_buf(),
            dir: Some(dir),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path inside the workspace.
    pub fn join<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        self.path.join(path)
    }
}

impl Scoped for Workspace {
    fn describe(&self) -> String {
        format!("workspace {}", self.path.display())
    }

    fn release(&mut self) -> Result<(), CleanupError> {
        match self.dir.take() {
            Some(dir) => dir.close().map_err(|source| CleanupError::Workspace {
                path: self.path.clone(),
                source,
            }),
            None => Ok(()),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        release_quietly(self);
    }
}

impl fmt::Debug for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.path.fmt(f)
    }
}

/// Loop device attached to an image file with partition scanning.
pub struct LoopDevice<'r> {
    runner: &'r dyn ToolRunner,
    path: PathBuf,
    attached: bool,
}

impl<'r> LoopDevice<'r> {
    /// Attach first free loop device to `file`.
    pub fn attach(runner: &'r dyn ToolRunner, file: &Path) -> Result<Self> {
        let output = runner
            .run(
                &Tool::new("losetup")
                    .args(["--find", "--show", "--partscan"])
                    .arg(file),
            )
            .context("failed to set up loop device")?;
        let device = output.trim();
        if device.is_empty() {
            bail!("losetup did not report a loop device for {}", file.display());
        }
        Ok(Self {
            runner,
            path: PathBuf::from(device),
            attached: true,
        })
    }

    /// Path to loop device.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get partition device, e.g. `/dev/loop1p1`.
    pub fn part(&self, n: usize) -> PathBuf {
        partition_device(&self.path, n)
    }
}

/// Partition `n` of block device `device`, e.g. `/dev/loop1` -> `/dev/loop1p1`.
pub fn partition_device(device: &Path, n: usize) -> PathBuf {
    let mut name = device.as_os_str().to_os_string();
    name.push(format!("p{}", n));
    PathBuf::from(name)
}

impl Scoped for LoopDevice<'_> {
    fn describe(&self) -> String {
        format!("loop device {}", self.path.display())
    }

    fn release(&mut self) -> Result<(), CleanupError> {
        if !self.attached {
            return Ok(());
        }
        self.attached = false;
        self.runner
            .run(&Tool::new("losetup").arg("--detach").arg(&self.path))
            .map(|_| ())
            .map_err(|source| CleanupError::Detach {
                device: self.path.clone(),
                source,
            })
    }
}

impl Drop for LoopDevice<'_> {
    fn drop(&mut self) {
        release_quietly(self);
    }
}

/// Options for [`Mount`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MountOpts {
    /// Issue discard requests (useful for sparse backing files).
    pub discard: bool,

    /// Source is a regular file, mount it through a loop device.
    pub loop_file: bool,

    pub read_only: bool,
}

impl MountOpts {
    fn to_option_string(self) -> Option<String> {
        let mut options = Vec::new();
        if self.discard {
            options.push("discard");
        }
        if self.loop_file {
            options.push("loop");
        }
        if self.read_only {
            options.push("ro");
        }
        (!options.is_empty()).then(|| options.join(","))
    }
}

/// Mounted filesystem. Unmounted recursively on release.
pub struct Mount<'r> {
    runner: &'r dyn ToolRunner,
    target: PathBuf,
    mounted: bool,
}

impl<'r> Mount<'r> {
    /// Mount `source` at `target`, creating `target` if needed.
    pub fn new(
        runner: &'r dyn ToolRunner,
        source: &Path,
        target: &Path,
        opts: MountOpts,
    ) -> Result<Self> {
        fs::create_dir_all(target)
            .context(format!("failed to create mountpoint {}", target.display()))?;

        let mut tool = Tool::new("mount").arg("-n").arg(source).arg(target);
        if let Some(options) = opts.to_option_string() {
            tool = tool.arg("-o").arg(options);
        }
        runner.run(&tool).context(format!(
            "failed to mount {} at {}",
            source.display(),
            target.display()
        ))?;

        Ok(Self {
            runner,
            target: target.to_path_buf(),
            mounted: true,
        })
    }
}

impl Scoped for Mount<'_> {
    fn describe(&self) -> String {
        format!("mount {}", self.target.display())
    }

    fn release(&mut self) -> Result<(), CleanupError> {
        if !self.mounted {
            return Ok(());
        }
        self.mounted = false;
        self.runner
            .run(
                &Tool::new("umount")
                    .args(["--recursive", "-n"])
                    .arg(&self.target),
            )
            .map(|_| ())
            .map_err(|source| CleanupError::Unmount {
                path: self.target.clone(),
                source,
            })
    }
}

impl Drop for Mount<'_> {
    fn drop(&mut self) {
        release_quietly(self);
    }
}
