use log::trace;
use std::fs::{self, File, FileTimes};
use std::path::{Path, PathBuf};
use std::{fmt, os::unix};
use thiserror::Error;

/// Error in [`Directory`] adapter.
#[derive(Error, Clone, Debug)]
pub enum DirectoryError {
    /// Failed to create adapter.
    #[error("failed to read directory {path}: {message}")]
    CreateError { path: PathBuf, message: String },

    /// Failed to get size of the content.
    #[error("failed to get size of {path}: {message}")]
    GetSizeError { path: PathBuf, message: String },

    /// Failed to copy content.
    #[error("failed to copy directory content {src_path} -> {dst_path}: {message}")]
    CopyDirectoryContentError {
        src_path: PathBuf,
        dst_path: PathBuf,
        message: String,
    },
}

/// Textual replacement applied to copied files.
pub type Substitution<'s> = (&'s str, &'s str);

/// Directory adapter.
///
/// Provides some helpful methods to operate on directories.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Directory<'a> {
    path: &'a Path,
}

impl<'a> Directory<'a> {
    /// Create new adapter for directory at given path.
    ///
    /// # Errors
    ///
    /// - Returns error if `path` is not a directory.
    pub fn from_path(path: &'a Path) -> Result<Self, DirectoryError> {
        let metadata = fs::metadata(path).map_err(|e| DirectoryError::CreateError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if metadata.is_dir() {
            Ok(Self { path })
        } else {
            Err(DirectoryError::CreateError {
                path: path.to_path_buf(),
                message: "not a directory".to_string(),
            })
        }
    }

    /// Size of all content in directory in bytes.
    pub fn size(&self) -> Result<u64, DirectoryError> {
        fs_extra::dir::get_size(self.path).map_err(|e| DirectoryError::GetSizeError {
            path: self.path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Overlay the content of the directory onto `target_dir`.
    ///
    /// Every copied file gets `substitutions` applied to its text. Files named `exclude`
    /// are skipped. Permissions and modification times are preserved. Files that are not
    /// valid UTF-8 are copied unchanged. Symlinks are copied as they are.
    pub fn copy_overlay(
        &self,
        target_dir: &Path,
        substitutions: &[Substitution<'_>],
        exclude: &str,
    ) -> Result<(), DirectoryError> {
        let mut stack = vec![self.path.to_path_buf()];
        let input_root = self.path.components().count();

        let io_err_handler = |err: std::io::Error| DirectoryError::CopyDirectoryContentError {
            src_path: self.path.to_path_buf(),
            dst_path: target_dir.to_path_buf(),
            message: err.to_string(),
        };

        while let Some(working_path) = stack.pop() {
            trace!("entering: {}", working_path.display());
            let dest = target_dir.join(
                working_path
                    .components()
                    .skip(input_root)
                    .collect::<PathBuf>(),
            );
            fs::create_dir_all(&dest).map_err(io_err_handler)?;

            for entry in fs::read_dir(&working_path).map_err(io_err_handler)? {
                let entry = entry.map_err(io_err_handler)?;
                let path = entry.path();
                let name = entry.file_name();
                let dest_path = dest.join(&name);
                let file_type = entry.file_type().map_err(io_err_handler)?;

                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_symlink() {
                    let target = fs::read_link(&path).map_err(io_err_handler)?;
                    trace!("  symlink {} -> {}", dest_path.display(), target.display());
                    unix::fs::symlink(target, dest_path).map_err(io_err_handler)?;
                } else if name == exclude {
                    trace!("  skip: {}", path.display());
                } else {
                    trace!("  copy: {} -> {}", path.display(), dest_path.display());
                    let content = fs::read(&path).map_err(io_err_handler)?;
                    let content = match String::from_utf8(content) {
                        Ok(text) => substitutions
                            .iter()
                            .fold(text, |text, (from, to)| text.replace(from, to))
                            .into_bytes(),
                        Err(raw) => raw.into_bytes(),
                    };
                    fs::write(&dest_path, content).map_err(io_err_handler)?;
                    copy_metadata(&path, &dest_path).map_err(io_err_handler)?;
                }
            }
        }
        Ok(())
    }
}

fn copy_metadata(src: &Path, dst: &Path) -> std::io::Result<()> {
    let metadata = fs::metadata(src)?;
    let times = FileTimes::new()
        .set_accessed(metadata.accessed()?)
        .set_modified(metadata.modified()?);
    File::options().write(true).open(dst)?.set_times(times)?;
    fs::set_permissions(dst, metadata.permissions())
}

impl<'a> fmt::Debug for Directory<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.path.fmt(f)
    }
}

impl<'a> fmt::Display for Directory<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format!("{}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::{Directory, DirectoryError};
    use anyhow::Result;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempdir::TempDir;

    #[test]
    fn test_from_path_fail() {
        let res = Directory::from_path(Path::new("/foo/bar/baz"));
        assert!(matches!(
            res.err().unwrap(),
            DirectoryError::CreateError { .. }
        ));
    }

    #[test]
    fn test_size() -> Result<()> {
        let tmp = TempDir::new("test-dirs")?;
        fs::write(tmp.path().join("tmp"), b"123")?;
        let directory = Directory::from_path(tmp.path())?;
        assert_eq!(directory.size()?, 3);
        Ok(())
    }

    #[test]
    fn test_copy_overlay() -> Result<()> {
        let src = TempDir::new("test-dirs")?;
        let dst = TempDir::new("test-dirs")?;
        fs::create_dir_all(src.path().join("isolinux"))?;
        fs::write(
            src.path().join("isolinux/boot.msg"),
            "label @@FSLABEL@@ args @@KERNEL-ARGS@@\n",
        )?;
        fs::set_permissions(
            src.path().join("isolinux/boot.msg"),
            fs::Permissions::from_mode(0o640),
        )?;
        fs::write(src.path().join("README-devel.md"), "@@FSLABEL@@")?;
        fs::write(src.path().join("logo.bin"), [0xffu8, 0xfe, 0x40, 0x40])?;

        Directory::from_path(src.path())?.copy_overlay(
            dst.path(),
            &[("@@FSLABEL@@", "LIRI"), ("@@KERNEL-ARGS@@", "quiet rd.live.image")],
            "README-devel.md",
        )?;

        let copied = dst.path().join("isolinux/boot.msg");
        assert_eq!(
            fs::read_to_string(&copied)?,
            "label LIRI args quiet rd.live.image\n"
        );
        assert_eq!(fs::metadata(&copied)?.permissions().mode() & 0o777, 0o640);
        assert_eq!(
            fs::metadata(&copied)?.modified()?,
            fs::metadata(src.path().join("isolinux/boot.msg"))?.modified()?
        );
        assert!(!dst.path().join("README-devel.md").exists());
        assert_eq!(fs::read(dst.path().join("logo.bin"))?, vec![0xff, 0xfe, 0x40, 0x40]);
        Ok(())
    }
}
