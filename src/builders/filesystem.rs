//! Image files and filesystems.

use anyhow::{bail, Context, Result};
use fatfs::{FileSystem, FormatVolumeOptions, FsOptions};
use log::{debug, trace};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

use super::directory::Directory;
use super::tools::{Tool, ToolRunner};

/// Smallest EFI boot image. FAT needs a few reserved sectors and tables even for tiny trees.
pub const MIN_EFI_IMAGE_SIZE: u64 = 2 * 1024 * 1024;

const SECTOR_SIZE: u64 = 512;

/// Create a new sparse file of exactly `size` bytes.
pub fn create_sparse_file(path: &Path, size: u64) -> Result<()> {
    if path.exists() {
        bail!("file '{}' already exists", path.display());
    }
    if size == 0 {
        bail!("cannot create empty image file '{}'", path.display());
    }
    let mut file = File::create_new(path).context("failed to create image file")?;

    // This will create sparse file on Linux
    file.seek(SeekFrom::Start(size - 1))
        .context("seek for image size")?;
    file.write_all(&[0])
        .context("failed to extend image file")?;
    debug!("allocated {} bytes in {}", size, path.display());
    Ok(())
}

/// Format `target` (block device or regular file) as ext4.
pub fn mkfs_ext4(runner: &dyn ToolRunner, target: &Path, label: Option<&str>) -> Result<()> {
    let mut tool = Tool::new("mkfs.ext4");
    if let Some(label) = label {
        tool = tool.arg("-L").arg(label);
    }
    // Never ask for confirmation.
    tool = tool.arg("-F").arg(target);
    runner
        .run(&tool)
        .context(format!("failed to create ext4 filesystem on {}", target.display()))?;
    Ok(())
}

/// Format `target` as FAT.
pub fn mkfs_fat(runner: &dyn ToolRunner, target: &Path, label: &str) -> Result<()> {
    runner
        .run(&Tool::new("mkfs.fat").arg("-n").arg(label).arg(target))
        .context(format!("failed to create FAT filesystem on {}", target.display()))?;
    Ok(())
}

/// Size of the EFI boot image for a tree of `content_size` bytes: 25% margin, sector aligned.
pub fn efi_image_size(content_size: u64) -> u64 {
    let size = (content_size + content_size / 4).max(MIN_EFI_IMAGE_SIZE);
    size.div_ceil(SECTOR_SIZE) * SECTOR_SIZE
}

/// Write a FAT image at `path` holding the content of `source` under `EFI/`.
///
/// Returns the image size.
pub fn create_efi_boot_image(path: &Path, source: &Path) -> Result<u64> {
    let content = Directory::from_path(source)?.size()?;
    let size = efi_image_size(content);
    create_sparse_file(path, size)?;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .context("failed to open EFI boot image")?;
    fatfs::format_volume(
        &file,
        FormatVolumeOptions::new().volume_label(*b"EFIBOOT    "),
    )
    .context("failed to format EFI boot image")?;

    let fs = FileSystem::new(&file, FsOptions::new()).context("failed to open EFI boot image")?;
    {
        let efi = fs
            .root_dir()
            .create_dir("EFI")
            .context("failed to create EFI directory")?;
        copy_into_fat(&efi, source)
            .context(format!("failed to copy {} into EFI boot image", source.display()))?;
    }
    fs.unmount().context("failed to finish EFI boot image")?;
    debug!("EFI boot image {} ({} bytes)", path.display(), size);
    Ok(size)
}

fn copy_into_fat(dir: &fatfs::Dir<'_, &File>, source: &Path) -> io::Result<()> {
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if path.is_dir() {
            trace!("  mkdir: {}", name);
            let sub = dir.create_dir(&name)?;
            copy_into_fat(&sub, &path)?;
        } else if path.is_file() {
            trace!("  copy: {}", path.display());
            let mut file = dir.create_file(&name)?;
            file.truncate()?;
            io::copy(&mut File::open(&path)?, &mut file)?;
            file.flush()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::tools::fake::FakeRunner;
    use std::io::Read;
    use tempdir::TempDir;

    #[test]
    fn test_sparse_file() -> Result<()> {
        let tmp = TempDir::new("fs-test")?;
        let path = tmp.path().join("disk.img");
        create_sparse_file(&path, 64 * 1024 * 1024)?;
        assert_eq!(fs::metadata(&path)?.len(), 64 * 1024 * 1024);
        assert!(create_sparse_file(&path, 1024).is_err());
        Ok(())
    }

    #[test]
    fn test_mkfs_commands() -> Result<()> {
        let runner = FakeRunner::new();
        mkfs_ext4(&runner, Path::new("/dev/loop0p4"), Some("root"))?;
        mkfs_ext4(&runner, Path::new("rootfs.img"), None)?;
        mkfs_fat(&runner, Path::new("/dev/loop0p2"), "EFI-SYSTEM")?;
        assert_eq!(
            runner.lines_of("mkfs.ext4"),
            vec![
                "mkfs.ext4 -L root -F /dev/loop0p4",
                "mkfs.ext4 -F rootfs.img"
            ]
        );
        assert_eq!(
            runner.lines_of("mkfs.fat"),
            vec!["mkfs.fat -n EFI-SYSTEM /dev/loop0p2"]
        );
        Ok(())
    }

    #[test]
    fn test_efi_image_size() {
        assert_eq!(efi_image_size(0), MIN_EFI_IMAGE_SIZE);
        assert_eq!(efi_image_size(8 * 1024 * 1024), 10 * 1024 * 1024);
        assert_eq!(efi_image_size(4_000_001) % 512, 0);
    }

    #[test]
    fn test_efi_boot_image() -> Result<()> {
        let tmp = TempDir::new("fs-test")?;
        let source = tmp.path().join("efi");
        fs::create_dir_all(source.join("BOOT"))?;
        fs::write(source.join("BOOT/BOOTX64.EFI"), b"shim")?;
        let image = tmp.path().join("efiboot.img");

        let size = create_efi_boot_image(&image, &source)?;
        assert_eq!(fs::metadata(&image)?.len(), size);

        let file = OpenOptions::new().read(true).write(true).open(&image)?;
        let fs = FileSystem::new(&file, FsOptions::new())?;
        let mut content = String::new();
        fs.root_dir()
            .open_file("EFI/BOOT/BOOTX64.EFI")?
            .read_to_string(&mut content)?;
        assert_eq!(content, "shim");
        Ok(())
    }
}
