//! Disk image builder.
//!
//! Produces a GPT disk image with separate boot, EFI system and root partitions
//! and the OS tree deployed on root. Raw images can be converted to qcow2 or vmdk.

use anyhow::{Context as _, Result};
use log::{debug, info, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::bootloader::{vendor_redirect_cfg, DISK_GRUB_CFG};
use super::deploy::{deploy_tree, label, prepare_var};
use super::filesystem::{create_sparse_file, mkfs_ext4, mkfs_fat};
use super::partition::{self, PartitionPlan, BOOT_LABEL, EFI_LABEL, ROOT_LABEL};
use super::scope::{partition_device, LoopDevice, Mount, MountOpts, ScopeStack, Workspace};
use super::tools::{Tool, ToolRunner};
use super::tree::Tree;
use super::{BuildError, BuildOpts, Pipeline, Step, Steps};

/// Disk image build context.
///
/// Fields drop in declaration order: acquired resources are released before
/// the workspace holding them is removed.
pub struct DiskBuildContext<'a> {
    opts: &'a BuildOpts,
    runner: &'a dyn ToolRunner,
    tree: Tree<'a>,
    plan: PartitionPlan,
    commit: Option<String>,
    image: Option<PathBuf>,
    loopdev: Option<PathBuf>,
    mountpoints: Vec<PathBuf>,
    deployroot: Option<PathBuf>,
    scopes: ScopeStack<'a>,
    workspace: Workspace,
}

impl<'a> DiskBuildContext<'a> {
    /// Create context and workspace for given build options.
    pub fn from_opts(opts: &'a BuildOpts, runner: &'a dyn ToolRunner) -> Result<Self> {
        let workspace = Workspace::create(&opts.workdir)?;
        Ok(Self {
            opts,
            runner,
            tree: Tree::new(runner, &opts.manifest, &opts.arch, &opts.workdir),
            plan: PartitionPlan::for_arch(&opts.arch),
            commit: None,
            image: None,
            loopdev: None,
            mountpoints: Vec::new(),
            deployroot: None,
            scopes: ScopeStack::new(),
            workspace,
        })
    }

    fn commit(&self, action: &str) -> Result<String, BuildError> {
        self.commit
            .clone()
            .ok_or_else(|| BuildError::invalid_context(action, "commit"))
    }

    fn image(&self, action: &str) -> Result<PathBuf, BuildError> {
        self.image
            .clone()
            .ok_or_else(|| BuildError::invalid_context(action, "image file"))
    }

    fn loopdev(&self, action: &str) -> Result<PathBuf, BuildError> {
        self.loopdev
            .clone()
            .ok_or_else(|| BuildError::invalid_context(action, "loop device"))
    }

    fn rootdir(&self) -> PathBuf {
        self.workspace.join("root")
    }

    fn bootdir(&self) -> PathBuf {
        self.rootdir().join("boot")
    }

    fn efidir(&self) -> PathBuf {
        self.bootdir().join("efi")
    }
}

struct MirrorTree;

impl Step<DiskBuildContext<'_>> for MirrorTree {
    fn name(&self) -> &'static str {
        "mirror OS tree"
    }

    fn run(&mut self, ctx: &mut DiskBuildContext<'_>) -> Result<()> {
        super::prepare_tree(&ctx.tree, &ctx.opts.manifest.remote_url)
    }
}

struct ResolveCommit;

impl Step<DiskBuildContext<'_>> for ResolveCommit {
    fn name(&self) -> &'static str {
        "resolve commit"
    }

    fn run(&mut self, ctx: &mut DiskBuildContext<'_>) -> Result<()> {
        let commit = ctx.tree.resolve_commit()?;
        info!("building {} ({})", ctx.tree.main_ref(), commit);
        ctx.commit = Some(commit);
        Ok(())
    }
}

struct AllocateImage;

impl Step<DiskBuildContext<'_>> for AllocateImage {
    fn name(&self) -> &'static str {
        "allocate image file"
    }

    fn run(&mut self, ctx: &mut DiskBuildContext<'_>) -> Result<()> {
        let path = ctx.workspace.join("disk.img");
        info!("creating {} image file", ctx.opts.manifest.size);
        create_sparse_file(&path, ctx.opts.manifest.size.as_u64())?;
        ctx.image = Some(path);
        Ok(())
    }
}

struct AttachLoopDevice;

impl Step<DiskBuildContext<'_>> for AttachLoopDevice {
    fn name(&self) -> &'static str {
        "attach image file"
    }

    fn run(&mut self, ctx: &mut DiskBuildContext<'_>) -> Result<()> {
        let image = ctx.image(self.name())?;
        let loopdev = LoopDevice::attach(ctx.runner, &image)?;
        info!("attached image file as {}", loopdev.path().display());
        ctx.loopdev = Some(loopdev.path().to_path_buf());
        ctx.scopes.push(loopdev);
        Ok(())
    }
}

struct PartitionDisk;

impl Step<DiskBuildContext<'_>> for PartitionDisk {
    fn name(&self) -> &'static str {
        "partition disk"
    }

    fn run(&mut self, ctx: &mut DiskBuildContext<'_>) -> Result<()> {
        let loopdev = ctx.loopdev(self.name())?;
        let script = ctx.plan.to_sfdisk_script();
        debug!("partition table:\n{}", script);
        ctx.runner.run(
            &Tool::new("sfdisk")
                .arg("--color=never")
                .arg(&loopdev)
                .stdin(script),
        )?;
        ctx.runner.run(&Tool::new("sync"))?;
        Ok(())
    }
}

struct FormatPartitions;

impl Step<DiskBuildContext<'_>> for FormatPartitions {
    fn name(&self) -> &'static str {
        "format partitions"
    }

    fn run(&mut self, ctx: &mut DiskBuildContext<'_>) -> Result<()> {
        let loopdev = ctx.loopdev(self.name())?;

        info!("formatting EFI system partition");
        mkfs_fat(
            ctx.runner,
            &partition_device(&loopdev, ctx.plan.efi_number()),
            EFI_LABEL,
        )?;
        info!("formatting boot partition");
        mkfs_ext4(
            ctx.runner,
            &partition_device(&loopdev, ctx.plan.boot_number()),
            Some(BOOT_LABEL),
        )?;
        info!("formatting root partition");
        mkfs_ext4(
            ctx.runner,
            &partition_device(&loopdev, ctx.plan.root_number()),
            Some(ROOT_LABEL),
        )?;
        Ok(())
    }
}

struct MountPartitions;

impl Step<DiskBuildContext<'_>> for MountPartitions {
    fn name(&self) -> &'static str {
        "mount image"
    }

    fn run(&mut self, ctx: &mut DiskBuildContext<'_>) -> Result<()> {
        let loopdev = ctx.loopdev(self.name())?;
        info!("mounting image");

        let layout = [
            (
                ctx.plan.root_number(),
                ctx.rootdir(),
                MountOpts {
                    discard: true,
                    ..Default::default()
                },
            ),
            (ctx.plan.boot_number(), ctx.bootdir(), MountOpts::default()),
            (ctx.plan.efi_number(), ctx.efidir(), MountOpts::default()),
        ];
        for (number, target, opts) in layout {
            let mount = Mount::new(
                ctx.runner,
                &partition_device(&loopdev, number),
                &target,
                opts,
            )?;
            ctx.scopes.push(mount);
            ctx.mountpoints.push(target);
        }

        let ostreedir = ctx.rootdir().join("ostree");
        fs::create_dir_all(&ostreedir)
            .context(format!("failed to create {}", ostreedir.display()))?;
        Ok(())
    }
}

struct LabelFilesystems;

impl Step<DiskBuildContext<'_>> for LabelFilesystems {
    fn name(&self) -> &'static str {
        "label filesystems"
    }

    fn run(&mut self, ctx: &mut DiskBuildContext<'_>) -> Result<()> {
        if !ctx.opts.manifest.selinux {
            debug!("SELinux labeling disabled");
            return Ok(());
        }
        // FAT has no extended attributes, so the ESP is left alone.
        let rootdir = ctx.rootdir();
        label(ctx.runner, "/", &rootdir)?;
        label(ctx.runner, "/boot", &ctx.bootdir())?;
        label(ctx.runner, "/ostree", &rootdir.join("ostree"))?;
        Ok(())
    }
}

struct DeployTree;

impl Step<DiskBuildContext<'_>> for DeployTree {
    fn name(&self) -> &'static str {
        "deploy OS tree"
    }

    fn run(&mut self, ctx: &mut DiskBuildContext<'_>) -> Result<()> {
        let commit = ctx.commit(self.name())?;
        let refs = vec![ctx.tree.main_ref().to_string()];
        let deployroot = deploy_tree(ctx.runner, &ctx.tree, &ctx.rootdir(), &commit, &refs)?;
        ctx.deployroot = Some(deployroot);
        Ok(())
    }
}

struct PrepareVar;

impl Step<DiskBuildContext<'_>> for PrepareVar {
    fn name(&self) -> &'static str {
        "prepare /var"
    }

    fn run(&mut self, ctx: &mut DiskBuildContext<'_>) -> Result<()> {
        prepare_var(
            ctx.runner,
            &ctx.rootdir(),
            ctx.tree.osname(),
            ctx.opts.manifest.selinux,
        )
    }
}

struct InstallBootloader;

impl Step<DiskBuildContext<'_>> for InstallBootloader {
    fn name(&self) -> &'static str {
        "install bootloader"
    }

    fn run(&mut self, ctx: &mut DiskBuildContext<'_>) -> Result<()> {
        let deployroot = ctx
            .deployroot
            .clone()
            .ok_or_else(|| BuildError::invalid_context(self.name(), "deployment root"))?;
        info!("installing UEFI bootloader");
        install_uefi(&deployroot, &ctx.rootdir(), &ctx.efidir())?;

        if partition::has_bios_boot(&ctx.opts.arch) {
            info!("installing BIOS bootloader");
            let loopdev = ctx.loopdev(self.name())?;
            ctx.runner
                .run(
                    &Tool::new("grub2-install")
                        .args(["--target", "i386-pc", "--boot-directory"])
                        .arg(ctx.bootdir())
                        .arg(&loopdev),
                )
                .context("failed to install BIOS bootloader")?;
        }
        Ok(())
    }
}

/// Copy EFI binaries shipped by the deployed tree into the ESP and write boot configs.
fn install_uefi(deployroot: &Path, rootdir: &Path, efidir: &Path) -> Result<()> {
    let src_efi = deployroot.join("usr/lib/ostree-boot/efi/EFI");
    let dst_boot = efidir.join("EFI/BOOT");
    fs::create_dir_all(&dst_boot).context(format!("failed to create {}", dst_boot.display()))?;

    let fallback = find_files(&src_efi.join("BOOT"), |name| name.starts_with("BOOT"))?;
    let grub = find_files(&src_efi, |name| {
        name.starts_with("grub") && name.ends_with(".efi")
    })?;
    for file in fallback.iter().chain(grub.iter()) {
        copy_into(file, &dst_boot)?;
    }

    // Vendor is the directory holding grub, e.g. `EFI/fedora`.
    let vendor = grub
        .last()
        .and_then(|file| file.parent())
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().to_string());
    if let Some(vendor) = vendor {
        let vendordir = efidir.join("EFI").join(&vendor);
        debug!("EFI vendor directory: {}", vendordir.display());
        fs::create_dir_all(&vendordir)
            .context(format!("failed to create {}", vendordir.display()))?;
        fs::write(vendordir.join("grub.cfg"), vendor_redirect_cfg())
            .context("failed to write vendor grub.cfg")?;
    }

    let grub2dir = rootdir.join("boot/grub2");
    fs::create_dir_all(&grub2dir).context(format!("failed to create {}", grub2dir.display()))?;
    fs::write(grub2dir.join("grub.cfg"), DISK_GRUB_CFG).context("failed to write grub.cfg")?;
    Ok(())
}

fn copy_into(file: &Path, dir: &Path) -> Result<()> {
    let name = file
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("invalid file path {}", file.display()))?;
    debug!("copying {} into {}", file.display(), dir.display());
    fs::copy(file, dir.join(name)).context(format!("failed to copy {}", file.display()))?;
    Ok(())
}

/// Regular files under `dir` (recursively) whose name satisfies `pred`, sorted by path.
///
/// Missing `dir` gives an empty list.
fn find_files<P>(dir: &Path, pred: P) -> io::Result<Vec<PathBuf>>
where
    P: Fn(&str) -> bool,
{
    let mut found = Vec::new();
    if !dir.is_dir() {
        return Ok(found);
    }
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() && pred(&entry.file_name().to_string_lossy()) {
                found.push(entry.path());
            }
        }
    }
    found.sort();
    Ok(found)
}

struct ConfigureSysroot;

impl Step<DiskBuildContext<'_>> for ConfigureSysroot {
    fn name(&self) -> &'static str {
        "configure sysroot.bootloader"
    }

    fn run(&mut self, ctx: &mut DiskBuildContext<'_>) -> Result<()> {
        let repo = ctx.rootdir().join("ostree/repo");
        ctx.runner.run(
            &Tool::new("ostree")
                .arg("config")
                .arg(format!("--repo={}", repo.display()))
                .args(["set", "sysroot.bootloader", "none"]),
        )?;
        Ok(())
    }
}

struct SetImmutable;

impl Step<DiskBuildContext<'_>> for SetImmutable {
    fn name(&self) -> &'static str {
        "set immutable attribute"
    }

    fn run(&mut self, ctx: &mut DiskBuildContext<'_>) -> Result<()> {
        ctx.runner
            .run(&Tool::new("chattr").arg("+i").arg(ctx.rootdir()))?;
        Ok(())
    }
}

struct TrimFilesystems;

impl Step<DiskBuildContext<'_>> for TrimFilesystems {
    fn name(&self) -> &'static str {
        "trim filesystems"
    }

    fn run(&mut self, ctx: &mut DiskBuildContext<'_>) -> Result<()> {
        for mountpoint in &ctx.mountpoints {
            if let Err(err) = ctx
                .runner
                .run(&Tool::new("fstrim").arg("-v").arg(mountpoint))
            {
                warn!("failed to trim {}: {}", mountpoint.display(), err);
            }
        }
        Ok(())
    }
}

struct ReleaseImage;

impl Step<DiskBuildContext<'_>> for ReleaseImage {
    fn name(&self) -> &'static str {
        "release image"
    }

    fn run(&mut self, ctx: &mut DiskBuildContext<'_>) -> Result<()> {
        info!("unmounting image");
        let errors = ctx.scopes.unwind();
        if !errors.is_empty() {
            warn!("{} resource(s) were not released cleanly", errors.len());
        }
        ctx.mountpoints.clear();
        ctx.loopdev = None;
        Ok(())
    }
}

struct ConvertImage;

impl Step<DiskBuildContext<'_>> for ConvertImage {
    fn name(&self) -> &'static str {
        "convert image"
    }

    fn run(&mut self, ctx: &mut DiskBuildContext<'_>) -> Result<()> {
        let image = ctx.image(self.name())?;
        let converted = super::convert_image(ctx.runner, ctx.opts.manifest.image_type, &image)?;
        ctx.image = Some(converted);
        Ok(())
    }
}

struct FinalizeImage;

impl Step<DiskBuildContext<'_>> for FinalizeImage {
    fn name(&self) -> &'static str {
        "move image to output"
    }

    fn run(&mut self, ctx: &mut DiskBuildContext<'_>) -> Result<()> {
        let image = ctx.image(self.name())?;
        super::finalize(&image, &ctx.opts.output)
    }
}

fn setup_pipeline<'c, 'a>(ctx: &'c mut DiskBuildContext<'a>) -> Pipeline<'c, DiskBuildContext<'a>> {
    let steps: Steps<DiskBuildContext<'a>> = vec![
        Box::new(MirrorTree),
        Box::new(ResolveCommit),
        Box::new(AllocateImage),
        Box::new(AttachLoopDevice),
        Box::new(PartitionDisk),
        Box::new(FormatPartitions),
        Box::new(MountPartitions),
        Box::new(LabelFilesystems),
        Box::new(DeployTree),
        Box::new(PrepareVar),
        Box::new(InstallBootloader),
        Box::new(ConfigureSysroot),
        Box::new(SetImmutable),
        Box::new(TrimFilesystems),
        Box::new(ReleaseImage),
        Box::new(ConvertImage),
        Box::new(FinalizeImage),
    ];
    Pipeline::from_steps(ctx, steps)
}

/// Build disk image. Returns the deployed commit.
pub fn build(opts: &BuildOpts, runner: &dyn ToolRunner) -> Result<String> {
    let mut ctx = DiskBuildContext::from_opts(opts, runner)?;
    setup_pipeline(&mut ctx).run()?;
    Ok(ctx.commit("report build result")?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::deploy::deployment_root;
    use crate::builders::tools::fake::FakeRunner;
    use crate::builders::tools::ToolError;
    use crate::manifest::Manifest;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tempdir::TempDir;

    fn opts(tmp: &Path, image_type: &str, arch: &str) -> Result<BuildOpts> {
        let repo = tmp.join("repo");
        fs::create_dir_all(&repo)?;
        fs::write(repo.join("config"), "[core]\nmode=archive-z2\n")?;
        let manifest = Manifest::parse(&format!(
            "type: {}\nosname: liri\nmain-ref: os/${{basearch}}/stable\nremote-url: file://{}\nsize: 64MiB\n",
            image_type,
            repo.display()
        ))?;
        Ok(BuildOpts {
            manifest,
            arch: arch.to_string(),
            workdir: tmp.join("work"),
            configdir: None,
            output: tmp.join(format!("liri.{}", image_type)),
            fslabel: None,
            force: false,
            syslinux_dir: PathBuf::from("/usr/share/syslinux"),
            timestamp: "202401010000".to_string(),
        })
    }

    /// Runner emulating the host tools the disk pipeline observes.
    fn host(captured: Rc<RefCell<Vec<(String, String)>>>) -> FakeRunner {
        let runner = FakeRunner::new();
        runner.on("losetup", |_| Ok("/dev/loop0\n".to_string()));
        runner.on_arg("ostree", "rev-parse", |_| Ok("abc123\n".to_string()));
        runner.on_arg("ostree", "deploy", |tool| {
            let sysroot = tool.option_value("--sysroot").unwrap_or_default();
            let root = deployment_root(Path::new(&sysroot), "liri", "abc123");
            let efi = root.join("usr/lib/ostree-boot/efi/EFI");
            let populate = || -> io::Result<()> {
                fs::create_dir_all(efi.join("BOOT"))?;
                fs::create_dir_all(efi.join("fedora"))?;
                fs::write(efi.join("BOOT/BOOTX64.EFI"), b"shim")?;
                fs::write(efi.join("BOOT/fbx64.efi"), b"fallback")?;
                fs::write(efi.join("fedora/grubx64.efi"), b"grub")?;
                Ok(())
            };
            populate().map_err(|e| ToolError::failed("ostree", "1", &e.to_string()))?;
            Ok(String::new())
        });
        runner.on("chattr", move |tool| {
            let rootdir = PathBuf::from(tool.get_args()[1].clone());
            let efidir = rootdir.join("boot/efi/EFI");
            for path in [
                efidir.join("fedora/grub.cfg"),
                efidir.join("BOOT/BOOTX64.EFI"),
                efidir.join("BOOT/grubx64.efi"),
                rootdir.join("boot/grub2/grub.cfg"),
            ] {
                let content = fs::read_to_string(&path).unwrap_or_default();
                captured
                    .borrow_mut()
                    .push((path.to_string_lossy().to_string(), content));
            }
            Ok(String::new())
        });
        runner
    }

    #[test]
    fn test_existing_output_runs_no_tools() -> Result<()> {
        let tmp = TempDir::new("disk-test")?;
        let opts = opts(tmp.path(), "disk", "x86_64")?;
        fs::write(&opts.output, b"old image")?;
        let runner = FakeRunner::new();

        let err = crate::builders::build(&opts, &runner).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::Precondition(_))
        ));
        assert!(runner.calls().is_empty());
        assert!(!opts.workdir.exists());
        Ok(())
    }

    #[test]
    fn test_partitioning_failure_detaches_loop_device() -> Result<()> {
        let tmp = TempDir::new("disk-test")?;
        let opts = opts(tmp.path(), "disk", "x86_64")?;
        let runner = FakeRunner::new();
        runner.on("losetup", |_| Ok("/dev/loop0\n".to_string()));
        runner.on_arg("ostree", "rev-parse", |_| Ok("abc123\n".to_string()));
        runner.fail("sfdisk");

        let err = build(&opts, &runner).unwrap_err();
        assert!(format!("{:#}", err).contains("failed to partition disk"));
        assert_eq!(runner.count("losetup", "--find"), 1);
        assert_eq!(runner.count("losetup", "--detach"), 1);
        assert_eq!(runner.count("mkfs.ext4", "-F"), 0);
        assert_eq!(fs::read_dir(&opts.workdir)?.count(), 0);
        assert!(!opts.output.exists());
        Ok(())
    }

    #[test]
    fn test_deploy_failure_unmounts_in_reverse_order() -> Result<()> {
        let tmp = TempDir::new("disk-test")?;
        let opts = opts(tmp.path(), "disk", "aarch64")?;
        let runner = FakeRunner::new();
        runner.on("losetup", |_| Ok("/dev/loop0\n".to_string()));
        runner.on_arg("ostree", "rev-parse", |_| Ok("abc123\n".to_string()));

        let err = build(&opts, &runner).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::MissingDeployment { .. })
        ));
        let released: Vec<String> = runner
            .calls()
            .iter()
            .filter(|tool| tool.program() == "umount" || tool.has_arg("--detach"))
            .map(|tool| {
                let last = tool.get_args().last().cloned().unwrap_or_default();
                Path::new(&last)
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_default()
            })
            .collect();
        assert_eq!(released, vec!["efi", "boot", "root", "loop0"]);
        Ok(())
    }

    #[test]
    fn test_disk_build_x86_64() -> Result<()> {
        let tmp = TempDir::new("disk-test")?;
        let opts = opts(tmp.path(), "disk", "x86_64")?;
        let captured = Rc::new(RefCell::new(Vec::new()));
        let runner = host(captured.clone());

        let commit = build(&opts, &runner)?;
        assert_eq!(commit, "abc123");
        assert_eq!(fs::metadata(&opts.output)?.len(), 64 * 1024 * 1024);
        assert_eq!(fs::read_dir(&opts.workdir)?.count(), 0);

        let sfdisk = runner
            .calls()
            .into_iter()
            .find(|tool| tool.program() == "sfdisk")
            .and_then(|tool| tool.get_stdin().map(|s| String::from_utf8_lossy(s).to_string()))
            .unwrap_or_default();
        assert!(sfdisk.contains("name=\"BIOS-BOOT\""));
        assert_eq!(
            runner.lines_of("mkfs.ext4"),
            vec![
                "mkfs.ext4 -L boot -F /dev/loop0p1",
                "mkfs.ext4 -L root -F /dev/loop0p4"
            ]
        );
        assert_eq!(runner.lines_of("mkfs.fat"), vec!["mkfs.fat -n EFI-SYSTEM /dev/loop0p2"]);
        assert_eq!(runner.count("grub2-install", "i386-pc"), 1);
        assert_eq!(runner.count("ostree", "sysroot.bootloader"), 1);
        assert_eq!(runner.count("fstrim", "-v"), 3);
        assert_eq!(runner.count("losetup", "--detach"), 1);
        assert_eq!(runner.count("umount", "--recursive"), 3);
        assert!(runner.lines_of("qemu-img").is_empty());

        let captured = captured.borrow();
        assert_eq!(captured[0].1, vendor_redirect_cfg());
        assert_eq!(captured[1].1, "shim");
        assert_eq!(captured[2].1, "grub");
        assert_eq!(captured[3].1, DISK_GRUB_CFG);
        Ok(())
    }

    #[test]
    fn test_qemu_build_converts_image() -> Result<()> {
        let tmp = TempDir::new("disk-test")?;
        let opts = opts(tmp.path(), "qemu", "aarch64")?;
        let runner = host(Rc::new(RefCell::new(Vec::new())));
        runner.on("qemu-img", |tool| {
            let converted = tool.get_args().last().cloned().unwrap_or_default();
            fs::write(converted, b"qcow2").map_err(|e| ToolError::failed("qemu-img", "1", &e.to_string()))?;
            Ok(String::new())
        });

        build(&opts, &runner)?;
        assert_eq!(fs::read(&opts.output)?, b"qcow2");
        assert_eq!(runner.count("grub2-install", "i386-pc"), 0);
        let sfdisk = runner
            .calls()
            .into_iter()
            .find(|tool| tool.program() == "sfdisk")
            .and_then(|tool| tool.get_stdin().map(|s| String::from_utf8_lossy(s).to_string()))
            .unwrap_or_default();
        assert!(!sfdisk.contains("BIOS-BOOT"));
        Ok(())
    }

    #[test]
    fn test_find_files() -> Result<()> {
        let tmp = TempDir::new("disk-test")?;
        fs::create_dir_all(tmp.path().join("EFI/fedora"))?;
        fs::write(tmp.path().join("EFI/fedora/grubx64.efi"), b"")?;
        fs::write(tmp.path().join("EFI/fedora/shimx64.efi"), b"")?;
        let found = find_files(tmp.path(), |name| name.starts_with("grub"))?;
        assert_eq!(found, vec![tmp.path().join("EFI/fedora/grubx64.efi")]);
        assert!(find_files(&tmp.path().join("missing"), |_| true)?.is_empty());
        Ok(())
    }
}
