//! Live ISO builder.
//!
//! The OS tree is deployed into an ext4 root filesystem image, which is compressed
//! with squashfs and mastered into a hybrid ISO together with kernel, initramfs and
//! isolinux/GRUB boot menus.

use anyhow::{Context as _, Result};
use log::{debug, info, warn};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use super::bootloader::{GrubConfig, SyslinuxConfig};
use super::deploy::{deploy_tree, label, prepare_var};
use super::directory::Directory;
use super::filesystem::{create_efi_boot_image, create_sparse_file, mkfs_ext4};
use super::partition;
use super::scope::{Mount, MountOpts, ScopeStack, Workspace};
use super::tools::{Tool, ToolRunner};
use super::tree::Tree;
use super::{BuildError, BuildOpts, Pipeline, Step, Steps};

/// ISO 9660 volume identifiers are limited to 32 bytes.
pub const MAX_LABEL_LEN: usize = 32;

/// Files from the overlay directory never copied onto the media.
pub const OVERLAY_EXCLUDE: &str = "README-devel.md";

const KERNEL_IMG: &str = "vmlinuz";
const INITRAMFS_IMG: &str = "initramfs.img";
const MEMTEST_PREFIX: &str = "memtest86+";
const CHECKISOMD5: &str = "/usr/bin/checkisomd5";
const GRUB_TIMEOUT_SECS: u32 = 1;

/// Binaries needed by isolinux, copied from the syslinux directory.
const ISOLINUX_FILES: [&str; 5] = [
    "isolinux.bin",
    "ldlinux.c32",
    "libcom32.c32",
    "libutil.c32",
    "vesamenu.c32",
];

/// Volume set identifier: `<osname>-<timestamp>-<arch>`.
pub fn volume_set(osname: &str, timestamp: &str, arch: &str) -> String {
    format!("{}-{}-{}", osname, timestamp, arch)
}

/// Cut `label` to at most [`MAX_LABEL_LEN`] bytes without splitting a character.
///
/// ASCII labels keep exactly [`MAX_LABEL_LEN`] bytes. When the limit falls inside
/// a multibyte character that character is dropped, so the result may be up to
/// three bytes shorter.
pub fn truncate_label(label: &str) -> String {
    if label.len() <= MAX_LABEL_LEN {
        return label.to_string();
    }
    let mut end = MAX_LABEL_LEN;
    while !label.is_char_boundary(end) {
        end -= 1;
    }
    label[..end].to_string()
}

/// Live image build context.
pub struct LiveBuildContext<'a> {
    opts: &'a BuildOpts,
    runner: &'a dyn ToolRunner,
    tree: Tree<'a>,
    volset: String,
    fslabel: String,
    kargs: String,
    commit: Option<String>,
    has_memtest: bool,
    has_checkisomd5: bool,

    /// Boot parameters of `genisoimage` accumulated by boot support steps.
    boot_args: Vec<String>,

    iso: Option<PathBuf>,
    scopes: ScopeStack<'a>,
    workspace: Workspace,
}

impl<'a> LiveBuildContext<'a> {
    pub fn from_opts(opts: &'a BuildOpts, runner: &'a dyn ToolRunner) -> Result<Self> {
        let manifest = &opts.manifest;
        let volset = volume_set(&manifest.osname, &opts.timestamp, &opts.arch);
        let fslabel = truncate_label(opts.fslabel.as_deref().unwrap_or(&volset));
        debug!("volume set: {}, label: {}", volset, fslabel);
        let workspace = Workspace::create(&opts.workdir)?;
        Ok(Self {
            opts,
            runner,
            tree: Tree::new(runner, manifest, &opts.arch, &opts.workdir),
            volset,
            fslabel,
            kargs: manifest.live_kargs(),
            commit: None,
            has_memtest: false,
            has_checkisomd5: false,
            boot_args: Vec::new(),
            iso: None,
            scopes: ScopeStack::new(),
            workspace,
        })
    }

    fn commit(&self, action: &str) -> Result<String, BuildError> {
        self.commit
            .clone()
            .ok_or_else(|| BuildError::invalid_context(action, "commit"))
    }

    fn iso(&self, action: &str) -> Result<PathBuf, BuildError> {
        self.iso
            .clone()
            .ok_or_else(|| BuildError::invalid_context(action, "ISO image"))
    }

    /// Root of the ISO staging tree.
    fn isoroot(&self) -> PathBuf {
        self.workspace.join("iso")
    }

    fn images(&self) -> PathBuf {
        self.isoroot().join("images")
    }

    fn isolinux(&self) -> PathBuf {
        self.isoroot().join("isolinux")
    }

    fn efi_vendor(&self) -> PathBuf {
        self.isoroot().join("EFI/fedora")
    }

    /// Directory compressed into the squashfs image.
    fn squashfs_root(&self) -> PathBuf {
        self.workspace.join("squashfs")
    }

    fn rootfs_image(&self) -> PathBuf {
        self.squashfs_root().join("LiveOS/rootfs.img")
    }
}

struct MirrorTree;

impl Step<LiveBuildContext<'_>> for MirrorTree {
    fn name(&self) -> &'static str {
        "mirror OS tree"
    }

    fn run(&mut self, ctx: &mut LiveBuildContext<'_>) -> Result<()> {
        super::prepare_tree(&ctx.tree, &ctx.opts.manifest.remote_url)
    }
}

struct ResolveCommit;

impl Step<LiveBuildContext<'_>> for ResolveCommit {
    fn name(&self) -> &'static str {
        "resolve commit"
    }

    fn run(&mut self, ctx: &mut LiveBuildContext<'_>) -> Result<()> {
        let commit = ctx.tree.resolve_commit()?;
        info!("building {} ({})", ctx.tree.main_ref(), commit);
        ctx.commit = Some(commit);
        Ok(())
    }
}

struct PrepareStaging;

impl Step<LiveBuildContext<'_>> for PrepareStaging {
    fn name(&self) -> &'static str {
        "prepare ISO staging tree"
    }

    fn run(&mut self, ctx: &mut LiveBuildContext<'_>) -> Result<()> {
        for dir in [
            ctx.images(),
            ctx.isolinux(),
            ctx.efi_vendor(),
            ctx.isoroot().join("LiveOS"),
            ctx.squashfs_root().join("LiveOS"),
        ] {
            fs::create_dir_all(&dir).context(format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

struct ExtractKernel;

impl Step<LiveBuildContext<'_>> for ExtractKernel {
    fn name(&self) -> &'static str {
        "extract kernel and initramfs"
    }

    fn run(&mut self, ctx: &mut LiveBuildContext<'_>) -> Result<()> {
        let commit = ctx.commit(self.name())?;

        // The module directory is the second entry of the listing, the first
        // one being `/usr/lib/modules` itself.
        let modules = ctx.tree.list("/usr/lib/modules", &commit)?;
        let moduledir = modules
            .get(1)
            .ok_or_else(|| anyhow::anyhow!("no kernel found under /usr/lib/modules"))?;
        info!("extracting kernel and initramfs from {}", moduledir);

        let images = ctx.images();
        for name in [KERNEL_IMG, INITRAMFS_IMG] {
            ctx.tree
                .checkout(&format!("{}/{}", moduledir, name), &images, &commit)?;
            // initramfs is not world readable in the tree
            let path = images.join(name);
            let mut permissions = fs::metadata(&path)
                .context(format!("failed to read {}", path.display()))?
                .permissions();
            permissions.set_mode(permissions.mode() | 0o444);
            fs::set_permissions(&path, permissions)
                .context(format!("failed to set permissions of {}", path.display()))?;
        }
        Ok(())
    }
}

struct ExtractMemtest;

impl Step<LiveBuildContext<'_>> for ExtractMemtest {
    fn name(&self) -> &'static str {
        "extract memtest"
    }

    fn run(&mut self, ctx: &mut LiveBuildContext<'_>) -> Result<()> {
        let commit = ctx.commit(self.name())?;
        let entries = ctx.tree.list("/usr/lib/ostree-boot", &commit)?;
        let memtest = entries.iter().find(|entry| {
            Path::new(entry)
                .file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with(MEMTEST_PREFIX))
        });
        let Some(memtest) = memtest else {
            debug!("no memtest in tree");
            return Ok(());
        };

        let images = ctx.images();
        ctx.tree.checkout(memtest, &images, &commit)?;
        let name = Path::new(memtest)
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("invalid memtest path {}", memtest))?;
        fs::rename(images.join(name), images.join("memtest"))
            .context("failed to rename memtest")?;
        info!("found {}", memtest);
        ctx.has_memtest = true;
        Ok(())
    }
}

struct DetectMediaCheck;

impl Step<LiveBuildContext<'_>> for DetectMediaCheck {
    fn name(&self) -> &'static str {
        "detect media check support"
    }

    fn run(&mut self, ctx: &mut LiveBuildContext<'_>) -> Result<()> {
        let commit = ctx.commit(self.name())?;
        ctx.has_checkisomd5 = !ctx.tree.list(CHECKISOMD5, &commit)?.is_empty();
        debug!("checkisomd5 available: {}", ctx.has_checkisomd5);
        Ok(())
    }
}

struct BuildRootfs;

impl Step<LiveBuildContext<'_>> for BuildRootfs {
    fn name(&self) -> &'static str {
        "create root filesystem"
    }

    fn run(&mut self, ctx: &mut LiveBuildContext<'_>) -> Result<()> {
        let commit = ctx.commit(self.name())?;
        let image = ctx.rootfs_image();
        info!("creating root filesystem");
        create_sparse_file(&image, ctx.opts.manifest.size.as_u64())?;
        mkfs_ext4(ctx.runner, &image, None)?;

        let rootdir = ctx.workspace.join("root");
        let mount = Mount::new(
            ctx.runner,
            &image,
            &rootdir,
            MountOpts {
                loop_file: true,
                ..Default::default()
            },
        )?;
        ctx.scopes.push(mount);

        let ostreedir = rootdir.join("ostree");
        fs::create_dir_all(&ostreedir)
            .context(format!("failed to create {}", ostreedir.display()))?;
        if ctx.opts.manifest.selinux {
            label(ctx.runner, "/", &rootdir)?;
            label(ctx.runner, "/ostree", &ostreedir)?;
        }

        deploy_tree(ctx.runner, &ctx.tree, &rootdir, &commit, ctx.tree.refs())?;
        prepare_var(
            ctx.runner,
            &rootdir,
            ctx.tree.osname(),
            ctx.opts.manifest.selinux,
        )?;

        ctx.scopes.unwind();
        Ok(())
    }
}

struct CompressRootfs;

impl Step<LiveBuildContext<'_>> for CompressRootfs {
    fn name(&self) -> &'static str {
        "compress root filesystem"
    }

    fn run(&mut self, ctx: &mut LiveBuildContext<'_>) -> Result<()> {
        let compression = &ctx.opts.manifest.live.squashfs_compression;
        info!("compressing squashfs with {}", compression);
        let squashfs = ctx.isoroot().join("LiveOS/squashfs.img");
        ctx.runner.run(
            &Tool::new("mksquashfs")
                .arg(".")
                .arg(&squashfs)
                .arg("-comp")
                .arg(compression)
                .current_dir(ctx.squashfs_root()),
        )?;
        Ok(())
    }
}

struct CopyOverlay;

impl Step<LiveBuildContext<'_>> for CopyOverlay {
    fn name(&self) -> &'static str {
        "copy files to ISO"
    }

    fn run(&mut self, ctx: &mut LiveBuildContext<'_>) -> Result<()> {
        let Some(configdir) = &ctx.opts.configdir else {
            return Ok(());
        };
        info!("copying {} to ISO", configdir.display());
        Directory::from_path(configdir)?.copy_overlay(
            &ctx.isoroot(),
            &[
                ("@@FSLABEL@@", ctx.fslabel.as_str()),
                ("@@KERNEL-ARGS@@", ctx.kargs.as_str()),
            ],
            OVERLAY_EXCLUDE,
        )?;
        Ok(())
    }
}

struct WriteBootMenus;

impl Step<LiveBuildContext<'_>> for WriteBootMenus {
    fn name(&self) -> &'static str {
        "write boot menus"
    }

    fn run(&mut self, ctx: &mut LiveBuildContext<'_>) -> Result<()> {
        let live = &ctx.opts.manifest.live;

        let mut syslinux =
            SyslinuxConfig::new(&live.title, &live.product, &ctx.fslabel, live.timeout);
        syslinux.add_linux_stanza(&ctx.kargs);
        if ctx.has_checkisomd5 {
            syslinux.add_check_stanza(&ctx.kargs);
        }
        syslinux.set_vesa_stanza(&ctx.kargs);
        if ctx.has_memtest {
            syslinux.set_memtest_stanza();
        }
        let path = ctx.isolinux().join("isolinux.cfg");
        fs::write(&path, syslinux.render())
            .context(format!("failed to write {}", path.display()))?;

        let mut grub = GrubConfig::new(&live.product, &ctx.fslabel, GRUB_TIMEOUT_SECS);
        grub.add_linux_stanza(&ctx.kargs);
        if ctx.has_checkisomd5 {
            grub.add_check_stanza(&ctx.kargs);
        }
        let path = ctx.efi_vendor().join("grub.cfg");
        fs::write(&path, grub.render()).context(format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

struct InstallIsolinux;

impl Step<LiveBuildContext<'_>> for InstallIsolinux {
    fn name(&self) -> &'static str {
        "copy syslinux files to ISO"
    }

    fn run(&mut self, ctx: &mut LiveBuildContext<'_>) -> Result<()> {
        let isolinux = ctx.isolinux();
        for name in ISOLINUX_FILES {
            let src = ctx.opts.syslinux_dir.join(name);
            let dst = isolinux.join(name);
            fs::copy(&src, &dst).context(format!("failed to copy {}", src.display()))?;
            fs::set_permissions(&dst, fs::Permissions::from_mode(0o755))
                .context(format!("failed to set permissions of {}", dst.display()))?;
        }
        ctx.boot_args.extend(
            [
                "-eltorito-boot",
                "isolinux/isolinux.bin",
                "-eltorito-catalog",
                "isolinux/boot.cat",
                "-no-emul-boot",
                "-boot-load-size",
                "4",
                "-boot-info-table",
            ]
            .map(String::from),
        );
        Ok(())
    }
}

struct CreateEfiBoot;

impl Step<LiveBuildContext<'_>> for CreateEfiBoot {
    fn name(&self) -> &'static str {
        "create EFI boot image"
    }

    fn run(&mut self, ctx: &mut LiveBuildContext<'_>) -> Result<()> {
        let commit = ctx.commit(self.name())?;
        let efidir = ctx.workspace.join("efi");
        info!("extracting EFI files");
        ctx.tree
            .checkout("/usr/lib/ostree-boot/efi/EFI", &efidir, &commit)?;
        create_efi_boot_image(&ctx.images().join("efiboot.img"), &efidir)?;
        ctx.boot_args.extend(
            [
                "-eltorito-alt-boot",
                "-efi-boot",
                "images/efiboot.img",
                "-no-emul-boot",
            ]
            .map(String::from),
        );
        Ok(())
    }
}

struct MasterIso;

impl Step<LiveBuildContext<'_>> for MasterIso {
    fn name(&self) -> &'static str {
        "create ISO image"
    }

    fn run(&mut self, ctx: &mut LiveBuildContext<'_>) -> Result<()> {
        let iso = ctx.workspace.join("live.iso");
        info!("creating ISO image");
        ctx.runner.run(
            &Tool::new("genisoimage")
                .arg("-verbose")
                .arg("-V")
                .arg(&ctx.fslabel)
                .arg("-volset")
                .arg(&ctx.volset)
                .args(["-rational-rock", "-J", "-joliet-long"])
                .args(&ctx.boot_args)
                .arg("-o")
                .arg(&iso)
                .arg(ctx.isoroot()),
        )?;
        ctx.iso = Some(iso);
        Ok(())
    }
}

struct MakeHybrid;

impl Step<LiveBuildContext<'_>> for MakeHybrid {
    fn name(&self) -> &'static str {
        "run isohybrid"
    }

    fn run(&mut self, ctx: &mut LiveBuildContext<'_>) -> Result<()> {
        let iso = ctx.iso(self.name())?;
        ctx.runner.run(&Tool::new("isohybrid").arg(&iso))?;
        Ok(())
    }
}

struct ImplantChecksum;

impl Step<LiveBuildContext<'_>> for ImplantChecksum {
    fn name(&self) -> &'static str {
        "implant MD5 checksum"
    }

    fn run(&mut self, ctx: &mut LiveBuildContext<'_>) -> Result<()> {
        let iso = ctx.iso(self.name())?;
        ctx.runner.run(&Tool::new("implantisomd5").arg(&iso))?;
        Ok(())
    }
}

struct FinalizeImage;

impl Step<LiveBuildContext<'_>> for FinalizeImage {
    fn name(&self) -> &'static str {
        "move image to output"
    }

    fn run(&mut self, ctx: &mut LiveBuildContext<'_>) -> Result<()> {
        let iso = ctx.iso(self.name())?;
        if !ctx.scopes.is_empty() {
            warn!("{} resource(s) still held at the end of build", ctx.scopes.len());
        }
        super::finalize(&iso, &ctx.opts.output)
    }
}

fn setup_pipeline<'c, 'a>(ctx: &'c mut LiveBuildContext<'a>) -> Pipeline<'c, LiveBuildContext<'a>> {
    let arch = ctx.opts.arch.clone();
    let mut steps: Steps<LiveBuildContext<'a>> = vec![
        Box::new(MirrorTree),
        Box::new(ResolveCommit),
        Box::new(PrepareStaging),
        Box::new(ExtractKernel),
        Box::new(ExtractMemtest),
        Box::new(DetectMediaCheck),
        Box::new(BuildRootfs),
        Box::new(CompressRootfs),
        Box::new(CopyOverlay),
        Box::new(WriteBootMenus),
    ];
    if partition::has_bios_boot(&arch) {
        steps.push(Box::new(InstallIsolinux));
    }
    if partition::has_efi_boot(&arch) {
        steps.push(Box::new(CreateEfiBoot));
    }
    steps.push(Box::new(MasterIso));
    if partition::has_bios_boot(&arch) {
        steps.push(Box::new(MakeHybrid));
    }
    steps.push(Box::new(ImplantChecksum));
    steps.push(Box::new(FinalizeImage));
    Pipeline::from_steps(ctx, steps)
}

/// Build live ISO image. Returns the deployed commit.
pub fn build(opts: &BuildOpts, runner: &dyn ToolRunner) -> Result<String> {
    let mut ctx = LiveBuildContext::from_opts(opts, runner)?;
    setup_pipeline(&mut ctx).run()?;
    Ok(ctx.commit("report build result")?)
}
