//! Deployment of the OS tree into a mounted sysroot.
//!
//! Shared by the disk builder (sysroot on the root partition) and the live builder
//! (sysroot on the root filesystem image).

use anyhow::{Context, Result};
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};

use super::tools::{Tool, ToolRunner};
use super::tree::Tree;
use super::BuildError;

/// Apply the SELinux context the host policy assigns to `policy_path` onto `target`.
pub fn label(runner: &dyn ToolRunner, policy_path: &str, target: &Path) -> Result<()> {
    let output = runner
        .run(&Tool::new("matchpathcon").arg("-n").arg(policy_path))
        .context(format!("failed to look up SELinux context of {}", policy_path))?;
    let context = output.trim();
    debug!("labeling {} as {}", target.display(), context);
    runner
        .run(&Tool::new("chcon").arg(context).arg(target))
        .context(format!("failed to label {}", target.display()))?;
    Ok(())
}

/// Directory holding deployment of `commit`.
pub fn deployment_root(sysroot: &Path, osname: &str, commit: &str) -> PathBuf {
    sysroot
        .join("ostree/deploy")
        .join(osname)
        .join("deploy")
        .join(format!("{}.0", commit))
}

/// Directory holding the persistent `/var` of `osname`.
pub fn var_root(sysroot: &Path, osname: &str) -> PathBuf {
    sysroot.join("ostree/deploy").join(osname).join("var")
}

/// Pull `refs` into a fresh repository under `sysroot` and deploy the main ref.
///
/// Returns the deployment root.
pub fn deploy_tree(
    runner: &dyn ToolRunner,
    tree: &Tree<'_>,
    sysroot: &Path,
    commit: &str,
    refs: &[String],
) -> Result<PathBuf> {
    info!("deploying {} ({})", tree.main_ref(), commit);
    let repo = sysroot.join("ostree/repo");
    for dir in [repo.clone(), sysroot.join("ostree/deploy")] {
        fs::create_dir_all(&dir).context(format!("failed to create {}", dir.display()))?;
    }

    runner
        .run(
            &Tool::new("ostree")
                .arg(format!("--repo={}", repo.display()))
                .args(["init", "--mode=bare"]),
        )
        .context("failed to initialize sysroot repository")?;

    tree.pull_into(&repo, refs)
        .context("failed to pull tree into sysroot repository")?;

    let sysroot_arg = format!("--sysroot={}", sysroot.display());
    runner
        .run(
            &Tool::new("ostree")
                .args(["admin", "os-init"])
                .arg(tree.osname())
                .arg(&sysroot_arg),
        )
        .context("failed to initialize OS in sysroot")?;
    runner
        .run(
            &Tool::new("ostree")
                .args(["admin", "deploy"])
                .arg(tree.main_ref())
                .arg(&sysroot_arg)
                .arg(format!("--os={}", tree.osname())),
        )
        .context("failed to deploy tree")?;

    let root = deployment_root(sysroot, tree.osname(), commit);
    if !root.is_dir() {
        return Err(BuildError::MissingDeployment {
            commit: commit.to_string(),
            path: root,
        }
        .into());
    }
    debug!("deployment root: {}", root.display());
    Ok(root)
}

/// Create the minimal `/var` skeleton and label `/var/home`.
pub fn prepare_var(
    runner: &dyn ToolRunner,
    sysroot: &Path,
    osname: &str,
    selinux: bool,
) -> Result<()> {
    let var = var_root(sysroot, osname);
    for dir in ["home", "log/journal", "lib/systemd"] {
        let path = var.join(dir);
        fs::create_dir_all(&path).context(format!("failed to create {}", path.display()))?;
    }
    if selinux {
        label(runner, "/home", &var.join("home"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::tools::fake::FakeRunner;
    use crate::manifest::Manifest;
    use tempdir::TempDir;

    fn manifest() -> Manifest {
        Manifest::parse(
            "type: disk\nosname: liri\nmain-ref: os/x86_64/stable\nremote-url: https://example.org\n",
        )
        .expect("valid manifest")
    }

    #[test]
    fn test_label() -> Result<()> {
        let runner = FakeRunner::new();
        runner.on("matchpathcon", |_| Ok("system_u:object_r:root_t:s0\n".to_string()));
        label(&runner, "/", Path::new("/mnt/root"))?;
        assert_eq!(
            runner.lines_of("chcon"),
            vec!["chcon system_u:object_r:root_t:s0 /mnt/root"]
        );
        Ok(())
    }

    #[test]
    fn test_deploy_tree() -> Result<()> {
        let tmp = TempDir::new("deploy-test")?;
        let sysroot = tmp.path().join("root");
        let runner = FakeRunner::new();
        let root = deployment_root(&sysroot, "liri", "abc");
        let created = root.clone();
        runner.on_arg("ostree", "deploy", move |_| {
            fs::create_dir_all(&created).map_err(|e| {
                crate::builders::tools::ToolError::failed("ostree", "1", &e.to_string())
            })?;
            Ok(String::new())
        });
        let manifest = manifest();
        let tree = Tree::new(&runner, &manifest, "x86_64", tmp.path());

        let refs = vec![tree.main_ref().to_string()];
        assert_eq!(deploy_tree(&runner, &tree, &sysroot, "abc", &refs)?, root);
        let lines = runner.lines_of("ostree");
        assert!(lines[0].ends_with("init --mode=bare"));
        assert!(lines[1].starts_with("ostree pull-local"));
        assert!(lines[1].ends_with("--disable-fsync"));
        assert_eq!(
            lines[3],
            format!(
                "ostree admin deploy os/x86_64/stable --sysroot={} --os=liri",
                sysroot.display()
            )
        );
        Ok(())
    }

    #[test]
    fn test_missing_deployment_is_fatal() -> Result<()> {
        let tmp = TempDir::new("deploy-test")?;
        let runner = FakeRunner::new();
        let manifest = manifest();
        let tree = Tree::new(&runner, &manifest, "x86_64", tmp.path());
        let err = deploy_tree(&runner, &tree, &tmp.path().join("root"), "abc", tree.refs())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::MissingDeployment { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_prepare_var() -> Result<()> {
        let tmp = TempDir::new("deploy-test")?;
        let runner = FakeRunner::new();
        prepare_var(&runner, tmp.path(), "liri", false)?;
        assert!(var_root(tmp.path(), "liri").join("log/journal").is_dir());
        assert!(runner.calls().is_empty());
        prepare_var(&runner, tmp.path(), "liri", true)?;
        assert_eq!(runner.lines_of("matchpathcon"), vec!["matchpathcon -n /home"]);
        Ok(())
    }
}
