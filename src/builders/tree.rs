//! OSTree repository access.
//!
//! [`Tree`] mirrors the remote repository into a local one and answers the questions
//! builders ask about a commit: what is its checksum, what is under a path, give me
//! that path as files, and how big would a filesystem holding it be.

use log::{debug, info};
use serde::Serialize;
use std::cell::OnceCell;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::tools::{Tool, ToolError, ToolRunner};
use crate::manifest::Manifest;

/// Commits younger than this are kept by [`Tree::prune`].
pub const DEFAULT_PRUNE_HORIZON: &str = "1 hour ago";

const MIB: u64 = 1024 * 1024;

/// Error of the tree source.
#[derive(Error, Debug)]
pub enum TreeError {
    #[error("failed to open repository {path}: {message}")]
    Open { path: PathBuf, message: String },

    #[error("ref '{refspec}' not found")]
    NotFound { refspec: String },

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected line in tree listing: '{0}'")]
    Listing(String),
}

impl TreeError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Opened local repository.
#[derive(Debug)]
struct Repo {
    path: PathBuf,
}

impl Repo {
    fn open(path: &Path) -> Result<Self, TreeError> {
        let config = path.join("config");
        if !config.is_file() {
            return Err(TreeError::Open {
                path: path.to_path_buf(),
                message: "not an OSTree repository".to_string(),
            });
        }
        debug!("opened repository {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

/// OS tree of one build.
pub struct Tree<'r> {
    runner: &'r dyn ToolRunner,
    repo_path: PathBuf,
    local: bool,
    osname: String,
    main_ref: String,
    refs: Vec<String>,
    repo: OnceCell<Repo>,
}

impl<'r> Tree<'r> {
    /// Tree described by `manifest` for `arch`.
    ///
    /// Remote trees are mirrored into `<workdir>/repo`, local ones are used in place.
    pub fn new(runner: &'r dyn ToolRunner, manifest: &Manifest, arch: &str, workdir: &Path) -> Self {
        let (repo_path, local) = match manifest.local_repo() {
            Some(path) => (path, true),
            None => (workdir.join("repo"), false),
        };
        Self {
            runner,
            repo_path,
            local,
            osname: manifest.osname.clone(),
            main_ref: manifest.main_ref_for(arch),
            refs: manifest.refs_for(arch),
            repo: OnceCell::new(),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Whether the repository is used in place instead of mirrored.
    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn osname(&self) -> &str {
        &self.osname
    }

    pub fn main_ref(&self) -> &str {
        &self.main_ref
    }

    pub fn refs(&self) -> &[String] {
        &self.refs
    }

    fn ostree(&self) -> Tool {
        Tool::new("ostree").arg(format!("--repo={}", self.repo_path.display()))
    }

    fn open(&self) -> Result<&Repo, TreeError> {
        if let Some(repo) = self.repo.get() {
            return Ok(repo);
        }
        let repo = Repo::open(&self.repo_path)?;
        Ok(self.repo.get_or_init(|| repo))
    }

    /// Mirror every ref from `url` into the local archive repository.
    ///
    /// On failure the repository may be left half-populated; removing it is up to the caller.
    pub fn mirror(&self, url: &str) -> Result<(), TreeError> {
        fs::create_dir_all(&self.repo_path).map_err(|e| TreeError::io(&self.repo_path, e))?;
        if !self.repo_path.join("config").is_file() {
            info!("initializing repository {}", self.repo_path.display());
            self.runner
                .run(&self.ostree().args(["init", "--mode=archive"]))?;
        }
        self.runner.run(
            &self
                .ostree()
                .args(["remote", "add", "--if-not-exists", "--no-gpg-verify"])
                .arg(&self.osname)
                .arg(url),
        )?;
        for refspec in &self.refs {
            info!("pulling {}", refspec);
            self.runner.run(
                &self
                    .ostree()
                    .args(["pull", "--mirror"])
                    .arg(format!("{}:{}", self.osname, refspec)),
            )?;
        }
        Ok(())
    }

    /// Delete objects not reachable from commits newer than `horizon`.
    pub fn prune(&self, horizon: &str) -> Result<(), TreeError> {
        self.runner.run(
            &self
                .ostree()
                .arg("prune")
                .arg(format!("--keep-younger-than={}", horizon)),
        )?;
        Ok(())
    }

    /// Checksum of the commit the main ref points to.
    pub fn resolve_commit(&self) -> Result<String, TreeError> {
        self.open()?;
        let output = self
            .runner
            .run(&self.ostree().arg("rev-parse").arg(&self.main_ref))
            .map_err(|_| TreeError::NotFound {
                refspec: self.main_ref.clone(),
            })?;
        let commit = output.trim().to_string();
        if commit.is_empty() {
            return Err(TreeError::NotFound {
                refspec: self.main_ref.clone(),
            });
        }
        debug!("{} resolved to {}", self.main_ref, commit);
        Ok(commit)
    }

    /// Paths directly under `path` at `commit`.
    ///
    /// The first entry is `path` itself. Missing `path` gives an empty list.
    pub fn list(&self, path: &str, commit: &str) -> Result<Vec<String>, TreeError> {
        let result = self.runner.run(
            &self
                .ostree()
                .args(["ls", "--nul-filenames-only", commit, path]),
        );
        match result {
            Ok(output) => Ok(output
                .split('\0')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect()),
            Err(err) if err.stderr().contains("No such file or directory") => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Extract `path` at `commit` into `dest`.
    pub fn checkout(&self, path: &str, dest: &Path, commit: &str) -> Result<(), TreeError> {
        debug!("checking out {} into {}", path, dest.display());
        self.runner.run(
            &self
                .ostree()
                .args(["checkout", "--user-mode"])
                .arg(format!("--subpath={}", path))
                .arg(commit)
                .arg(dest),
        )?;
        Ok(())
    }

    /// Pull `refs` from this tree into another local repository.
    pub fn pull_into(&self, target_repo: &Path, refs: &[String]) -> Result<(), TreeError> {
        self.runner.run(
            &Tool::new("ostree")
                .arg("pull-local")
                .arg(&self.repo_path)
                .args(refs)
                .arg(format!("--repo={}", target_repo.display()))
                .arg("--disable-fsync"),
        )?;
        Ok(())
    }

    /// Estimate size of a filesystem holding `commit`.
    pub fn estimate_disk_size(
        &self,
        commit: &str,
        opts: &EstimateOpts,
    ) -> Result<SizeEstimate, TreeError> {
        let repo = self.open()?;
        let listing = self
            .runner
            .run(&self.ostree().args(["ls", "-R", "-C", commit, "/"]))?;
        let entries = parse_listing(&listing)?;

        let mut seen = HashSet::new();
        let mut objects = Vec::new();
        objects.push(ReachableObject {
            kind: ObjectKind::Metadata,
            size: metadata_object_size(&repo.path, commit, "commit")?,
        });
        for entry in entries {
            match entry {
                ListedEntry::Dir { contents, meta } => {
                    for (checksum, ext) in [(contents, "dirtree"), (meta, "dirmeta")] {
                        if seen.insert(checksum.clone()) {
                            objects.push(ReachableObject {
                                kind: ObjectKind::Metadata,
                                size: metadata_object_size(&repo.path, &checksum, ext)?,
                            });
                        }
                    }
                }
                ListedEntry::File { checksum, size } => {
                    if seen.insert(checksum) {
                        objects.push(ReachableObject {
                            kind: ObjectKind::RegularFile,
                            size,
                        });
                    }
                }
                ListedEntry::Symlink {
                    checksum,
                    target_len,
                } => {
                    if seen.insert(checksum) {
                        objects.push(ReachableObject {
                            kind: ObjectKind::Symlink,
                            size: target_len,
                        });
                    }
                }
            }
        }
        Ok(estimate(objects, opts))
    }
}

fn metadata_object_size(repo: &Path, checksum: &str, ext: &str) -> Result<u64, TreeError> {
    if checksum.len() < 3 {
        return Err(TreeError::Listing(checksum.to_string()));
    }
    let path = repo
        .join("objects")
        .join(&checksum[..2])
        .join(format!("{}.{}", &checksum[2..], ext));
    fs::metadata(&path)
        .map(|m| m.len())
        .map_err(|e| TreeError::io(&path, e))
}

/// Entry of a recursive `ostree ls -C` listing.
#[derive(Clone, Debug, PartialEq, Eq)]
enum ListedEntry {
    Dir { contents: String, meta: String },
    File { checksum: String, size: u64 },
    Symlink { checksum: String, target_len: u64 },
}

fn parse_listing(listing: &str) -> Result<Vec<ListedEntry>, TreeError> {
    let mut entries = Vec::new();
    for line in listing.lines().filter(|l| !l.trim().is_empty()) {
        let bad_line = || TreeError::Listing(line.to_string());
        let mut fields = line.split_whitespace();
        let mode = fields.next().ok_or_else(bad_line)?;
        let _uid = fields.next().ok_or_else(bad_line)?;
        let _gid = fields.next().ok_or_else(bad_line)?;
        let size = fields
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(bad_line)?;
        let checksum = fields.next().ok_or_else(bad_line)?.to_string();
        let entry = match mode.chars().next() {
            Some('d') => ListedEntry::Dir {
                contents: checksum,
                meta: fields.next().ok_or_else(bad_line)?.to_string(),
            },
            Some('l') => {
                let rest = fields.collect::<Vec<_>>().join(" ");
                let target = rest.split_once(" -> ").map(|(_, t)| t).ok_or_else(bad_line)?;
                ListedEntry::Symlink {
                    checksum,
                    target_len: target.len() as u64,
                }
            }
            Some('-') => ListedEntry::File { checksum, size },
            _ => return Err(bad_line()),
        };
        entries.push(entry);
    }
    Ok(entries)
}

/// Parameters of [`Tree::estimate_disk_size`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EstimateOpts {
    pub block_size: u64,
    pub inode_size: u64,
    /// Filesystem overhead plus safety margin, in percent of the raw total.
    pub margin_percent: u64,
}

impl Default for EstimateOpts {
    fn default() -> Self {
        Self {
            block_size: 4096,
            inode_size: 512,
            margin_percent: 20,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    Metadata,
    RegularFile,
    Symlink,
}

/// Object reachable from a commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReachableObject {
    pub kind: ObjectKind,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ObjectTally {
    pub count: u64,
    pub blocks: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct InodeTally {
    pub count: u64,
    pub mb: u64,
}

/// Size estimate with its breakdown.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SizeEstimate {
    pub meta: ObjectTally,
    pub regfiles: ObjectTally,
    pub symlinks: ObjectTally,
    pub inodes: InodeTally,
    /// Blocks and inode tables, in MiB.
    pub base_mb: u64,
    /// Base size with the margin applied, in MiB.
    pub final_mb: u64,
}

impl SizeEstimate {
    pub fn bytes(&self) -> u64 {
        self.final_mb * MIB
    }
}

/// Fold reachable objects into an estimate.
pub fn estimate<I>(objects: I, opts: &EstimateOpts) -> SizeEstimate
where
    I: IntoIterator<Item = ReachableObject>,
{
    let block_size = opts.block_size.max(1);
    let mut meta = ObjectTally::default();
    let mut regfiles = ObjectTally::default();
    let mut symlinks = ObjectTally::default();

    for object in objects {
        let tally = match object.kind {
            ObjectKind::Metadata => &mut meta,
            ObjectKind::RegularFile => &mut regfiles,
            ObjectKind::Symlink => &mut symlinks,
        };
        tally.count += 1;
        tally.blocks += object.size / block_size + 1;
    }

    let blocks = meta.blocks + regfiles.blocks + symlinks.blocks;
    let blocks_per_mb = (MIB / block_size).max(1);
    let data_mb = blocks.div_ceil(blocks_per_mb);

    let inode_count = meta.count + regfiles.count + symlinks.count;
    let inodes = InodeTally {
        count: inode_count,
        mb: 1 + inode_count * opts.inode_size / MIB,
    };

    let base_mb = data_mb + inodes.mb;
    let final_mb = base_mb * (100 + opts.margin_percent) / 100 + 1;

    SizeEstimate {
        meta,
        regfiles,
        symlinks,
        inodes,
        base_mb,
        final_mb,
    }
}
