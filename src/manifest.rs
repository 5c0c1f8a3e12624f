//! Image manifest.
//!
//! A manifest is a YAML document describing what image to build. It is parsed once
//! into an immutable [`Manifest`], with every default declared below.

use bytesize::ByteSize;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error while loading manifest.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid manifest: {0}")]
    Invalid(String),
}

/// Kind of image to produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    /// Live ISO media.
    Live,
    /// Raw disk image.
    Disk,
    /// Disk image converted to qcow2.
    Qemu,
    /// Disk image converted to vmdk.
    Vmware,
    /// Raw disk image for bare metal.
    Metal,
}

impl ImageType {
    /// Whether the image is produced by the disk builder.
    pub fn is_disk(self) -> bool {
        !matches!(self, Self::Live)
    }

    /// File extension of the final artifact.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Live => "iso",
            Self::Disk | Self::Metal => "img",
            Self::Qemu => "qcow2",
            Self::Vmware => "vmdk",
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Live => "live",
            Self::Disk => "disk",
            Self::Qemu => "qemu",
            Self::Vmware => "vmware",
            Self::Metal => "metal",
        })
    }
}

/// Settings used only by live images.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LiveSettings {
    /// Boot menu title.
    pub title: String,

    /// Product name shown in menu entries.
    pub product: String,

    /// Legacy boot menu timeout, in tenths of a second.
    pub timeout: u32,

    /// Compression algorithm passed to `mksquashfs -comp`.
    pub squashfs_compression: String,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            title: "Linux".to_string(),
            product: "Linux (Live)".to_string(),
            timeout: 600,
            squashfs_compression: "zstd".to_string(),
        }
    }
}

fn default_size() -> ByteSize {
    ByteSize::gib(4)
}

fn default_selinux() -> bool {
    true
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<ByteSize, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bytes(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Bytes(bytes) => Ok(ByteSize::b(bytes)),
        Raw::Text(text) => text
            .trim()
            .parse::<ByteSize>()
            .map_err(|err| serde::de::Error::custom(format!("invalid size '{}': {}", text, err))),
    }
}

/// Declarative description of an image.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Manifest {
    #[serde(rename = "type")]
    pub image_type: ImageType,

    /// Size of the disk image, or of the live root filesystem.
    #[serde(default = "default_size", deserialize_with = "deserialize_size")]
    pub size: ByteSize,

    pub osname: String,

    /// Ref deployed into the image. May contain `${basearch}`.
    pub main_ref: String,

    /// Additional refs to mirror. May contain `${basearch}`.
    #[serde(default)]
    pub refs: Vec<String>,

    /// Remote repository URL. Absolute path or `file://` URL means local repository.
    pub remote_url: String,

    #[serde(default)]
    pub extra_kargs: Vec<String>,

    /// Apply SELinux labels to the deployed filesystems.
    #[serde(default = "default_selinux")]
    pub selinux: bool,

    #[serde(default)]
    pub live: LiveSettings,
}

impl Manifest {
    /// Read and validate manifest file.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse and validate manifest text.
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        let manifest: Self = serde_yaml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        for (key, value) in [
            ("osname", &self.osname),
            ("main-ref", &self.main_ref),
            ("remote-url", &self.remote_url),
        ] {
            if value.trim().is_empty() {
                return Err(ManifestError::Invalid(format!("'{}' must not be empty", key)));
            }
        }
        if self.size.as_u64() == 0 {
            return Err(ManifestError::Invalid("'size' must be positive".to_string()));
        }
        Ok(())
    }

    /// Main ref for given architecture.
    pub fn main_ref_for(&self, arch: &str) -> String {
        substitute_basearch(&self.main_ref, arch)
    }

    /// All refs to mirror for given architecture, main ref included.
    pub fn refs_for(&self, arch: &str) -> Vec<String> {
        let mut refs: Vec<String> = self
            .refs
            .iter()
            .map(|r| substitute_basearch(r, arch))
            .collect();
        let main_ref = self.main_ref_for(arch);
        if !refs.contains(&main_ref) {
            refs.push(main_ref);
        }
        refs
    }

    /// Local repository path when remote URL points to the local filesystem.
    pub fn local_repo(&self) -> Option<PathBuf> {
        if let Some(path) = self.remote_url.strip_prefix("file://") {
            return Some(PathBuf::from(path));
        }
        let path = Path::new(&self.remote_url);
        path.is_absolute().then(|| path.to_path_buf())
    }

    /// Replace remote with a local repository directory.
    pub fn use_local_repo(&mut self, dir: &Path) {
        self.remote_url = format!("file://{}", dir.display());
    }

    /// Kernel arguments for live media: extra arguments (or a quiet default) and live marker.
    pub fn live_kargs(&self) -> String {
        let mut kargs = if self.extra_kargs.is_empty() {
            vec!["quiet".to_string(), "rhgb".to_string()]
        } else {
            self.extra_kargs.clone()
        };
        kargs.push("rd.live.image".to_string());
        kargs.join(" ")
    }
}

fn substitute_basearch(value: &str, arch: &str) -> String {
    value.replace("${basearch}", arch)
}
