//! Boot menu configuration for live media and the GRUB files of disk images.
//!
//! Generators hold an immutable template and an append-only list of stanzas.
//! Rendering is pure and may be repeated.

mod grub;
mod syslinux;

pub use grub::GrubConfig;
pub use syslinux::SyslinuxConfig;

/// Kernel argument asking dracut to verify the media checksum before boot.
pub const MEDIA_CHECK_KARG: &str = "rd.live.check";

/// Kernel argument that disables kernel mode setting.
pub const BASIC_GRAPHICS_KARG: &str = "nomodeset";

/// Boot menu entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stanza {
    /// Internal name (syslinux label).
    pub name: String,

    /// Text shown in the menu.
    pub label: String,

    /// Optional help text.
    pub help: Option<String>,

    /// Kernel arguments.
    pub kargs: String,
}

impl Stanza {
    pub fn new<N: Into<String>, L: Into<String>, K: Into<String>>(
        name: N,
        label: L,
        kargs: K,
    ) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            help: None,
            kargs: kargs.into(),
        }
    }

    pub fn with_help<H: Into<String>>(mut self, help: H) -> Self {
        self.help = Some(help.into());
        self
    }
}

/// Join kernel arguments, skipping empty ones.
pub(crate) fn join_kargs(base: &str, extra: &str) -> String {
    [base.trim(), extra.trim()]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Substitute `@@KEY@@` placeholders of `template` in one pass.
///
/// Substituted values are never scanned again, unknown placeholders are kept.
pub(crate) fn fill_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("@@") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let found = after.find("@@").and_then(|end| {
            values
                .iter()
                .find(|(key, _)| *key == &after[..end])
                .map(|(_, value)| (end, *value))
        });
        match found {
            Some((end, value)) => {
                out.push_str(value);
                rest = &after[end + 2..];
            }
            None => {
                out.push_str("@@");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// GRUB configuration installed on the boot partition of disk images.
///
/// Entries come from Boot Loader Specification snippets written by OSTree.
/// The boot partition is found by its label, so the image boots from any disk.
pub const DISK_GRUB_CFG: &str = r#"set pager=1
search --label boot --set boot
set root=$boot

if [ -f ${config_directory}/grubenv ]; then
  load_env -f ${config_directory}/grubenv
elif [ -s $prefix/grubenv ]; then
  load_env
fi

if [ x"${feature_menuentry_id}" = xy ]; then
  menuentry_id_option="--id"
else
  menuentry_id_option=""
fi

function load_video {
  if [ x$feature_all_video_module = xy ]; then
    insmod all_video
  else
    insmod efi_gop
    insmod efi_uga
    insmod ieee1275_fb
    insmod vbe
    insmod vga
    insmod video_bochs
    insmod video_cirrus
  fi
}

serial --speed=115200
terminal_input serial console
terminal_output serial console
if [ x$feature_timeout_style = xy ] ; then
  set timeout_style=menu
  set timeout=1
else
  set timeout=1
fi

insmod blscfg
blscfg
"#;

/// Small GRUB configuration placed next to the vendor EFI binary.
///
/// It locates the boot partition by label and hands over to its configuration.
pub fn vendor_redirect_cfg() -> String {
    format!(
        "search --label {} --set prefix\nset prefix=($prefix)/grub2\nnormal\n",
        crate::builders::partition::BOOT_LABEL
    )
}
