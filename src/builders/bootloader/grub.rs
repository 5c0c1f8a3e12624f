//! UEFI boot menu (GRUB) of live media.

use super::{fill_template, join_kargs, Stanza, MEDIA_CHECK_KARG};

const TEMPLATE: &str = "set default=\"0\"

function load_video {
  insmod efi_gop
  insmod efi_uga
  insmod video_bochs
  insmod video_cirrus
  insmod all_video
}

load_video
set gfxpayload=keep
insmod gzio
insmod part_gpt
insmod ext2

set timeout=@@TIMEOUT@@
### END /etc/grub.d/00_header ###

### BEGIN /etc/grub.d/10_linux ###
@@STANZAS@@
";

/// Menu of the GRUB EFI bootloader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrubConfig {
    product: String,
    fslabel: String,
    timeout: u32,
    stanzas: Vec<Stanza>,
}

impl GrubConfig {
    /// `timeout` is in seconds.
    pub fn new(product: &str, fslabel: &str, timeout: u32) -> Self {
        Self {
            product: product.to_string(),
            fslabel: fslabel.to_string(),
            timeout,
            stanzas: Vec::new(),
        }
    }

    pub fn add_linux_stanza(&mut self, kargs: &str) {
        self.stanzas.push(Stanza::new(
            "linux",
            format!("Start {}", self.product),
            kargs,
        ));
    }

    pub fn add_check_stanza(&mut self, kargs: &str) {
        self.stanzas.push(Stanza::new(
            "check",
            format!("Test this media & start {}", self.product),
            join_kargs(kargs, MEDIA_CHECK_KARG),
        ));
    }

    fn render_stanza(&self, stanza: &Stanza) -> String {
        format!(
            "menuentry '{}' --class fedora --class gnu-linux --class gnu --class os {{\n  linux /images/vmlinuz root=live:CDLABEL={} {}\n  initrd /images/initramfs.img\n}}",
            stanza.label, self.fslabel, stanza.kargs
        )
    }

    /// Full `grub.cfg` text.
    pub fn render(&self) -> String {
        let stanzas = self
            .stanzas
            .iter()
            .map(|stanza| self.render_stanza(stanza))
            .collect::<Vec<_>>()
            .join("\n\n");
        let timeout = self.timeout.to_string();
        fill_template(
            TEMPLATE,
            &[("TIMEOUT", timeout.as_str()), ("STANZAS", stanzas.as_str())],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::GrubConfig;

    #[test]
    fn test_render_empty() {
        let text = GrubConfig::new("Liri OS (Live)", "LIRI", 1).render();
        assert!(!text.contains("@@"));
        assert!(!text.contains("menuentry"));
        assert!(text.contains("set timeout=1\n"));
    }

    #[test]
    fn test_render_entries() {
        let mut config = GrubConfig::new("Liri OS (Live)", "LIRI", 1);
        config.add_linux_stanza("quiet rd.live.image");
        config.add_check_stanza("quiet rd.live.image");
        let text = config.render();
        assert_eq!(text.matches("menuentry '").count(), 2);
        assert!(text.contains("menuentry 'Start Liri OS (Live)' --class fedora"));
        assert!(text.contains(
            "  linux /images/vmlinuz root=live:CDLABEL=LIRI quiet rd.live.image rd.live.check\n"
        ));
        assert!(text.contains("}\n\nmenuentry 'Test this media & start Liri OS (Live)'"));
    }

    #[test]
    fn test_check_without_memtest() {
        let mut config = GrubConfig::new("Liri OS (Live)", "LIRI", 1);
        config.add_linux_stanza("quiet rhgb rd.live.image");
        config.add_check_stanza("quiet rhgb rd.live.image");
        let text = config.render();
        assert_eq!(text.matches("rd.live.check").count(), 1);
        assert_eq!(text.matches("menuentry '").count(), 2);
        assert_eq!(text.matches("memtest").count(), 0);
    }
}
