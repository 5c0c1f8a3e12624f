//! Legacy BIOS boot menu (isolinux).

use super::{fill_template, join_kargs, Stanza, BASIC_GRAPHICS_KARG, MEDIA_CHECK_KARG};

const TEMPLATE: &str = "default vesamenu.c32
timeout @@TIMEOUT@@

display boot.msg

menu autoboot Starting @@TITLE@@ in # second{,s}. Press any key to interrupt.

menu clear
menu background splash.png
menu title @@TITLE@@
menu vshift 8
menu rows 18
menu margin 8
menu helpmsgrow 15
menu tabmsgrow 13

menu color border * #00000000 #00000000 none
menu color sel 0 #ffffffff #00000000 none
menu color title 0 #ff7ba3d0 #00000000 none
menu color tabmsg 0 #ff3a6496 #00000000 none
menu color unsel 0 #84b8ffff #00000000 none
menu color hotsel 0 #84b8ffff #00000000 none
menu color hotkey 0 #ffffffff #00000000 none
menu color help 0 #ffffffff #00000000 none
menu color scrollbar 0 #ffffffff #ff355594 none
menu color timeout 0 #ffffffff #00000000 none
menu color timeout_msg 0 #ffffffff #00000000 none
menu color cmdmark 0 #84b8ffff #00000000 none
menu color cmdline 0 #ffffffff #00000000 none

menu tabmsg Press Tab for full configuration options on menu items.

menu separator
menu separator
@@STANZAS@@
menu separator
menu begin ^Troubleshooting
  menu title Troubleshooting
@@TROUBLESHOOTING@@
menu separator

label local
  menu label Boot from ^local drive
  localboot 0xffff

menu separator

label returntomain
  menu label Return to ^main menu.
  menu exit

menu end
";

const VESA_HELP: &str = "Try this option out if you're having trouble starting
\tthe system.";

const MEMTEST_HELP: &str = "If your system is having issues, a problem with your
\tsystem's memory may be the cause. Use this utility to see if
\tthe memory is working correctly.";

/// Menu of the isolinux bootloader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyslinuxConfig {
    title: String,
    product: String,
    fslabel: String,
    timeout: u32,
    stanzas: Vec<Stanza>,
    vesa: Option<Stanza>,
    memtest: Option<Stanza>,
}

impl SyslinuxConfig {
    /// `timeout` is in tenths of a second.
    pub fn new(title: &str, product: &str, fslabel: &str, timeout: u32) -> Self {
        Self {
            title: title.to_string(),
            product: product.to_string(),
            fslabel: fslabel.to_string(),
            timeout,
            stanzas: Vec::new(),
            vesa: None,
            memtest: None,
        }
    }

    /// Entry starting the live system.
    pub fn add_linux_stanza(&mut self, kargs: &str) {
        self.stanzas.push(Stanza::new(
            "linux",
            format!("^Start {}", self.product),
            kargs,
        ));
    }

    /// Entry verifying the media before starting the live system.
    pub fn add_check_stanza(&mut self, kargs: &str) {
        self.stanzas.push(Stanza::new(
            "check",
            format!("Test this ^media & start {}", self.product),
            join_kargs(kargs, MEDIA_CHECK_KARG),
        ));
    }

    /// Troubleshooting entry starting without kernel mode setting.
    pub fn set_vesa_stanza(&mut self, kargs: &str) {
        self.vesa = Some(
            Stanza::new(
                "vesa",
                format!("Start {} in ^basic graphics mode", self.product),
                join_kargs(kargs, BASIC_GRAPHICS_KARG),
            )
            .with_help(VESA_HELP),
        );
    }

    /// Troubleshooting entry running the memory tester.
    pub fn set_memtest_stanza(&mut self) {
        self.memtest =
            Some(Stanza::new("memtest", "Run a ^memory test", "").with_help(MEMTEST_HELP));
    }

    fn render_stanza(&self, stanza: &Stanza) -> String {
        format!(
            "\nlabel {}\n  menu label {}\n  kernel /images/vmlinuz\n  append initrd=/images/initramfs.img root=live:CDLABEL={} {}\n",
            stanza.name, stanza.label, self.fslabel, stanza.kargs
        )
    }

    fn render_vesa(&self, stanza: &Stanza) -> String {
        format!(
            "\nlabel {}\n  menu indent count 5\n  menu label {}\n  text help\n\t{}\n  endtext\n  kernel /images/vmlinuz\n  append initrd=/images/initramfs.img root=live:CDLABEL={} {}\n",
            stanza.name,
            stanza.label,
            stanza.help.as_deref().unwrap_or_default(),
            self.fslabel,
            stanza.kargs
        )
    }

    fn render_memtest(stanza: &Stanza) -> String {
        format!(
            "\nlabel {}\n  menu label {}\n  text help\n\t{}\n  endtext\n  kernel /images/memtest\n",
            stanza.name,
            stanza.label,
            stanza.help.as_deref().unwrap_or_default()
        )
    }

    /// Full `isolinux.cfg` text.
    pub fn render(&self) -> String {
        let stanzas: String = self
            .stanzas
            .iter()
            .map(|stanza| self.render_stanza(stanza))
            .collect();

        let mut troubleshooting = String::new();
        if let Some(vesa) = &self.vesa {
            troubleshooting.push_str(&self.render_vesa(vesa));
        }
        if let Some(memtest) = &self.memtest {
            troubleshooting.push_str(&Self::render_memtest(memtest));
        }

        let timeout = self.timeout.to_string();
        fill_template(
            TEMPLATE,
            &[
                ("TIMEOUT", timeout.as_str()),
                ("TITLE", self.title.as_str()),
                ("STANZAS", stanzas.as_str()),
                ("TROUBLESHOOTING", troubleshooting.as_str()),
            ],
        )
    }
}
