//! GPT partition layout of disk images.

/// EFI system partition.
pub const GPT_TYPE_ESP: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";

/// BIOS boot partition, used by GRUB to embed its core image on GPT disks.
pub const GPT_TYPE_BIOS: &str = "21686148-6449-6E6F-744E-656564454649";

/// Linux filesystem data.
pub const GPT_TYPE_LINUX: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";

pub const BOOT_LABEL: &str = "boot";
pub const EFI_LABEL: &str = "EFI-SYSTEM";
pub const BIOS_LABEL: &str = "BIOS-BOOT";
pub const ROOT_LABEL: &str = "root";

const BOOT_SIZE_MIB: u64 = 384;
const EFI_SIZE_MIB: u64 = 127;
const BIOS_SIZE_MIB: u64 = 1;

/// Architectures booted by legacy BIOS firmware.
pub fn has_bios_boot(arch: &str) -> bool {
    arch == "x86_64"
}

/// Architectures booted by UEFI firmware.
pub fn has_efi_boot(arch: &str) -> bool {
    matches!(arch, "x86_64" | "aarch64")
}

/// Single partition of the plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    /// Size in MiB, `None` means the rest of the disk.
    pub size_mib: Option<u64>,
    pub type_guid: &'static str,
    pub name: &'static str,
}

/// Ordered partition table for the target architecture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionPlan {
    pub partitions: Vec<Partition>,
}

impl PartitionPlan {
    /// Layout for `arch`: boot, ESP, BIOS boot (BIOS architectures only), root.
    ///
    /// Root always comes last and takes the remaining space.
    pub fn for_arch(arch: &str) -> Self {
        let mut partitions = vec![
            Partition {
                size_mib: Some(BOOT_SIZE_MIB),
                type_guid: GPT_TYPE_LINUX,
                name: BOOT_LABEL,
            },
            Partition {
                size_mib: Some(EFI_SIZE_MIB),
                type_guid: GPT_TYPE_ESP,
                name: EFI_LABEL,
            },
        ];
        if has_bios_boot(arch) {
            partitions.push(Partition {
                size_mib: Some(BIOS_SIZE_MIB),
                type_guid: GPT_TYPE_BIOS,
                name: BIOS_LABEL,
            });
        }
        partitions.push(Partition {
            size_mib: None,
            type_guid: GPT_TYPE_LINUX,
            name: ROOT_LABEL,
        });
        Self { partitions }
    }

    /// 1-based partition number of the boot partition.
    pub fn boot_number(&self) -> usize {
        self.number_of(BOOT_LABEL)
    }

    /// 1-based partition number of the ESP.
    pub fn efi_number(&self) -> usize {
        self.number_of(EFI_LABEL)
    }

    /// 1-based partition number of the root partition.
    pub fn root_number(&self) -> usize {
        self.partitions.len()
    }

    fn number_of(&self, name: &str) -> usize {
        self.partitions
            .iter()
            .position(|p| p.name == name)
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    /// Script for `sfdisk`.
    pub fn to_sfdisk_script(&self) -> String {
        let lines = self.partitions.iter().map(|partition| match partition.size_mib {
            Some(size) => format!(
                "size={}MiB, type={}, name=\"{}\"\n",
                size, partition.type_guid, partition.name
            ),
            None => format!("type={}, name=\"{}\"\n", partition.type_guid, partition.name),
        });
        std::iter::once("label: gpt\n".to_string()).chain(lines).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_x86_64_layout() {
        let plan = PartitionPlan::for_arch("x86_64");
        let names: Vec<_> = plan.partitions.iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["boot", "EFI-SYSTEM", "BIOS-BOOT", "root"]);
        assert_eq!(plan.root_number(), 4);
        assert_eq!(plan.boot_number(), 1);
        assert_eq!(plan.efi_number(), 2);
    }

    #[test]
    fn test_aarch64_layout() {
        let plan = PartitionPlan::for_arch("aarch64");
        assert_eq!(plan.root_number(), 3);
        assert!(plan.partitions.iter().all(|p| p.type_guid != GPT_TYPE_BIOS));
    }

    #[test]
    fn test_sfdisk_script() {
        let script = PartitionPlan::for_arch("x86_64").to_sfdisk_script();
        assert_eq!(
            script,
            "label: gpt\n\
             size=384MiB, type=0FC63DAF-8483-4772-8E79-3D69D8477DE4, name=\"boot\"\n\
             size=127MiB, type=C12A7328-F81F-11D2-BA4B-00A0C93EC93B, name=\"EFI-SYSTEM\"\n\
             size=1MiB, type=21686148-6449-6E6F-744E-656564454649, name=\"BIOS-BOOT\"\n\
             type=0FC63DAF-8483-4772-8E79-3D69D8477DE4, name=\"root\"\n"
        );
    }

    #[test]
    fn test_sfdisk_script_without_bios_boot() {
        let script = PartitionPlan::for_arch("aarch64").to_sfdisk_script();
        assert_eq!(script.lines().count(), 4);
        assert!(script.starts_with("label: gpt\n"));
        assert!(!script.contains("BIOS-BOOT"));
        assert!(script.ends_with("name=\"root\"\n"));
    }

    proptest! {
        #[test]
        fn test_root_is_last_and_unsized(arch in "[a-z0-9_]{1,10}") {
            let plan = PartitionPlan::for_arch(&arch);
            let last = plan.partitions.last().expect("plan is never empty");
            prop_assert_eq!(last.name, ROOT_LABEL);
            prop_assert_eq!(last.size_mib, None);
            prop_assert_eq!(plan.root_number(), plan.partitions.len());
            prop_assert!(plan.partitions[..plan.partitions.len() - 1]
                .iter()
                .all(|p| p.size_mib.is_some()));
            let has_bios = plan.partitions.iter().any(|p| p.type_guid == GPT_TYPE_BIOS);
            prop_assert_eq!(has_bios, has_bios_boot(&arch));
        }
    }
}
