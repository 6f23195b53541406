//! Device-specific mount and unmount sequences.
//!
//! The dongle's volume graph has a fixed dependency order: the EFI volume
//! mounts directly, the boot volume must be unlocked before its filesystem
//! can be mounted, the ISO volume mounts directly, and an optional
//! persistent volume unlocks and mounts last. Unmounting reverses the
//! logical dependencies and always finishes by locking both mappings, so
//! the device ends safe-to-remove no matter which steps were actually
//! necessary this run.

use std::path::PathBuf;

use log::info;

use crate::descriptor::DeviceDescriptor;
use crate::error::Result;
use crate::executor::{Executor, Operation};
use crate::volume::VolumeRegistry;

/// Mapping name for the decrypted boot volume.
pub const BOOT_MAPPING: &str = "dongleboot";

/// Mapping name for the decrypted persistent volume.
pub const PERSIST_MAPPING: &str = "donglepersist";

/// Where the dongle's volumes are mounted on the host.
#[derive(Debug, Clone)]
pub struct MountLayout {
    pub efi: PathBuf,
    pub boot: PathBuf,
    pub iso: PathBuf,
    pub persist: PathBuf,
}

impl Default for MountLayout {
    fn default() -> Self {
        Self {
            efi: PathBuf::from("/efi"),
            boot: PathBuf::from("/boot"),
            iso: PathBuf::from("/mnt/iso"),
            persist: PathBuf::from("/mnt/persist"),
        }
    }
}

impl MountLayout {
    /// Layout rooted under `base`, for exercising the sequences headlessly.
    pub fn rooted_at(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            efi: base.join("efi"),
            boot: base.join("boot"),
            iso: base.join("iso"),
            persist: base.join("persist"),
        }
    }
}

/// Mounts every volume of the dongle in dependency order.
///
/// Any failing step aborts the sequence; the device is left in whatever
/// intermediate state existed and the operator must re-run.
pub fn mount_all(
    exec: &mut Executor,
    vols: &VolumeRegistry,
    layout: &MountLayout,
    desc: &DeviceDescriptor,
) -> Result<()> {
    vols.mount_by_uuid(exec, &desc.efi_uuid, &layout.efi)?;
    vols.unlock_by_uuid(exec, &desc.locked_boot_uuid, BOOT_MAPPING)?;
    vols.mount_by_uuid(exec, &desc.unlocked_boot_uuid, &layout.boot)?;
    vols.mount_by_uuid(exec, &desc.part_iso_uuid, &layout.iso)?;
    if let Some(persistent) = &desc.persistent {
        vols.unlock_by_uuid(exec, &persistent.locked_uuid, PERSIST_MAPPING)?;
        vols.mount_by_uuid(exec, &persistent.unlocked_uuid, &layout.persist)?;
    }
    info!("mounted all necessary points from donglified usb");
    Ok(())
}

/// Unmounts everything and locks both mappings.
///
/// Locking is attempted even when the corresponding mount step was skipped;
/// the primitives are idempotent, so this only guarantees the end state.
pub fn unmount_all(exec: &mut Executor, vols: &VolumeRegistry, layout: &MountLayout) -> Result<()> {
    vols.unmount(exec, &layout.efi)?;
    vols.unmount(exec, &layout.boot)?;
    vols.unmount(exec, &layout.iso)?;
    vols.unmount(exec, &layout.persist)?;
    vols.lock(exec, BOOT_MAPPING)?;
    vols.lock(exec, PERSIST_MAPPING)?;
    info!("system mounts are now clean, safe to remove dongle");
    Ok(())
}

/// Makes the host's bare EFI and boot directories immutable.
///
/// Prevents a host system from writing into the mount point directories
/// while the dongle is not mounted.
pub fn ensure_mountpoint_only(
    exec: &mut Executor,
    vols: &VolumeRegistry,
    layout: &MountLayout,
) -> Result<()> {
    if vols.is_mounted(&layout.efi)? || vols.is_mounted(&layout.boot)? {
        return Ok(());
    }
    exec.execute(Operation {
        command: &format!("chattr +i {}", layout.efi.display()),
        description: &format!("make host {} only a mountpoint", layout.efi.display()),
        needed: true,
        confirm: false,
    })?;
    exec.execute(Operation {
        command: &format!("chattr +i {}", layout.boot.display()),
        description: &format!("make host {} only a mountpoint", layout.boot.display()),
        needed: true,
        confirm: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::ScriptedConfirmer;
    use crate::descriptor::{DeviceDescriptor, PersistentVolumes};
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor {
            efi_uuid: "EFI1-UUID".to_string(),
            locked_boot_uuid: "LOCKED-UUID".to_string(),
            unlocked_boot_uuid: "BOOT1-UUID".to_string(),
            part_iso_uuid: "ISO1-UUID".to_string(),
            persistent: None,
            installs: BTreeMap::new(),
            isos: BTreeMap::new(),
        }
    }

    struct Fixture {
        exec: Executor,
        vols: VolumeRegistry,
        layout: MountLayout,
        mapper: std::path::PathBuf,
        mounts: std::path::PathBuf,
        _dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let mapper = dir.path().join("mapper");
            let mounts = dir.path().join("mounts");
            fs::create_dir(&mapper).unwrap();
            fs::write(&mounts, "").unwrap();
            Self {
                exec: Executor::with_options(Box::new(ScriptedConfirmer::accept_all()), true, true),
                vols: VolumeRegistry::with_probe_paths(&mapper, &mounts),
                layout: MountLayout::rooted_at(dir.path().join("mnt")),
                mapper,
                mounts,
                _dir: dir,
            }
        }

        fn add_mapping(&self, name: &str) {
            fs::write(self.mapper.join(name), "").unwrap();
        }

        fn add_mount(&self, dest: &Path) {
            let mut table = fs::read_to_string(&self.mounts).unwrap();
            table.push_str(&format!("/dev/sdx1 {} ext4 rw 0 0\n", dest.display()));
            fs::write(&self.mounts, table).unwrap();
        }
    }

    #[test]
    fn test_mount_all_issues_full_sequence_on_clean_host() {
        let mut fx = Fixture::new();
        mount_all(&mut fx.exec, &fx.vols, &fx.layout, &descriptor()).unwrap();
        assert_eq!(
            fx.exec.history(),
            [
                format!("mount UUID=EFI1-UUID {}", fx.layout.efi.display()),
                "cryptsetup open /dev/disk/by-uuid/LOCKED-UUID dongleboot".to_string(),
                format!("mount UUID=BOOT1-UUID {}", fx.layout.boot.display()),
                format!("mount UUID=ISO1-UUID {}", fx.layout.iso.display()),
            ]
        );
    }

    #[test]
    fn test_mount_all_skips_steps_already_in_target_state() {
        // EFI and ISO are already mounted; only the boot volume needs work.
        let mut fx = Fixture::new();
        fx.add_mount(&fx.layout.efi);
        fx.add_mount(&fx.layout.iso);
        mount_all(&mut fx.exec, &fx.vols, &fx.layout, &descriptor()).unwrap();
        assert_eq!(
            fx.exec.history(),
            [
                "cryptsetup open /dev/disk/by-uuid/LOCKED-UUID dongleboot".to_string(),
                format!("mount UUID=BOOT1-UUID {}", fx.layout.boot.display()),
            ]
        );
    }

    #[test]
    fn test_mount_all_includes_persistent_volume_when_present() {
        let mut fx = Fixture::new();
        let mut desc = descriptor();
        desc.persistent = Some(PersistentVolumes {
            locked_uuid: "PLCK-UUID".to_string(),
            unlocked_uuid: "PERS-UUID".to_string(),
        });
        mount_all(&mut fx.exec, &fx.vols, &fx.layout, &desc).unwrap();
        let history = fx.exec.history();
        assert_eq!(history.len(), 6);
        assert_eq!(
            history[4],
            "cryptsetup open /dev/disk/by-uuid/PLCK-UUID donglepersist"
        );
        assert_eq!(
            history[5],
            format!("mount UUID=PERS-UUID {}", fx.layout.persist.display())
        );
    }

    #[test]
    fn test_unmount_all_on_clean_host_issues_nothing() {
        let mut fx = Fixture::new();
        unmount_all(&mut fx.exec, &fx.vols, &fx.layout).unwrap();
        assert!(fx.exec.history().is_empty());
    }

    #[test]
    fn test_unmount_all_reverses_and_locks() {
        let mut fx = Fixture::new();
        fx.add_mount(&fx.layout.efi);
        fx.add_mount(&fx.layout.boot);
        fx.add_mapping(BOOT_MAPPING);
        unmount_all(&mut fx.exec, &fx.vols, &fx.layout).unwrap();
        assert_eq!(
            fx.exec.history(),
            [
                format!("umount {}", fx.layout.efi.display()),
                format!("umount {}", fx.layout.boot.display()),
                "cryptsetup close dongleboot".to_string(),
            ]
        );
    }

    #[test]
    fn test_unmount_all_locks_persistent_mapping_even_without_mounts() {
        let mut fx = Fixture::new();
        fx.add_mapping(PERSIST_MAPPING);
        unmount_all(&mut fx.exec, &fx.vols, &fx.layout).unwrap();
        assert_eq!(fx.exec.history(), ["cryptsetup close donglepersist"]);
    }

    #[test]
    fn test_ensure_mountpoint_only_skips_when_boot_mounted() {
        let mut fx = Fixture::new();
        fx.add_mount(&fx.layout.boot);
        ensure_mountpoint_only(&mut fx.exec, &fx.vols, &fx.layout).unwrap();
        assert!(fx.exec.history().is_empty());
    }

    #[test]
    fn test_ensure_mountpoint_only_marks_both_directories() {
        let mut fx = Fixture::new();
        ensure_mountpoint_only(&mut fx.exec, &fx.vols, &fx.layout).unwrap();
        assert_eq!(
            fx.exec.history(),
            [
                format!("chattr +i {}", fx.layout.efi.display()),
                format!("chattr +i {}", fx.layout.boot.display()),
            ]
        );
    }
}
