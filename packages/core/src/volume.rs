//! Idempotent volume primitives: unlock, lock, mount, unmount.
//!
//! Each primitive probes the live host state (the `/dev/mapper` directory
//! and the kernel mount table) immediately before acting and becomes a no-op
//! when the target state already holds. Nothing is remembered between calls,
//! so the primitives stay correct after partial failures or out-of-band
//! operator changes.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use snafu::ResultExt;

use crate::error::{IoResultExt, MountTableReadSnafu, Result};
use crate::executor::{Executor, Operation};

/// Default directory where device-mapper exposes decrypted mappings.
pub const MAPPER_DIR: &str = "/dev/mapper";

/// Default kernel mount table.
pub const MOUNT_TABLE: &str = "/proc/mounts";

/// Probes host volume state and drives the unlock/mount primitives.
///
/// The probe paths are injectable so the state machine can be exercised
/// against fixture files.
#[derive(Debug, Clone)]
pub struct VolumeRegistry {
    mapper_dir: PathBuf,
    mount_table: PathBuf,
}

impl Default for VolumeRegistry {
    fn default() -> Self {
        Self {
            mapper_dir: PathBuf::from(MAPPER_DIR),
            mount_table: PathBuf::from(MOUNT_TABLE),
        }
    }
}

impl VolumeRegistry {
    /// Registry probing the real host (`/dev/mapper`, `/proc/mounts`).
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry probing the given paths instead of the live host.
    pub fn with_probe_paths(mapper_dir: impl Into<PathBuf>, mount_table: impl Into<PathBuf>) -> Self {
        Self {
            mapper_dir: mapper_dir.into(),
            mount_table: mount_table.into(),
        }
    }

    /// Whether a decrypted mapping with this name currently exists.
    pub fn mapping_exists(&self, name: &str) -> bool {
        self.mapper_dir.join(name).exists()
    }

    /// Whether something is currently mounted at `dest`, per the mount table.
    pub fn is_mounted(&self, dest: &Path) -> Result<bool> {
        let table = fs::read_to_string(&self.mount_table).context(MountTableReadSnafu {
            path: self.mount_table.clone(),
        })?;
        Ok(table.lines().any(|line| {
            line.split_whitespace()
                .nth(1)
                .is_some_and(|field| Path::new(&unescape_mount_field(field)) == dest)
        }))
    }

    /// Unlocks the encrypted volume with this filesystem UUID into `name`.
    pub fn unlock_by_uuid(&self, exec: &mut Executor, uuid: &str, name: &str) -> Result<()> {
        if self.mapping_exists(name) {
            info!("mapping {name} already exists, skipping unlock");
            return Ok(());
        }
        exec.execute(Operation {
            command: &format!("cryptsetup open /dev/disk/by-uuid/{uuid} {name}"),
            description: &format!("Unlock UUID={uuid} partition and name it as {name}"),
            needed: true,
            confirm: true,
        })
    }

    /// Unlocks the encrypted volume at this device path into `name`.
    pub fn unlock_by_path(&self, exec: &mut Executor, device: &str, name: &str) -> Result<()> {
        if self.mapping_exists(name) {
            info!("mapping {name} already exists, skipping unlock");
            return Ok(());
        }
        exec.execute(Operation {
            command: &format!("cryptsetup open {device} {name}"),
            description: &format!("Unlock disk {device} partition and name it as {name}"),
            needed: true,
            confirm: true,
        })
    }

    /// Discards the decrypted mapping with this name.
    pub fn lock(&self, exec: &mut Executor, name: &str) -> Result<()> {
        if !self.mapping_exists(name) {
            info!("mapping {name} does not exist, nothing to lock");
            return Ok(());
        }
        exec.execute(Operation {
            command: &format!("cryptsetup close {name}"),
            description: &format!("Lock the dongle's {name} partition"),
            needed: true,
            confirm: true,
        })
    }

    /// Mounts the volume with this filesystem UUID at `dest`.
    pub fn mount_by_uuid(&self, exec: &mut Executor, uuid: &str, dest: &Path) -> Result<()> {
        create_mount_point(dest)?;
        if self.is_mounted(dest)? {
            info!("{} is already mounted, skipping", dest.display());
            return Ok(());
        }
        exec.execute(Operation {
            command: &format!("mount UUID={uuid} {}", dest.display()),
            description: &format!("mount dongle's partition UUID={uuid} to {}", dest.display()),
            needed: true,
            confirm: true,
        })
    }

    /// Mounts the decrypted mapping with this name at `dest`.
    pub fn mount_mapper(&self, exec: &mut Executor, name: &str, dest: &Path) -> Result<()> {
        create_mount_point(dest)?;
        if self.is_mounted(dest)? {
            info!("{} is already mounted, skipping", dest.display());
            return Ok(());
        }
        exec.execute(Operation {
            command: &format!("mount {}/{name} {}", MAPPER_DIR, dest.display()),
            description: &format!(
                "mount dongle's partition mapper name {name} to {}",
                dest.display()
            ),
            needed: true,
            confirm: true,
        })
    }

    /// Unmounts whatever is mounted at `dest`.
    pub fn unmount(&self, exec: &mut Executor, dest: &Path) -> Result<()> {
        if !self.is_mounted(dest)? {
            info!("{} is not mounted, nothing to unmount", dest.display());
            return Ok(());
        }
        exec.execute(Operation {
            command: &format!("umount {}", dest.display()),
            description: &format!("un-mount dongle's {}", dest.display()),
            needed: true,
            confirm: true,
        })
    }
}

/// Creates a mount point directory if it doesn't exist.
fn create_mount_point(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path).mount_point_context(path)?;
    }
    Ok(())
}

/// Decodes the octal escapes the kernel uses in mount table fields.
fn unescape_mount_field(input: &str) -> String {
    let mut chars = input.chars().peekable();
    let mut output = String::with_capacity(input.len());

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            output.push(ch);
            continue;
        }
        let mut oct = String::new();
        while oct.len() < 3 {
            match chars.peek() {
                Some(next) if next.is_ascii_digit() => {
                    oct.push(*next);
                    chars.next();
                }
                _ => break,
            }
        }
        if oct.len() == 3 {
            if let Ok(value) = u8::from_str_radix(&oct, 8) {
                output.push(value as char);
                continue;
            }
        }
        output.push('\\');
        output.push_str(&oct);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::ScriptedConfirmer;
    use std::fs;
    use tempfile::TempDir;

    /// Registry and executor wired to a fixture mapper dir and mount table.
    struct Fixture {
        registry: VolumeRegistry,
        exec: Executor,
        mapper: PathBuf,
        mounts: PathBuf,
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
                registry: VolumeRegistry::with_probe_paths(&mapper, &mounts),
                exec: Executor::with_options(Box::new(ScriptedConfirmer::accept_all()), true, true),
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

        fn mount_dest(&self) -> PathBuf {
            self._dir.path().join("mnt")
        }
    }

    #[test]
    fn test_unlock_skips_when_mapping_exists() {
        let mut fx = Fixture::new();
        fx.add_mapping("dongleboot");
        fx.registry
            .unlock_by_uuid(&mut fx.exec, "aaaa-bbbb", "dongleboot")
            .unwrap();
        assert!(fx.exec.history().is_empty());
    }

    #[test]
    fn test_unlock_issues_cryptsetup_open_once() {
        let mut fx = Fixture::new();
        fx.registry
            .unlock_by_uuid(&mut fx.exec, "aaaa-bbbb", "dongleboot")
            .unwrap();
        assert_eq!(
            fx.exec.history(),
            ["cryptsetup open /dev/disk/by-uuid/aaaa-bbbb dongleboot"]
        );
    }

    #[test]
    fn test_lock_skips_when_no_mapping() {
        let mut fx = Fixture::new();
        fx.registry.lock(&mut fx.exec, "dongleboot").unwrap();
        assert!(fx.exec.history().is_empty());
    }

    #[test]
    fn test_lock_closes_existing_mapping() {
        let mut fx = Fixture::new();
        fx.add_mapping("dongleboot");
        fx.registry.lock(&mut fx.exec, "dongleboot").unwrap();
        assert_eq!(fx.exec.history(), ["cryptsetup close dongleboot"]);
    }

    #[test]
    fn test_mount_skips_when_already_mounted() {
        let mut fx = Fixture::new();
        let dest = fx.mount_dest();
        fx.add_mount(&dest);
        fx.registry
            .mount_by_uuid(&mut fx.exec, "cccc-dddd", &dest)
            .unwrap();
        assert!(fx.exec.history().is_empty());
    }

    #[test]
    fn test_mount_creates_mount_point_and_issues_mount() {
        let mut fx = Fixture::new();
        let dest = fx.mount_dest();
        fx.registry
            .mount_by_uuid(&mut fx.exec, "cccc-dddd", &dest)
            .unwrap();
        assert!(dest.is_dir());
        assert_eq!(
            fx.exec.history(),
            [format!("mount UUID=cccc-dddd {}", dest.display())]
        );
    }

    #[test]
    fn test_unmount_skips_when_not_mounted() {
        let mut fx = Fixture::new();
        let dest = fx.mount_dest();
        fx.registry
            .unmount(&mut fx.exec, &dest)
            .unwrap();
        assert!(fx.exec.history().is_empty());
    }

    #[test]
    fn test_unmount_issues_umount_when_mounted() {
        let mut fx = Fixture::new();
        let dest = fx.mount_dest();
        fx.add_mount(&dest);
        fx.registry.unmount(&mut fx.exec, &dest).unwrap();
        assert_eq!(fx.exec.history(), [format!("umount {}", dest.display())]);
    }

    #[test]
    fn test_mount_table_octal_escapes_are_decoded() {
        let fx = Fixture::new();
        let dest = fx._dir.path().join("with space");
        let escaped = dest.display().to_string().replace(' ', "\\040");
        fs::write(&fx.mounts, format!("/dev/sdx1 {escaped} ext4 rw 0 0\n")).unwrap();
        assert!(fx.registry.is_mounted(&dest).unwrap());
    }

    #[test]
    fn test_primitives_are_idempotent_across_repeat_calls() {
        let mut fx = Fixture::new();
        fx.registry
            .unlock_by_path(&mut fx.exec, "/dev/sdx2", "dongleboot")
            .unwrap();
        // Simulate the first call having taken effect.
        fx.add_mapping("dongleboot");
        fx.registry
            .unlock_by_path(&mut fx.exec, "/dev/sdx2", "dongleboot")
            .unwrap();
        assert_eq!(fx.exec.history().len(), 1);
    }
}
