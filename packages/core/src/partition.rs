//! Destructive initialization of a new dongle.
//!
//! Partitions and formats the raw device, probes the resulting volume
//! UUIDs, installs GRUB, and writes the first descriptor. The whole
//! procedure is gated behind a typed acknowledgement; everything after it
//! is required and runs without per-command confirmation, matching the
//! "you will not be asked again" contract.

use std::collections::BTreeMap;

use log::{info, warn};

use crate::confirm::ConfirmationProvider;
use crate::descriptor::{DeviceDescriptor, PersistentVolumes};
use crate::disk;
use crate::error::Result;
use crate::executor::{Executor, Operation};
use crate::grub;
use crate::store::{ConfigStore, DESCRIPTOR_FILE};
use crate::topology::{self, BOOT_MAPPING, MountLayout, PERSIST_MAPPING};
use crate::volume::VolumeRegistry;

/// Phrase the operator must type before any data is destroyed.
pub const ACKNOWLEDGE_PHRASE: &str = "DESTROY MY DONGLE";

const EFI_SIZE_MIB: u64 = 256;
const BOOT_SIZE_MIB: u64 = 2048;
const ALIGNMENT_GAP_MIB: u64 = 8;

/// Partition sizes chosen by the operator.
///
/// `None` means use the recommended size (half the device, each). The ISO
/// partition is always created because its volume UUID is a required part
/// of the descriptor; `persistent_size_mib = Some(0)` skips the persistent
/// partition.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitOptions {
    pub iso_size_mib: Option<u64>,
    pub persistent_size_mib: Option<u64>,
}

/// Recommended size in MiB for each of the ISO and persistent partitions.
pub fn recommended_share_mib(device_size_bytes: u64) -> u64 {
    (device_size_bytes / (1024 * 1024)) / 2
}

/// Re-partitions and formats `device`, returning the freshly written store.
///
/// Returns `Ok(None)` when the operator declines the acknowledgement; no
/// data is touched in that case.
pub fn init_device(
    device: &str,
    opts: InitOptions,
    exec: &mut Executor,
    vols: &VolumeRegistry,
    layout: &MountLayout,
) -> Result<Option<ConfigStore>> {
    warn!("the following procedure *will* destroy ALL data on '{device}'");
    warn!("YOU WILL NOT BE ASKED AGAIN");
    if !exec.provider().acknowledge(ACKNOWLEDGE_PHRASE)? {
        info!("Stopping procedure by user command. No data was lost.");
        return Ok(None);
    }

    let device_size = disk::device_size_bytes(device)?;
    let recommended = recommended_share_mib(device_size);
    let iso_size = opts.iso_size_mib.filter(|size| *size > 0).unwrap_or(recommended);
    let persistent_size = opts.persistent_size_mib.unwrap_or(recommended);
    info!(
        "partition scheme: EFI {EFI_SIZE_MIB} MiB, boot {BOOT_SIZE_MIB} MiB, \
         ISOs {iso_size} MiB, persistent {persistent_size} MiB"
    );

    let mut run = |command: String, description: &str| {
        exec.execute(Operation {
            command: &command,
            description,
            needed: true,
            confirm: false,
        })
    };

    run(
        format!("parted {device} mklabel gpt"),
        "set USB partition table as GPT",
    )?;

    let parted = format!("parted -a optimal {device}");
    let mut offset = ALIGNMENT_GAP_MIB;
    run(
        format!("{parted} mkpart \"DONGLE_EFI\" fat32 {offset}MB {EFI_SIZE_MIB}MB"),
        "create efi partition on dongle",
    )?;
    run(format!("{parted} set 1 esp on"), "mark /efi as esp")?;

    offset += EFI_SIZE_MIB + ALIGNMENT_GAP_MIB;
    run(
        format!(
            "{parted} mkpart \"DONGLE_BOOT\" {offset}MB {}MB",
            offset + BOOT_SIZE_MIB
        ),
        "create boot partition on dongle",
    )?;
    run(format!("{parted} set 2 boot on"), "mark /boot as boot")?;
    offset += BOOT_SIZE_MIB + ALIGNMENT_GAP_MIB;

    run(
        format!(
            "{parted} mkpart \"DONGLE_ISOs\" {offset}MB {}MB",
            offset + iso_size
        ),
        "create ISOs partition on dongle",
    )?;
    offset += iso_size + ALIGNMENT_GAP_MIB;

    let persistent_index = if persistent_size > 0 {
        run(
            format!("{parted} mkpart \"DONGLE_PERSISTENT\" {offset}MB 100%"),
            "create persistent partition on dongle",
        )?;
        Some(4)
    } else {
        None
    };

    run(
        format!("mkfs.vfat -n DONGLE_EFI -F 32 {device}1"),
        "format DONGLE_EFI as FAT32",
    )?;
    run(
        format!("cryptsetup luksFormat --type luks1 {device}2"),
        "encrypt dongle's /boot partition, user will be asked for passphrase automatically",
    )?;
    vols.unlock_by_path(exec, &format!("{device}2"), BOOT_MAPPING)?;
    exec.execute(Operation {
        command: &format!("mkfs.ext4 /dev/mapper/{BOOT_MAPPING}"),
        description: "format dongle's /boot partition as ext4",
        needed: true,
        confirm: false,
    })?;

    exec.execute(Operation {
        command: &format!("mkfs.ext4 {device}3"),
        description: "format dongle's ISOs partition as ext4",
        needed: true,
        confirm: false,
    })?;
    if let Some(index) = persistent_index {
        exec.execute(Operation {
            command: &format!("cryptsetup luksFormat --type luks2 {device}{index}"),
            description:
                "encrypt dongle's persistent partition, user will be asked for passphrase automatically",
            needed: false,
            confirm: false,
        })?;
        vols.unlock_by_path(exec, &format!("{device}{index}"), PERSIST_MAPPING)?;
        exec.execute(Operation {
            command: &format!("mkfs.ext4 /dev/mapper/{PERSIST_MAPPING}"),
            description: "format dongle's persistent partition",
            needed: false,
            confirm: false,
        })?;
    }

    let persistent = match persistent_index {
        Some(index) => Some(PersistentVolumes {
            locked_uuid: disk::uuid_by_dev(&format!("{device}{index}"))?,
            unlocked_uuid: disk::uuid_by_dev(&format!("/dev/mapper/{PERSIST_MAPPING}"))?,
        }),
        None => None,
    };
    let descriptor = DeviceDescriptor {
        efi_uuid: disk::uuid_by_dev(&format!("{device}1"))?,
        locked_boot_uuid: disk::uuid_by_dev(&format!("{device}2"))?,
        unlocked_boot_uuid: disk::uuid_by_dev(&format!("/dev/mapper/{BOOT_MAPPING}"))?,
        part_iso_uuid: disk::uuid_by_dev(&format!("{device}3"))?,
        persistent,
        installs: BTreeMap::new(),
        isos: BTreeMap::new(),
    };

    let store = ConfigStore::from_parts(layout.boot.join(DESCRIPTOR_FILE), descriptor);
    topology::mount_all(exec, vols, layout, store.descriptor())?;
    grub::encrypted_install(exec)?;
    store.save()?;

    info!("dongle's partition initialization done");
    info!("you are recommended to start adding system installs onto your dongle");
    Ok(Some(store))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recommended_share_is_half_the_device() {
        // 64 GiB stick: 65536 MiB total, half recommended for each.
        let bytes = 64 * 1024 * 1024 * 1024u64;
        assert_eq!(recommended_share_mib(bytes), 32768);
    }

    #[test]
    fn test_init_options_default_to_recommended() {
        let opts = InitOptions::default();
        assert!(opts.iso_size_mib.is_none());
        assert!(opts.persistent_size_mib.is_none());
    }
}
