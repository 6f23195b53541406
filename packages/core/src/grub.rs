//! Bootloader configuration rendering and installation.
//!
//! The templates live in `assets/` and are compiled into the binary. The
//! core only substitutes validated descriptor data into them; it never
//! composes bootloader syntax anywhere else.

use std::fs;
use std::path::Path;

use log::info;
use snafu::ResultExt;

use crate::descriptor::DeviceDescriptor;
use crate::error::{FileMoveSnafu, IoResultExt, Result};
use crate::executor::{Executor, Operation};

const DEFAULT_GRUB_TEMPLATE: &str = include_str!("../assets/templates/default-grub");
const HEADER_TEMPLATE: &str = include_str!("../assets/grub.d/header.cfg");
const SYSTEM_TEMPLATE: &str = include_str!("../assets/grub.d/system.cfg");
const LOOPBACK_TEMPLATE: &str = include_str!("../assets/grub.d/isos/loopback.cfg");

const DEFAULT_GRUB_PATH: &str = "/etc/default/grub";

/// Installs GRUB onto the dongle's EFI volume.
///
/// Run with no kernels installed yet and with all volumes mounted. The
/// host's `/etc/default/grub` is moved aside so `grub-install` sees the
/// dongle's cryptodisk-enabled defaults, and restored afterwards.
pub fn encrypted_install(exec: &mut Executor) -> Result<()> {
    let original = Path::new(DEFAULT_GRUB_PATH);
    let backup = Path::new("/etc/default/grub.bak");

    fs::rename(original, backup).context(FileMoveSnafu {
        from: original,
        to: backup,
    })?;
    fs::write(original, DEFAULT_GRUB_TEMPLATE).file_write_context(original)?;

    let result = exec.execute(Operation {
        command:
            "grub-install --target=x86_64-efi --efi-directory=/efi --bootloader-id=GRUB --removable",
        description: "install grub into dongle",
        needed: true,
        confirm: true,
    });

    // Put the host's own defaults back even when grub-install failed.
    fs::rename(backup, original).context(FileMoveSnafu {
        from: backup,
        to: original,
    })?;

    result
}

/// Renders the complete `grub.cfg` for the descriptor's installs and ISOs.
pub fn render_boot_config(desc: &DeviceDescriptor) -> String {
    let mut config = HEADER_TEMPLATE.to_string();

    for (name, install) in &desc.installs {
        config.push_str(
            &SYSTEM_TEMPLATE
                .replace("{name}", name)
                .replace("{kernel_args}", &install.kernel_args)
                .replace("{ucode}", &install.ucode),
        );
    }

    for (name, iso) in &desc.isos {
        config.push_str(
            &LOOPBACK_TEMPLATE
                .replace("{name}", name)
                .replace("{file_name}", &iso.file_name)
                .replace("{loopback_cfg_location}", &iso.loopback_cfg_location)
                .replace("{iso_part_uuid}", &desc.part_iso_uuid),
        );
    }

    config
}

/// Writes the rendered boot configuration onto the mounted boot volume.
pub fn write_boot_config(desc: &DeviceDescriptor, boot_mount: &Path) -> Result<()> {
    let grub_dir = boot_mount.join("grub");
    if !grub_dir.exists() {
        fs::create_dir_all(&grub_dir).file_write_context(&grub_dir)?;
    }
    let path = grub_dir.join("grub.cfg");
    fs::write(&path, render_boot_config(desc)).file_write_context(&path)?;
    info!("grub.cfg has been written");
    Ok(())
}

/// Names of the embedded ISO menu-entry templates.
pub fn iso_template_names() -> &'static [&'static str] {
    &["loopback"]
}
