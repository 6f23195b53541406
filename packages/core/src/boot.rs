//! Kernel, microcode, and initramfs installation for one registered install.
//!
//! Delegates the actual package work to the host package manager and
//! records the installed kernel version back into the descriptor. The
//! boot-image files are renamed to the install-name stem so multiple
//! installs can coexist in the boot volume.

use std::fs;
use std::path::Path;
use std::process::Command;

use log::info;
use snafu::ResultExt;

use crate::error::{
    CommandExitSnafu, CommandSpawnSnafu, IoResultExt, ProbeOutputSnafu, Result, UnknownInstallSnafu,
};
use crate::executor::{Executor, Operation};
use crate::grub;
use crate::store::ConfigStore;
use crate::topology::{self, MountLayout};
use crate::volume::VolumeRegistry;

const MKINITCPIO_TEMPLATE: &str = include_str!("../assets/templates/mkinitcpio.conf");
const SD_SULOGIN_HOOK: &str = include_str!("../assets/sd-sulogin.initramfs.hook");
const SHADOW_INITRAMFS: &str = include_str!("../assets/shadow.initramfs");

const MKINITCPIO_CONF: &str = "/etc/mkinitcpio.conf";
const SD_SULOGIN_PATH: &str = "/etc/initcpio/install/sd-sulogin";
const SHADOW_PATH: &str = "/etc/shadow.initramfs";

/// Renders the mkinitcpio configuration for one install.
pub fn render_mkinitcpio(cryptokeyfile: &str, hooks_added: &str) -> String {
    MKINITCPIO_TEMPLATE
        .replace("$CRYPTO_KEYFILE", cryptokeyfile)
        .replace("$HOOKS_ADDED", hooks_added)
}

fn write_initramfs_config(cryptokeyfile: &str, hooks_added: &str) -> Result<()> {
    let conf = Path::new(MKINITCPIO_CONF);
    fs::write(conf, render_mkinitcpio(cryptokeyfile, hooks_added)).file_write_context(conf)?;
    info!("wrote {MKINITCPIO_CONF}");

    let hook = Path::new(SD_SULOGIN_PATH);
    if let Some(parent) = hook.parent() {
        fs::create_dir_all(parent).file_write_context(parent)?;
    }
    fs::write(hook, SD_SULOGIN_HOOK).file_write_context(hook)?;
    info!("wrote {SD_SULOGIN_PATH}");

    let shadow = Path::new(SHADOW_PATH);
    fs::write(shadow, SHADOW_INITRAMFS).file_write_context(shadow)?;
    info!("wrote {SHADOW_PATH}");

    Ok(())
}

/// Installs (or reinstalls) the kernel stack of a registered install.
///
/// Mounts everything first, writes the initramfs configuration, installs
/// the packages, positions the boot images under the install-name stem,
/// records the installed kernel version, and regenerates `grub.cfg`.
pub fn install_system(
    exec: &mut Executor,
    vols: &VolumeRegistry,
    layout: &MountLayout,
    store: &mut ConfigStore,
    name: &str,
) -> Result<()> {
    topology::mount_all(exec, vols, layout, store.descriptor())?;

    let install = store
        .descriptor()
        .installs
        .get(name)
        .cloned()
        .ok_or_else(|| UnknownInstallSnafu { name }.build())?;

    write_initramfs_config(&install.cryptokeyfile, &install.hooks_added)?;

    let kernel = &install.kernel_name;
    let ucode = &install.ucode;
    exec.execute(Operation {
        command: &format!("pacman -S --noconfirm {kernel} {ucode} mkinitcpio"),
        description: "install the kernel, microcode, and mkinitcpio",
        needed: true,
        confirm: true,
    })?;

    let boot = layout.boot.display();
    exec.execute(Operation {
        command: &format!("rm {boot}/*fallback*"),
        description: "remove kernel fallback images",
        needed: true,
        confirm: true,
    })?;

    exec.execute(Operation {
        command: &format!("mv -f {boot}/vmlinuz-{kernel} {boot}/vmlinuz-{name}"),
        description: "rename linux kernel image",
        needed: true,
        confirm: true,
    })?;
    exec.execute(Operation {
        command: &format!("mv -f {boot}/initramfs-{kernel}.img {boot}/initramfs-{name}.img"),
        description: "rename initramfs image",
        needed: true,
        confirm: true,
    })?;
    exec.execute(Operation {
        command: &format!("mv -f {boot}/{ucode}.img {boot}/{ucode}-{name}.img"),
        description: "rename microcode image",
        needed: true,
        confirm: true,
    })?;

    let version = installed_kernel_version(kernel)?;
    store.set_kernel_version(name, &version)?;

    grub::write_boot_config(store.descriptor(), &layout.boot)?;
    info!(
        "kernel & initramfs are correctly positioned in {} for detection by grub",
        layout.boot.display()
    );
    Ok(())
}

/// Queries the package manager for the installed version of a kernel package.
fn installed_kernel_version(kernel_name: &str) -> Result<String> {
    let command = format!("pacman -Q {kernel_name}");
    let output = Command::new("pacman")
        .args(["-Q", kernel_name])
        .output()
        .context(CommandSpawnSnafu {
            command: command.clone(),
        })?;

    if !output.status.success() {
        return CommandExitSnafu {
            command,
            code: output.status.code().unwrap_or(-1),
        }
        .fail();
    }

    parse_package_version(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
        ProbeOutputSnafu {
            command,
            message: format!("could not parse version of {kernel_name}"),
        }
        .build()
    })
}

/// `pacman -Q` prints `<name> <version>`.
fn parse_package_version(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .nth(1)
        .map(|version| version.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_mkinitcpio_substitutes_placeholders() {
        let rendered = render_mkinitcpio("/boot/crypto_keyfile.bin", "lvm2");
        assert!(rendered.contains("FILES=(/boot/crypto_keyfile.bin)"));
        assert!(rendered.contains("fsck lvm2)"));
        assert!(!rendered.contains("$CRYPTO_KEYFILE"));
        assert!(!rendered.contains("$HOOKS_ADDED"));
    }

    #[test]
    fn test_render_mkinitcpio_with_empty_options() {
        let rendered = render_mkinitcpio("", "");
        assert!(rendered.contains("FILES=()"));
        assert!(!rendered.contains('$'));
    }

    #[test]
    fn test_parse_package_version() {
        assert_eq!(
            parse_package_version("linux-hardened 6.9.1.hardened1-1\n"),
            Some("6.9.1.hardened1-1".to_string())
        );
        assert_eq!(parse_package_version("linux-hardened"), None);
        assert_eq!(parse_package_version(""), None);
    }
}
