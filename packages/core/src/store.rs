//! Loading, migrating, and persisting the device descriptor.
//!
//! `dongle.ini` on the unlocked boot volume is the single source of truth
//! for the device. The store reads it, runs the validate-else-migrate
//! protocol, and holds the only in-memory copy for the session. Every
//! mutation persists before returning, so the on-device file is never stale
//! for more than one command.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use log::{error, info};

use crate::confirm::ConfirmationProvider;
use crate::descriptor::{
    self, DEVICE_SECTION, DeviceDescriptor, IsoImage, ISO_SECTION_PREFIX, RawDocument, RawSection,
    SystemInstall,
};
use crate::error::{
    ConfigEmptySnafu, ConfigInvalidSnafu, ConfigMissingSnafu, ConfigParseSnafu,
    DescriptorRejectedSnafu, DuplicateEntrySnafu, IoResultExt, ReservedNameSnafu, Result,
    UnknownInstallSnafu,
};
use crate::executor::Executor;
use crate::topology::{BOOT_MAPPING, MountLayout};
use crate::volume::VolumeRegistry;

/// Descriptor file name at the root of the boot volume.
pub const DESCRIPTOR_FILE: &str = "dongle.ini";

/// Owns the validated descriptor for the lifetime of a session.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    descriptor: DeviceDescriptor,
}

impl ConfigStore {
    /// Wraps a freshly built descriptor (used by `init`, before first save).
    pub fn from_parts(path: impl Into<PathBuf>, descriptor: DeviceDescriptor) -> Self {
        Self {
            path: path.into(),
            descriptor,
        }
    }

    /// Unlocks and mounts the boot volume of `device`, then loads the
    /// descriptor from it.
    pub fn locate(
        device: &str,
        exec: &mut Executor,
        vols: &VolumeRegistry,
        layout: &MountLayout,
    ) -> Result<Self> {
        info!("attempting to locate {DESCRIPTOR_FILE}");
        vols.unlock_by_path(exec, device, BOOT_MAPPING)?;
        vols.mount_mapper(exec, BOOT_MAPPING, &layout.boot)?;
        Self::load(&layout.boot.join(DESCRIPTOR_FILE), exec.provider())
    }

    /// Loads, validates, and (when necessary) migrates the descriptor file.
    ///
    /// A missing, empty, or unparsable file is fatal. A file that fails
    /// strict validation gets one migration attempt; if the migrated
    /// document validates, the operator must accept it and may persist it
    /// now. When migration doesn't help, the *original* validation errors
    /// are surfaced, because they describe the file actually on disk.
    /// Finally the whole descriptor must pass the operator's review before
    /// the session may use it.
    pub fn load(path: &Path, confirm: &mut dyn ConfirmationProvider) -> Result<Self> {
        if !path.exists() {
            return ConfigMissingSnafu { path }.fail();
        }
        let text = fs::read_to_string(path).config_read_context(path)?;
        let raw = parse_document(&text, path)?;
        if raw.sections.is_empty() {
            return ConfigEmptySnafu { path }.fail();
        }

        let descriptor = match descriptor::validate(&raw) {
            Ok(descriptor) => {
                Self::review_gate(confirm, &descriptor)?;
                descriptor
            }
            Err(original_violations) => {
                info!("attempting to convert {DESCRIPTOR_FILE} to v{}", descriptor::LATEST_VERSION);
                let mut converted = raw.clone();
                let migrated = descriptor::migrate_to_latest(&mut converted)
                    .ok()
                    .and_then(|_| descriptor::validate(&converted).ok());
                let Some(descriptor) = migrated else {
                    error!("could not convert {DESCRIPTOR_FILE} to latest version");
                    error!("please fix {DESCRIPTOR_FILE} manually and try again");
                    return ConfigInvalidSnafu {
                        violations: original_violations,
                    }
                    .fail();
                };
                info!(
                    "{DESCRIPTOR_FILE} has been converted to v{}, manual verification is always recommended",
                    descriptor::LATEST_VERSION
                );
                Self::review_gate(confirm, &descriptor)?;
                if confirm.confirm("Would you like to save this configuration?")? {
                    write_descriptor(path, &descriptor)?;
                    info!("{DESCRIPTOR_FILE} has been saved");
                }
                descriptor
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            descriptor,
        })
    }

    fn review_gate(
        confirm: &mut dyn ConfirmationProvider,
        descriptor: &DeviceDescriptor,
    ) -> Result<()> {
        let accepted = confirm.review(
            &format!("Please review that this {DESCRIPTOR_FILE} is correct:"),
            descriptor.to_ini().trim_end(),
        )?;
        if !accepted {
            return DescriptorRejectedSnafu.fail();
        }
        Ok(())
    }

    /// The validated descriptor.
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Where the descriptor is persisted.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-serializes the descriptor and overwrites the on-device file,
    /// restricting its permissions to owner read/write.
    pub fn save(&self) -> Result<()> {
        write_descriptor(&self.path, &self.descriptor)
    }

    /// Registers a new install and persists immediately.
    pub fn add_install(&mut self, name: &str, install: SystemInstall) -> Result<()> {
        if name == DEVICE_SECTION || name.starts_with(ISO_SECTION_PREFIX) || name.is_empty() {
            return ReservedNameSnafu { name }.fail();
        }
        if self.descriptor.installs.contains_key(name) {
            return DuplicateEntrySnafu { name }.fail();
        }
        self.descriptor.installs.insert(name.to_string(), install);
        self.save()
    }

    /// Registers a new ISO and persists immediately.
    pub fn add_iso(&mut self, name: &str, iso: IsoImage) -> Result<()> {
        if name.is_empty() {
            return ReservedNameSnafu { name }.fail();
        }
        if self.descriptor.isos.contains_key(name) {
            return DuplicateEntrySnafu { name }.fail();
        }
        self.descriptor.isos.insert(name.to_string(), iso);
        self.save()
    }

    /// Records the installed kernel version of an install and persists.
    pub fn set_kernel_version(&mut self, name: &str, version: &str) -> Result<()> {
        let install = self
            .descriptor
            .installs
            .get_mut(name)
            .ok_or_else(|| UnknownInstallSnafu { name }.build())?;
        install.kernel_version = version.to_string();
        self.save()
    }
}

fn write_descriptor(path: &Path, descriptor: &DeviceDescriptor) -> Result<()> {
    fs::write(path, descriptor.to_ini()).config_write_context(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).config_write_context(path)?;
    Ok(())
}

/// Parses the sectioned key/value descriptor format.
///
/// Lines are `[section]` headers or `key = value` properties; `#` and `;`
/// start comments. Anything else, a property outside a section, or a
/// duplicate section name is a parse error.
pub fn parse_document(text: &str, path: &Path) -> Result<RawDocument> {
    let mut raw = RawDocument::default();
    let mut current: Option<String> = None;

    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        let parse_error = |message: String| {
            ConfigParseSnafu {
                path,
                line: index + 1,
                message,
            }
            .fail()
        };

        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(header) = line.strip_prefix('[') {
            let Some(name) = header.strip_suffix(']') else {
                return parse_error(format!("unterminated section header '{line}'"));
            };
            let name = name.trim();
            if name.is_empty() {
                return parse_error("empty section name".to_string());
            }
            if raw.sections.contains_key(name) {
                return parse_error(format!("duplicate section '{name}'"));
            }
            raw.sections.insert(name.to_string(), RawSection::new());
            current = Some(name.to_string());
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return parse_error(format!("expected 'key = value', got '{line}'"));
        };
        let key = key.trim();
        if key.is_empty() {
            return parse_error("property with empty key".to_string());
        }
        let Some(section) = &current else {
            return parse_error(format!("property '{key}' outside of any section"));
        };
        raw.sections
            .get_mut(section)
            .expect("current section exists")
            .insert(key.to_string(), value.trim().to_string());
    }

    Ok(raw)
}
