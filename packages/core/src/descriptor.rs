//! The versioned data model persisted in `dongle.ini`.
//!
//! Two representations exist side by side: [`RawDocument`] is the direct
//! parse of the sectioned key/value file, and [`DeviceDescriptor`] is the
//! typed model that the rest of the system consumes. Strict validation
//! turns the former into the latter, producing one field-path-annotated
//! [`Violation`] per broken constraint. Documents written by older releases
//! are upgraded by an explicit, ordered list of [`Migration`] steps over the
//! raw form before validation is retried.

use std::collections::BTreeMap;
use std::fmt;

use log::info;

use crate::error::{MigrationUnsupportedSnafu, Result};

/// Current descriptor schema version.
pub const LATEST_VERSION: &str = "1";

/// Reserved section holding the device identity.
pub const DEVICE_SECTION: &str = "dongle";

/// Section name prefix marking ISO entries.
pub const ISO_SECTION_PREFIX: &str = "iso.";

/// Default location of the loopback descriptor inside an ISO.
pub const DEFAULT_LOOPBACK_CFG: &str = "/boot/grub/loopback.cfg";

/// One bootable operating-system entry.
///
/// The entry name is also the on-disk boot-image filename stem, so it is
/// immutable once created; renaming means delete and recreate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInstall {
    /// Kernel package name (`linux`, `linux-hardened`, ...).
    pub kernel_name: String,
    /// Extra kernel command-line arguments, may be empty.
    pub kernel_args: String,
    /// Installed kernel version, empty until the first installation.
    pub kernel_version: String,
    /// Encryption key file loaded into the initramfs, may be empty.
    pub cryptokeyfile: String,
    /// Extra initramfs hooks, may be empty.
    pub hooks_added: String,
    /// Microcode package name (`intel-ucode`, `amd-ucode`).
    pub ucode: String,
}

/// One loopback-bootable ISO entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoImage {
    /// File name at the root of the ISO volume.
    pub file_name: String,
    /// Path of the boot-loopback descriptor inside the ISO.
    pub loopback_cfg_location: String,
}

/// The optional encrypted persistent-data volume pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentVolumes {
    /// UUID of the locked (outer) partition.
    pub locked_uuid: String,
    /// Filesystem UUID of the decrypted mapping.
    pub unlocked_uuid: String,
}

/// Root persisted entity: device identity plus registered installs and ISOs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub efi_uuid: String,
    pub locked_boot_uuid: String,
    pub unlocked_boot_uuid: String,
    pub part_iso_uuid: String,
    pub persistent: Option<PersistentVolumes>,
    pub installs: BTreeMap<String, SystemInstall>,
    pub isos: BTreeMap<String, IsoImage>,
}

impl DeviceDescriptor {
    /// Renders the descriptor in its on-disk form.
    ///
    /// Section order is deterministic: device identity first, then installs
    /// in name order, then ISOs in name order.
    pub fn to_ini(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("[{DEVICE_SECTION}]\n"));
        out.push_str(&format!("version = {LATEST_VERSION}\n"));
        out.push_str(&format!("efi_uuid = {}\n", self.efi_uuid));
        out.push_str(&format!("locked_boot_uuid = {}\n", self.locked_boot_uuid));
        out.push_str(&format!(
            "unlocked_boot_uuid = {}\n",
            self.unlocked_boot_uuid
        ));
        out.push_str(&format!("part_iso_uuid = {}\n", self.part_iso_uuid));
        if let Some(persistent) = &self.persistent {
            out.push_str(&format!(
                "locked_persistent_uuid = {}\n",
                persistent.locked_uuid
            ));
            out.push_str(&format!(
                "unlocked_persistent_uuid = {}\n",
                persistent.unlocked_uuid
            ));
        }

        for (name, install) in &self.installs {
            out.push('\n');
            out.push_str(&format!("[{name}]\n"));
            out.push_str(&format!("kernel_name = {}\n", install.kernel_name));
            out.push_str(&format!("kernel_args = {}\n", install.kernel_args));
            out.push_str(&format!("kernel_version = {}\n", install.kernel_version));
            out.push_str(&format!("cryptokeyfile = {}\n", install.cryptokeyfile));
            out.push_str(&format!("hooks_added = {}\n", install.hooks_added));
            out.push_str(&format!("ucode = {}\n", install.ucode));
        }

        for (name, iso) in &self.isos {
            out.push('\n');
            out.push_str(&format!("[{ISO_SECTION_PREFIX}{name}]\n"));
            out.push_str(&format!("file_name = {}\n", iso.file_name));
            out.push_str(&format!(
                "loopback_cfg_location = {}\n",
                iso.loopback_cfg_location
            ));
        }

        out
    }
}

/// Key/value contents of one descriptor section.
pub type RawSection = BTreeMap<String, String>;

/// A parsed but not yet validated descriptor file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawDocument {
    pub sections: BTreeMap<String, RawSection>,
}

impl RawDocument {
    /// The schema version this document claims, `"0"` when the version key
    /// predates versioning.
    pub fn version(&self) -> &str {
        self.sections
            .get(DEVICE_SECTION)
            .and_then(|section| section.get("version"))
            .map(String::as_str)
            .unwrap_or("0")
    }
}

/// Constraint category of a single validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// A required field is absent.
    MissingField,
    /// A field the schema does not know about.
    UnknownField,
    /// A required field is present but empty.
    EmptyValue,
    /// A field holds an unsupported value.
    WrongValue,
    /// A volume UUID appears more than once.
    DuplicateValue,
    /// A required section is absent.
    MissingSection,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ViolationKind::MissingField => "missing required field",
            ViolationKind::UnknownField => "unknown field",
            ViolationKind::EmptyValue => "must not be empty",
            ViolationKind::WrongValue => "unsupported value",
            ViolationKind::DuplicateValue => "duplicate volume UUID",
            ViolationKind::MissingSection => "missing required section",
        };
        f.write_str(text)
    }
}

/// One broken constraint, annotated with the offending key path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Dotted path of the offending key, e.g. `config.efi_uuid`.
    pub path: String,
    /// The rejected value, empty when the field is absent.
    pub value: String,
    /// Constraint category.
    pub kind: ViolationKind,
}

impl Violation {
    fn new(path: impl Into<String>, value: impl Into<String>, kind: ViolationKind) -> Self {
        Self {
            path: path.into(),
            value: value.into(),
            kind,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Field: {} = '{}', {}", self.path, self.value, self.kind)
    }
}

const DEVICE_REQUIRED_KEYS: &[&str] = &[
    "version",
    "efi_uuid",
    "locked_boot_uuid",
    "unlocked_boot_uuid",
    "part_iso_uuid",
];

const DEVICE_OPTIONAL_KEYS: &[&str] = &["locked_persistent_uuid", "unlocked_persistent_uuid"];

const INSTALL_KEYS: &[&str] = &[
    "kernel_name",
    "kernel_args",
    "kernel_version",
    "cryptokeyfile",
    "hooks_added",
    "ucode",
];

/// Install fields that must carry a value.
const INSTALL_REQUIRED_VALUES: &[&str] = &["kernel_name", "ucode"];

const ISO_KEYS: &[&str] = &["file_name", "loopback_cfg_location"];

/// Strictly validates a raw document against the current schema.
///
/// Returns the typed descriptor, or every violated constraint. Unknown
/// fields, missing fields, and wrong shapes are all rejected; nothing is
/// repaired silently.
pub fn validate(raw: &RawDocument) -> std::result::Result<DeviceDescriptor, Vec<Violation>> {
    let mut violations = Vec::new();

    let Some(device) = raw.sections.get(DEVICE_SECTION) else {
        return Err(vec![Violation::new(
            "config",
            "",
            ViolationKind::MissingSection,
        )]);
    };

    for key in DEVICE_REQUIRED_KEYS {
        match device.get(*key) {
            None => violations.push(Violation::new(
                format!("config.{key}"),
                "",
                ViolationKind::MissingField,
            )),
            Some(value) if value.is_empty() => violations.push(Violation::new(
                format!("config.{key}"),
                "",
                ViolationKind::EmptyValue,
            )),
            Some(_) => {}
        }
    }
    if let Some(version) = device.get("version") {
        if !version.is_empty() && version != LATEST_VERSION {
            violations.push(Violation::new(
                "config.version",
                version.as_str(),
                ViolationKind::WrongValue,
            ));
        }
    }
    for key in DEVICE_OPTIONAL_KEYS {
        if let Some(value) = device.get(*key) {
            if value.is_empty() {
                violations.push(Violation::new(
                    format!("config.{key}"),
                    "",
                    ViolationKind::EmptyValue,
                ));
            }
        }
    }
    let persistent_present = DEVICE_OPTIONAL_KEYS
        .iter()
        .filter(|key| device.contains_key(**key))
        .count();
    if persistent_present == 1 {
        for key in DEVICE_OPTIONAL_KEYS {
            if !device.contains_key(*key) {
                violations.push(Violation::new(
                    format!("config.{key}"),
                    "",
                    ViolationKind::MissingField,
                ));
            }
        }
    }
    for (key, value) in device {
        if !DEVICE_REQUIRED_KEYS.contains(&key.as_str())
            && !DEVICE_OPTIONAL_KEYS.contains(&key.as_str())
        {
            violations.push(Violation::new(
                format!("config.{key}"),
                value.as_str(),
                ViolationKind::UnknownField,
            ));
        }
    }

    let mut installs = BTreeMap::new();
    let mut isos = BTreeMap::new();

    for (section, entries) in &raw.sections {
        if section == DEVICE_SECTION {
            continue;
        }
        if let Some(name) = section.strip_prefix(ISO_SECTION_PREFIX) {
            let path = |key: &str| format!("isos.{name}.{key}");
            for key in ISO_KEYS {
                match entries.get(*key) {
                    None => {
                        violations.push(Violation::new(path(key), "", ViolationKind::MissingField))
                    }
                    Some(value) if value.is_empty() => {
                        violations.push(Violation::new(path(key), "", ViolationKind::EmptyValue))
                    }
                    Some(_) => {}
                }
            }
            for (key, value) in entries {
                if !ISO_KEYS.contains(&key.as_str()) {
                    violations.push(Violation::new(
                        path(key),
                        value.as_str(),
                        ViolationKind::UnknownField,
                    ));
                }
            }
            isos.insert(
                name.to_string(),
                IsoImage {
                    file_name: entries.get("file_name").cloned().unwrap_or_default(),
                    loopback_cfg_location: entries
                        .get("loopback_cfg_location")
                        .cloned()
                        .unwrap_or_default(),
                },
            );
        } else {
            let path = |key: &str| format!("installs.{section}.{key}");
            for key in INSTALL_KEYS {
                match entries.get(*key) {
                    None => {
                        violations.push(Violation::new(path(key), "", ViolationKind::MissingField))
                    }
                    Some(value)
                        if value.is_empty() && INSTALL_REQUIRED_VALUES.contains(key) =>
                    {
                        violations.push(Violation::new(path(key), "", ViolationKind::EmptyValue))
                    }
                    Some(_) => {}
                }
            }
            for (key, value) in entries {
                if !INSTALL_KEYS.contains(&key.as_str()) {
                    violations.push(Violation::new(
                        path(key),
                        value.as_str(),
                        ViolationKind::UnknownField,
                    ));
                }
            }
            installs.insert(
                section.clone(),
                SystemInstall {
                    kernel_name: entries.get("kernel_name").cloned().unwrap_or_default(),
                    kernel_args: entries.get("kernel_args").cloned().unwrap_or_default(),
                    kernel_version: entries.get("kernel_version").cloned().unwrap_or_default(),
                    cryptokeyfile: entries.get("cryptokeyfile").cloned().unwrap_or_default(),
                    hooks_added: entries.get("hooks_added").cloned().unwrap_or_default(),
                    ucode: entries.get("ucode").cloned().unwrap_or_default(),
                },
            );
        }
    }

    // Volume UUIDs must be unique within the descriptor.
    let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
    let id_keys = DEVICE_REQUIRED_KEYS
        .iter()
        .chain(DEVICE_OPTIONAL_KEYS)
        .filter(|key| **key != "version");
    for key in id_keys {
        if let Some(value) = device.get(*key).filter(|value| !value.is_empty()) {
            if seen.insert(value.as_str(), *key).is_some() {
                violations.push(Violation::new(
                    format!("config.{key}"),
                    value.as_str(),
                    ViolationKind::DuplicateValue,
                ));
            }
        }
    }

    if !violations.is_empty() {
        return Err(violations);
    }

    let get = |key: &str| device.get(key).cloned().unwrap_or_default();
    let persistent = if persistent_present == 2 {
        Some(PersistentVolumes {
            locked_uuid: get("locked_persistent_uuid"),
            unlocked_uuid: get("unlocked_persistent_uuid"),
        })
    } else {
        None
    };

    Ok(DeviceDescriptor {
        efi_uuid: get("efi_uuid"),
        locked_boot_uuid: get("locked_boot_uuid"),
        unlocked_boot_uuid: get("unlocked_boot_uuid"),
        part_iso_uuid: get("part_iso_uuid"),
        persistent,
        installs,
        isos,
    })
}

/// One schema upgrade step.
pub struct Migration {
    pub from: &'static str,
    pub to: &'static str,
    pub apply: fn(&mut RawDocument),
}

/// Ordered upgrade chain from the oldest supported shape to the current one.
pub const MIGRATIONS: &[Migration] = &[Migration {
    from: "0",
    to: "1",
    apply: migrate_v0_to_v1,
}];

/// Upgrades a raw document to the latest schema version, step by step.
///
/// The document is mutated in place; validation is the caller's next move.
pub fn migrate_to_latest(raw: &mut RawDocument) -> Result<()> {
    loop {
        let version = raw.version().to_string();
        if version == LATEST_VERSION {
            return Ok(());
        }
        let Some(step) = MIGRATIONS.iter().find(|m| m.from == version) else {
            return MigrationUnsupportedSnafu { version }.fail();
        };
        info!("converting dongle.ini from version {} to {}", step.from, step.to);
        (step.apply)(raw);
        if raw.version() == version {
            // The step could not take effect (e.g. no device section).
            return MigrationUnsupportedSnafu { version }.fail();
        }
    }
}

/// v0 documents predate the version field and carried a redundant `name`
/// key in each install section.
fn migrate_v0_to_v1(raw: &mut RawDocument) {
    if let Some(device) = raw.sections.get_mut(DEVICE_SECTION) {
        device.insert("version".to_string(), "1".to_string());
        info!("added version field to dongle.ini");
    }
    for (section, entries) in &mut raw.sections {
        if section == DEVICE_SECTION || section.starts_with(ISO_SECTION_PREFIX) {
            continue;
        }
        if entries.remove("name").is_some() {
            info!("removed no longer required name field, {section}, from installs");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_section() -> RawSection {
        RawSection::from([
            ("version".to_string(), "1".to_string()),
            ("efi_uuid".to_string(), "AAAA-0001".to_string()),
            ("locked_boot_uuid".to_string(), "AAAA-0002".to_string()),
            ("unlocked_boot_uuid".to_string(), "AAAA-0003".to_string()),
            ("part_iso_uuid".to_string(), "AAAA-0004".to_string()),
        ])
    }

    fn install_section(kernel_version: &str) -> RawSection {
        RawSection::from([
            ("kernel_name".to_string(), "linux-hardened".to_string()),
            ("kernel_args".to_string(), "quiet".to_string()),
            ("kernel_version".to_string(), kernel_version.to_string()),
            ("cryptokeyfile".to_string(), String::new()),
            ("hooks_added".to_string(), String::new()),
            ("ucode".to_string(), "intel-ucode".to_string()),
        ])
    }

    fn valid_document() -> RawDocument {
        let mut raw = RawDocument::default();
        raw.sections
            .insert(DEVICE_SECTION.to_string(), device_section());
        raw.sections
            .insert("arch-main".to_string(), install_section(""));
        raw.sections.insert(
            "iso.grml".to_string(),
            RawSection::from([
                ("file_name".to_string(), "grml64-full.iso".to_string()),
                (
                    "loopback_cfg_location".to_string(),
                    DEFAULT_LOOPBACK_CFG.to_string(),
                ),
            ]),
        );
        raw
    }

    #[test]
    fn test_valid_document_produces_typed_descriptor() {
        let descriptor = validate(&valid_document()).unwrap();
        assert_eq!(descriptor.efi_uuid, "AAAA-0001");
        assert_eq!(descriptor.installs["arch-main"].kernel_args, "quiet");
        assert_eq!(descriptor.installs["arch-main"].kernel_version, "");
        assert_eq!(descriptor.isos["grml"].file_name, "grml64-full.iso");
    }

    #[test]
    fn test_unknown_device_field_is_rejected_with_config_path() {
        let mut raw = valid_document();
        raw.sections
            .get_mut(DEVICE_SECTION)
            .unwrap()
            .insert("foo".to_string(), "bar".to_string());
        let violations = validate(&raw).unwrap_err();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].path, "config.foo");
        assert_eq!(violations[0].value, "bar");
        assert_eq!(violations[0].kind, ViolationKind::UnknownField);
    }

    #[test]
    fn test_missing_required_field_is_reported_per_key() {
        let mut raw = valid_document();
        raw.sections
            .get_mut(DEVICE_SECTION)
            .unwrap()
            .remove("efi_uuid");
        let violations = validate(&raw).unwrap_err();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].path, "config.efi_uuid");
        assert_eq!(violations[0].kind, ViolationKind::MissingField);
    }

    #[test]
    fn test_empty_volume_uuid_is_rejected() {
        let mut raw = valid_document();
        raw.sections
            .get_mut(DEVICE_SECTION)
            .unwrap()
            .insert("part_iso_uuid".to_string(), String::new());
        let violations = validate(&raw).unwrap_err();
        assert_eq!(violations[0].path, "config.part_iso_uuid");
        assert_eq!(violations[0].kind, ViolationKind::EmptyValue);
    }

    #[test]
    fn test_duplicate_volume_uuid_is_rejected() {
        let mut raw = valid_document();
        raw.sections
            .get_mut(DEVICE_SECTION)
            .unwrap()
            .insert("part_iso_uuid".to_string(), "AAAA-0001".to_string());
        let violations = validate(&raw).unwrap_err();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::DuplicateValue);
        assert_eq!(violations[0].path, "config.part_iso_uuid");
    }

    #[test]
    fn test_install_with_unknown_key_is_rejected() {
        let mut raw = valid_document();
        raw.sections
            .get_mut("arch-main")
            .unwrap()
            .insert("name".to_string(), "arch-main".to_string());
        let violations = validate(&raw).unwrap_err();
        assert_eq!(violations[0].path, "installs.arch-main.name");
        assert_eq!(violations[0].kind, ViolationKind::UnknownField);
    }

    #[test]
    fn test_iso_missing_file_name_is_rejected() {
        let mut raw = valid_document();
        raw.sections
            .get_mut("iso.grml")
            .unwrap()
            .remove("file_name");
        let violations = validate(&raw).unwrap_err();
        assert_eq!(violations[0].path, "isos.grml.file_name");
        assert_eq!(violations[0].kind, ViolationKind::MissingField);
    }

    #[test]
    fn test_missing_device_section_is_fatal() {
        let mut raw = valid_document();
        raw.sections.remove(DEVICE_SECTION);
        let violations = validate(&raw).unwrap_err();
        assert_eq!(violations[0].kind, ViolationKind::MissingSection);
        assert_eq!(violations[0].path, "config");
    }

    #[test]
    fn test_half_specified_persistent_pair_is_rejected() {
        let mut raw = valid_document();
        raw.sections
            .get_mut(DEVICE_SECTION)
            .unwrap()
            .insert("locked_persistent_uuid".to_string(), "AAAA-0005".to_string());
        let violations = validate(&raw).unwrap_err();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].path, "config.unlocked_persistent_uuid");
        assert_eq!(violations[0].kind, ViolationKind::MissingField);
    }

    #[test]
    fn test_persistent_pair_round_trips_into_typed_model() {
        let mut raw = valid_document();
        let device = raw.sections.get_mut(DEVICE_SECTION).unwrap();
        device.insert("locked_persistent_uuid".to_string(), "AAAA-0005".to_string());
        device.insert(
            "unlocked_persistent_uuid".to_string(),
            "AAAA-0006".to_string(),
        );
        let descriptor = validate(&raw).unwrap();
        let persistent = descriptor.persistent.unwrap();
        assert_eq!(persistent.locked_uuid, "AAAA-0005");
        assert_eq!(persistent.unlocked_uuid, "AAAA-0006");
    }

    #[test]
    fn test_v0_document_migrates_to_valid_v1() {
        let mut raw = valid_document();
        raw.sections
            .get_mut(DEVICE_SECTION)
            .unwrap()
            .remove("version");
        raw.sections
            .get_mut("arch-main")
            .unwrap()
            .insert("name".to_string(), "arch-main".to_string());
        assert_eq!(raw.version(), "0");

        assert!(validate(&raw).is_err());
        migrate_to_latest(&mut raw).unwrap();
        let descriptor = validate(&raw).unwrap();
        assert_eq!(raw.version(), "1");
        assert!(!descriptor.installs["arch-main"]
            .kernel_name
            .is_empty());
    }

    #[test]
    fn test_unknown_version_has_no_migration_path() {
        let mut raw = valid_document();
        raw.sections
            .get_mut(DEVICE_SECTION)
            .unwrap()
            .insert("version".to_string(), "7".to_string());
        let err = migrate_to_latest(&mut raw).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::MigrationUnsupported { .. }
        ));
    }

    #[test]
    fn test_render_is_deterministic_and_ordered() {
        let descriptor = validate(&valid_document()).unwrap();
        let rendered = descriptor.to_ini();
        let dongle_at = rendered.find("[dongle]").unwrap();
        let install_at = rendered.find("[arch-main]").unwrap();
        let iso_at = rendered.find("[iso.grml]").unwrap();
        assert!(dongle_at < install_at && install_at < iso_at);
        assert_eq!(rendered, descriptor.to_ini());
    }
}
