//! Unified error types for the donglify-core library.
//!
//! Uses SNAFU for context-rich error handling, especially useful when the same
//! underlying error type (like `std::io::Error`) appears in different contexts.

use snafu::{ResultExt, Snafu};
use std::path::PathBuf;

use crate::descriptor::Violation;

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all core library operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Failed to spawn an external command.
    #[snafu(display("failed to execute command '{command}'"))]
    CommandSpawn {
        command: String,
        source: std::io::Error,
    },

    /// Command executed but returned a non-zero exit code.
    #[snafu(display("command '{command}' failed with returncode {code}"))]
    CommandExit { command: String, code: i32 },

    /// The operator declined an operation that was marked as required.
    #[snafu(display("required operation declined by user command: {description}"))]
    DeclinedRequired { description: String },

    /// A confirmation was requested without a description to present.
    #[snafu(display("operation '{command}' requests confirmation but has no description"))]
    MissingDescription { command: String },

    /// Failed to read the operator's answer from the terminal.
    #[snafu(display("failed to read confirmation input"))]
    ConfirmationRead { source: std::io::Error },

    /// The descriptor file does not exist on the boot volume.
    #[snafu(display(
        "{} does not exist, choose another device partition or run donglify init",
        path.display()
    ))]
    ConfigMissing { path: PathBuf },

    /// The descriptor file exists but contains no sections.
    #[snafu(display("{} is empty", path.display()))]
    ConfigEmpty { path: PathBuf },

    /// Failed to read the descriptor file.
    #[snafu(display("failed to read {}", path.display()))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to write the descriptor file.
    #[snafu(display("failed to write {}", path.display()))]
    ConfigWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The descriptor file is not parsable as sectioned key/value data.
    #[snafu(display("failed to parse {} at line {line}: {message}", path.display()))]
    ConfigParse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// The descriptor failed strict schema validation.
    #[snafu(display("dongle.ini is not valid:\n{}", format_violations(violations)))]
    ConfigInvalid { violations: Vec<Violation> },

    /// No migration path exists from the detected schema version.
    #[snafu(display("no migration path from descriptor version '{version}'"))]
    MigrationUnsupported { version: String },

    /// The operator rejected the loaded descriptor at the review gate.
    #[snafu(display("dongle.ini has been rejected by user command"))]
    DescriptorRejected,

    /// An install or ISO with this name already exists in the descriptor.
    #[snafu(display("an entry named '{name}' already exists in dongle.ini"))]
    DuplicateEntry { name: String },

    /// The name collides with a reserved descriptor section.
    #[snafu(display("'{name}' is reserved and cannot be used as an entry name"))]
    ReservedName { name: String },

    /// No install with this name is registered in the descriptor.
    #[snafu(display("no install named '{name}' is registered on the dongle"))]
    UnknownInstall { name: String },

    /// Failed to list the contents of a mounted volume.
    #[snafu(display("failed to list {}", path.display()))]
    DirectoryRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to read the host mount table.
    #[snafu(display("failed to read mount table at {}", path.display()))]
    MountTableRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Mount point creation failed.
    #[snafu(display("failed to create mount point at {}", path.display()))]
    MountPointCreation {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to parse lsblk JSON output.
    #[snafu(display("failed to parse lsblk output: {message}"))]
    LsblkParse { message: String },

    /// An external probe ran but did not report the expected data.
    #[snafu(display("'{command}' reported no usable output: {message}"))]
    ProbeOutput { command: String, message: String },

    /// Failed to write a host configuration file.
    #[snafu(display("failed to write {}", path.display()))]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to move a host configuration file aside or back.
    #[snafu(display("failed to move {} to {}", from.display(), to.display()))]
    FileMove {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl Error {
    /// The process exit code this error should terminate with.
    ///
    /// A failed external command propagates its own exit code; every other
    /// fatal condition exits with 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::CommandExit { code, .. } => *code,
            _ => 1,
        }
    }
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!(" - {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Extension trait for adding context to io::Error results.
pub trait IoResultExt<T> {
    /// Add context for descriptor read errors.
    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for descriptor write errors.
    fn config_write_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for mount point creation errors.
    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for host configuration file writes.
    fn file_write_context(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ConfigReadSnafu { path: path.into() })
    }

    fn config_write_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ConfigWriteSnafu { path: path.into() })
    }

    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(MountPointCreationSnafu { path: path.into() })
    }

    fn file_write_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(FileWriteSnafu { path: path.into() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_exit_code_is_propagated() {
        let err = Error::CommandExit {
            command: "mount UUID=x /efi".to_string(),
            code: 32,
        };
        assert_eq!(err.exit_code(), 32);
    }

    #[test]
    fn test_other_errors_exit_with_one() {
        let err = Error::DescriptorRejected;
        assert_eq!(err.exit_code(), 1);
    }
}
