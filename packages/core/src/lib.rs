//! donglify-core: Core library for managing a multi-boot encrypted USB
//! dongle.
//!
//! The dongle carries several bootable operating-system installs and
//! loopback-bootable ISO images behind encrypted volumes, described by a
//! single versioned `dongle.ini` on its boot volume. This crate owns the
//! descriptor's schema, validation and migration, the volume lifecycle
//! state machine, and the guarded execution contract every external
//! command runs under.
//!
//! # Modules
//!
//! - [`executor`]: Guarded external-command execution (confirm/dry-run/must-succeed)
//! - [`confirm`]: Confirmation providers (interactive and scripted)
//! - [`volume`]: Idempotent unlock/lock/mount/unmount primitives
//! - [`topology`]: The dongle's fixed mount/unmount dependency sequences
//! - [`descriptor`]: Versioned descriptor schema, validation, migration
//! - [`store`]: Descriptor persistence and the operator review gate
//! - [`disk`]: Read-only host probing via `lsblk`
//! - [`partition`]: Destructive initialization of a new dongle
//! - [`grub`]: Bootloader configuration rendering and installation
//! - [`boot`]: Kernel/microcode/initramfs installation per install
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use donglify_core::confirm::StdinConfirmer;
//! use donglify_core::executor::Executor;
//! use donglify_core::store::ConfigStore;
//! use donglify_core::topology::{self, MountLayout};
//! use donglify_core::volume::VolumeRegistry;
//!
//! let mut exec = Executor::new(Box::new(StdinConfirmer));
//! let vols = VolumeRegistry::new();
//! let layout = MountLayout::default();
//!
//! // Unlock and mount the boot volume, then load and review dongle.ini.
//! let store = ConfigStore::locate("/dev/sdb2", &mut exec, &vols, &layout).unwrap();
//! topology::mount_all(&mut exec, &vols, &layout, store.descriptor()).unwrap();
//! ```

pub mod boot;
pub mod confirm;
pub mod descriptor;
pub mod disk;
pub mod error;
pub mod executor;
pub mod grub;
pub mod partition;
pub mod store;
pub mod topology;
pub mod volume;

// Re-export commonly used types
pub use confirm::{ConfirmationProvider, ConfirmationRequest, ScriptedConfirmer, StdinConfirmer};
pub use descriptor::{DeviceDescriptor, IsoImage, SystemInstall};
pub use error::{Error, Result};
pub use executor::{Executor, Operation};
pub use store::ConfigStore;
pub use topology::MountLayout;
pub use volume::VolumeRegistry;
