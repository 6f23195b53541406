//! Interactive dongle session: prompt loop and command dispatch.
//!
//! All user prompting lives here; the core state machine only sees
//! validated data and the confirmation provider.

use std::fs;
use std::io::{self, BufRead, Write};

use donglify_core::boot;
use donglify_core::confirm::StdinConfirmer;
use donglify_core::descriptor::{DEFAULT_LOOPBACK_CFG, IsoImage, SystemInstall};
use donglify_core::disk;
use donglify_core::error::{ConfirmationReadSnafu, DirectoryReadSnafu, Result};
use donglify_core::executor::{Executor, Operation};
use donglify_core::grub;
use donglify_core::store::ConfigStore;
use donglify_core::topology::{self, MountLayout};
use donglify_core::volume::VolumeRegistry;
use snafu::ResultExt;

const COMMANDS: &str = "mount unmount add reinstall update status list iso";
const ISO_COMMANDS: &str = "iso list | iso add | iso templates";

/// One interactive session against an initialized dongle.
pub struct Session {
    exec: Executor,
    vols: VolumeRegistry,
    layout: MountLayout,
    store: ConfigStore,
}

impl Session {
    /// Unlocks the device's boot volume and loads the descriptor.
    pub fn start(device: &str, yes: bool, dry_run: bool) -> Result<Self> {
        let mut exec = Executor::with_options(Box::new(StdinConfirmer), !yes, dry_run);
        let vols = VolumeRegistry::new();
        let layout = MountLayout::default();
        let store = ConfigStore::locate(device, &mut exec, &vols, &layout)?;
        Ok(Self {
            exec,
            vols,
            layout,
            store,
        })
    }

    /// Runs the prompt loop until EOF.
    pub fn run(&mut self) -> Result<()> {
        loop {
            println!("available commands: {COMMANDS}");
            let Some(line) = prompt_line("donglify> ")? else {
                println!();
                println!("Farewell, Traveller.");
                return Ok(());
            };

            match line.as_str() {
                "" => {}
                "status" => print!("{}", disk::filesystem_overview()?),
                "list" => self.cmd_list(),
                "mount" => {
                    self.cmd_mount()?;
                    print!("{}", disk::filesystem_overview()?);
                }
                "unmount" => {
                    self.cmd_unmount()?;
                    print!("{}", disk::filesystem_overview()?);
                }
                "add" => self.cmd_add()?,
                "reinstall" => self.cmd_reinstall()?,
                "update" => self.cmd_update()?,
                "iso list" => self.cmd_iso_list(),
                "iso add" => self.cmd_iso_add()?,
                "iso templates" => self.cmd_iso_templates(),
                "iso" => println!("iso commands: {ISO_COMMANDS}"),
                other => {
                    println!("command {other} not recognized");
                    println!("Commands: {COMMANDS}");
                }
            }
        }
    }

    fn cmd_mount(&mut self) -> Result<()> {
        topology::mount_all(
            &mut self.exec,
            &self.vols,
            &self.layout,
            self.store.descriptor(),
        )
    }

    fn cmd_unmount(&mut self) -> Result<()> {
        topology::unmount_all(&mut self.exec, &self.vols, &self.layout)
    }

    fn cmd_list(&self) {
        let installs = &self.store.descriptor().installs;
        if installs.is_empty() {
            println!("no system installs on dongle");
            return;
        }
        println!("listing registered installs on dongle");
        for (name, install) in installs {
            println!();
            println!("name: {name}");
            println!("kernel_name: {}", install.kernel_name);
            println!("kernel_args: {}", install.kernel_args);
            println!("kernel_version: {}", install.kernel_version);
            println!("cryptokeyfile: {}", install.cryptokeyfile);
            println!("hooks_added: {}", install.hooks_added);
            println!("ucode: {}", install.ucode);
        }
        println!();
    }

    fn cmd_add(&mut self) -> Result<()> {
        println!("Fill configs for current system:");
        let Some(name) = prompt_line("install name, shown on GRUB: ")? else {
            return Ok(());
        };
        let Some(kernel_name) = prompt_line("kernel package name [linux/-hardened/-lts/..]: ")?
        else {
            return Ok(());
        };
        let Some(kernel_args) = prompt_line("kernel args [optional]: ")? else {
            return Ok(());
        };
        let Some(ucode) = prompt_line("microcode package to be installed [intel-ucode/amd-ucode]: ")?
        else {
            return Ok(());
        };
        let Some(cryptokeyfile) =
            prompt_line("encryption key file to be loaded into initramfs [optional]: ")?
        else {
            return Ok(());
        };
        let Some(hooks_added) = prompt_line("hooks to be added to initramfs [optional]: ")? else {
            return Ok(());
        };

        self.store.add_install(
            &name,
            SystemInstall {
                kernel_name,
                kernel_args,
                kernel_version: String::new(),
                cryptokeyfile,
                hooks_added,
                ucode,
            },
        )?;

        println!("adding current host system to donglify");
        topology::unmount_all(&mut self.exec, &self.vols, &self.layout)?;
        topology::ensure_mountpoint_only(&mut self.exec, &self.vols, &self.layout)?;
        self.install(&name)
    }

    fn cmd_reinstall(&mut self) -> Result<()> {
        let Some(name) = self.select_install()? else {
            println!("no available system configurations to reinstall");
            return Ok(());
        };
        self.install(&name)
    }

    fn cmd_update(&mut self) -> Result<()> {
        let Some(name) = self.select_install()? else {
            println!("no available installs, try the 'add' command first");
            return Ok(());
        };
        let Some(command) = prompt_line("Enter your system's update command: ")? else {
            return Ok(());
        };
        topology::mount_all(
            &mut self.exec,
            &self.vols,
            &self.layout,
            self.store.descriptor(),
        )?;
        self.exec.execute(Operation {
            command: &command,
            description: "Runs user given system update command.",
            needed: true,
            confirm: true,
        })?;
        self.install(&name)
    }

    fn cmd_iso_list(&self) {
        let isos = &self.store.descriptor().isos;
        if isos.is_empty() {
            println!("no isos are added to dongle");
            return;
        }
        for (name, iso) in isos {
            println!();
            println!("name: {name}");
            println!("file_name: {}", iso.file_name);
            println!("loopback_cfg_location: {}", iso.loopback_cfg_location);
        }
        println!();
    }

    fn cmd_iso_add(&mut self) -> Result<()> {
        let iso_uuid = self.store.descriptor().part_iso_uuid.clone();
        self.vols
            .mount_by_uuid(&mut self.exec, &iso_uuid, &self.layout.iso)?;

        let entries = fs::read_dir(&self.layout.iso).context(DirectoryReadSnafu {
            path: self.layout.iso.clone(),
        })?;
        let mut available: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        available.sort();
        println!("files on ISOs partition: {}", available.join(" "));

        let Some(name) = prompt_line("Name of the system to be added: ")? else {
            return Ok(());
        };
        let Some(file_name) =
            prompt_line("Filename of the iso on ISOs partition (must be in root of ISOs partition): ")?
        else {
            return Ok(());
        };
        let Some(loopback) =
            prompt_line(&format!("loopback.cfg location in ISO [{DEFAULT_LOOPBACK_CFG}]: "))?
        else {
            return Ok(());
        };
        let loopback_cfg_location = if loopback.is_empty() {
            DEFAULT_LOOPBACK_CFG.to_string()
        } else {
            loopback
        };

        self.store.add_iso(
            &name,
            IsoImage {
                file_name,
                loopback_cfg_location,
            },
        )?;
        grub::write_boot_config(self.store.descriptor(), &self.layout.boot)
    }

    fn cmd_iso_templates(&self) {
        println!("available iso grub configuration templates:");
        for name in grub::iso_template_names() {
            println!("  {name}");
        }
    }

    fn install(&mut self, name: &str) -> Result<()> {
        boot::install_system(
            &mut self.exec,
            &self.vols,
            &self.layout,
            &mut self.store,
            name,
        )
    }

    fn select_install(&mut self) -> Result<Option<String>> {
        let names: Vec<String> = self.store.descriptor().installs.keys().cloned().collect();
        if names.is_empty() {
            return Ok(None);
        }
        println!("registered installs: {}", names.join(" "));
        let Some(name) = prompt_line("install name: ")? else {
            return Ok(None);
        };
        if names.contains(&name) {
            Ok(Some(name))
        } else {
            println!("no install named '{name}'");
            Ok(None)
        }
    }
}

/// Prints `prompt` and reads one trimmed line; `None` on EOF.
pub fn prompt_line(prompt: &str) -> Result<Option<String>> {
    print!("{prompt}");
    io::stdout().flush().context(ConfirmationReadSnafu)?;
    let mut line = String::new();
    let read = io::stdin()
        .lock()
        .read_line(&mut line)
        .context(ConfirmationReadSnafu)?;
    if read == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

/// Reads an optional partition size in MiB; empty input means `None`.
pub fn prompt_size(prompt: &str) -> Result<Option<u64>> {
    loop {
        let Some(line) = prompt_line(prompt)? else {
            return Ok(None);
        };
        if line.is_empty() {
            return Ok(None);
        }
        match line.parse::<u64>() {
            Ok(size) => return Ok(Some(size)),
            Err(_) => println!("please enter a whole number of MiB, or leave empty"),
        }
    }
}

/// Terminates the whole process on Ctrl-C with a farewell.
///
/// No cleanup of partially-unlocked or mounted volumes is attempted; the
/// idempotent primitives make the next run safe regardless.
pub fn install_interrupt_handler() {
    use nix::libc;
    use nix::sys::signal::{SigHandler, Signal, signal};

    extern "C" fn on_interrupt(_: libc::c_int) {
        const MSG: &[u8] = b"\n\nFarewell, Traveller.\n";
        unsafe {
            libc::write(libc::STDERR_FILENO, MSG.as_ptr().cast(), MSG.len());
            libc::_exit(1);
        }
    }

    unsafe {
        let _ = signal(Signal::SIGINT, SigHandler::Handler(on_interrupt));
    }
}
