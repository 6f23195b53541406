//! donglify - manage a multi-boot encrypted USB dongle.
//!
//! `donglify init /dev/<usb>` destructively prepares a new dongle;
//! `donglify /dev/<usb><boot-index>` opens an interactive session against
//! an initialized one.

mod session;

use clap::{Parser, Subcommand};
use donglify_core::confirm::StdinConfirmer;
use donglify_core::executor::Executor;
use donglify_core::partition::{self, InitOptions};
use donglify_core::topology::MountLayout;
use donglify_core::volume::VolumeRegistry;
use env_logger::Env;
use log::error;

/// Manage a removable dongle carrying multiple bootable installs and ISOs
/// behind encrypted volumes.
#[derive(Parser)]
#[command(name = "donglify", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Encrypted boot partition of an initialized dongle (e.g. /dev/sdb2).
    device: Option<String>,

    /// Answer yes to every confirmation prompt.
    #[arg(long, global = true)]
    yes: bool,

    /// Log commands without executing them.
    #[arg(long, global = true)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Destructively re-partition and format a new dongle.
    Init {
        /// Whole USB device to take over (e.g. /dev/sdb).
        device: String,
    },
}

const USAGE: &str = "Usage: donglify /dev/<name of usb>[index of encrypted dongleboot]\n\
                     \x20      donglify init /dev/<name of usb>";

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    session::install_interrupt_handler();

    let cli = Cli::parse();
    println!("Version: {}", env!("CARGO_PKG_VERSION"));

    let result = match (cli.command, cli.device) {
        (Some(Commands::Init { device }), _) => {
            if !is_device_path(&device) {
                eprintln!("{USAGE}");
                std::process::exit(1);
            }
            run_init(&device, cli.yes, cli.dry_run)
        }
        (None, Some(device)) => {
            if !is_device_path(&device) {
                eprintln!("{USAGE}");
                std::process::exit(1);
            }
            println!("Welcome to donglify!");
            session::Session::start(&device, cli.yes, cli.dry_run)
                .and_then(|mut session| session.run())
        }
        (None, None) => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(e.exit_code());
    }
}

fn is_device_path(device: &str) -> bool {
    device.starts_with("/dev/") && device.len() > "/dev/".len()
}

fn run_init(device: &str, yes: bool, dry_run: bool) -> donglify_core::Result<()> {
    let mut exec = Executor::with_options(Box::new(StdinConfirmer), !yes, dry_run);
    let vols = VolumeRegistry::new();
    let layout = MountLayout::default();

    let recommended = partition::recommended_share_mib(donglify_core::disk::device_size_bytes(device)?);
    println!("recommended partition scheme:");
    println!("DONGLE_EFI partition: 256 MB");
    println!("DONGLE_BOOT partition: 2048 MB");
    println!("DONGLE_ISOs partition: {recommended} MB");
    println!("DONGLE_PERSISTENT partition: {recommended} MB");

    let opts = InitOptions {
        iso_size_mib: session::prompt_size("What would you like to have for ISO partition size in MB? [empty for same] ")?,
        persistent_size_mib: session::prompt_size("What would you like to have for persistent partition size in MB? [empty for same] ")?,
    };

    match partition::init_device(device, opts, &mut exec, &vols, &layout)? {
        Some(_store) => {
            print!("{}", donglify_core::disk::filesystem_overview()?);
            Ok(())
        }
        None => {
            println!("Farewell.");
            Ok(())
        }
    }
}
