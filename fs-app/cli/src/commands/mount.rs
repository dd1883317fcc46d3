//! Mount command: expose a backing directory as a FUSE filesystem.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use fuser::MountOption;
use log::info;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use ledgerfs::{Engine, EngineOptions, LedgerFs};

/// Check if a mountpoint is already in use by reading /proc/mounts.
fn is_mountpoint_in_use(mountpoint: &PathBuf) -> Result<bool> {
    let mounts_file =
        File::open("/proc/mounts").context("Failed to open /proc/mounts. Are you running on Linux?")?;
    let reader = BufReader::new(mounts_file);
    let canonical_mountpoint = mountpoint.canonicalize().unwrap_or_else(|_| mountpoint.clone());

    for line in reader.lines() {
        let line = line.context("Failed to read line from /proc/mounts")?;
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 2 {
            let mount_point = PathBuf::from(parts[1]);
            let canonical_mount = mount_point.canonicalize().unwrap_or(mount_point);
            if canonical_mount == canonical_mountpoint {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Mount a LedgerFS backing directory via FUSE
#[derive(Parser, Debug)]
#[command(about = "Mount a LedgerFS backing directory via FUSE")]
pub struct MountArgs {
    /// Backing directory holding (or receiving) the data and meta files
    pub store: PathBuf,

    /// Mount point
    pub mountpoint: PathBuf,

    /// Write buffer capacity in bytes (minimum 4096)
    #[arg(long)]
    pub buffer: Option<usize>,

    /// Allow other users to access the mount (requires user_allow_other in
    /// /etc/fuse.conf)
    #[arg(long)]
    pub allow_other: bool,
}

pub fn run(args: MountArgs) -> Result<()> {
    let mountpoint = args
        .mountpoint
        .canonicalize()
        .with_context(|| format!("Failed to access mountpoint: {}", args.mountpoint.display()))?;
    if !mountpoint.is_dir() {
        return Err(anyhow!("Mountpoint must be a directory"));
    }
    if is_mountpoint_in_use(&mountpoint)? {
        return Err(anyhow!(
            "Mountpoint '{}' is already in use by another filesystem.\n\nCheck current mounts with:\n    mount | grep '{}'",
            mountpoint.display(),
            mountpoint.display()
        ));
    }

    let engine = Engine::open(&args.store)
        .map_err(|e| anyhow!("Failed to open store {}: {e}", args.store.display()))?;

    if let Some(buffer) = args.buffer {
        let options = EngineOptions {
            write_buffer_size: buffer,
            ..EngineOptions::default()
        };
        engine
            .set_options(options)
            .map_err(|_| anyhow!("Invalid write buffer size: {buffer}"))?;
    }

    let mut options = vec![
        MountOption::FSName("ledgerfs".to_string()),
        MountOption::AutoUnmount,
    ];
    if args.allow_other {
        options.push(MountOption::AllowOther);
    }

    ctrlc::set_handler(move || {
        info!("Unmounting filesystem...");
        // AutoUnmount takes care of the actual unmount on exit.
        std::process::exit(0);
    })
    .context("Failed to set Ctrl+C handler")?;

    info!(
        "Mounting LedgerFS store '{}' at '{}'",
        args.store.display(),
        mountpoint.display()
    );
    info!("Press Ctrl+C to unmount");

    let fs = LedgerFs::new(engine);
    fuser::mount2(fs, &mountpoint, &options)
        .with_context(|| format!("Failed to mount at {}", mountpoint.display()))?;

    info!("Filesystem unmounted");
    Ok(())
}
