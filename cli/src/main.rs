use clap::{Parser, Subcommand};
use dbs_core::{DbsError, DbsResult};

#[derive(Parser)]
#[command(name = "dbs")]
#[command(about = "Copy-on-write snapshotting block storage engine", long_about = None)]
struct Cli {
    /// Path to the backing device or file
    device: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a raw file or block device
    Init,
    /// Print device, volume and allocation summary
    Info,
    /// Create a new volume
    CreateVolume {
        name: String,
        /// Size in bytes
        size: u64,
    },
    /// Rename an existing volume
    RenameVolume { name: String, new_name: String },
    /// Snapshot a volume's current state
    CreateSnapshot { name: String },
    /// Clone a snapshot into a new, independent volume
    CloneSnapshot {
        new_name: String,
        source_snapshot_id: u16,
    },
    /// Delete a volume and every snapshot in its chain
    DeleteVolume { name: String },
    /// Delete a single non-current snapshot
    DeleteSnapshot { snapshot_id: u16 },
    /// List every volume on the device
    ListVolumes,
    /// List every snapshot in a volume's chain, newest first
    ListSnapshots { name: String },
    /// Reclaim unreferenced physical extents
    Vacuum,
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[unit])
    } else {
        format!("{size:.2} {}", UNITS[unit])
    }
}

fn run(cli: Cli) -> DbsResult<()> {
    let device = cli.device;
    match cli.command {
        Commands::Init => {
            dbs_core::init_device(&device)?;
            println!("initialized {device}");
        }
        Commands::Info => {
            let info = dbs_core::device_info(&device)?;
            println!("device:     {device}");
            println!("version:    {:#010x}", info.version);
            println!("size:       {}", human_size(info.device_size));
            println!(
                "extents:    {} / {} allocated ({})",
                info.allocated_device_extents,
                info.total_device_extents,
                human_size(info.allocated_device_extents as u64 * dbs_core::DBS_EXTENT_SIZE)
            );
            println!("volumes:    {}", info.volume_count);
        }
        Commands::CreateVolume { name, size } => {
            dbs_core::create_volume(&device, &name, size)?;
            println!("created volume '{name}' ({})", human_size(size));
        }
        Commands::RenameVolume { name, new_name } => {
            dbs_core::rename_volume(&device, &name, &new_name)?;
            println!("renamed '{name}' to '{new_name}'");
        }
        Commands::CreateSnapshot { name } => {
            let id = dbs_core::create_snapshot(&device, &name)?;
            println!("created snapshot {id} of '{name}'");
        }
        Commands::CloneSnapshot {
            new_name,
            source_snapshot_id,
        } => {
            dbs_core::clone_snapshot(&device, &new_name, source_snapshot_id)?;
            println!("cloned snapshot {source_snapshot_id} into '{new_name}'");
        }
        Commands::DeleteVolume { name } => {
            dbs_core::delete_volume(&device, &name)?;
            println!("deleted volume '{name}'");
        }
        Commands::DeleteSnapshot { snapshot_id } => {
            dbs_core::delete_snapshot(&device, snapshot_id)?;
            println!("deleted snapshot {snapshot_id}");
        }
        Commands::ListVolumes => {
            let volumes = dbs_core::volume_info(&device)?;
            if volumes.is_empty() {
                println!("no volumes");
            }
            for v in volumes {
                println!(
                    "{:<24} {:>10}  snapshot {:<6} ({} in chain)",
                    v.volume_name,
                    human_size(v.volume_size),
                    v.snapshot_id,
                    v.snapshot_count
                );
            }
        }
        Commands::ListSnapshots { name } => {
            let snapshots = dbs_core::snapshot_info(&device, &name)?;
            for s in snapshots {
                match s.parent_snapshot_id {
                    Some(parent) => println!("{:<6} parent {}", s.snapshot_id, parent),
                    None => println!("{:<6} (root)", s.snapshot_id),
                }
            }
        }
        Commands::Vacuum => {
            dbs_core::vacuum_device(&device)?;
        }
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        match e {
            DbsError::Unimplemented(_) => eprintln!("{e}"),
            _ => eprintln!("error: {e}"),
        }
        std::process::exit(1);
    }
}
