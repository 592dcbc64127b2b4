use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{arg, ArgAction, command};
use execute::Execute;
use fork::{fork, Fork};
use fuser::MountOption;
use log::*;
use nix::sys::signal;
use retry::delay::Fixed;
use retry::{retry_with_index, OperationResult};
use uuid::Uuid;

use ltfs::fuse_binding::LtfsFuse;
use ltfs::label;
use ltfs::runtime::{IndexPartitionCriteria, TraversalStrategy, VolumePolicy, DEVICE_FILE, FORCE_FORMAT, MOUNT_POINT};
use ltfs::sync_engine::{self, SyncTrigger};
use ltfs::Volume;
use tape_transport::file::FileTransport;
use tape_transport::{PartitionId, TapeTransport};

/// Parses `backward`, `forward`, or `rollback:<generation>`.
fn parse_traversal(s: &str) -> Result<TraversalStrategy> {
    match s {
        "backward" => Ok(TraversalStrategy::Backward),
        "forward" => Ok(TraversalStrategy::Forward),
        other => {
            let gen = other
                .strip_prefix("rollback:")
                .ok_or_else(|| anyhow!("--traversal must be backward, forward, or rollback:<generation>"))?
                .parse::<u64>()
                .context("rollback generation must be a number")?;
            Ok(TraversalStrategy::Rollback(gen))
        }
    }
}

/// Parses `max_filesize,glob1,glob2,...` into index-partition placement
/// criteria.
fn parse_index_criteria(s: &str) -> Result<IndexPartitionCriteria> {
    let mut parts = s.split(',');
    let max_filesize_criteria = parts
        .next()
        .ok_or_else(|| anyhow!("--index-criteria needs a leading max file size"))?
        .parse::<u64>()
        .context("max file size must be a number")?;
    Ok(IndexPartitionCriteria {
        have_criteria: true,
        max_filesize_criteria,
        glob_patterns: parts.map(str::to_string).collect(),
    })
}

fn main() -> Result<()> {
    let matches = command!()
        .arg(arg!([mountpoint] "Mountpoint to mount the volume on").default_value("tests/mnt"))
        .arg(arg!(-f --front "Keep daemon running in front").action(ArgAction::SetTrue).required(false))
        .arg(arg!(--format "Format a fresh volume before mounting").action(ArgAction::SetTrue).required(false))
        .arg(arg!(-r --read_only "Mount read-only").action(ArgAction::SetTrue).required(false))
        .arg(arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`").action(ArgAction::SetTrue).required(false))
        .arg(arg!(-d --device <FILE> "Device/image path").required(false).default_value("ltfs.img"))
        .arg(arg!(--creator <NAME> "Creator string written to the label").required(false).default_value("rust-ltfs"))
        .arg(arg!(--blocksize <BYTES> "Blocksize used for format").required(false).default_value("524288"))
        .arg(arg!(--traversal <STRATEGY> "backward | forward | rollback:<generation>").required(false).default_value("backward"))
        .arg(arg!(--sync_interval <SECONDS> "Periodic sync interval, 0 to disable").required(false).default_value("300"))
        .arg(arg!(--index_criteria <SPEC> "max_filesize,glob,glob,... placed on the Index Partition").required(false))
        .get_matches();

    if matches.get_flag("verbose") {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    let mountpoint = matches.get_one::<String>("mountpoint").unwrap();
    let device = matches.get_one::<String>("device").unwrap();
    let abspath_mountpoint = std::fs::canonicalize(mountpoint)
        .with_context(|| format!("mountpoint {mountpoint} does not exist"))?
        .to_str()
        .unwrap()
        .to_string();

    info!("Device: {device}");
    DEVICE_FILE.set(device.clone()).unwrap();
    MOUNT_POINT.set(abspath_mountpoint.clone()).unwrap();
    FORCE_FORMAT.set(matches.get_flag("format")).unwrap();

    let creator = matches.get_one::<String>("creator").unwrap().clone();
    let blocksize: u32 = matches.get_one::<String>("blocksize").unwrap().parse().context("--blocksize must be a number")?;
    let traversal = parse_traversal(matches.get_one::<String>("traversal").unwrap())?;
    let sync_secs: u64 = matches.get_one::<String>("sync_interval").unwrap().parse().context("--sync-interval must be a number")?;
    let index_criteria = match matches.get_one::<String>("index_criteria") {
        Some(s) => parse_index_criteria(s)?,
        None => IndexPartitionCriteria::default(),
    };
    let read_only = matches.get_flag("read_only");

    let policy = VolumePolicy {
        traversal,
        index_criteria,
        sync_interval: if sync_secs == 0 { None } else { Some(std::time::Duration::from_secs(sync_secs)) },
        read_only,
        ..VolumePolicy::default()
    };

    macro_rules! umount {
        () => {{
            info!("Unmounting {}", MOUNT_POINT.read().unwrap().clone());
            let mut command = execute::command_args!("fusermount", "-u", MOUNT_POINT.read().unwrap().clone());
            command.stdout(Stdio::piped());
            if let Ok(output) = command.execute_output() {
                info!("fusermount output: {}", String::from_utf8_lossy(&output.stdout));
            }
        }};
    }

    pub extern "C" fn signal_handler(_: i32) {
        println!("[{}] Received signal, unmounting.", std::process::id());
        let mut command = execute::command_args!("fusermount", "-u", MOUNT_POINT.read().unwrap().clone());
        command.stdout(Stdio::piped());
        let _ = command.execute_output();
        println!("[{}] All done.", std::process::id());
        std::process::exit(0);
    }

    let sig_action = signal::SigAction::new(signal::SigHandler::Handler(signal_handler), signal::SaFlags::SA_NODEFER, signal::SigSet::empty());
    unsafe {
        if let Err(e) = signal::sigaction(signal::SIGINT, &sig_action) {
            println!("SIGINT signal set failed, {e:?}");
        }
    }

    let mut options = vec![MountOption::FSName("ltfs".to_string())];
    options.push(if read_only { MountOption::RO } else { MountOption::RW });

    let retry_times = 3;
    match if matches.get_flag("front") { Ok(Fork::Child) } else { fork() } {
        Ok(Fork::Parent(child)) => {
            info!("Daemon running at pid: {child}");
            Ok(())
        }
        Ok(Fork::Child) => match retry_with_index(Fixed::from_millis(100), |current_try| {
            info!("[try {current_try}/{retry_times}] mounting at {abspath_mountpoint}");
            match mount_once(device, &abspath_mountpoint, blocksize, &creator, policy.clone(), options.clone()) {
                Ok(()) => {
                    info!("All done.");
                    OperationResult::Ok(())
                }
                Err(e) => {
                    if current_try > retry_times {
                        OperationResult::Err(format!("failed to mount after {retry_times} retries: {e}"))
                    } else {
                        umount!();
                        OperationResult::Retry(format!("mount failed, retrying after unmount: {e}"))
                    }
                }
            }
        }) {
            Ok(_) => Ok(()),
            Err(e) => Err(anyhow!("mount failed with {}", e)),
        },
        Err(e) => Err(anyhow!("fork returned error {e}")),
    }
}

/// Formats (if `--format` was requested) or mounts the volume, spawns the
/// background sync engine thread, and blocks in `fuser::mount2` until
/// unmount.
fn mount_once(device: &str, mountpoint: &str, blocksize: u32, creator: &str, policy: VolumePolicy, options: Vec<MountOption>) -> Result<()> {
    let force_format = FORCE_FORMAT.read().unwrap().clone();
    let vol: Arc<Volume<FileTransport>> = if force_format {
        Arc::new(Volume::format(FileTransport::new(), blocksize, creator, policy).map_err(|e| anyhow!("format failed: {e}"))?)
    } else {
        let mut probe = FileTransport::new();
        probe.load().map_err(|e| anyhow!("failed to load transport for {device}: {e}"))?;
        let coherency = label::read_coherency(&mut probe, PartitionId::A).map_err(|e| anyhow!("failed to read coherency record: {e}"))?;
        let expected_uuid = Uuid::parse_str(&coherency.volume_uuid).context("coherency record has an invalid UUID")?;
        Arc::new(Volume::mount(probe, expected_uuid, blocksize, creator, policy).map_err(|e| anyhow!("mount failed: {e}"))?)
    };

    let sync_vol = vol.clone();
    let sync_handle = sync_engine::spawn(vol.policy.sync_interval, move |trigger| match sync_vol.sync_now(&[sync_vol.index_partition, sync_vol.data_partition]) {
        Ok(_) => true,
        Err(e) => {
            warn!("sync engine: trigger {trigger:?} failed: {e}");
            !matches!(trigger, SyncTrigger::Unmount)
        }
    });
    vol.attach_sync_handle(sync_handle);

    let fs = LtfsFuse::new(vol.clone());
    fuser::mount2(fs, mountpoint, &options).map_err(|e| anyhow!("fuser::mount2 failed: {e}"))?;
    vol.request_sync(SyncTrigger::Unmount);
    Ok(())
}
