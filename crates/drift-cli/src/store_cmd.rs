//! Store subcommands: fmt, df, clean, check, plus the config template.

use drift_config::Config;
use drift_lfs::{BlockOwner, Geometry, Lfs, LfsError, LfsTuning, NIL_ADDR};
use drift_proto::Status;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Mutex;

/// Map a store failure onto the wire/exit taxonomy.
pub fn status_of(err: &LfsError) -> Status {
    match err {
        LfsError::Io(_) => Status::DomainUnavailable,
        LfsError::Codec(_) => Status::Inconsistency,
        LfsError::OutOfResources(_) => Status::OutOfResources,
        LfsError::InvalidArgument(_) => Status::InvalidArgument,
        LfsError::NoSuchFile(_) => Status::NoSuchFile,
        LfsError::Inconsistency(_) => Status::Inconsistency,
    }
}

fn tuning(config: &Config) -> LfsTuning {
    LfsTuning {
        dirty_threshold: config.lfs.dirty_threshold(),
        clean_range_low: config.lfs.clean_range_low,
        max_desc: 1024,
    }
}

pub fn init() -> Result<(), LfsError> {
    let path = Path::new("drift.toml");
    if path.exists() {
        return Err(LfsError::InvalidArgument(
            "drift.toml already exists".to_string(),
        ));
    }
    std::fs::write(path, Config::init_toml())?;
    println!("wrote drift.toml");
    Ok(())
}

pub fn fmt(store: &Path, config: &Config) -> Result<(), LfsError> {
    let geometry = Geometry {
        segment_count: config.lfs.segment_count,
        segment_size: config.lfs.segment_size,
        block_size: config.lfs.block_size,
    };
    Lfs::format(store, geometry, tuning(config))?;
    println!(
        "formatted {}: {} segments of {} KiB",
        store.display(),
        geometry.segment_count,
        geometry.segment_size / 1024
    );
    Ok(())
}

pub fn df(store: &Path, config: &Config) -> Result<(), LfsError> {
    let lfs = Lfs::attach(store, tuning(config))?;
    let info = lfs.domain_info();
    let cp = lfs.usage_checkpoint();
    println!("store          {}", store.display());
    println!("capacity       {} KiB", info.max_kbytes);
    println!("free           {} KiB", info.free_kbytes);
    println!("block size     {} B", info.block_size);
    println!("descriptors    {} used / {} total",
        info.max_file_desc - info.free_file_desc,
        info.max_file_desc
    );
    println!(
        "segments       {} clean, {} dirty, log head {}",
        cp.num_clean, cp.num_dirty, cp.current_segment
    );
    Ok(())
}

/// Cleaner liveness through the descriptor map: a block is live iff some
/// allocated descriptor points at it; relocation repoints the map.
struct DescOwner<'a> {
    lfs: &'a Lfs,
    by_addr: Mutex<HashMap<u32, u32>>,
}

impl<'a> DescOwner<'a> {
    fn new(lfs: &'a Lfs) -> Self {
        let by_addr = lfs
            .allocated_descriptors()
            .into_iter()
            .filter(|(_, e)| e.disk_addr != NIL_ADDR)
            .map(|(f, e)| (e.disk_addr, f))
            .collect();
        Self {
            lfs,
            by_addr: Mutex::new(by_addr),
        }
    }
}

impl BlockOwner for DescOwner<'_> {
    fn is_live(&self, addr: u32) -> bool {
        self.by_addr.lock().unwrap().contains_key(&addr)
    }

    fn relocate(&self, old: u32, new: u32) {
        let mut by_addr = self.by_addr.lock().unwrap();
        if let Some(file_num) = by_addr.remove(&old) {
            by_addr.insert(new, file_num);
            if let Err(e) = self.lfs.set_desc_addr(file_num, new) {
                tracing::warn!(file_num, error = %e, "descriptor repoint failed");
            }
        }
    }
}

pub fn clean(store: &Path, config: &Config, max_segments: usize) -> Result<(), LfsError> {
    let lfs = Lfs::attach(store, tuning(config))?;
    let owner = DescOwner::new(&lfs);
    let stats = lfs.clean(&owner, max_segments, &AtomicBool::new(false))?;
    lfs.checkpoint()?;
    println!(
        "cleaned {} segments: {} blocks moved, {} discarded",
        stats.segments_cleaned, stats.live_blocks_moved, stats.dead_blocks_discarded
    );
    Ok(())
}

pub fn check(store: &Path, config: &Config) -> Result<(), LfsError> {
    let lfs = Lfs::attach(store, tuning(config))?;
    lfs.check_invariants()?;
    println!("{}: usage map consistent", store.display());
    Ok(())
}
