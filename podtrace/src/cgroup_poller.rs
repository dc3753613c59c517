//! Periodically walks `/sys/fs/cgroup` for controller files and writes the
//! usage/limit pair the core's sampler evaluates into the `CGROUP_LIMITS_MEM`
//! and `CGROUP_LIMITS_CPU` maps. There's no kernel hook for "a cgroup's
//! controller file changed", so the cadence lives here rather than in a
//! probe, matching the core's contract that the trigger cadence is the
//! loader's choice.
//!
//! Memory and CPU get one map each, rather than sharing a single table keyed
//! by cgroup id, because a cgroup can have both a `memory.max` and a
//! `cpu.max` quota configured at once; a shared single-slot-per-cgroup table
//! would have the CPU write silently clobber the memory entry (or vice
//! versa) every tick, permanently hiding whichever resource lost the race.
//!
//! Only memory and CPU are accounted for; cgroup v2's `io.max` is a
//! per-device list with no single aggregate limit, so it doesn't fit the
//! engine's single usage/limit pair without inventing a policy the spec
//! doesn't define.

use std::borrow::BorrowMut;
use std::path::{Path, PathBuf};
use std::time::Duration;

use aya::maps::{HashMap as AyaHashMap, MapData};
use log::{debug, warn};
use walkdir::WalkDir;

#[repr(C)]
#[derive(Copy, Clone)]
pub struct CgroupLimitEntry {
    pub usage: u64,
    pub limit: u64,
}

unsafe impl aya::Pod for CgroupLimitEntry {}

fn find_cgroup_dirs(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.path().to_path_buf())
        .collect()
}

fn cgroup_id_of(dir: &Path) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(dir).ok().map(|m| m.ino())
}

fn read_u64_file(path: &Path) -> Option<u64> {
    let content = std::fs::read_to_string(path).ok()?;
    let trimmed = content.trim();
    if trimmed == "max" {
        return Some(0);
    }
    trimmed.parse().ok()
}

/// `memory.current`/`memory.max`, in bytes. `limit == 0` (unset `max`) means
/// unlimited and the core never alerts on it.
fn read_memory(dir: &Path) -> Option<(u64, u64)> {
    let usage = read_u64_file(&dir.join("memory.current"))?;
    let limit = read_u64_file(&dir.join("memory.max")).unwrap_or(0);
    Some((usage, limit))
}

/// `cpu.stat`'s cumulative `usage_usec` against the quota/period pair in
/// `cpu.max`, normalized to a comparable scale (quota as a percentage of one
/// period, usage as cumulative microseconds — good enough for the
/// threshold comparisons the core performs on successive samples).
fn read_cpu(dir: &Path) -> Option<(u64, u64)> {
    let stat = std::fs::read_to_string(dir.join("cpu.stat")).ok()?;
    let usage_usec = stat
        .lines()
        .find_map(|l| l.strip_prefix("usage_usec ").and_then(|v| v.trim().parse().ok()))?;

    let cpu_max = std::fs::read_to_string(dir.join("cpu.max")).ok()?;
    let mut parts = cpu_max.split_whitespace();
    let quota = parts.next()?;
    if quota == "max" {
        return Some((usage_usec, 0));
    }
    let quota: u64 = quota.parse().ok()?;
    let period: u64 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(100_000);
    Some((usage_usec, quota.saturating_mul(100) / period.max(1)))
}

/// Walks `root` once, writing a [`CgroupLimitEntry`] per cgroup found into
/// `mem_limits` and/or `cpu_limits`. A controller file that's missing or
/// unreadable for a given cgroup simply skips that resource for this tick.
pub fn poll_once<T: BorrowMut<MapData>>(
    mem_limits: &mut AyaHashMap<T, u64, CgroupLimitEntry>,
    cpu_limits: &mut AyaHashMap<T, u64, CgroupLimitEntry>,
    root: &str,
) {
    for dir in find_cgroup_dirs(Path::new(root)) {
        let Some(id) = cgroup_id_of(&dir) else {
            continue;
        };

        if let Some((usage, limit)) = read_memory(&dir) {
            let entry = CgroupLimitEntry { usage, limit };
            if let Err(err) = mem_limits.insert(id, entry, 0) {
                warn!("cgroup_limits_mem insert failed for {}: {err:?}", dir.display());
            }
        }

        if let Some((usage, limit)) = read_cpu(&dir) {
            if limit > 0 {
                let entry = CgroupLimitEntry { usage, limit };
                let _ = cpu_limits.insert(id, entry, 0);
            }
        }
    }
    debug!("cgroup poll tick complete under {root}");
}

pub async fn run(
    mut mem_limits: AyaHashMap<MapData, u64, CgroupLimitEntry>,
    mut cpu_limits: AyaHashMap<MapData, u64, CgroupLimitEntry>,
    root: String,
    interval_ms: u64,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
    loop {
        ticker.tick().await;
        poll_once(&mut mem_limits, &mut cpu_limits, &root);
    }
}
