//! Performance counters: Count how many times we do various important operations.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering, fence};

use enum_map::{Enum, EnumMap};
use tracing::*;

#[derive(Debug, Copy, Clone, Enum)]
pub enum Op {
    IndexLoad,
    PackLoad,
    BackendCacheWrite,
    BackendCacheHit,
    BackendCacheMiss,
    BackendCacheEviction,
    BackendCacheSpill,
    FileToBuffer,
    FileToMmap,
    TreeCacheHit,
    TreeCacheMiss,
}

static COUNTER_MAP: LazyLock<EnumMap<Op, AtomicUsize>> = LazyLock::new(EnumMap::default);

#[inline]
pub fn bump(which: Op) {
    add(which, 1);
}

pub fn add(to: Op, amount: usize) {
    COUNTER_MAP[to].fetch_add(amount, Ordering::Relaxed);
}

pub fn log_counts() {
    fence(Ordering::SeqCst);

    let counts = COUNTER_MAP
        .iter()
        .map(|(k, v)| (k, v.load(Ordering::Relaxed)))
        .filter(|(_k, v)| *v > 0) // Ignore things we didn't do
        .collect::<Vec<_>>();

    if counts.is_empty() {
        return;
    }

    let opname = |op| match op {
        Op::IndexLoad => "indexes loaded",
        Op::PackLoad => "pack manifests loaded",
        Op::BackendCacheWrite => "backend cache writes",
        Op::BackendCacheHit => "backend cache hits",
        Op::BackendCacheMiss => "backend cache misses",
        Op::BackendCacheEviction => "backend cache evictions",
        Op::BackendCacheSpill => "backend cache spills",
        Op::FileToBuffer => "input files buffered",
        Op::FileToMmap => "input files memory mapped",
        Op::TreeCacheHit => "tree cache hits",
        Op::TreeCacheMiss => "tree cache misses",
    };

    debug!("Counters:");
    for (op, count) in &counts {
        debug!("{:6} {}", count, opname(*op));
    }
}
