//! Shared-memory trace region, the wire between the fuzzer and the DBI
//! tracer client running inside the target process.
//!
//! Layout, in order: a u32 trace count, a fixed array of u32 block offsets,
//! and a u32 hash of the input (written by the tracer, not consumed here).
//! The tracer publishes the count last; the fuzzer reads it only after the
//! child has been reaped, so no further synchronization is needed.

use memmap2::MmapMut;

use std::fs::OpenOptions;
use std::path::PathBuf;

use crate::{BlockTrace, VeerError, VeerResult};

/// Base name for per-worker regions: `/<prefix>_<worker_id>`.
pub const TRACE_SHM_PREFIX: &str = "veer_trace";

/// Capacity of the offset array: 16 MiB worth of u32 entries.
pub const TRACE_SHM_MAX_OFFSETS: usize = (16 * 1024 * 1024) / 4;

const COUNT_BYTES: usize = 4;
const HASH_BYTES: usize = 4;

/// Total region size: count header, offset array, trailing input hash.
pub const TRACE_SHM_BYTES: usize = COUNT_BYTES + TRACE_SHM_MAX_OFFSETS * 4 + HASH_BYTES;

/// POSIX shared-memory name for a worker's region (leading slash included,
/// as consumed by `shm_open` inside the tracer).
pub fn region_name(suffix: &str) -> String {
    format!("/{TRACE_SHM_PREFIX}_{suffix}")
}

fn region_path(name: &str) -> PathBuf {
    // shm_open(name) surfaces as /dev/shm/<name-without-slash> on Linux.
    PathBuf::from("/dev/shm").join(name.trim_start_matches('/'))
}

/// A mapped trace region. Created (or reused) at worker startup and held for
/// the worker's lifetime; the mapping is dropped on detach.
#[derive(Debug)]
pub struct TraceRegion {
    name: String,
    map: MmapMut,
}

impl TraceRegion {
    /// Create or reuse the region behind `name` and map it.
    pub fn open(name: &str) -> VeerResult<Self> {
        let path = region_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| {
                VeerError::Target(format!("cannot open trace region {}: {err}", path.display()))
            })?;
        file.set_len(TRACE_SHM_BYTES as u64).map_err(|err| {
            VeerError::Target(format!("cannot size trace region {}: {err}", path.display()))
        })?;
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|err| {
            VeerError::Target(format!("cannot map trace region {}: {err}", path.display()))
        })?;
        Ok(Self {
            name: name.to_string(),
            map,
        })
    }

    /// Name passed to the tracer via `-shm`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Zero the trace count before spawning the target, signalling that no
    /// trace is ready.
    pub fn clear_count(&mut self) {
        self.map[..COUNT_BYTES].copy_from_slice(&0u32.to_ne_bytes());
    }

    pub fn trace_count(&self) -> u32 {
        u32::from_ne_bytes(self.map[..COUNT_BYTES].try_into().expect("count header"))
    }

    /// Copy out the published trace, clamping the count to the region's
    /// capacity. Valid to call only after the writing child has been reaped.
    pub fn read_trace(&self) -> BlockTrace {
        let count = (self.trace_count() as usize).min(TRACE_SHM_MAX_OFFSETS);
        let mut trace = Vec::with_capacity(count);
        for i in 0..count {
            let at = COUNT_BYTES + i * 4;
            trace.push(u32::from_ne_bytes(
                self.map[at..at + 4].try_into().expect("offset entry"),
            ));
        }
        trace
    }

    /// Test hook: play the tracer's role and publish a trace into the region.
    #[cfg(test)]
    fn publish(&mut self, offsets: &[u32]) {
        for (i, &off) in offsets.iter().enumerate() {
            let at = COUNT_BYTES + i * 4;
            self.map[at..at + 4].copy_from_slice(&off.to_ne_bytes());
        }
        // Count last, mirroring the writer side of the contract.
        self.map[..COUNT_BYTES].copy_from_slice(&(offsets.len() as u32).to_ne_bytes());
    }
}
