//! Knowledge checkpoint persistence.
//!
//! A checkpoint records the effective settings, the full ring (empty slots
//! included) with its write index, and the graph payload. Loading refuses
//! foreign endianness and treats any structural inconsistency as corruption.

use std::path::Path;

use crate::{
    wire, FuzzExecution, GraphSnapshot, InputSizeRange, RingSnapshot, Settings, VeerError,
    VeerResult,
};

/// Settings echoed into the checkpoint so a restart can decide whether the
/// persisted state belongs to the same campaign.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointSettings {
    pub input_size: InputSizeRange,
    pub thread_count: u32,
    pub max_history_count: u32,
    pub target_program: String,
    pub tracer_lib: String,
    pub drrun_path: String,
    pub work_dir: String,
}

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub settings: CheckpointSettings,
    pub write_idx: u32,
    pub slots: Vec<Option<FuzzExecution>>,
    pub graph: GraphSnapshot,
}

impl Checkpoint {
    /// Whether this checkpoint was produced by a campaign against the same
    /// target binary.
    pub fn matches_target(&self, settings: &Settings) -> bool {
        self.settings.target_program == settings.target_program.display().to_string()
    }
}

pub fn write_checkpoint(
    path: &Path,
    settings: &Settings,
    ring: &RingSnapshot,
    graph: &GraphSnapshot,
) -> VeerResult<()> {
    let mut buf = Vec::new();
    wire::put_endianness(&mut buf);

    wire::put_u32(&mut buf, settings.input_size.min);
    wire::put_u32(&mut buf, settings.input_size.max);
    wire::put_u32(&mut buf, settings.input_size.step);
    wire::put_u32(&mut buf, settings.thread_count);
    wire::put_u32(&mut buf, settings.max_history_count);
    wire::put_str(&mut buf, &settings.target_program.display().to_string());
    wire::put_str(&mut buf, &settings.tracer_lib.display().to_string());
    wire::put_str(&mut buf, &settings.drrun_path.display().to_string());
    wire::put_str(&mut buf, &settings.work_dir.display().to_string());

    wire::put_u32(&mut buf, ring.write_idx as u32);
    wire::put_u32(&mut buf, ring.slots.len() as u32);
    for slot in &ring.slots {
        wire::put_slot(&mut buf, slot);
    }

    wire::put_graph(&mut buf, graph);

    std::fs::write(path, buf)?;
    Ok(())
}

pub fn load_checkpoint(path: &Path) -> VeerResult<Checkpoint> {
    let raw = std::fs::read(path)?;
    let mut reader = wire::WireReader::new(&raw);
    wire::check_endianness(&mut reader)?;

    let settings = CheckpointSettings {
        input_size: InputSizeRange {
            min: reader.u32("min length")?,
            max: reader.u32("max length")?,
            step: reader.u32("step length")?,
        },
        thread_count: reader.u32("thread count")?,
        max_history_count: reader.u32("max history count")?,
        target_program: reader.string("target program")?,
        tracer_lib: reader.string("tracer lib")?,
        drrun_path: reader.string("drrun path")?,
        work_dir: reader.string("work dir")?,
    };

    let write_idx = reader.u32("write index")?;
    let slot_count = reader.u32("ring size")?;
    if slot_count == 0 || slot_count != settings.max_history_count {
        return Err(VeerError::Checkpoint(format!(
            "ring size {slot_count} disagrees with recorded capacity {}",
            settings.max_history_count
        )));
    }
    if write_idx >= slot_count {
        return Err(VeerError::Checkpoint(format!(
            "write index {write_idx} out of range for capacity {slot_count}"
        )));
    }
    let mut slots = Vec::with_capacity(slot_count as usize);
    for _ in 0..slot_count {
        slots.push(wire::read_slot(&mut reader)?);
    }

    let graph = wire::read_graph(&mut reader)?;
    if !reader.is_exhausted() {
        return Err(VeerError::Checkpoint(
            "trailing bytes after graph payload".to_string(),
        ));
    }

    Ok(Checkpoint {
        settings,
        write_idx,
        slots,
        graph,
    })
}
