//! Crash artifact serialization.
//!
//! A crash artifact is self-contained: the signal, the target argument
//! vector, the crashing input, the trace captured up to the crash, and the
//! full graph payload at the moment of the crash, so a crash can be triaged
//! (or the run resumed around it) without the live process.

use std::path::Path;

use crate::{wire, BlockTrace, FuzzInput, GraphSnapshot, VeerResult};

#[derive(Debug, Clone, PartialEq)]
pub struct CrashReport {
    pub signal: i32,
    /// Target argument vector after the `--` separator of the tracer
    /// invocation.
    pub target_args: Vec<String>,
    pub input: FuzzInput,
    pub trace: BlockTrace,
    pub graph: GraphSnapshot,
}

impl CrashReport {
    pub fn save(&self, path: &Path) -> VeerResult<()> {
        let mut buf = Vec::new();
        wire::put_endianness(&mut buf);
        wire::put_i32(&mut buf, self.signal);

        wire::put_u32(&mut buf, self.target_args.len() as u32);
        for arg in &self.target_args {
            wire::put_str(&mut buf, arg);
        }

        wire::put_bytes(&mut buf, &self.input);
        wire::put_u32_list(&mut buf, &self.trace);
        wire::put_graph(&mut buf, &self.graph);

        std::fs::write(path, buf)?;
        Ok(())
    }

    pub fn load(path: &Path) -> VeerResult<Self> {
        let raw = std::fs::read(path)?;
        let mut reader = wire::WireReader::new(&raw);
        wire::check_endianness(&mut reader)?;

        let signal = reader.i32("signal number")?;
        let arg_count = reader.u32("target arg count")?;
        let mut target_args = Vec::with_capacity(arg_count as usize);
        for _ in 0..arg_count {
            target_args.push(reader.string("target arg")?);
        }

        let input = reader.bytes("crashing input")?;
        let trace = reader.u32_list("crash trace")?;
        let graph = wire::read_graph(&mut reader)?;

        Ok(Self {
            signal,
            target_args,
            input,
            trace,
            graph,
        })
    }
}

/// Artifact file name: worker, signal, and a digest of the crashing input so
/// repeated crashes on the same input collapse onto one file.
pub fn crash_file_name(worker_id: u32, signal: i32, input: &[u8]) -> String {
    let digest = blake3::hash(input);
    format!(
        "crash_w{worker_id}_sig{signal}_{}.crash",
        &digest.to_hex().as_str()[..16]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Node2VecParams, TraceGraph, DEFAULT_EMBEDDING_DIM};

    #[test]
    fn crash_report_round_trips() {
        let graph = TraceGraph::new(DEFAULT_EMBEDDING_DIM, Node2VecParams::default());
        graph.absorb_trace(&vec![0x40, 0x50, 0x60]);
        graph.train_embeddings();

        let report = CrashReport {
            signal: 11,
            target_args: vec!["./target".to_string(), "--strict".to_string()],
            input: b"ABCDEF".to_vec(),
            trace: vec![0x40, 0x50],
            graph: graph.snapshot(),
        };

        let path = std::env::temp_dir().join(crash_file_name(0, 11, &report.input));
        report.save(&path).expect("save crash report");
        let loaded = CrashReport::load(&path).expect("load crash report");
        assert_eq!(loaded, report);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn file_name_is_stable_per_input() {
        let a = crash_file_name(2, 11, b"ABCDEF");
        let b = crash_file_name(2, 11, b"ABCDEF");
        let c = crash_file_name(2, 11, b"ABCDEG");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("crash_w2_sig11_"));
        assert!(a.ends_with(".crash"));
    }
}
