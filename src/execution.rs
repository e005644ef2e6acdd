//! Core value types: fuzz inputs, block traces, and their pairing.

/// Bytes delivered to the target's stdin.
pub type FuzzInput = Vec<u8>;

/// Sequence of executed basic-block offsets, relative to the target's
/// main-module base, as published by the tracer.
pub type BlockTrace = Vec<u32>;

/// One observed run of the target: the input and the trace it produced.
/// Executions stored in the knowledge ring are non-empty on both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuzzExecution {
    pub input: FuzzInput,
    pub trace: BlockTrace,
}

impl FuzzExecution {
    pub fn new(input: FuzzInput, trace: BlockTrace) -> Self {
        Self { input, trace }
    }
}
