use std::io;

use thiserror::Error;

use crate::kernels::{BlockShape, TilingPolicy};

#[derive(Error, Debug)]
pub enum Error {
    /// The tile unit (or the OS permission to use it) is missing. No fallback exists.
    #[error("hardware tile unit unsupported: {0}")]
    HardwareUnsupported(String),

    #[error(
        "perf event {name} unavailable: {source}; consider `echo -1 | sudo tee /proc/sys/kernel/perf_event_paranoid`"
    )]
    PerformanceCounterUnavailable {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("{policy} kernel cannot be built for {shape}: {reason}")]
    ShapeConfiguration {
        policy: TilingPolicy,
        shape: BlockShape,
        reason: String,
    },

    #[error(
        "result mismatch at ({row}, {col}): expected {expected}, got {actual} ({mismatches} elements differ)"
    )]
    CorrectnessMismatch {
        row: usize,
        col: usize,
        expected: f32,
        actual: f32,
        mismatches: usize,
    },

    #[error("a tile configuration is already active on this thread")]
    TileScopeActive,
}

pub type Result<T> = std::result::Result<T, Error>;
