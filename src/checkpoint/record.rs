use serde::{Deserialize, Serialize};

use crate::state::TrainStateRecord;

/// Format version of [`Manifest`].
pub const MANIFEST_VERSION: u32 = 1;

/// Describes one rank's entry of a checkpoint. Written last, so its presence alone does not
/// make an entry valid: only the rename of the staged directory does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub version: u32,
    pub step: u64,
    pub rank: usize,
    pub world_size: usize,
    pub data_cursor: u64,
    pub model_bytes: u64,
    pub optimizer_bytes: u64,
    pub train_state_bytes: u64,
}

/// What one process persists at a step boundary.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot<'a> {
    pub model: &'a [u8],
    pub optimizer: &'a [u8],
    pub train_state: &'a TrainStateRecord,
    pub data_cursor: u64,
}

/// One process's entry read back from a checkpoint, mutually consistent by construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Restored {
    pub step: u64,
    pub model: Vec<u8>,
    pub optimizer: Vec<u8>,
    pub train_state: TrainStateRecord,
    pub data_cursor: u64,
}
