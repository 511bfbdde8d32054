use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::host::DEFAULT_STATE;

/// What a checkpoint persists for one instance: the engine-side fields the
/// script cannot rebuild itself, plus the sandbox's opaque variable blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub fsm_state: String,
    pub running: bool,
    pub variables: Vec<u8>,
}

impl StateSnapshot {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(self).context("encoding state snapshot")
    }

    pub fn decode(blob: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(blob).context("decoding state snapshot")
    }
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            fsm_state: DEFAULT_STATE.to_string(),
            running: true,
            variables: Vec::new(),
        }
    }
}
