//! Items carried by the three scheduler queues. Each is built by the
//! submitting side and consumed exactly once by a worker.

use std::fmt;
use std::sync::Arc;

use crate::instance::ScriptInstance;
use crate::line_map::LineMap;
use crate::types::{DetectParams, EventArg};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadAction {
    /// Compile the instance's source and install it
    Load,
    /// Tear the instance down; its removal flag is already set
    Unload,
    /// Swap in new source on an installed instance
    Reupload { source: String },
}

impl fmt::Display for LoadAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadAction::Load => write!(f, "load"),
            LoadAction::Unload => write!(f, "unload"),
            LoadAction::Reupload { .. } => write!(f, "reupload"),
        }
    }
}

#[derive(Debug)]
pub struct LoadUnloadRequest {
    pub instance: Arc<ScriptInstance>,
    pub action: LoadAction,
}

#[derive(Debug)]
pub struct EventRequest {
    pub instance: Arc<ScriptInstance>,
    pub event: String,
    pub detect: Vec<DetectParams>,
    pub args: Vec<EventArg>,
    /// Line map of the code installed when the event was submitted
    pub line_map: Arc<LineMap>,
}

#[derive(Debug)]
pub struct CheckpointRequest {
    pub instance: Arc<ScriptInstance>,
    /// false deletes the persisted snapshot instead of writing one
    pub create: bool,
}
