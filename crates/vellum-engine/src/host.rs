//! Contracts for the services the scheduler drives but does not implement:
//! the script compiler, the sandbox that executes compiled units, state
//! persistence and the scene that produces events.

use std::sync::Arc;

use crate::error::RuntimeFault;
use crate::line_map::LineMap;
use crate::types::{DetectParams, EventArg, ItemId, ObjectId};

/// Name of the fsm state every script starts in
pub const DEFAULT_STATE: &str = "default";

/// Opaque handle to a compiled unit living inside the sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptHandle(pub u64);

/// Output of a successful compile
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    pub handle: ScriptHandle,
    pub line_map: Arc<LineMap>,
}

/// Compiles source text into an executable unit
pub trait ScriptCompiler: Send + Sync {
    /// Returns the compiled unit or the list of compiler errors
    fn compile(&self, source: &str) -> Result<CompiledUnit, Vec<String>>;

    /// Called once no registered instance uses `source` any more, so a
    /// compiler that caches artifacts per source text can drop them.
    fn release_source(&self, _source: &str) {}
}

/// Everything the sandbox needs to run one event handler
#[derive(Debug, Clone)]
pub struct Invocation {
    pub object: ObjectId,
    pub item: ItemId,
    /// The instance's fsm state at the time the handler runs
    pub state: String,
    pub event: String,
    pub detect: Vec<DetectParams>,
    pub args: Vec<EventArg>,
}

/// Executes compiled units in isolation
///
/// Implementations must be safe to call from several worker threads at
/// once, for different handles and for the same handle.
pub trait ScriptSandbox: Send + Sync {
    fn execute(&self, handle: ScriptHandle, invocation: &Invocation) -> Result<(), RuntimeFault>;

    /// Reinitialise the unit's global state
    fn reset(&self, handle: ScriptHandle) -> anyhow::Result<()>;

    /// Release the unit; the handle is never used again afterwards
    fn dispose(&self, handle: ScriptHandle) -> anyhow::Result<()>;

    /// Serialize the unit's variable state
    fn snapshot(&self, handle: ScriptHandle) -> anyhow::Result<Vec<u8>>;

    /// Overwrite the unit's variable state from a snapshot
    fn restore(&self, handle: ScriptHandle, blob: &[u8]) -> anyhow::Result<()>;

    /// Event names the unit handles while in `state`
    fn state_events(&self, handle: ScriptHandle, state: &str) -> Vec<String>;
}

/// Durable storage for checkpoint blobs
pub trait StatePersistence: Send + Sync {
    fn save_state(&self, item: ItemId, blob: &[u8]) -> anyhow::Result<()>;
    fn delete_state(&self, item: ItemId) -> anyhow::Result<()>;
    fn load_state(&self, item: ItemId) -> anyhow::Result<Option<Vec<u8>>>;
}

/// The world side of the scheduler: admission of events and lifecycle
/// notifications. Every method has a no-op default.
pub trait SceneHooks: Send + Sync {
    /// Whether the object should currently receive events at all
    fn accepts_events(&self, _object: ObjectId) -> bool {
        true
    }

    fn state_exit(&self, _object: ObjectId, _item: ItemId, _state: &str) {}

    fn state_entry(&self, _object: ObjectId, _item: ItemId, _state: &str) {}

    /// The set of events the script handles in its current state changed
    fn script_events_changed(&self, _object: ObjectId, _item: ItemId, _events: &[String]) {}

    fn script_removed(&self, _object: ObjectId, _item: ItemId) {}
}

/// Scene that admits every event and ignores notifications
#[derive(Debug, Clone, Copy, Default)]
pub struct NullScene;

impl SceneHooks for NullScene {}
