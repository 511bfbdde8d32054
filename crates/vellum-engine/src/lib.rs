//! Script execution scheduler
//!
//! Accepts untrusted scripts attached to simulated objects, compiles them
//! into isolated units and runs their event handlers under bounded
//! concurrency. Three bounded queues (load/unload, events, checkpoints) are
//! drained by three independently sized worker pools; a script fault never
//! escapes its own instance.
//!
//! The compiler, sandbox, persistence and scene are collaborators behind
//! the traits in [`host`]. [`wasm::WasmRuntime`] is a ready-made compiler
//! and sandbox for WebAssembly text scripts.

pub mod config;
pub mod error;
pub mod host;
pub mod instance;
pub mod line_map;
pub mod outcomes;
pub mod queue;
pub mod registry;
pub mod requests;
pub mod scheduler;
pub mod snapshot;
pub mod store;
pub mod throttle;
pub mod types;
pub mod wasm;

mod sync;
mod workers;

pub use config::{SchedulerConfig, VellumConfig};
pub use error::{CompileOutcome, MappedFault, QueueKind, RuntimeFault, SchedulerError};
pub use host::{
    CompiledUnit, DEFAULT_STATE, Invocation, NullScene, SceneHooks, ScriptCompiler, ScriptHandle,
    ScriptSandbox, StatePersistence,
};
pub use instance::{Lifecycle, ScriptInstance};
pub use line_map::{CodePosition, LineMap, SourcePosition};
pub use scheduler::{BuildError, QueueStats, Scheduler, SchedulerBuilder};
pub use store::{FileStateStore, MemoryStateStore};
pub use types::{
    DetectParams, EventArg, ItemId, ObjectId, Rotation, ScriptEvent, StartOptions, StateSource,
    Vector3,
};
pub use wasm::WasmRuntime;
