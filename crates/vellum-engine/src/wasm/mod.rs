//! WebAssembly-text scripts run under wasmtime: the shipped compiler and
//! sandbox.

mod engine;
mod runtime;

pub use engine::{HostState, create_engine, create_linker};
pub use runtime::{WasmRuntime, source_line_map};
