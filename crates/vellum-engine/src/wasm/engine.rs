use anyhow::{Context, Result};
use tracing::debug;
use wasmtime::{Caller, Config, Engine, Linker};

use crate::host::ScriptHandle;

/// Per-store data visible to host imports
pub struct HostState {
    pub handle: ScriptHandle,
    /// Detection entries of the event being handled
    pub detected: i32,
}

/// Create a Wasmtime engine that meters every call with fuel
pub fn create_engine() -> Result<Engine> {
    let mut config = Config::new();

    // Scripts run synchronously on blocking threads
    config.async_support(false);
    config.consume_fuel(true);
    config.wasm_backtrace(true);

    #[cfg(not(debug_assertions))]
    {
        config.cranelift_opt_level(wasmtime::OptLevel::Speed);
    }

    Engine::new(&config).context("Failed to create Wasmtime engine")
}

/// Host functions importable from module `env`
pub fn create_linker(engine: &Engine) -> Result<Linker<HostState>> {
    let mut linker = Linker::new(engine);

    linker
        .func_wrap("env", "detected_count", |caller: Caller<'_, HostState>| -> i32 {
            caller.data().detected
        })
        .context("Failed to define env.detected_count")?;

    linker
        .func_wrap("env", "log", |caller: Caller<'_, HostState>, value: i32| {
            debug!(target: "sandbox", "[script {}] log {}", caller.data().handle.0, value);
        })
        .context("Failed to define env.log")?;

    Ok(linker)
}
