use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use wasmtime::{
    Engine, ExternType, Instance, Linker, Module, Mutability, Store, Trap, Val, ValType,
    WasmBacktrace,
};

use super::engine::{HostState, create_engine, create_linker};
use crate::config::SandboxConfig;
use crate::error::RuntimeFault;
use crate::host::{CompiledUnit, Invocation, ScriptCompiler, ScriptHandle, ScriptSandbox};
use crate::line_map::{CodePosition, LineMap, SourcePosition};
use crate::sync::{lock, read, write};
use crate::types::EventArg;

struct Live {
    store: Store<HostState>,
    instance: Instance,
}

struct WasmUnit {
    module: Module,
    live: Mutex<Live>,
}

/// A saved global value; floats keep their exact bit patterns
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
enum GlobalValue {
    I32(i32),
    I64(i64),
    F32(u32),
    F64(u64),
}

/// Compiles WebAssembly text scripts and runs their handlers
///
/// A handler is an exported function named `"<state>:<event>"`. The unit's
/// variable state is its set of exported mutable globals.
pub struct WasmRuntime {
    engine: Engine,
    linker: Linker<HostState>,
    fuel_per_event: u64,
    modules: Mutex<HashMap<String, Module>>,
    units: RwLock<HashMap<ScriptHandle, Arc<WasmUnit>>>,
    next_handle: AtomicU64,
}

impl WasmRuntime {
    pub fn new(fuel_per_event: u64) -> anyhow::Result<Self> {
        let engine = create_engine()?;
        let linker = create_linker(&engine)?;
        Ok(Self {
            engine,
            linker,
            fuel_per_event,
            modules: Mutex::new(HashMap::new()),
            units: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        })
    }

    pub fn from_config(config: &SandboxConfig) -> anyhow::Result<Self> {
        Self::new(config.fuel_per_event)
    }

    /// Number of live compiled units
    pub fn unit_count(&self) -> usize {
        read(&self.units).len()
    }

    /// Number of distinct source texts with a cached module
    pub fn cached_module_count(&self) -> usize {
        lock(&self.modules).len()
    }

    fn module_for(&self, source: &str) -> anyhow::Result<Module> {
        if let Some(module) = lock(&self.modules).get(source) {
            return Ok(module.clone());
        }

        // Compile outside the lock; a racing compile of the same text just
        // loses the insert
        let module = Module::new(&self.engine, source)?;
        Ok(lock(&self.modules)
            .entry(source.to_string())
            .or_insert(module)
            .clone())
    }

    fn instantiate(&self, module: &Module, handle: ScriptHandle) -> anyhow::Result<Live> {
        let mut store = Store::new(&self.engine, HostState { handle, detected: 0 });
        store.set_fuel(self.fuel_per_event)?;
        let instance = self
            .linker
            .instantiate(&mut store, module)
            .context("instantiating module")?;
        Ok(Live { store, instance })
    }

    fn unit(&self, handle: ScriptHandle) -> anyhow::Result<Arc<WasmUnit>> {
        read(&self.units)
            .get(&handle)
            .cloned()
            .ok_or_else(|| anyhow!("unknown script handle {}", handle.0))
    }
}

impl ScriptCompiler for WasmRuntime {
    fn compile(&self, source: &str) -> Result<CompiledUnit, Vec<String>> {
        let module = self.module_for(source).map_err(|err| error_lines(&err))?;
        let handle = ScriptHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let live = self
            .instantiate(&module, handle)
            .map_err(|err| error_lines(&err))?;

        write(&self.units).insert(
            handle,
            Arc::new(WasmUnit {
                module,
                live: Mutex::new(live),
            }),
        );
        debug!(target: "sandbox", "Compiled unit {}", handle.0);

        Ok(CompiledUnit {
            handle,
            line_map: Arc::new(source_line_map(source)),
        })
    }

    fn release_source(&self, source: &str) {
        if lock(&self.modules).remove(source).is_some() {
            debug!(target: "sandbox", "Released cached module");
        }
    }
}

impl ScriptSandbox for WasmRuntime {
    fn execute(&self, handle: ScriptHandle, invocation: &Invocation) -> Result<(), RuntimeFault> {
        let unit = self
            .unit(handle)
            .map_err(|err| RuntimeFault::new(err.to_string()))?;
        let mut live = lock(&unit.live);
        let Live { store, instance } = &mut *live;

        let name = format!("{}:{}", invocation.state, invocation.event);
        let Some(func) = instance.get_func(&mut *store, &name) else {
            // No handler in this state
            return Ok(());
        };

        let params = flatten_args(&invocation.args);
        let ty = func.ty(&*store);
        let expected: Vec<ValType> = ty.params().collect();
        let matches = expected.len() == params.len()
            && expected.iter().zip(&params).all(|(ty, value)| {
                matches!(
                    (ty, value),
                    (ValType::I32, Val::I32(_)) | (ValType::F32, Val::F32(_))
                )
            });
        if !matches {
            return Err(RuntimeFault::new(format!(
                "handler {} takes {} parameter(s) that do not match the {} event argument value(s)",
                name,
                expected.len(),
                params.len()
            )));
        }

        let mut results = vec![Val::I32(0); ty.results().len()];
        store.data_mut().detected = i32::try_from(invocation.detect.len()).unwrap_or(i32::MAX);
        store
            .set_fuel(self.fuel_per_event)
            .map_err(|err| RuntimeFault::new(err.to_string()))?;

        func.call(&mut *store, &params, &mut results)
            .map_err(|err| runtime_fault(&err))
    }

    fn reset(&self, handle: ScriptHandle) -> anyhow::Result<()> {
        let unit = self.unit(handle)?;
        let fresh = self.instantiate(&unit.module, handle)?;
        *lock(&unit.live) = fresh;
        debug!(target: "sandbox", "Reset unit {}", handle.0);
        Ok(())
    }

    fn dispose(&self, handle: ScriptHandle) -> anyhow::Result<()> {
        if write(&self.units).remove(&handle).is_some() {
            debug!(target: "sandbox", "Disposed unit {}", handle.0);
        }
        Ok(())
    }

    fn snapshot(&self, handle: ScriptHandle) -> anyhow::Result<Vec<u8>> {
        let unit = self.unit(handle)?;
        let mut live = lock(&unit.live);
        let Live { store, instance } = &mut *live;

        let mut globals = BTreeMap::new();
        for export in unit.module.exports() {
            if !matches!(export.ty(), ExternType::Global(_)) {
                continue;
            }
            let Some(global) = instance.get_global(&mut *store, export.name()) else {
                continue;
            };
            if global.ty(&*store).mutability() != Mutability::Var {
                continue;
            }

            let value = match global.get(&mut *store) {
                Val::I32(value) => GlobalValue::I32(value),
                Val::I64(value) => GlobalValue::I64(value),
                Val::F32(bits) => GlobalValue::F32(bits),
                Val::F64(bits) => GlobalValue::F64(bits),
                _ => continue,
            };
            globals.insert(export.name().to_string(), value);
        }

        serde_json::to_vec(&globals).context("encoding globals")
    }

    fn restore(&self, handle: ScriptHandle, blob: &[u8]) -> anyhow::Result<()> {
        if blob.is_empty() {
            return Ok(());
        }
        let globals: BTreeMap<String, GlobalValue> =
            serde_json::from_slice(blob).context("decoding globals")?;

        let unit = self.unit(handle)?;
        let mut live = lock(&unit.live);
        let Live { store, instance } = &mut *live;

        for (name, value) in globals {
            let Some(global) = instance.get_global(&mut *store, &name) else {
                warn!(target: "sandbox", "Saved global {} no longer exists in unit {}", name, handle.0);
                continue;
            };
            let value = match value {
                GlobalValue::I32(value) => Val::I32(value),
                GlobalValue::I64(value) => Val::I64(value),
                GlobalValue::F32(bits) => Val::F32(bits),
                GlobalValue::F64(bits) => Val::F64(bits),
            };
            if let Err(err) = global.set(&mut *store, value) {
                bail!("restoring global {}: {}", name, err);
            }
        }
        Ok(())
    }

    fn state_events(&self, handle: ScriptHandle, state: &str) -> Vec<String> {
        let Ok(unit) = self.unit(handle) else {
            return Vec::new();
        };
        let prefix = format!("{}:", state);
        unit.module
            .exports()
            .filter(|export| matches!(export.ty(), ExternType::Func(_)))
            .filter_map(|export| export.name().strip_prefix(&prefix).map(str::to_string))
            .collect()
    }
}

/// Numeric arguments in order; text and keys have no wasm representation
fn flatten_args(args: &[EventArg]) -> Vec<Val> {
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        match arg {
            EventArg::Integer(value) => values.push(Val::I32(*value)),
            EventArg::Float(value) => values.push(Val::F32(value.to_bits())),
            EventArg::Vector(v) => {
                values.extend([v.x, v.y, v.z].map(|c| Val::F32(c.to_bits())));
            }
            EventArg::Rotation(r) => {
                values.extend([r.x, r.y, r.z, r.s].map(|c| Val::F32(c.to_bits())));
            }
            EventArg::Text(_) | EventArg::Key(_) => {}
        }
    }
    values
}

fn error_lines(err: &anyhow::Error) -> Vec<String> {
    err.chain()
        .flat_map(|cause| {
            cause
                .to_string()
                .lines()
                .map(str::trim_end)
                .filter(|line| !line.trim().is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

fn runtime_fault(err: &anyhow::Error) -> RuntimeFault {
    let message = match err.downcast_ref::<Trap>() {
        Some(trap) => trap.to_string(),
        None => format!("{:#}", err),
    };

    let location = err
        .downcast_ref::<WasmBacktrace>()
        .and_then(|trace| trace.frames().first())
        .map(|frame| CodePosition {
            line: frame.func_index(),
            column: 0,
        });

    match location {
        Some(location) => RuntimeFault::new(message).at(location),
        None => RuntimeFault::new(message),
    }
}

/// Map each function index to the source line where the function starts
///
/// Indices count imported functions first, then defined ones, both in text
/// order, which is how the text format assigns them.
pub fn source_line_map(source: &str) -> LineMap {
    let mut map = LineMap::new();
    let mut index = 0u32;

    for (line_no, line) in source.lines().enumerate() {
        let code = line.split(";;").next().unwrap_or_default();
        let mut rest = code;
        let mut offset = 0usize;

        while let Some(found) = rest.find("(func") {
            let column = offset + found;
            // `(type (func ...))` declares a signature, not a function
            let is_signature = code[..column].trim_end().ends_with("(type");
            if !is_signature {
                map.insert(
                    CodePosition {
                        line: index,
                        column: 0,
                    },
                    SourcePosition {
                        line: (line_no + 1) as u32,
                        column: (column + 1) as u32,
                    },
                );
                index += 1;
            }
            offset = column + "(func".len();
            rest = &code[offset..];
        }
    }
    map
}
