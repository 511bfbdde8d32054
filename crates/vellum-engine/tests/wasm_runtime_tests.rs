mod common;

use std::sync::Arc;

use common::wait_until;
use vellum_engine::snapshot::StateSnapshot;
use vellum_engine::{
    CodePosition, EventArg, Invocation, ItemId, MemoryStateStore, ObjectId, Scheduler,
    ScriptCompiler, ScriptEvent, ScriptSandbox, SchedulerConfig, StartOptions, StatePersistence,
    WasmRuntime, wasm::source_line_map,
};

const COUNTER: &str = r#"(module
  (import "env" "log" (func $log (param i32)))
  (import "env" "detected_count" (func $detected (result i32)))
  (global $count (export "count") (mut i32) (i32.const 0))
  (global $limit (export "limit") i32 (i32.const 10))
  (func (export "default:touch_start")
    global.get $count
    call $detected
    i32.add
    i32.const 1
    i32.add
    global.set $count)
  (func (export "default:state_entry")
    global.get $count
    call $log)
  (func (export "open:state_entry"))
  (func (export "default:timer")
    unreachable)
  (func (export "default:spin")
    (loop $forever
      br $forever))
  (func (export "default:on_rez") (param i32)
    local.get 0
    global.set $count))"#;

fn runtime() -> WasmRuntime {
    WasmRuntime::new(100_000).expect("wasm runtime")
}

fn invocation(state: &str, event: &str) -> Invocation {
    Invocation {
        object: ObjectId(1),
        item: ItemId::new_v4(),
        state: state.to_string(),
        event: event.to_string(),
        detect: Vec::new(),
        args: Vec::new(),
    }
}

fn count(runtime: &WasmRuntime, handle: vellum_engine::ScriptHandle) -> i64 {
    let blob = runtime.snapshot(handle).unwrap();
    let globals: serde_json::Value = serde_json::from_slice(&blob).unwrap();
    globals["count"]["I32"].as_i64().unwrap()
}

#[test]
fn test_handler_updates_globals() {
    let runtime = runtime();
    let unit = runtime.compile(COUNTER).unwrap();

    runtime.execute(unit.handle, &invocation("default", "touch_start")).unwrap();
    runtime.execute(unit.handle, &invocation("default", "touch_start")).unwrap();
    assert_eq!(count(&runtime, unit.handle), 2);

    let mut touched = invocation("default", "touch_start");
    touched.detect = vec![Default::default(), Default::default()];
    runtime.execute(unit.handle, &touched).unwrap();
    assert_eq!(count(&runtime, unit.handle), 5);
}

#[test]
fn test_missing_handler_is_not_a_fault() {
    let runtime = runtime();
    let unit = runtime.compile(COUNTER).unwrap();

    assert!(runtime.execute(unit.handle, &invocation("open", "touch_start")).is_ok());
    assert!(runtime.execute(unit.handle, &invocation("default", "listen")).is_ok());
}

#[test]
fn test_compile_errors_are_reported() {
    let runtime = runtime();
    let errors = runtime.compile("(module (func (export \"x\") i32.bogus))").unwrap_err();

    assert!(!errors.is_empty());
    assert_eq!(runtime.unit_count(), 0);
}

#[test]
fn test_trap_maps_to_source_line() {
    let runtime = runtime();
    let unit = runtime.compile(COUNTER).unwrap();

    let fault = runtime
        .execute(unit.handle, &invocation("default", "timer"))
        .unwrap_err();
    let location = fault.location.expect("trap location");

    let expected_line = COUNTER
        .lines()
        .position(|line| line.contains("default:timer"))
        .unwrap() as u32
        + 1;
    let source = unit.line_map.resolve(location).expect("mapped position");
    assert_eq!(source.line, expected_line);
}

#[test]
fn test_fuel_exhaustion_faults_and_unit_survives() {
    let runtime = runtime();
    let unit = runtime.compile(COUNTER).unwrap();

    let fault = runtime
        .execute(unit.handle, &invocation("default", "spin"))
        .unwrap_err();
    assert!(fault.message.contains("fuel"), "unexpected fault: {}", fault);

    // Fuel is refilled for the next event
    runtime.execute(unit.handle, &invocation("default", "touch_start")).unwrap();
    assert_eq!(count(&runtime, unit.handle), 1);
}

#[test]
fn test_handler_arguments() {
    let runtime = runtime();
    let unit = runtime.compile(COUNTER).unwrap();

    let mut on_rez = invocation("default", "on_rez");
    on_rez.args = vec![EventArg::Integer(42)];
    runtime.execute(unit.handle, &on_rez).unwrap();
    assert_eq!(count(&runtime, unit.handle), 42);

    // Wrong arity is a fault, not a crash
    let fault = runtime
        .execute(unit.handle, &invocation("default", "on_rez"))
        .unwrap_err();
    assert!(fault.message.contains("default:on_rez"));
}

#[test]
fn test_snapshot_restore_and_reset() {
    let runtime = runtime();
    let first = runtime.compile(COUNTER).unwrap();
    let second = runtime.compile(COUNTER).unwrap();
    assert_ne!(first.handle, second.handle);
    // Same text shares one module
    assert_eq!(runtime.cached_module_count(), 1);

    for _ in 0..3 {
        runtime.execute(first.handle, &invocation("default", "touch_start")).unwrap();
    }
    let blob = runtime.snapshot(first.handle).unwrap();

    // Immutable globals are not part of the state
    let globals: serde_json::Value = serde_json::from_slice(&blob).unwrap();
    assert!(globals.get("limit").is_none());

    runtime.restore(second.handle, &blob).unwrap();
    assert_eq!(count(&runtime, second.handle), 3);

    runtime.reset(second.handle).unwrap();
    assert_eq!(count(&runtime, second.handle), 0);
    assert_eq!(count(&runtime, first.handle), 3);

    assert!(runtime.restore(first.handle, b"not json").is_err());
}

#[test]
fn test_state_events_follow_exports() {
    let runtime = runtime();
    let unit = runtime.compile(COUNTER).unwrap();

    let mut events = runtime.state_events(unit.handle, "default");
    events.sort();
    assert_eq!(events, ["on_rez", "spin", "state_entry", "timer", "touch_start"]);
    assert_eq!(runtime.state_events(unit.handle, "open"), ["state_entry"]);
    assert!(runtime.state_events(unit.handle, "closed").is_empty());
}

#[test]
fn test_dispose_and_release() {
    let runtime = runtime();
    let unit = runtime.compile(COUNTER).unwrap();

    runtime.dispose(unit.handle).unwrap();
    runtime.dispose(unit.handle).unwrap();
    assert_eq!(runtime.unit_count(), 0);
    assert!(runtime.execute(unit.handle, &invocation("default", "touch_start")).is_err());

    runtime.release_source(COUNTER);
    assert_eq!(runtime.cached_module_count(), 0);
}

#[test]
fn test_line_map_positions() {
    let map = source_line_map(COUNTER);
    // Two imports plus six defined functions
    assert_eq!(map.len(), 8);
    let first = map.resolve(CodePosition { line: 0, column: 0 }).unwrap();
    assert_eq!(first.line, 2);
}

#[test]
fn test_scheduler_runs_wasm_scripts() {
    let runtime = Arc::new(runtime());
    let store = Arc::new(MemoryStateStore::new());
    let config = SchedulerConfig {
        poll_interval_ms: 5,
        ..Default::default()
    };
    let scheduler = Scheduler::builder(config)
        .runtime(Arc::clone(&runtime))
        .persistence(store.clone() as Arc<dyn StatePersistence>)
        .build()
        .unwrap();
    scheduler.start().unwrap();

    let item = ItemId::new_v4();
    assert!(scheduler.submit_load(ObjectId(5), item, COUNTER, StartOptions::new()));
    assert!(wait_until(|| scheduler
        .instance(item)
        .is_some_and(|instance| instance.is_installed())));
    let handle = scheduler.instance(item).and_then(|i| i.handle()).unwrap();

    for _ in 0..4 {
        assert!(scheduler.submit_event(item, ScriptEvent::new("touch_start")));
    }
    assert!(wait_until(|| count(&runtime, handle) == 4));

    assert!(scheduler.submit_checkpoint(item, true));
    assert!(wait_until(|| store.load_state(item).unwrap().is_some()));
    let snapshot = StateSnapshot::decode(&store.load_state(item).unwrap().unwrap()).unwrap();
    assert_eq!(snapshot.fsm_state, "default");
    assert!(snapshot.running);

    assert!(scheduler.submit_unload(item));
    assert!(wait_until(|| runtime.unit_count() == 0));
    assert!(wait_until(|| runtime.cached_module_count() == 0));

    scheduler.shutdown();
}
