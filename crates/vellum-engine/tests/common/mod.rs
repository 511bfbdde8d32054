//! Recording collaborators shared by the scheduler integration tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use vellum_engine::{
    CodePosition, CompiledUnit, EventArg, Invocation, ItemId, LineMap, ObjectId, RuntimeFault,
    Scheduler, SchedulerConfig, SceneHooks, ScriptCompiler, ScriptHandle, ScriptSandbox,
    SourcePosition, StatePersistence,
};

/// Source text the mock compiler rejects
pub const BAD_SOURCE: &str = "default { syntax error";
pub const GOOD_SOURCE: &str = "default { touch_start() {} }";

#[derive(Debug, Clone)]
pub struct Execution {
    pub item: ItemId,
    pub handle: ScriptHandle,
    pub state: String,
    pub event: String,
    pub args: Vec<EventArg>,
}

/// Compiler and sandbox in one, recording every call
///
/// Events named `boom` fault at code position 0, `panic` panics inside the
/// sandbox and `slow` sleeps for 50ms.
#[derive(Default)]
pub struct MockRuntime {
    next_handle: AtomicU64,
    pub executed: Mutex<Vec<Execution>>,
    pub disposed: Mutex<Vec<ScriptHandle>>,
    pub restored: Mutex<Vec<(ScriptHandle, Vec<u8>)>>,
    pub resets: Mutex<Vec<ScriptHandle>>,
    pub released: Mutex<Vec<String>>,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self, item: ItemId, event: &str) -> usize {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.item == item && e.event == event)
            .count()
    }

    pub fn executions_for(&self, item: ItemId) -> Vec<Execution> {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.item == item)
            .cloned()
            .collect()
    }

    pub fn dispose_count(&self, handle: ScriptHandle) -> usize {
        self.disposed
            .lock()
            .unwrap()
            .iter()
            .filter(|h| **h == handle)
            .count()
    }
}

impl ScriptCompiler for MockRuntime {
    fn compile(&self, source: &str) -> Result<CompiledUnit, Vec<String>> {
        if source.contains("syntax error") {
            return Err(vec!["(1,11): syntax error".to_string()]);
        }

        let handle = ScriptHandle(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1);
        let mut line_map = LineMap::new();
        line_map.insert(
            CodePosition { line: 0, column: 0 },
            SourcePosition { line: 7, column: 3 },
        );
        Ok(CompiledUnit {
            handle,
            line_map: Arc::new(line_map),
        })
    }

    fn release_source(&self, source: &str) {
        self.released.lock().unwrap().push(source.to_string());
    }
}

impl ScriptSandbox for MockRuntime {
    fn execute(&self, handle: ScriptHandle, invocation: &Invocation) -> Result<(), RuntimeFault> {
        self.executed.lock().unwrap().push(Execution {
            item: invocation.item,
            handle,
            state: invocation.state.clone(),
            event: invocation.event.clone(),
            args: invocation.args.clone(),
        });

        match invocation.event.as_str() {
            "boom" => Err(RuntimeFault::new("division by zero").at(CodePosition { line: 0, column: 4 })),
            "panic" => panic!("sandbox blew up"),
            "slow" => {
                thread::sleep(Duration::from_millis(50));
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn reset(&self, handle: ScriptHandle) -> anyhow::Result<()> {
        self.resets.lock().unwrap().push(handle);
        Ok(())
    }

    fn dispose(&self, handle: ScriptHandle) -> anyhow::Result<()> {
        self.disposed.lock().unwrap().push(handle);
        Ok(())
    }

    fn snapshot(&self, handle: ScriptHandle) -> anyhow::Result<Vec<u8>> {
        Ok(format!("vars-{}", handle.0).into_bytes())
    }

    fn restore(&self, handle: ScriptHandle, blob: &[u8]) -> anyhow::Result<()> {
        self.restored.lock().unwrap().push((handle, blob.to_vec()));
        Ok(())
    }

    fn state_events(&self, _handle: ScriptHandle, state: &str) -> Vec<String> {
        match state {
            "default" => vec!["state_entry".into(), "touch_start".into(), "timer".into()],
            _ => vec!["state_entry".into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SceneCall {
    Exit(ItemId, String),
    Entry(ItemId, String),
    Events(ItemId, Vec<String>),
    Removed(ItemId),
}

/// Scene that records notifications and can block objects
#[derive(Default)]
pub struct RecordingScene {
    pub calls: Mutex<Vec<SceneCall>>,
    pub blocked: Mutex<HashSet<ObjectId>>,
}

impl RecordingScene {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<SceneCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl SceneHooks for RecordingScene {
    fn accepts_events(&self, object: ObjectId) -> bool {
        !self.blocked.lock().unwrap().contains(&object)
    }

    fn state_exit(&self, _object: ObjectId, item: ItemId, state: &str) {
        self.calls.lock().unwrap().push(SceneCall::Exit(item, state.to_string()));
    }

    fn state_entry(&self, _object: ObjectId, item: ItemId, state: &str) {
        self.calls.lock().unwrap().push(SceneCall::Entry(item, state.to_string()));
    }

    fn script_events_changed(&self, _object: ObjectId, item: ItemId, events: &[String]) {
        self.calls.lock().unwrap().push(SceneCall::Events(item, events.to_vec()));
    }

    fn script_removed(&self, _object: ObjectId, item: ItemId) {
        self.calls.lock().unwrap().push(SceneCall::Removed(item));
    }
}

pub fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        event_queue_threads: 2,
        poll_interval_ms: 5,
        min_worker_threads: 2,
        max_worker_threads: 8,
        ..Default::default()
    }
}

pub struct Harness {
    pub scheduler: Scheduler,
    pub runtime: Arc<MockRuntime>,
    pub scene: Arc<RecordingScene>,
    pub store: Arc<vellum_engine::MemoryStateStore>,
}

pub fn harness(config: SchedulerConfig) -> Harness {
    let runtime = MockRuntime::new();
    let scene = RecordingScene::new();
    let store = Arc::new(vellum_engine::MemoryStateStore::new());

    let scheduler = Scheduler::builder(config)
        .runtime(Arc::clone(&runtime))
        .scene(scene.clone())
        .persistence(store.clone() as Arc<dyn StatePersistence>)
        .build()
        .expect("scheduler should build");

    Harness {
        scheduler,
        runtime,
        scene,
        store,
    }
}

pub fn started(config: SchedulerConfig) -> Harness {
    let harness = harness(config);
    harness.scheduler.start().expect("scheduler should start");
    harness
}

/// Poll `condition` until it holds or five seconds pass
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Give the workers time to run anything still queued
pub fn settle() {
    thread::sleep(Duration::from_millis(100));
}

impl Harness {
    /// Load a script and wait until it is installed
    pub fn load(&self, object: u32, source: &str) -> ItemId {
        let item = ItemId::new_v4();
        assert!(self.scheduler.submit_load(
            ObjectId(object),
            item,
            source,
            vellum_engine::StartOptions::new()
        ));
        assert!(
            wait_until(|| self.installed(item)),
            "script {} never installed",
            item
        );
        item
    }

    pub fn installed(&self, item: ItemId) -> bool {
        self.scheduler
            .instance(item)
            .is_some_and(|instance| instance.is_installed())
    }
}
