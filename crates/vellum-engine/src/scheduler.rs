//! The scheduler coordinator: owns the queues, the worker pools and the
//! runtime they run on, and is the only surface the scene talks to.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{CompileOutcome, SchedulerError};
use crate::host::{NullScene, SceneHooks, ScriptCompiler, ScriptSandbox, StatePersistence};
use crate::instance::{Lifecycle, ScriptInstance};
use crate::requests::LoadAction;
use crate::snapshot::StateSnapshot;
use crate::store::MemoryStateStore;
use crate::sync::lock;
use crate::types::{DetectParams, ItemId, ObjectId, ScriptEvent, StartOptions, StateSource};
use crate::workers::loader::publish_events;
use crate::workers::{Collaborators, Shared, checkpoint, dispatch, loader};

/// Error during builder configuration
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("No script compiler configured - use .compiler() or .runtime()")]
    MissingCompiler,
    #[error("No script sandbox configured - use .sandbox() or .runtime()")]
    MissingSandbox,
}

/// Builder for [`Scheduler`]
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    compiler: Option<Arc<dyn ScriptCompiler>>,
    sandbox: Option<Arc<dyn ScriptSandbox>>,
    persistence: Option<Arc<dyn StatePersistence>>,
    scene: Option<Arc<dyn SceneHooks>>,
}

impl SchedulerBuilder {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            compiler: None,
            sandbox: None,
            persistence: None,
            scene: None,
        }
    }

    pub fn compiler(mut self, compiler: Arc<dyn ScriptCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    pub fn sandbox(mut self, sandbox: Arc<dyn ScriptSandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// Use one value as both compiler and sandbox
    pub fn runtime<R>(self, runtime: Arc<R>) -> Self
    where
        R: ScriptCompiler + ScriptSandbox + 'static,
    {
        let compiler: Arc<dyn ScriptCompiler> = runtime.clone();
        self.compiler(compiler).sandbox(runtime)
    }

    /// Where checkpoints go (default: in memory)
    pub fn persistence(mut self, persistence: Arc<dyn StatePersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Admission predicate and lifecycle listener (default: [`NullScene`])
    pub fn scene(mut self, scene: Arc<dyn SceneHooks>) -> Self {
        self.scene = Some(scene);
        self
    }

    pub fn build(self) -> Result<Scheduler, BuildError> {
        let collaborators = Collaborators {
            compiler: self.compiler.ok_or(BuildError::MissingCompiler)?,
            sandbox: self.sandbox.ok_or(BuildError::MissingSandbox)?,
            persistence: self
                .persistence
                .unwrap_or_else(|| Arc::new(MemoryStateStore::new())),
            scene: self.scene.unwrap_or_else(|| Arc::new(NullScene)),
        };

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Scheduler {
            shared: Arc::new(Shared::new(self.config, collaborators)),
            runtime: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            shutdown_tx,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }
}

/// Snapshot of queue depths, for logging and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub load_unload: usize,
    pub events: usize,
    pub checkpoints: usize,
}

/// Runs untrusted scripts for the scene under bounded concurrency
///
/// Submissions never block: each goes into one of three bounded queues and
/// is refused when that queue is full. Three worker pools drain the queues
/// on a runtime the scheduler owns, so it can be driven from plain threads
/// as well as from async code.
pub struct Scheduler {
    shared: Arc<Shared>,
    runtime: Mutex<Option<Runtime>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Scheduler {
    pub fn builder(config: SchedulerConfig) -> SchedulerBuilder {
        SchedulerBuilder::new(config)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    // ===== Lifecycle =====

    /// Spawn the worker pools. Calling it again is a no-op.
    pub fn start(&self) -> Result<(), SchedulerError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShutDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let config = &self.shared.config;
        if !config.enabled {
            info!(target: "scheduler", "Script scheduler is disabled; no workers started");
            return Ok(());
        }

        let runtime = match build_runtime(config) {
            Ok(runtime) => runtime,
            Err(err) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(err.into());
            }
        };

        let loaders = config.start_stop_threads.max(1);
        let dispatchers = config.event_queue_threads.max(1);
        let checkpointers = config.state_saving_threads.max(1);

        let mut workers = lock(&self.workers);
        for worker in 0..loaders {
            workers.push(runtime.spawn(loader::run(
                Arc::clone(&self.shared),
                worker,
                self.shutdown_tx.subscribe(),
            )));
        }
        for worker in 0..dispatchers {
            workers.push(runtime.spawn(dispatch::run(
                Arc::clone(&self.shared),
                worker,
                self.shutdown_tx.subscribe(),
            )));
        }
        for worker in 0..checkpointers {
            workers.push(runtime.spawn(checkpoint::run(
                Arc::clone(&self.shared),
                worker,
                self.shutdown_tx.subscribe(),
            )));
        }
        drop(workers);
        *lock(&self.runtime) = Some(runtime);

        info!(
            target: "scheduler",
            "Started {} loader, {} dispatch and {} checkpoint worker(s); worker priority {} is advisory",
            loaders,
            dispatchers,
            checkpointers,
            config.worker_priority
        );
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        lock(&self.runtime).is_some()
    }

    /// Stop accepting work, let running items finish, then checkpoint and
    /// dispose every remaining instance. Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: "scheduler", "Shutting down script scheduler");

        let _ = self.shutdown_tx.send(true);
        self.shared.load_queue.close();
        self.shared.event_queue.close();
        self.shared.checkpoint_queue.close();

        let runtime = lock(&self.runtime).take();
        let workers = std::mem::take(&mut *lock(&self.workers));
        if let Some(runtime) = runtime {
            // Joined from a plain thread so this also works when called
            // from inside another runtime
            let runtime_ref = &runtime;
            std::thread::scope(|scope| {
                scope.spawn(move || {
                    runtime_ref.block_on(async {
                        for worker in workers {
                            if let Err(err) = worker.await {
                                error!(target: "scheduler", "Worker ended abnormally: {}", err);
                            }
                        }
                    })
                });
            });
            runtime.shutdown_background();
        }

        self.dispose_all();
        self.shared.outcomes.clear();
        info!(target: "scheduler", "Script scheduler stopped");
    }

    fn dispose_all(&self) {
        let shared = &self.shared;
        for instance in lock(&shared.pending_loads).drain().map(|(_, instance)| instance) {
            instance.mark_pending_removal();
        }

        let instances = shared.registry.all();
        let count = instances.len();
        for instance in instances {
            instance.mark_pending_removal();
            let program = instance.take_unit();
            instance.set_lifecycle(Lifecycle::Disposed);

            if let Some(handle) = program.handle() {
                let sandbox = &shared.collaborators.sandbox;
                let persistence = &shared.collaborators.persistence;
                let item = instance.item();

                let result = catch_unwind(AssertUnwindSafe(|| -> anyhow::Result<()> {
                    let snapshot = StateSnapshot {
                        fsm_state: instance.fsm_state(),
                        running: instance.is_running(),
                        variables: sandbox.snapshot(handle)?,
                    };
                    persistence.save_state(item, &snapshot.encode()?)?;
                    Ok(())
                }));
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!(target: "scheduler", "Final checkpoint of {} failed: {:#}", item, err),
                    Err(_) => error!(target: "scheduler", "Final checkpoint of {} panicked", item),
                }

                match catch_unwind(AssertUnwindSafe(|| sandbox.dispose(handle))) {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!(target: "scheduler", "Failed to dispose {}: {:#}", item, err),
                    Err(_) => error!(target: "scheduler", "Disposing {} panicked", item),
                }
            }
            shared.registry.remove(&instance);
        }
        debug!(target: "scheduler", "Disposed {} script(s) at shutdown", count);
    }

    // ===== Submission =====

    /// Compile `source` and install it as the script for `item`. A script
    /// already running for the item keeps running until the new one is in.
    pub fn submit_load(
        &self,
        object: ObjectId,
        item: ItemId,
        source: impl Into<String>,
        options: StartOptions,
    ) -> bool {
        report("load", item, self.try_submit_load(object, item, source, options))
    }

    pub fn try_submit_load(
        &self,
        object: ObjectId,
        item: ItemId,
        source: impl Into<String>,
        options: StartOptions,
    ) -> Result<(), SchedulerError> {
        self.ensure_open()?;
        let instance = ScriptInstance::new(object, item, source, options);

        let previous = lock(&self.shared.pending_loads).insert(item, Arc::clone(&instance));
        if let Err(err) = self.shared.enqueue_load(Arc::clone(&instance), LoadAction::Load) {
            let mut pending = lock(&self.shared.pending_loads);
            pending.remove(&item);
            if let Some(previous) = previous {
                pending.insert(item, previous);
            }
            return Err(err);
        }

        // A newer load supersedes one still waiting in the queue
        if let Some(previous) = previous {
            previous.mark_pending_removal();
        }
        Ok(())
    }

    /// Swap new source into an installed script. On a compile error the
    /// old code keeps running.
    pub fn submit_reupload(&self, item: ItemId, source: impl Into<String>) -> bool {
        report("reupload", item, self.try_submit_reupload(item, source))
    }

    pub fn try_submit_reupload(
        &self,
        item: ItemId,
        source: impl Into<String>,
    ) -> Result<(), SchedulerError> {
        self.ensure_open()?;
        let instance = self.installed(item)?;
        self.shared.enqueue_load(
            instance,
            LoadAction::Reupload {
                source: source.into(),
            },
        )
    }

    /// Remove the script for `item`. No event for it runs after this returns.
    pub fn submit_unload(&self, item: ItemId) -> bool {
        report("unload", item, self.try_submit_unload(item))
    }

    pub fn try_submit_unload(&self, item: ItemId) -> Result<(), SchedulerError> {
        self.ensure_open()?;

        let pending = lock(&self.shared.pending_loads).remove(&item);
        self.shared.take_resume_intent(item);

        // A queued load is unloaded like an installed script so its
        // checkpoint goes and the scene hears about it
        let instance = match (self.shared.registry.get_by_item(item), pending) {
            (Some(registered), Some(pending)) => {
                pending.mark_pending_removal();
                registered
            }
            (Some(registered), None) => registered,
            (None, Some(pending)) => pending,
            (None, None) => return Err(SchedulerError::UnknownScript(item)),
        };

        // Set before queueing so nothing dispatches in between
        if !instance.mark_pending_removal() {
            debug!(target: "scheduler", "Unload of {} already queued", item);
            return Ok(());
        }
        self.shared.purge_events(&instance);
        self.shared.enqueue_load(instance, LoadAction::Unload)
    }

    /// Queue an event for one script
    pub fn submit_event(&self, item: ItemId, event: ScriptEvent) -> bool {
        report("event", item, self.try_submit_event(item, event))
    }

    pub fn try_submit_event(&self, item: ItemId, event: ScriptEvent) -> Result<(), SchedulerError> {
        self.ensure_open()?;
        let instance = self.installed(item)?;
        if !self.shared.collaborators.scene.accepts_events(instance.object()) {
            return Err(SchedulerError::EventsBlocked);
        }
        self.shared.enqueue_event(&instance, event)
    }

    /// Queue an event for every script on an object. True when every
    /// script accepted it, including when the object has none.
    pub fn submit_object_event(&self, object: ObjectId, event: ScriptEvent) -> bool {
        let instances = self.shared.registry.all_for_object(object);
        if instances.is_empty() {
            return true;
        }
        if !self.shared.collaborators.scene.accepts_events(object) {
            debug!(target: "scheduler", "Object {} does not accept events", object);
            return false;
        }

        instances.iter().fold(true, |accepted, instance| {
            self.submit_event(instance.item(), event.clone()) && accepted
        })
    }

    /// Persist (`create`) or delete the checkpoint for a script
    pub fn submit_checkpoint(&self, item: ItemId, create: bool) -> bool {
        report("checkpoint", item, self.try_submit_checkpoint(item, create))
    }

    pub fn try_submit_checkpoint(&self, item: ItemId, create: bool) -> Result<(), SchedulerError> {
        self.ensure_open()?;
        let instance = self
            .shared
            .registry
            .get_by_item(item)
            .ok_or(SchedulerError::UnknownScript(item))?;
        self.shared.enqueue_checkpoint(&instance, create)
    }

    // ===== Compile outcomes =====

    /// Wait for the outcome of the next load or reupload of `item`. Each
    /// outcome is handed to one caller only. Fails with `UnknownScript` when
    /// the script is unloaded before an outcome arrives.
    pub async fn compile_outcome(&self, item: ItemId) -> Result<CompileOutcome, SchedulerError> {
        self.ensure_loading()?;
        match self.shared.outcomes.wait(item).await {
            Some(outcome) => Ok(outcome),
            None => {
                self.ensure_open()?;
                Err(SchedulerError::UnknownScript(item))
            }
        }
    }

    /// Blocking [`Scheduler::compile_outcome`]; Ok(None) on timeout
    pub fn wait_compile_outcome(
        &self,
        item: ItemId,
        timeout: Duration,
    ) -> Result<Option<CompileOutcome>, SchedulerError> {
        self.ensure_loading()?;
        Ok(self.shared.outcomes.wait_blocking(item, timeout))
    }

    /// Collect an outcome that is already available
    pub fn take_compile_outcome(&self, item: ItemId) -> Option<CompileOutcome> {
        self.shared.outcomes.take(item)
    }

    // ===== Per-script operations =====

    pub fn script_keys(&self, object: ObjectId) -> Vec<ItemId> {
        self.shared
            .registry
            .all_for_object(object)
            .iter()
            .map(|instance| instance.item())
            .collect()
    }

    pub fn instance(&self, item: ItemId) -> Option<Arc<ScriptInstance>> {
        self.shared.registry.get_by_item(item)
    }

    pub fn script_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn is_running(&self, item: ItemId) -> bool {
        self.shared
            .registry
            .get_by_item(item)
            .is_some_and(|instance| instance.is_running())
    }

    /// Start or stop event delivery. Ignored for disabled scripts.
    pub fn set_running(&self, item: ItemId, running: bool) -> bool {
        match self.shared.registry.get_by_item(item) {
            Some(instance) if instance.is_disabled() => {
                debug!(target: "scheduler", "Ignoring running change for disabled script {}", item);
                false
            }
            Some(instance) => {
                instance.set_running(running);
                true
            }
            None => false,
        }
    }

    pub fn fsm_state(&self, item: ItemId) -> Option<String> {
        self.shared
            .registry
            .get_by_item(item)
            .map(|instance| instance.fsm_state())
    }

    /// Move the script to another fsm state: the new state and event set are
    /// committed, then the scene gets exit, events and entry notifications
    /// and `state_entry` is queued. Nothing happens when the state does not
    /// change.
    pub fn set_state(&self, item: ItemId, state: &str) -> Result<(), SchedulerError> {
        let instance = self.installed(item)?;
        let permit = instance.hold().ok_or(SchedulerError::PendingRemoval(item))?;
        let Some(handle) = permit.handle() else {
            return Err(SchedulerError::UnknownScript(item));
        };

        if instance.fsm_state() == state {
            return Ok(());
        }

        let events = self.shared.collaborators.sandbox.state_events(handle, state);
        let Some(old) = instance.transition(state, events.clone()) else {
            return Ok(());
        };

        let scene = &self.shared.collaborators.scene;
        let object = instance.object();
        scene.state_exit(object, item, &old);
        scene.script_events_changed(object, item, &events);
        scene.state_entry(object, item, state);
        drop(permit);

        debug!(target: "scheduler", "Script {} changed state {} -> {}", item, old, state);
        self.shared
            .post_engine_event(&instance, ScriptEvent::new("state_entry"));
        if let Err(err) = self.shared.enqueue_checkpoint(&instance, true) {
            debug!(target: "scheduler", "No checkpoint after state change of {}: {}", item, err);
        }
        Ok(())
    }

    /// Hold back events for a script; queued ones wait until resumed
    pub fn suspend(&self, item: ItemId) -> Result<(), SchedulerError> {
        let instance = self.find(item).ok_or(SchedulerError::UnknownScript(item))?;
        instance.set_suspended(true);
        Ok(())
    }

    /// Release a suspended script. A script that is not installed yet is
    /// resumed once it is.
    pub fn resume(&self, item: ItemId) {
        let mut intents = lock(&self.shared.resume_intents);
        match self.shared.registry.get_by_item(item) {
            Some(instance) if instance.is_installed() => instance.set_suspended(false),
            _ if lock(&self.shared.pending_loads).contains_key(&item) => {
                intents.insert(item);
                debug!(target: "scheduler", "Recorded resume intent for {}", item);
            }
            _ => debug!(target: "scheduler", "Ignoring resume of unknown script {}", item),
        }
    }

    /// Reinitialise a script's globals and go back to the default state.
    /// Running and disabled flags are left alone.
    pub fn reset(&self, item: ItemId) -> Result<(), SchedulerError> {
        let instance = self.installed(item)?;
        let permit = instance.hold().ok_or(SchedulerError::PendingRemoval(item))?;
        let Some(handle) = permit.handle() else {
            return Err(SchedulerError::UnknownScript(item));
        };

        if let Err(err) = self.shared.collaborators.sandbox.reset(handle) {
            warn!(target: "scheduler", "Sandbox reset of {} failed: {:#}", item, err);
        }
        instance.reset_runtime_state();
        publish_events(&self.shared, &instance, handle);
        drop(permit);

        self.shared
            .post_engine_event(&instance, ScriptEvent::new("state_entry"));
        Ok(())
    }

    /// Restart a script from its current source
    pub fn start_script(&self, item: ItemId) -> Result<(), SchedulerError> {
        let instance = self.installed(item)?;
        self.try_submit_load(
            instance.object(),
            item,
            instance.source(),
            instance.start_options(),
        )
    }

    pub fn stop_script(&self, item: ItemId) -> Result<(), SchedulerError> {
        self.try_submit_unload(item)
    }

    /// Minimum time between two runs of the same event type
    pub fn set_min_event_delay(&self, item: ItemId, seconds: f64) -> Result<(), SchedulerError> {
        let instance = self.installed(item)?;
        // NaN and negatives turn the limit off; anything too large saturates
        let interval = if seconds > 0.0 {
            Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        };
        instance.set_min_event_interval(interval);
        Ok(())
    }

    pub fn start_param(&self, item: ItemId) -> Option<i32> {
        self.find(item)
            .map(|instance| instance.start_options().start_param)
    }

    pub fn detect_params(&self, item: ItemId, index: usize) -> Option<DetectParams> {
        self.shared
            .registry
            .get_by_item(item)
            .and_then(|instance| instance.detect_params().get(index).cloned())
    }

    // ===== Bulk maintenance =====

    /// Set every enabled script running; returns how many changed
    pub fn start_all(&self) -> usize {
        self.set_all_running(true)
    }

    pub fn stop_all(&self) -> usize {
        self.set_all_running(false)
    }

    /// Recompile every script from scratch, discarding saved state
    pub fn restart_all(&self) -> usize {
        let instances = self.shared.registry.all();
        let mut restarted = 0;
        for instance in instances {
            if instance.is_pending_removal() {
                continue;
            }
            let item = instance.item();
            if let Err(err) = self.shared.enqueue_checkpoint(&instance, false) {
                warn!(target: "scheduler", "Could not queue state wipe for {}: {}", item, err);
            }

            let options = instance
                .start_options()
                .with_state_source(StateSource::NewRez);
            if self
                .try_submit_load(instance.object(), item, instance.source(), options)
                .is_ok()
            {
                restarted += 1;
            }
        }
        info!(target: "scheduler", "Restarting {} script(s)", restarted);
        restarted
    }

    /// Queue deletion of every script's saved state
    pub fn wipe_state_saves(&self) -> usize {
        let instances = self.shared.registry.all();
        let wiped = instances
            .iter()
            .filter(|instance| self.shared.enqueue_checkpoint(instance, false).is_ok())
            .count();
        info!(target: "scheduler", "Queued state wipe for {} script(s)", wiped);
        wiped
    }

    pub fn queue_stats(&self) -> QueueStats {
        QueueStats {
            load_unload: self.shared.load_queue.len(),
            events: self.shared.event_queue.len(),
            checkpoints: self.shared.checkpoint_queue.len(),
        }
    }

    // ===== Helpers =====

    fn ensure_open(&self) -> Result<(), SchedulerError> {
        if self.stopped.load(Ordering::SeqCst) {
            Err(SchedulerError::ShutDown)
        } else {
            Ok(())
        }
    }

    /// Outcomes only arrive while loader workers run
    fn ensure_loading(&self) -> Result<(), SchedulerError> {
        self.ensure_open()?;
        if self.is_started() {
            Ok(())
        } else {
            Err(SchedulerError::NotStarted)
        }
    }

    /// Registered instance that is not being removed
    fn installed(&self, item: ItemId) -> Result<Arc<ScriptInstance>, SchedulerError> {
        let instance = self
            .shared
            .registry
            .get_by_item(item)
            .ok_or(SchedulerError::UnknownScript(item))?;
        if instance.is_pending_removal() {
            return Err(SchedulerError::PendingRemoval(item));
        }
        Ok(instance)
    }

    /// Registered instance, or one still waiting to load
    fn find(&self, item: ItemId) -> Option<Arc<ScriptInstance>> {
        self.shared
            .registry
            .get_by_item(item)
            .or_else(|| lock(&self.shared.pending_loads).get(&item).cloned())
    }

    fn set_all_running(&self, running: bool) -> usize {
        let mut changed = 0;
        for instance in self.shared.registry.all() {
            if !instance.is_disabled() && instance.is_running() != running {
                instance.set_running(running);
                changed += 1;
            }
        }
        changed
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn build_runtime(config: &SchedulerConfig) -> std::io::Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.min_worker_threads.max(1))
        .max_blocking_threads(config.max_worker_threads.max(1))
        .thread_keep_alive(config.worker_idle_timeout())
        .thread_stack_size(config.worker_stack_size().max(256 * 1024))
        .thread_name("vellum-worker")
        .enable_all()
        .build()
}

/// Collapse a submission result to the accepted flag, logging refusals
fn report(what: &str, item: ItemId, result: Result<(), SchedulerError>) -> bool {
    match result {
        Ok(()) => true,
        Err(err @ SchedulerError::QueueSaturated { .. }) => {
            warn!(target: "scheduler", "Refused {} for {}: {}", what, item, err);
            false
        }
        Err(err) => {
            debug!(target: "scheduler", "Refused {} for {}: {}", what, item, err);
            false
        }
    }
}
