//! Loader workers: compile and install, swap in new source, or tear down.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{Shared, blocking};
use crate::error::CompileOutcome;
use crate::host::{CompiledUnit, ScriptHandle};
use crate::instance::{Lifecycle, Program, ScriptInstance};
use crate::requests::{LoadAction, LoadUnloadRequest};
use crate::snapshot::StateSnapshot;
use crate::types::{EventArg, ScriptEvent};

pub(crate) async fn run(shared: Arc<Shared>, worker: usize, shutdown: watch::Receiver<bool>) {
    debug!(target: "loader", "Loader worker {} started", worker);
    let poll = shared.config.poll_interval();

    while !*shutdown.borrow() {
        let Some((request, lease)) = shared.load_queue.next(poll).await else {
            continue;
        };

        let item = request.instance.item();
        let action = request.action.to_string();

        // Each item runs in its own task so a panic stays with that item
        let task = tokio::spawn(handle(Arc::clone(&shared), request));
        if let Err(err) = task.await {
            error!(target: "loader", "Loader worker {} failed on {} of {}: {}", worker, action, item, err);
        }
        drop(lease);
    }

    debug!(target: "loader", "Loader worker {} stopped", worker);
}

async fn handle(shared: Arc<Shared>, request: LoadUnloadRequest) {
    let LoadUnloadRequest { instance, action } = request;
    match action {
        LoadAction::Load => load(&shared, instance).await,
        LoadAction::Unload => unload(&shared, instance).await,
        LoadAction::Reupload { source } => reupload(&shared, instance, source).await,
    }
}

async fn load(shared: &Arc<Shared>, instance: Arc<ScriptInstance>) {
    let item = instance.item();
    let object = instance.object();

    if instance.is_pending_removal() {
        debug!(target: "loader", "Skipping load of {}: removal already requested", item);
        shared.finish_pending_load(&instance);
        return;
    }

    instance.set_lifecycle(Lifecycle::Loading);
    let source = instance.source();
    let unit = match compile(shared, &source).await {
        Ok(unit) => unit,
        Err(errors) => {
            warn!(
                target: "loader",
                "Script {} on object {} failed to compile with {} error(s)",
                item,
                object,
                errors.len()
            );
            instance.set_lifecycle(Lifecycle::Uninstalled);
            shared.finish_pending_load(&instance);
            // A newer load of the item still owns any resume intent
            if !instance.is_pending_removal() {
                shared.take_resume_intent(item);
            }
            shared.outcomes.fulfil(item, CompileOutcome::Failed(errors));
            return;
        }
    };

    let handle = unit.handle;
    let previous = instance.install(source, unit);
    instance.reset_runtime_state();
    instance.set_running(true);
    instance.set_disabled(false);

    let options = instance.start_options();
    let restored = options.state_source.restores_state()
        && restore_checkpoint(shared, &instance, handle).await;

    let displaced = shared.registry.upsert(Arc::clone(&instance));
    // Taken after the upsert so a concurrent resume either finds the
    // registered instance or leaves an intent behind for us
    if shared.take_resume_intent(item) {
        instance.set_suspended(false);
    }
    shared.finish_pending_load(&instance);
    shared.outcomes.fulfil(item, CompileOutcome::Compiled);
    info!(target: "loader", "Loaded script {} on object {}", item, object);

    if let Some(displaced) = displaced {
        debug!(target: "loader", "Retiring replaced instance of {}", item);
        retire(shared, &displaced).await;
    }
    if previous.handle().is_some() {
        retire_program(shared, previous).await;
    }

    // An unload may have run between the compile and the upsert above
    if instance.is_pending_removal() {
        retire(shared, &instance).await;
        return;
    }

    publish_events(shared, &instance, handle);
    if !restored {
        shared.post_engine_event(&instance, ScriptEvent::new("state_entry"));
    }
    if options.post_on_rez {
        shared.post_engine_event(
            &instance,
            ScriptEvent::new("on_rez").with_arg(EventArg::Integer(options.start_param)),
        );
    }
}

async fn reupload(shared: &Arc<Shared>, instance: Arc<ScriptInstance>, source: String) {
    let item = instance.item();
    if instance.is_pending_removal() || !shared.registry.contains(&instance) {
        debug!(target: "loader", "Skipping reupload of {}: script is gone", item);
        return;
    }

    let unit = match compile(shared, &source).await {
        Ok(unit) => unit,
        Err(errors) => {
            // The old code keeps running
            warn!(
                target: "loader",
                "Reupload of {} failed to compile with {} error(s); keeping previous code",
                item,
                errors.len()
            );
            shared.outcomes.fulfil(item, CompileOutcome::Failed(errors));
            return;
        }
    };

    let handle = unit.handle;
    let previous = instance.install(source, unit);
    instance.reset_runtime_state();
    instance.set_running(true);
    instance.set_disabled(false);
    shared.outcomes.fulfil(item, CompileOutcome::Compiled);
    info!(target: "loader", "Reuploaded script {} on object {}", item, instance.object());

    let old_source = previous.source.clone();
    retire_program(shared, previous).await;
    release_source_if_unused(shared, &old_source);

    if instance.is_pending_removal() {
        let late = instance.take_unit();
        retire_program(shared, late).await;
        return;
    }

    publish_events(shared, &instance, handle);
    shared.post_engine_event(&instance, ScriptEvent::new("state_entry"));
}

async fn unload(shared: &Arc<Shared>, instance: Arc<ScriptInstance>) {
    let item = instance.item();
    let object = instance.object();
    instance.mark_pending_removal();
    shared.finish_pending_load(&instance);

    // A load still waiting in the queue was never registered; its checkpoint
    // and the scene still have to hear about the removal
    if !retire(shared, &instance).await {
        debug!(target: "loader", "Unload of {}: script was never installed", item);
    }
    shared.outcomes.discard(item);
    shared.take_resume_intent(item);

    if let Err(err) = shared.enqueue_checkpoint(&instance, false) {
        debug!(target: "loader", "Deleting checkpoint of {} inline: {}", item, err);
        let persistence = Arc::clone(&shared.collaborators.persistence);
        if let Some(Err(err)) = blocking("loader", "delete_state", move || persistence.delete_state(item)).await {
            warn!(target: "loader", "Failed to delete checkpoint of {}: {:#}", item, err);
        }
    }

    shared.collaborators.scene.script_removed(object, item);
    info!(target: "loader", "Unloaded script {} from object {}", item, object);
}

/// Stop an instance for good: no further events, wait out the ones running,
/// dispose its unit and drop it from the registry. Safe to call twice.
/// Returns whether the instance was the registered one for its item.
pub(crate) async fn retire(shared: &Arc<Shared>, instance: &Arc<ScriptInstance>) -> bool {
    instance.mark_pending_removal();
    let purged = shared.purge_events(instance);
    if purged > 0 {
        debug!(target: "loader", "Dropped {} queued event(s) for {}", purged, instance.item());
    }

    instance.drain().await;
    let program = instance.take_unit();
    instance.set_lifecycle(Lifecycle::Disposed);
    if let Some(handle) = program.handle() {
        dispose(shared, handle, instance).await;
    }

    let removed = shared.registry.remove(instance);
    release_source_if_unused(shared, &program.source);
    removed
}

/// Dispose a replaced program once no dispatch or checkpoint still uses it
async fn retire_program(shared: &Arc<Shared>, program: Arc<Program>) {
    program.unpinned().await;

    if let Some(handle) = program.handle() {
        let sandbox = Arc::clone(&shared.collaborators.sandbox);
        if let Some(Err(err)) = blocking("loader", "dispose", move || sandbox.dispose(handle)).await {
            warn!(target: "loader", "Failed to dispose replaced unit {:?}: {:#}", handle, err);
        }
    }
}

async fn dispose(shared: &Arc<Shared>, handle: ScriptHandle, instance: &ScriptInstance) {
    let sandbox = Arc::clone(&shared.collaborators.sandbox);
    // A panicking dispose is already logged by `blocking`
    if let Some(Err(err)) = blocking("loader", "dispose", move || sandbox.dispose(handle)).await {
        warn!(target: "loader", "Failed to dispose script {}: {:#}", instance.item(), err);
    }
}

async fn compile(shared: &Arc<Shared>, source: &str) -> Result<CompiledUnit, Vec<String>> {
    let compiler = Arc::clone(&shared.collaborators.compiler);
    let source = source.to_string();
    blocking("loader", "compile", move || compiler.compile(&source))
        .await
        .unwrap_or_else(|| Err(vec!["compiler crashed".to_string()]))
}

/// Restore the persisted checkpoint into a freshly compiled unit. Returns
/// false when there is nothing usable to restore.
async fn restore_checkpoint(shared: &Arc<Shared>, instance: &Arc<ScriptInstance>, handle: ScriptHandle) -> bool {
    let item = instance.item();
    let persistence = Arc::clone(&shared.collaborators.persistence);
    let sandbox = Arc::clone(&shared.collaborators.sandbox);

    let restored = blocking("loader", "restore", move || -> anyhow::Result<Option<StateSnapshot>> {
        let Some(blob) = persistence.load_state(item)? else {
            return Ok(None);
        };
        let snapshot = StateSnapshot::decode(&blob)?;
        sandbox.restore(handle, &snapshot.variables)?;
        Ok(Some(snapshot))
    })
    .await;

    match restored {
        Some(Ok(Some(snapshot))) => {
            instance.transition(&snapshot.fsm_state, Vec::new());
            instance.set_running(snapshot.running);
            debug!(target: "loader", "Restored checkpoint of {} in state {}", item, snapshot.fsm_state);
            true
        }
        Some(Ok(None)) => false,
        Some(Err(err)) => {
            warn!(target: "loader", "Could not restore checkpoint of {}: {:#}", item, err);
            false
        }
        None => false,
    }
}

/// Recompute the events the instance handles in its current state and tell
/// the scene
pub(crate) fn publish_events(shared: &Shared, instance: &ScriptInstance, handle: ScriptHandle) {
    let events = shared
        .collaborators
        .sandbox
        .state_events(handle, &instance.fsm_state());
    instance.set_subscribed_events(events.clone());
    shared
        .collaborators
        .scene
        .script_events_changed(instance.object(), instance.item(), &events);
}

fn release_source_if_unused(shared: &Shared, source: &str) {
    if shared.registry.scripts_with_identical_source(source) == 0 {
        shared.collaborators.compiler.release_source(source);
    }
}
