//! Checkpoint workers: persist or delete instance state snapshots.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use super::{Shared, blocking};
use crate::instance::ScriptInstance;
use crate::requests::CheckpointRequest;
use crate::snapshot::StateSnapshot;

pub(crate) async fn run(shared: Arc<Shared>, worker: usize, shutdown: watch::Receiver<bool>) {
    debug!(target: "checkpoint", "Checkpoint worker {} started", worker);
    let poll = shared.config.poll_interval();

    while !*shutdown.borrow() {
        let Some((CheckpointRequest { instance, create }, _lease)) =
            shared.checkpoint_queue.next(poll).await
        else {
            continue;
        };

        if create {
            save(&shared, instance).await;
        } else {
            delete(&shared, instance).await;
        }
    }

    debug!(target: "checkpoint", "Checkpoint worker {} stopped", worker);
}

async fn save(shared: &Arc<Shared>, instance: Arc<ScriptInstance>) {
    let item = instance.item();
    // Pinning the unit keeps a concurrent unload from disposing it mid-snapshot
    let Some(permit) = instance.hold() else {
        debug!(target: "checkpoint", "Skipping checkpoint of {}: not installed", item);
        return;
    };
    if !shared.registry.contains(&instance) {
        debug!(target: "checkpoint", "Skipping checkpoint of {}: not registered", item);
        return;
    }
    let Some(handle) = permit.handle() else {
        return;
    };

    let fsm_state = instance.fsm_state();
    let running = instance.is_running();
    let sandbox = Arc::clone(&shared.collaborators.sandbox);
    let persistence = Arc::clone(&shared.collaborators.persistence);

    let saved = blocking("checkpoint", "save", move || -> anyhow::Result<usize> {
        let _permit = permit;
        let variables = sandbox.snapshot(handle)?;
        let blob = StateSnapshot {
            fsm_state,
            running,
            variables,
        }
        .encode()?;
        persistence.save_state(item, &blob)?;
        Ok(blob.len())
    })
    .await;

    match saved {
        Some(Ok(bytes)) => debug!(target: "checkpoint", "Saved {} bytes of state for {}", bytes, item),
        Some(Err(err)) => warn!(target: "checkpoint", "Failed to save state for {}: {:#}", item, err),
        None => {}
    }
}

async fn delete(shared: &Arc<Shared>, instance: Arc<ScriptInstance>) {
    let item = instance.item();
    let persistence = Arc::clone(&shared.collaborators.persistence);

    match blocking("checkpoint", "delete", move || persistence.delete_state(item)).await {
        Some(Ok(())) => debug!(target: "checkpoint", "Deleted saved state for {}", item),
        Some(Err(err)) => warn!(target: "checkpoint", "Failed to delete state for {}: {:#}", item, err),
        None => {}
    }
}
