//! The three worker pools and the state they share with the coordinator.

pub mod checkpoint;
pub mod dispatch;
pub mod loader;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::config::SchedulerConfig;
use crate::error::{QueueKind, SchedulerError};
use crate::host::{SceneHooks, ScriptCompiler, ScriptSandbox, StatePersistence};
use crate::instance::ScriptInstance;
use crate::outcomes::CompileOutcomes;
use crate::queue::BoundedQueue;
use crate::registry::InstanceRegistry;
use crate::requests::{CheckpointRequest, EventRequest, LoadAction, LoadUnloadRequest};
use crate::sync::lock;
use crate::types::{ItemId, ScriptEvent};

/// The collaborators the workers call out to
#[derive(Clone)]
pub struct Collaborators {
    pub compiler: Arc<dyn ScriptCompiler>,
    pub sandbox: Arc<dyn ScriptSandbox>,
    pub persistence: Arc<dyn StatePersistence>,
    pub scene: Arc<dyn SceneHooks>,
}

/// Everything owned by one scheduler and reachable from its workers
pub(crate) struct Shared {
    pub config: SchedulerConfig,
    pub registry: InstanceRegistry,
    pub load_queue: BoundedQueue<LoadUnloadRequest>,
    pub event_queue: BoundedQueue<EventRequest>,
    pub checkpoint_queue: BoundedQueue<CheckpointRequest>,
    pub collaborators: Collaborators,
    pub outcomes: CompileOutcomes,
    /// Instances submitted for loading that are not registered yet
    pub pending_loads: Mutex<HashMap<ItemId, Arc<ScriptInstance>>>,
    /// Items resumed before they were installed
    pub resume_intents: Mutex<HashSet<ItemId>>,
}

impl Shared {
    pub fn new(config: SchedulerConfig, collaborators: Collaborators) -> Self {
        Self {
            registry: InstanceRegistry::new(),
            load_queue: BoundedQueue::new(QueueKind::LoadUnload, config.max_load_unload_queue_size),
            event_queue: BoundedQueue::new(QueueKind::Event, config.max_event_queue_size),
            checkpoint_queue: BoundedQueue::new(
                QueueKind::Checkpoint,
                config.max_checkpoint_queue_size,
            ),
            collaborators,
            outcomes: CompileOutcomes::new(),
            pending_loads: Mutex::new(HashMap::new()),
            resume_intents: Mutex::new(HashSet::new()),
            config,
        }
    }

    pub fn enqueue_load(
        &self,
        instance: Arc<ScriptInstance>,
        action: LoadAction,
    ) -> Result<(), SchedulerError> {
        let item = instance.item();
        let label = action.to_string();
        push(&self.load_queue, LoadUnloadRequest { instance, action })?;
        debug!(target: "scheduler", "Queued {} for {}", label, item);
        Ok(())
    }

    pub fn enqueue_event(
        &self,
        instance: &Arc<ScriptInstance>,
        event: ScriptEvent,
    ) -> Result<(), SchedulerError> {
        let line_map = instance
            .program()
            .unit
            .as_ref()
            .map(|unit| Arc::clone(&unit.line_map))
            .unwrap_or_default();

        push(
            &self.event_queue,
            EventRequest {
                instance: Arc::clone(instance),
                event: event.name,
                detect: event.detect,
                args: event.args,
                line_map,
            },
        )
    }

    pub fn enqueue_checkpoint(
        &self,
        instance: &Arc<ScriptInstance>,
        create: bool,
    ) -> Result<(), SchedulerError> {
        push(
            &self.checkpoint_queue,
            CheckpointRequest {
                instance: Arc::clone(instance),
                create,
            },
        )
    }

    /// Queue an event the engine itself raises, such as `state_entry`.
    /// A full queue only costs the event, so it is logged and dropped.
    pub fn post_engine_event(&self, instance: &Arc<ScriptInstance>, event: ScriptEvent) {
        let name = event.name.clone();
        if let Err(err) = self.enqueue_event(instance, event) {
            warn!(
                target: "scheduler",
                "Dropped {} for {}: {}", name, instance.item(), err
            );
        }
    }

    /// Drop queued, not yet started events for `instance`
    pub fn purge_events(&self, instance: &Arc<ScriptInstance>) -> usize {
        self.event_queue
            .retain(|request| !Arc::ptr_eq(&request.instance, instance))
    }

    pub fn take_resume_intent(&self, item: ItemId) -> bool {
        lock(&self.resume_intents).remove(&item)
    }

    /// Forget a pending load, but only if it is still this instance
    pub fn finish_pending_load(&self, instance: &Arc<ScriptInstance>) {
        let mut pending = lock(&self.pending_loads);
        if pending
            .get(&instance.item())
            .is_some_and(|current| Arc::ptr_eq(current, instance))
        {
            pending.remove(&instance.item());
        }
    }
}

fn push<T>(queue: &BoundedQueue<T>, item: T) -> Result<(), SchedulerError> {
    if queue.is_closed() {
        return Err(SchedulerError::ShutDown);
    }
    queue.try_push(item).map_err(|_| SchedulerError::QueueSaturated {
        queue: queue.kind(),
        capacity: queue.capacity(),
    })
}

/// Run a blocking collaborator call on the runtime's blocking pool. A panic
/// in `call` is logged and reported as None.
pub(crate) async fn blocking<R, F>(worker: &'static str, what: &str, call: F) -> Option<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    match tokio::task::spawn_blocking(call).await {
        Ok(value) => Some(value),
        Err(err) if err.is_panic() => {
            tracing::error!(target: "scheduler", "{} panicked during {}: {:?}", worker, what, err);
            None
        }
        Err(err) => {
            warn!(target: "scheduler", "{} task for {} was cancelled: {}", worker, what, err);
            None
        }
    }
}
