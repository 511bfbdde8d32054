//! Dispatch workers: run queued events through the sandbox.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{debug, trace, warn};

use super::{Shared, blocking};
use crate::error::{MappedFault, RuntimeFault};
use crate::host::Invocation;
use crate::instance::{Admission, DispatchPermit};
use crate::requests::EventRequest;

pub(crate) async fn run(shared: Arc<Shared>, worker: usize, shutdown: watch::Receiver<bool>) {
    debug!(target: "dispatch", "Dispatch worker {} started", worker);
    let poll = shared.config.poll_interval();
    // Consecutive items put back because their instance is suspended
    let mut deferred = 0usize;

    while !*shutdown.borrow() {
        let Some((request, lease)) = shared.event_queue.next(poll).await else {
            deferred = 0;
            continue;
        };

        if !shared.registry.contains(&request.instance) {
            trace!(
                target: "dispatch",
                "Dropping {} for {}: not registered",
                request.event,
                request.instance.item()
            );
            continue;
        }

        let admission = request.instance.admit(&request.event, Instant::now());
        match admission {
            Admission::Run(permit) => {
                deferred = 0;
                execute(&shared, request, permit).await;
            }
            Admission::Defer => {
                lease.requeue(request);
                deferred += 1;
                // Everything left in the queue is waiting on a suspended script
                if deferred >= shared.event_queue.occupancy() {
                    tokio::time::sleep(poll).await;
                    deferred = 0;
                }
                continue;
            }
            Admission::Drop(reason) => {
                trace!(
                    target: "dispatch",
                    "Dropping {} for {}: {:?}",
                    request.event,
                    request.instance.item(),
                    reason
                );
            }
        }
        drop(lease);
    }

    debug!(target: "dispatch", "Dispatch worker {} stopped", worker);
}

async fn execute(shared: &Arc<Shared>, request: EventRequest, permit: DispatchPermit) {
    let Some(handle) = permit.handle() else {
        return;
    };

    let EventRequest {
        instance,
        event,
        detect,
        args,
        line_map,
    } = request;

    // Map faults against the code that actually runs
    let line_map = permit
        .program()
        .unit
        .as_ref()
        .map(|unit| Arc::clone(&unit.line_map))
        .unwrap_or(line_map);

    if !detect.is_empty() {
        instance.set_detect_params(detect.clone());
    }

    let invocation = Invocation {
        object: instance.object(),
        item: instance.item(),
        state: instance.fsm_state(),
        event: event.clone(),
        detect,
        args,
    };

    let sandbox = Arc::clone(&shared.collaborators.sandbox);
    let result = blocking("dispatch", &event, move || {
        // The permit keeps the unit alive until the handler returns
        let _permit = permit;
        match catch_unwind(AssertUnwindSafe(|| sandbox.execute(handle, &invocation))) {
            Ok(result) => result,
            Err(panic) => Err(RuntimeFault::new(format!(
                "sandbox panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    })
    .await;

    match result {
        Some(Ok(())) => {
            trace!(target: "dispatch", "Ran {} for {}", event, instance.item());
        }
        Some(Err(fault)) => {
            let source = fault.location.and_then(|location| line_map.resolve(location));
            let mapped = MappedFault { fault, source };
            warn!(
                target: "dispatch",
                "Script {} on object {} faulted in {}: {}",
                instance.item(),
                instance.object(),
                event,
                mapped
            );

            if shared.config.disable_on_fault {
                instance.set_disabled(true);
                warn!(target: "dispatch", "Disabled script {} after fault", instance.item());
            }
        }
        None => {}
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
