use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, mpsc};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::CompileOutcome;
use crate::sync::lock;
use crate::types::ItemId;

enum Waiter {
    Task(oneshot::Sender<CompileOutcome>),
    Thread(mpsc::SyncSender<CompileOutcome>),
}

impl Waiter {
    /// Hand the outcome over, or give it back if the waiter has gone away
    fn deliver(self, outcome: CompileOutcome) -> Result<(), CompileOutcome> {
        match self {
            Waiter::Task(sender) => sender.send(outcome),
            Waiter::Thread(sender) => sender.send(outcome).map_err(|err| err.0),
        }
    }
}

enum Slot {
    Ready(CompileOutcome),
    Waiting(VecDeque<Waiter>),
}

/// One-shot delivery of load results, keyed by item
///
/// The loader fulfils a slot once per load attempt. Each outcome reaches
/// exactly one caller: the oldest live waiter, or else the next caller to
/// ask. Nobody polls.
#[derive(Default)]
pub struct CompileOutcomes {
    slots: Mutex<HashMap<ItemId, Slot>>,
}

impl CompileOutcomes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fulfil(&self, item: ItemId, outcome: CompileOutcome) {
        let mut slots = lock(&self.slots);
        let mut outcome = outcome;

        // Ok(drained) when a waiter took it, Err(outcome) when nobody did
        let delivered = match slots.get_mut(&item) {
            Some(Slot::Waiting(waiters)) => loop {
                match waiters.pop_front() {
                    Some(waiter) => match waiter.deliver(outcome) {
                        Ok(()) => break Ok(waiters.is_empty()),
                        Err(returned) => outcome = returned,
                    },
                    None => break Err(outcome),
                }
            },
            _ => Err(outcome),
        };

        match delivered {
            Ok(true) => {
                slots.remove(&item);
            }
            Ok(false) => {}
            // Newer attempts replace an outcome nobody collected
            Err(outcome) => {
                slots.insert(item, Slot::Ready(outcome));
            }
        }
    }

    /// Take a stored outcome without waiting
    pub fn take(&self, item: ItemId) -> Option<CompileOutcome> {
        let mut slots = lock(&self.slots);
        match slots.remove(&item) {
            Some(Slot::Ready(outcome)) => Some(outcome),
            Some(waiting) => {
                slots.insert(item, waiting);
                None
            }
            None => None,
        }
    }

    /// Wait for the next outcome for `item`. Returns None when the mailbox
    /// is cleared before one arrives.
    pub async fn wait(&self, item: ItemId) -> Option<CompileOutcome> {
        let receiver = {
            let mut slots = lock(&self.slots);
            if let Some(outcome) = Self::take_ready(&mut slots, item) {
                return Some(outcome);
            }
            let (sender, receiver) = oneshot::channel();
            Self::enqueue(&mut slots, item, Waiter::Task(sender));
            receiver
        };

        receiver.await.ok()
    }

    /// Blocking variant of [`CompileOutcomes::wait`] for callers outside
    /// any async runtime
    pub fn wait_blocking(&self, item: ItemId, timeout: Duration) -> Option<CompileOutcome> {
        let receiver = {
            let mut slots = lock(&self.slots);
            if let Some(outcome) = Self::take_ready(&mut slots, item) {
                return Some(outcome);
            }
            let (sender, receiver) = mpsc::sync_channel(1);
            Self::enqueue(&mut slots, item, Waiter::Thread(sender));
            receiver
        };

        receiver.recv_timeout(timeout).ok()
    }

    /// Drop every stored outcome and release every waiter empty-handed
    pub fn clear(&self) {
        lock(&self.slots).clear();
    }

    /// Forget the item's outcome and release its waiters empty-handed
    pub fn discard(&self, item: ItemId) {
        lock(&self.slots).remove(&item);
    }

    pub fn has_pending(&self, item: ItemId) -> bool {
        matches!(lock(&self.slots).get(&item), Some(Slot::Ready(_)))
    }

    fn take_ready(slots: &mut HashMap<ItemId, Slot>, item: ItemId) -> Option<CompileOutcome> {
        if matches!(slots.get(&item), Some(Slot::Ready(_)))
            && let Some(Slot::Ready(outcome)) = slots.remove(&item)
        {
            return Some(outcome);
        }
        None
    }

    fn enqueue(slots: &mut HashMap<ItemId, Slot>, item: ItemId, waiter: Waiter) {
        match slots.entry(item).or_insert_with(|| Slot::Waiting(VecDeque::new())) {
            Slot::Waiting(waiters) => waiters.push_back(waiter),
            // take_ready already emptied any Ready slot under the same lock
            Slot::Ready(_) => {}
        }
    }
}
