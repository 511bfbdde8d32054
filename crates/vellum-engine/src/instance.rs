use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::host::{CompiledUnit, DEFAULT_STATE, ScriptHandle};
use crate::sync::{lock, read, write};
use crate::throttle::EventThrottle;
use crate::types::{DetectParams, ItemId, ObjectId, StartOptions};

/// Engine-side lifecycle of an instance, independent of the script's own
/// fsm state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Uninstalled = 0,
    Loading = 1,
    Installed = 2,
    Disposed = 3,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Lifecycle::Loading,
            2 => Lifecycle::Installed,
            3 => Lifecycle::Disposed,
            _ => Lifecycle::Uninstalled,
        }
    }
}

/// Source text and the compiled unit built from it
///
/// The pair is swapped as a whole so a reader never sees new source next to
/// old compiled code.
///
/// Dispatches and checkpoints pin the program they run against; a replaced
/// program is disposed only once its pins are gone.
#[derive(Debug)]
pub struct Program {
    pub source: String,
    pub unit: Option<CompiledUnit>,
    pins: AtomicUsize,
    unpinned: Notify,
}

impl Program {
    pub fn new(source: String, unit: Option<CompiledUnit>) -> Self {
        Self {
            source,
            unit,
            pins: AtomicUsize::new(0),
            unpinned: Notify::new(),
        }
    }

    pub fn handle(&self) -> Option<ScriptHandle> {
        self.unit.as_ref().map(|unit| unit.handle)
    }

    /// Dispatches and checkpoints currently running against this program
    pub fn pins(&self) -> usize {
        self.pins.load(Ordering::SeqCst)
    }

    /// Wait until nothing runs against this program
    pub async fn unpinned(&self) {
        loop {
            let notified = self.unpinned.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pins() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn unpin(&self) {
        if self.pins.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.unpinned.notify_waiters();
        }
    }
}

/// Result of the dispatch guard
#[derive(Debug)]
pub enum Admission {
    Run(DispatchPermit),
    /// Suspended: try again later
    Defer,
    Drop(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NotInstalled,
    PendingRemoval,
    NotRunning,
    Throttled,
}

/// Gate verdict from the lifecycle flags alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Open,
    Deferred,
    Closed(DropReason),
}

#[derive(Debug)]
struct FsmSlot {
    state: String,
    events: Vec<String>,
}

/// One running script attached to one inventory item on one object
#[derive(Debug)]
pub struct ScriptInstance {
    object: ObjectId,
    item: ItemId,
    program: RwLock<Arc<Program>>,
    lifecycle: AtomicU8,
    running: AtomicBool,
    suspended: AtomicBool,
    disabled: AtomicBool,
    pending_removal: AtomicBool,
    fsm: Mutex<FsmSlot>,
    start: Mutex<StartOptions>,
    throttle: Mutex<EventThrottle>,
    detect_cache: RwLock<Vec<DetectParams>>,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl ScriptInstance {
    pub fn new(
        object: ObjectId,
        item: ItemId,
        source: impl Into<String>,
        options: StartOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            object,
            item,
            program: RwLock::new(Arc::new(Program::new(source.into(), None))),
            lifecycle: AtomicU8::new(Lifecycle::Uninstalled as u8),
            running: AtomicBool::new(true),
            suspended: AtomicBool::new(options.start_suspended),
            disabled: AtomicBool::new(false),
            pending_removal: AtomicBool::new(false),
            fsm: Mutex::new(FsmSlot {
                state: DEFAULT_STATE.to_string(),
                events: Vec::new(),
            }),
            start: Mutex::new(options),
            throttle: Mutex::new(EventThrottle::default()),
            detect_cache: RwLock::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        })
    }

    pub fn object(&self) -> ObjectId {
        self.object
    }

    pub fn item(&self) -> ItemId {
        self.item
    }

    // ===== Program =====

    /// Current source/compiled pair
    pub(crate) fn program(&self) -> Arc<Program> {
        read(&self.program).clone()
    }

    /// Current program, pinned under the same lock `install` swaps it with,
    /// so a replaced program can never gain a pin after it was retired
    fn pin_program(&self) -> Arc<Program> {
        let program = read(&self.program);
        program.pins.fetch_add(1, Ordering::SeqCst);
        Arc::clone(&program)
    }

    pub fn source(&self) -> String {
        read(&self.program).source.clone()
    }

    pub fn handle(&self) -> Option<ScriptHandle> {
        read(&self.program).handle()
    }

    /// Install a freshly compiled unit together with its source and return
    /// the program it replaced
    pub fn install(&self, source: String, unit: CompiledUnit) -> Arc<Program> {
        let replacement = Arc::new(Program::new(source, Some(unit)));
        let previous = std::mem::replace(&mut *write(&self.program), replacement);
        self.set_lifecycle(Lifecycle::Installed);
        previous
    }

    /// Take the compiled unit out for disposal, leaving the source behind
    pub fn take_unit(&self) -> Arc<Program> {
        let mut slot = write(&self.program);
        let source = slot.source.clone();
        std::mem::replace(&mut *slot, Arc::new(Program::new(source, None)))
    }

    // ===== Lifecycle flags =====

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::SeqCst))
    }

    pub fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.lifecycle.store(lifecycle as u8, Ordering::SeqCst);
    }

    pub fn is_installed(&self) -> bool {
        self.lifecycle() == Lifecycle::Installed
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::SeqCst);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::SeqCst);
    }

    pub fn is_pending_removal(&self) -> bool {
        self.pending_removal.load(Ordering::SeqCst)
    }

    /// Mark the instance for removal. Returns false if it already was.
    pub fn mark_pending_removal(&self) -> bool {
        !self.pending_removal.swap(true, Ordering::SeqCst)
    }

    // ===== Start parameters =====

    pub fn start_options(&self) -> StartOptions {
        *lock(&self.start)
    }

    pub fn set_start_options(&self, options: StartOptions) {
        *lock(&self.start) = options;
    }

    // ===== Fsm state =====

    pub fn fsm_state(&self) -> String {
        lock(&self.fsm).state.clone()
    }

    /// Assign a new fsm state and its event set. Returns the old state name,
    /// or None when the names are equal and nothing changed.
    pub fn transition(&self, state: &str, events: Vec<String>) -> Option<String> {
        let mut fsm = lock(&self.fsm);
        if fsm.state == state {
            return None;
        }
        fsm.events = events;
        Some(std::mem::replace(&mut fsm.state, state.to_string()))
    }

    pub fn subscribed_events(&self) -> Vec<String> {
        lock(&self.fsm).events.clone()
    }

    pub fn set_subscribed_events(&self, events: Vec<String>) {
        lock(&self.fsm).events = events;
    }

    /// Back to the default state, forgetting detection and throttle history
    pub fn reset_runtime_state(&self) {
        lock(&self.fsm).state = DEFAULT_STATE.to_string();
        lock(&self.throttle).clear();
        write(&self.detect_cache).clear();
    }

    // ===== Throttle and detection =====

    pub fn min_event_interval(&self) -> Duration {
        lock(&self.throttle).min_interval()
    }

    pub fn set_min_event_interval(&self, interval: Duration) {
        lock(&self.throttle).set_min_interval(interval);
    }

    pub fn detect_params(&self) -> Vec<DetectParams> {
        read(&self.detect_cache).clone()
    }

    pub fn set_detect_params(&self, detect: Vec<DetectParams>) {
        *write(&self.detect_cache) = detect;
    }

    // ===== Dispatch guard =====

    /// The single answer to "may this instance execute now", from the flags
    /// alone, checked in this order: installed with compiled code, not
    /// pending removal, running and not disabled, not suspended.
    pub fn gate(&self) -> Gate {
        if !self.is_installed() || self.handle().is_none() {
            return Gate::Closed(DropReason::NotInstalled);
        }
        if self.is_pending_removal() {
            return Gate::Closed(DropReason::PendingRemoval);
        }
        if !self.is_running() || self.is_disabled() {
            return Gate::Closed(DropReason::NotRunning);
        }
        if self.is_suspended() {
            return Gate::Deferred;
        }
        Gate::Open
    }

    /// Run the gate and the throttle for one event. A `Run` admission holds
    /// the instance in flight until the permit is dropped, which is what
    /// `drain` waits on.
    pub fn admit(self: &Arc<Self>, event: &str, now: Instant) -> Admission {
        // Count ourselves in flight before reading the removal flag, so a
        // concurrent `mark_pending_removal` either stops us here or waits for us.
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let permit = DispatchPermit {
            instance: Arc::clone(self),
            program: self.pin_program(),
        };

        match self.gate() {
            Gate::Open => {}
            Gate::Deferred => return Admission::Defer,
            Gate::Closed(reason) => return Admission::Drop(reason),
        }

        if !lock(&self.throttle).try_admit(event, now) {
            return Admission::Drop(DropReason::Throttled);
        }

        Admission::Run(permit)
    }

    /// Pin the compiled unit for non-event work such as a checkpoint or a
    /// reset. Fails once removal has been requested or while nothing is
    /// compiled; a successful hold delays disposal like a dispatch does.
    pub fn hold(self: &Arc<Self>) -> Option<DispatchPermit> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let permit = DispatchPermit {
            instance: Arc::clone(self),
            program: self.pin_program(),
        };

        if self.is_pending_removal() || permit.program.handle().is_none() {
            return None;
        }
        Some(permit)
    }

    /// Number of admitted dispatches that have not finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no admitted dispatch is running
    pub async fn drain(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn finish_dispatch(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

/// Proof that an event passed the guard; keeps the instance in flight
#[derive(Debug)]
pub struct DispatchPermit {
    instance: Arc<ScriptInstance>,
    program: Arc<Program>,
}

impl DispatchPermit {
    pub fn instance(&self) -> &Arc<ScriptInstance> {
        &self.instance
    }

    /// The program that was current when the event was admitted
    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn handle(&self) -> Option<ScriptHandle> {
        self.program.handle()
    }
}

impl Drop for DispatchPermit {
    fn drop(&mut self) {
        self.program.unpin();
        self.instance.finish_dispatch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line_map::LineMap;

    fn unit(handle: u64) -> CompiledUnit {
        CompiledUnit {
            handle: ScriptHandle(handle),
            line_map: Arc::new(LineMap::new()),
        }
    }

    fn installed() -> Arc<ScriptInstance> {
        let instance = ScriptInstance::new(ObjectId(1), ItemId::new_v4(), "src", StartOptions::new());
        instance.install("src".to_string(), unit(1));
        instance
    }

    #[test]
    fn test_new_instance_is_not_dispatchable() {
        let instance = ScriptInstance::new(ObjectId(1), ItemId::new_v4(), "src", StartOptions::new());
        assert_eq!(instance.lifecycle(), Lifecycle::Uninstalled);
        assert_eq!(instance.gate(), Gate::Closed(DropReason::NotInstalled));
        assert_eq!(instance.fsm_state(), DEFAULT_STATE);
    }

    #[test]
    fn test_gate_order() {
        let instance = installed();
        assert_eq!(instance.gate(), Gate::Open);

        instance.set_suspended(true);
        assert_eq!(instance.gate(), Gate::Deferred);

        instance.set_running(false);
        assert_eq!(instance.gate(), Gate::Closed(DropReason::NotRunning));

        // Removal wins over everything but installation
        instance.mark_pending_removal();
        assert_eq!(instance.gate(), Gate::Closed(DropReason::PendingRemoval));
    }

    #[test]
    fn test_pending_removal_is_monotonic() {
        let instance = installed();
        assert!(instance.mark_pending_removal());
        assert!(!instance.mark_pending_removal());
        assert!(instance.is_pending_removal());
    }

    #[test]
    fn test_permit_tracks_in_flight() {
        let instance = installed();
        let admission = instance.admit("touch_start", Instant::now());
        assert!(matches!(admission, Admission::Run(_)));
        assert_eq!(instance.in_flight(), 1);

        drop(admission);
        assert_eq!(instance.in_flight(), 0);

        // Refused admissions do not leak an in-flight count either
        instance.set_suspended(true);
        assert!(matches!(instance.admit("touch_start", Instant::now()), Admission::Defer));
        assert_eq!(instance.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_replaced_program_waits_for_its_pins() {
        let instance = installed();
        let Admission::Run(permit) = instance.admit("touch_start", Instant::now()) else {
            panic!("expected the event to be admitted");
        };

        let previous = instance.install("new".to_string(), unit(2));
        assert_eq!(previous.pins(), 1);
        assert_eq!(instance.program().pins(), 0);

        let waiter = {
            let previous = Arc::clone(&previous);
            tokio::spawn(async move { previous.unpinned().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("unpinned after the permit is dropped")
            .unwrap();

        // A plain reference does not hold disposal back
        let _reference = Arc::clone(&previous);
        previous.unpinned().await;
    }

    #[test]
    fn test_hold_refused_after_removal() {
        let instance = installed();
        let held = instance.hold();
        assert!(held.is_some());
        assert_eq!(instance.in_flight(), 1);
        drop(held);

        instance.mark_pending_removal();
        assert!(instance.hold().is_none());
        assert_eq!(instance.in_flight(), 0);
    }

    #[test]
    fn test_throttle_applies_after_gate() {
        let instance = installed();
        instance.set_min_event_interval(Duration::from_secs(5));
        let now = Instant::now();

        assert!(matches!(instance.admit("touch_start", now), Admission::Run(_)));
        assert!(matches!(
            instance.admit("touch_start", now),
            Admission::Drop(DropReason::Throttled)
        ));
    }

    #[test]
    fn test_install_swaps_source_and_unit_together() {
        let instance = installed();
        let previous = instance.install("new".to_string(), unit(2));

        assert_eq!(previous.source, "src");
        assert_eq!(previous.handle(), Some(ScriptHandle(1)));
        let program = instance.program();
        assert_eq!(program.source, "new");
        assert_eq!(program.handle(), Some(ScriptHandle(2)));
    }

    #[test]
    fn test_transition_only_on_change() {
        let instance = installed();
        assert_eq!(instance.transition(DEFAULT_STATE, vec![]), None);

        let old = instance.transition("open", vec!["touch_start".into()]);
        assert_eq!(old.as_deref(), Some(DEFAULT_STATE));
        assert_eq!(instance.fsm_state(), "open");
        assert_eq!(instance.subscribed_events(), vec!["touch_start".to_string()]);
    }

    #[test]
    fn test_reset_runtime_state() {
        let instance = installed();
        instance.transition("open", vec![]);
        instance.set_detect_params(vec![DetectParams::default()]);
        instance.set_min_event_interval(Duration::from_secs(1));
        instance.set_running(false);

        instance.reset_runtime_state();

        assert_eq!(instance.fsm_state(), DEFAULT_STATE);
        assert!(instance.detect_params().is_empty());
        assert_eq!(instance.min_event_interval(), Duration::from_secs(1));
        // Reset leaves the running flag alone
        assert!(!instance.is_running());
    }

    #[tokio::test]
    async fn test_drain_waits_for_permits() {
        let instance = installed();
        let permit = match instance.admit("timer", Instant::now()) {
            Admission::Run(permit) => permit,
            other => panic!("expected run, got {:?}", other),
        };

        let waiter = {
            let instance = Arc::clone(&instance);
            tokio::spawn(async move { instance.drain().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("drain should finish once the permit is dropped")
            .unwrap();
    }
}
