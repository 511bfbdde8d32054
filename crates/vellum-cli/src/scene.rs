use tracing::{debug, info};
use vellum_engine::{ItemId, ObjectId, SceneHooks};

/// Scene for a headless host: every object accepts events and
/// notifications are only logged
pub struct LoggingScene;

impl SceneHooks for LoggingScene {
    fn state_exit(&self, object: ObjectId, item: ItemId, state: &str) {
        debug!(target: "scene", "[{}/{}] leaving state {}", object, item, state);
    }

    fn state_entry(&self, object: ObjectId, item: ItemId, state: &str) {
        info!(target: "scene", "[{}/{}] entered state {}", object, item, state);
    }

    fn script_events_changed(&self, object: ObjectId, item: ItemId, events: &[String]) {
        debug!(target: "scene", "[{}/{}] handles: {}", object, item, events.join(", "));
    }

    fn script_removed(&self, object: ObjectId, item: ItemId) {
        info!(target: "scene", "[{}/{}] script removed", object, item);
    }
}
