use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// Scheduling hint for worker threads
///
/// Neither std nor tokio can set thread priorities portably, so the value is
/// carried through and logged when the worker runtime starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WorkerPriority {
    Lowest,
    #[default]
    BelowNormal,
    Normal,
    AboveNormal,
    Highest,
}

impl WorkerPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerPriority::Lowest => "lowest",
            WorkerPriority::BelowNormal => "belownormal",
            WorkerPriority::Normal => "normal",
            WorkerPriority::AboveNormal => "abovenormal",
            WorkerPriority::Highest => "highest",
        }
    }
}

impl From<String> for WorkerPriority {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "lowest" => WorkerPriority::Lowest,
            "belownormal" => WorkerPriority::BelowNormal,
            "normal" => WorkerPriority::Normal,
            "abovenormal" => WorkerPriority::AboveNormal,
            "highest" => WorkerPriority::Highest,
            other => {
                warn!(
                    target: "scheduler",
                    "Unknown worker priority {:?}, using belownormal", other
                );
                WorkerPriority::BelowNormal
            }
        }
    }
}

impl From<WorkerPriority> for String {
    fn from(value: WorkerPriority) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for WorkerPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue caps, pool sizes and timing for the script scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Start the worker pools at all
    pub enabled: bool,

    /// Dispatch workers draining the event queue
    pub event_queue_threads: usize,

    /// Checkpoint workers draining the checkpoint queue
    pub state_saving_threads: usize,

    /// Loader workers draining the load/unload queue
    pub start_stop_threads: usize,

    /// Longest time an idle worker waits on its queue before re-checking
    pub poll_interval_ms: u64,

    pub max_load_unload_queue_size: usize,
    pub max_event_queue_size: usize,
    pub max_checkpoint_queue_size: usize,

    /// Core threads of the worker runtime
    pub min_worker_threads: usize,

    /// Cap on threads running script code at once
    pub max_worker_threads: usize,

    /// How long an idle script thread is kept before it exits
    pub worker_idle_timeout_sec: u64,

    pub worker_priority: WorkerPriority,

    pub worker_stack_size_kb: usize,

    /// Disable a script after a runtime fault instead of keeping it running
    pub disable_on_fault: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            event_queue_threads: 5,
            state_saving_threads: 1,
            start_stop_threads: 1,
            poll_interval_ms: 50,
            max_load_unload_queue_size: 100,
            max_event_queue_size: 300,
            max_checkpoint_queue_size: 1000,
            min_worker_threads: 2,
            max_worker_threads: 100,
            worker_idle_timeout_sec: 20,
            worker_priority: WorkerPriority::BelowNormal,
            worker_stack_size_kb: 2048,
            disable_on_fault: false,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn worker_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_idle_timeout_sec)
    }

    pub fn worker_stack_size(&self) -> usize {
        self.worker_stack_size_kb.saturating_mul(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_table_uses_defaults() {
        let config: SchedulerConfig = toml::from_str("").unwrap();
        assert!(config.enabled);
        assert_eq!(config.event_queue_threads, 5);
        assert_eq!(config.max_event_queue_size, 300);
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.worker_stack_size(), 2048 * 1024);
        assert!(!config.disable_on_fault);
    }

    #[test]
    fn test_partial_table_overrides() {
        let config: SchedulerConfig = toml::from_str(
            r#"
            event_queue_threads = 2
            max_event_queue_size = 10
            worker_priority = "Highest"
            "#,
        )
        .unwrap();

        assert_eq!(config.event_queue_threads, 2);
        assert_eq!(config.max_event_queue_size, 10);
        assert_eq!(config.worker_priority, WorkerPriority::Highest);
        assert_eq!(config.start_stop_threads, 1);
    }

    #[test]
    fn test_unknown_priority_falls_back() {
        let config: SchedulerConfig = toml::from_str(r#"worker_priority = "realtime""#).unwrap();
        assert_eq!(config.worker_priority, WorkerPriority::BelowNormal);
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let config = SchedulerConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
    }
}
