pub mod paths;
pub mod scheduler_config;
pub mod vellum_config;

pub use paths::ProjectPaths;
pub use scheduler_config::{SchedulerConfig, WorkerPriority};
pub use vellum_config::{ConfigLoadError, LoggingConfig, SandboxConfig, VellumConfig};
