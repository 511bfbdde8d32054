//! Maps script files onto scheduler instances

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use uuid::Uuid;
use vellum_engine::{ItemId, ObjectId, Scheduler, SchedulerError, StartOptions, StateSource};

use crate::scanner::ScanResult;

/// All scripts in one directory, attached to a single object
pub struct ScriptDirectory {
    object: ObjectId,
}

impl ScriptDirectory {
    pub fn new(object: ObjectId) -> Self {
        Self { object }
    }

    pub fn object(&self) -> ObjectId {
        self.object
    }

    /// Item id of a script file, the same on every run so checkpoints
    /// written at shutdown are found again on the next start
    pub fn item_for(&self, path: &Path) -> ItemId {
        let name = format!("{}:{}", self.object, path.display());
        ItemId::from(Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()))
    }

    /// Submit the loads, reuploads and unloads for one scan. Returns the
    /// items whose compile outcome should be awaited.
    pub fn apply(&self, scheduler: &Scheduler, scan: &ScanResult) -> Vec<(PathBuf, ItemId)> {
        let mut submitted = Vec::new();

        for path in &scan.added {
            if let Some(item) = self.load(scheduler, path) {
                submitted.push((path.clone(), item));
            }
        }
        for path in &scan.changed {
            if let Some(item) = self.reupload(scheduler, path) {
                submitted.push((path.clone(), item));
            }
        }
        for path in &scan.removed {
            let item = self.item_for(path);
            if scheduler.submit_unload(item) {
                info!(target: "scripts", "Unloading {}", path.display());
            }
        }

        submitted
    }

    /// Reupload every given script from disk
    pub fn reload_all<'a>(
        &self,
        scheduler: &Scheduler,
        paths: impl IntoIterator<Item = &'a PathBuf>,
    ) -> Vec<(PathBuf, ItemId)> {
        let scan = ScanResult {
            changed: paths.into_iter().cloned().collect(),
            ..ScanResult::default()
        };
        self.apply(scheduler, &scan)
    }

    fn load(&self, scheduler: &Scheduler, path: &Path) -> Option<ItemId> {
        let source = read_source(path)?;
        let item = self.item_for(path);
        let options = StartOptions::new().with_state_source(StateSource::RegionStart);

        match scheduler.try_submit_load(self.object, item, source, options) {
            Ok(()) => {
                info!(target: "scripts", "Loading {} as {}", path.display(), item);
                Some(item)
            }
            Err(err) => {
                warn!(target: "scripts", "Could not load {}: {}", path.display(), err);
                None
            }
        }
    }

    fn reupload(&self, scheduler: &Scheduler, path: &Path) -> Option<ItemId> {
        let source = read_source(path)?;
        let item = self.item_for(path);

        match scheduler.try_submit_reupload(item, source) {
            Ok(()) => {
                info!(target: "scripts", "Reuploading {}", path.display());
                Some(item)
            }
            // Never compiled successfully, so there is nothing to swap into
            Err(SchedulerError::UnknownScript(_)) => self.load(scheduler, path),
            Err(err) => {
                warn!(target: "scripts", "Could not reupload {}: {}", path.display(), err);
                None
            }
        }
    }
}

fn read_source(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(source) => Some(source),
        Err(err) => {
            warn!(target: "scripts", "Failed to read {}: {}", path.display(), err);
            None
        }
    }
}
