//! Checkpoint storage backends.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use tracing::debug;

use crate::host::StatePersistence;
use crate::sync::lock;
use crate::types::ItemId;

/// Keeps checkpoints in process memory; the default for a scheduler
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    blobs: Mutex<HashMap<ItemId, Vec<u8>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.blobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StatePersistence for MemoryStateStore {
    fn save_state(&self, item: ItemId, blob: &[u8]) -> anyhow::Result<()> {
        lock(&self.blobs).insert(item, blob.to_vec());
        Ok(())
    }

    fn delete_state(&self, item: ItemId) -> anyhow::Result<()> {
        lock(&self.blobs).remove(&item);
        Ok(())
    }

    fn load_state(&self, item: ItemId) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(lock(&self.blobs).get(&item).cloned())
    }
}

/// One `<item>.state` file per script in a directory
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    /// Use `dir`, creating it if needed
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating state directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, item: ItemId) -> PathBuf {
        self.dir.join(format!("{}.state", item))
    }
}

impl StatePersistence for FileStateStore {
    fn save_state(&self, item: ItemId, blob: &[u8]) -> anyhow::Result<()> {
        let path = self.path_for(item);
        // Write beside the target and rename so readers never see half a file
        let partial = path.with_extension("state.tmp");
        fs::write(&partial, blob).with_context(|| format!("writing {}", partial.display()))?;
        fs::rename(&partial, &path).with_context(|| format!("replacing {}", path.display()))?;
        debug!(target: "store", "Wrote {} bytes to {}", blob.len(), path.display());
        Ok(())
    }

    fn delete_state(&self, item: ItemId) -> anyhow::Result<()> {
        let path = self.path_for(item);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
        }
    }

    fn load_state(&self, item: ItemId) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.path_for(item);
        match fs::read(&path) {
            Ok(blob) => Ok(Some(blob)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }
}
