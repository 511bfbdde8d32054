//! Change detection for the script directory

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, warn};

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(1000);

/// Extension of script source files
pub const SCRIPT_EXTENSION: &str = "wat";

#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub changed: Vec<PathBuf>,
    pub added: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

impl ScanResult {
    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty() || !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// Compares modification times of `.wat` files between scans
pub struct ScriptScanner {
    script_dir: PathBuf,
    scan_interval: Duration,
    last_scan: Option<Instant>,
    known: HashMap<PathBuf, SystemTime>,
}

impl ScriptScanner {
    /// The first scan reports every script already present as added
    pub fn new(script_dir: PathBuf) -> Self {
        Self::with_interval(script_dir, DEFAULT_SCAN_INTERVAL)
    }

    pub fn with_interval(script_dir: PathBuf, scan_interval: Duration) -> Self {
        Self {
            script_dir,
            scan_interval,
            last_scan: None,
            known: HashMap::new(),
        }
    }

    pub fn script_dir(&self) -> &Path {
        &self.script_dir
    }

    pub fn should_scan(&self) -> bool {
        self.last_scan
            .is_none_or(|last| last.elapsed() >= self.scan_interval)
    }

    /// Scripts seen by the last scan
    pub fn known_scripts(&self) -> impl Iterator<Item = &PathBuf> {
        self.known.keys()
    }

    pub fn scan_changes(&mut self) -> ScanResult {
        self.last_scan = Some(Instant::now());
        debug!(target: "scanner", "Scanning {}", self.script_dir.display());

        let current = scripts_in_dir(&self.script_dir);
        let mut result = ScanResult::default();

        for (path, modified) in &current {
            match self.known.get(path) {
                Some(previous) if previous != modified => {
                    debug!(target: "scanner", "Script changed: {}", path.display());
                    result.changed.push(path.clone());
                }
                Some(_) => {}
                None => {
                    debug!(target: "scanner", "Script added: {}", path.display());
                    result.added.push(path.clone());
                }
            }
        }
        for path in self.known.keys() {
            if !current.contains_key(path) {
                debug!(target: "scanner", "Script removed: {}", path.display());
                result.removed.push(path.clone());
            }
        }

        // Stable order so loads happen alphabetically
        result.added.sort();
        result.changed.sort();
        result.removed.sort();

        self.known = current;
        result
    }
}

fn scripts_in_dir(script_dir: &Path) -> HashMap<PathBuf, SystemTime> {
    let mut scripts = HashMap::new();

    let entries = match std::fs::read_dir(script_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(target: "scanner", "Script directory does not exist: {}", script_dir.display());
            return scripts;
        }
        Err(e) => {
            warn!(target: "scanner", "Failed to read script directory {}: {}", script_dir.display(), e);
            return scripts;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some(SCRIPT_EXTENSION) {
            continue;
        }

        match entry.metadata().and_then(|metadata| metadata.modified()) {
            Ok(modified) => {
                scripts.insert(path, modified);
            }
            Err(e) => {
                warn!(target: "scanner", "Failed to read modification time of {}: {}", path.display(), e);
            }
        }
    }

    scripts
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_existing_scripts_are_added_on_first_scan() {
        let temp_dir = TempDir::new().unwrap();
        File::create(temp_dir.path().join("b.wat")).unwrap();
        File::create(temp_dir.path().join("a.wat")).unwrap();

        let mut scanner = ScriptScanner::new(temp_dir.path().to_path_buf());
        let result = scanner.scan_changes();

        assert_eq!(
            result.added,
            vec![temp_dir.path().join("a.wat"), temp_dir.path().join("b.wat")]
        );
        assert!(!scanner.scan_changes().has_changes());
    }

    #[test]
    fn test_should_scan_timing() {
        let temp_dir = TempDir::new().unwrap();
        let mut scanner =
            ScriptScanner::with_interval(temp_dir.path().to_path_buf(), Duration::from_millis(50));

        assert!(scanner.should_scan());
        scanner.scan_changes();
        assert!(!scanner.should_scan());

        std::thread::sleep(Duration::from_millis(60));
        assert!(scanner.should_scan());
    }

    #[test]
    fn test_detect_modified_script() {
        let temp_dir = TempDir::new().unwrap();
        let script_path = temp_dir.path().join("door.wat");
        fs::write(&script_path, "(module)").unwrap();

        let mut scanner = ScriptScanner::new(temp_dir.path().to_path_buf());
        scanner.scan_changes();

        let mut file = File::options().write(true).open(&script_path).unwrap();
        file.write_all(b"(module )").unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5)).unwrap();

        let result = scanner.scan_changes();
        assert_eq!(result.changed, vec![script_path]);
        assert!(result.added.is_empty());
        assert!(result.removed.is_empty());
    }

    #[test]
    fn test_detect_removed_script() {
        let temp_dir = TempDir::new().unwrap();
        let script_path = temp_dir.path().join("door.wat");
        File::create(&script_path).unwrap();

        let mut scanner = ScriptScanner::new(temp_dir.path().to_path_buf());
        scanner.scan_changes();
        fs::remove_file(&script_path).unwrap();

        let result = scanner.scan_changes();
        assert_eq!(result.removed, vec![script_path]);
        assert_eq!(scanner.known_scripts().count(), 0);
    }

    #[test]
    fn test_ignores_other_files() {
        let temp_dir = TempDir::new().unwrap();
        File::create(temp_dir.path().join("notes.txt")).unwrap();
        File::create(temp_dir.path().join("door.wasm")).unwrap();

        let mut scanner = ScriptScanner::new(temp_dir.path().to_path_buf());
        assert!(!scanner.scan_changes().has_changes());
    }

    #[test]
    fn test_handles_missing_directory() {
        let temp_dir = TempDir::new().unwrap();
        let mut scanner = ScriptScanner::new(temp_dir.path().join("missing"));
        assert!(!scanner.scan_changes().has_changes());
    }
}
