use std::path::PathBuf;

/// Where vellum keeps its files, following XDG on Unix-like systems and
/// `%APPDATA%` on Windows.
///
/// - config: `$XDG_CONFIG_HOME/{name}` (default `~/.config/{name}`)
/// - data: `$XDG_DATA_HOME/{name}` (default `~/.local/share/{name}`)
///
/// Scripts, checkpoints and logs all live under the data directory.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    name: String,
}

enum BaseDir {
    Config,
    Data,
}

impl ProjectPaths {
    /// Returns None when no home directory can be determined
    pub fn new(name: &str) -> Option<Self> {
        home_dir()?;
        Some(ProjectPaths {
            name: name.to_string(),
        })
    }

    pub fn config_dir(&self) -> PathBuf {
        self.resolve(BaseDir::Config)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.resolve(BaseDir::Data)
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.data_dir().join("scripts")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_dir().join("state")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }

    #[cfg(target_os = "windows")]
    fn resolve(&self, _base: BaseDir) -> PathBuf {
        std::env::var("APPDATA")
            .ok()
            .map(|appdata| PathBuf::from(appdata).join(&self.name))
            .unwrap_or_else(|| PathBuf::from(format!(".{}", self.name)))
    }

    #[cfg(not(target_os = "windows"))]
    fn resolve(&self, base: BaseDir) -> PathBuf {
        let (var, fallback): (&str, &[&str]) = match base {
            BaseDir::Config => ("XDG_CONFIG_HOME", &[".config"]),
            BaseDir::Data => ("XDG_DATA_HOME", &[".local", "share"]),
        };

        std::env::var(var)
            .ok()
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .or_else(|| home_dir().map(|home| fallback.iter().fold(home, |dir, part| dir.join(part))))
            .unwrap_or_else(|| fallback.iter().collect())
            .join(&self.name)
    }
}

/// Home directory from HOME, then USERPROFILE
fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .or_else(|| std::env::var("USERPROFILE").ok())
        .map(PathBuf::from)
}
