use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// Environment variable overriding the configuration directory.
pub const CONFIG_DIR_ENV: &str = "PONYCLOUD_CONFIG_DIR";

/// Where the daemons look for their configuration files
#[derive(Debug, Clone)]
pub struct Directories {
    /// Config directory (`$PONYCLOUD_CONFIG_DIR` or ~/.config/ponycloud)
    pub config: PathBuf,
}

impl Directories {
    /// Resolve the configuration directory: `$PONYCLOUD_CONFIG_DIR` if set,
    /// the XDG location otherwise. Returns `None` if neither is available.
    #[must_use]
    pub fn new() -> Option<Self> {
        if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV).filter(|v| !v.is_empty()) {
            return Some(Self::with_base(PathBuf::from(dir)));
        }

        let project = ProjectDirs::from("", "", "ponycloud")?;
        Some(Self::with_base(project.config_dir().to_path_buf()))
    }

    #[must_use]
    pub fn with_base(base: PathBuf) -> Self {
        Self { config: base }
    }

    /// Default config file of the named daemon, e.g. `sparkle.json`.
    #[must_use]
    pub fn config_file(&self, daemon: &str) -> PathBuf {
        self.config.join(format!("{daemon}.json"))
    }

    #[must_use]
    pub fn config_dir(&self) -> &Path {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_base_sets_config_dir() {
        let base = PathBuf::from("/tmp/test-ponycloud");
        let dirs = Directories::with_base(base.clone());
        assert_eq!(dirs.config_dir(), base.as_path());
    }

    #[test]
    fn test_config_file_per_daemon() {
        let dirs = Directories::with_base(PathBuf::from("/etc/ponycloud"));
        assert_eq!(
            dirs.config_file("sparkle"),
            PathBuf::from("/etc/ponycloud/sparkle.json")
        );
        assert_eq!(
            dirs.config_file("luna"),
            PathBuf::from("/etc/ponycloud/luna.json")
        );
    }

    #[test]
    fn test_new_points_at_ponycloud() {
        if std::env::var_os(CONFIG_DIR_ENV).is_none()
            && let Some(dirs) = Directories::new()
        {
            assert!(dirs.config.to_string_lossy().contains("ponycloud"));
        }
    }
}
