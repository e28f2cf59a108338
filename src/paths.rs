//! Application directory structure for vShell.
//!
//! - Config:    `~/.config/vshell/`  (preferences.toml)
//! - Data:      `~/Library/Application Support/app.vshell/` on macOS, XDG data
//!   elsewhere. This is the VM install root: QEMU firmware, disk images,
//!   `HOME` and working directory of the VM process.
//! - Cache:     exported to the VM as `TMPDIR`
//! - Logs:      `~/Library/Logs/vshell/` on macOS, under XDG data elsewhere

use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::PREFERENCES_FILE_NAME;

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
const BUNDLE_ID: &str = "app.vshell";
const APP_NAME: &str = "vshell";

/// All resolved application directory paths.
#[derive(Debug, Clone)]
pub struct VShellPaths {
    pub config: PathBuf,
    /// VM install root.
    pub data: PathBuf,
    pub cache: PathBuf,
    pub logs: PathBuf,
}

impl VShellPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories; call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;
        Some(Self {
            config: resolve_config_dir(&home),
            data: resolve_data_dir(&home),
            cache: resolve_cache_dir(&home),
            logs: resolve_log_dir(&home),
        })
    }

    /// Create all directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.data, &self.cache, &self.logs] {
            std::fs::create_dir_all(dir)?;
            info!("ensured directory: {}", dir.display());
        }
        Ok(())
    }

    pub fn preferences_file(&self) -> PathBuf {
        self.config.join(PREFERENCES_FILE_NAME)
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_data_dir(home: &Path) -> PathBuf {
    home.join("Library")
        .join("Application Support")
        .join(BUNDLE_ID)
}

#[cfg(not(target_os = "macos"))]
fn resolve_data_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".local").join("share").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_cache_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Caches").join(BUNDLE_ID)
}

#[cfg(not(target_os = "macos"))]
fn resolve_cache_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".cache").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    resolve_data_dir(home).join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    impl VShellPaths {
        fn rooted(root: &Path) -> Self {
            Self {
                config: root.join("config"),
                data: root.join("data"),
                cache: root.join("cache"),
                logs: root.join("logs"),
            }
        }
    }

    #[test]
    fn resolve_produces_valid_paths() {
        let paths = VShellPaths::resolve().expect("HOME should be set in tests");
        assert!(paths.config.to_string_lossy().contains("vshell"));
        assert!(paths.data.to_string_lossy().contains("vshell"));
        assert!(paths.preferences_file().ends_with("vshell/preferences.toml"));
    }

    #[test]
    fn ensure_creates_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = VShellPaths::rooted(tmp.path());

        paths.ensure().expect("ensure should succeed");

        assert!(paths.config.is_dir());
        assert!(paths.data.is_dir());
        assert!(paths.cache.is_dir());
        assert!(paths.logs.is_dir());
    }
}
