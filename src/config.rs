//! Persistent user preferences for vShell.
//!
//! All keys live in a single TOML document (`preferences.toml` in the config
//! directory). Unknown keys are ignored and missing keys take their defaults,
//! so an absent file is equivalent to a fresh install.
//!
//! Every setter rewrites the whole document through a uniquely named
//! temporary sibling file that is synced and renamed over the target, and the
//! directory entry is synced before the call returns.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::vm::ports::Service;

pub const PREFERENCES_FILE_NAME: &str = "preferences.toml";

static USERNAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("username pattern is a valid regex")
});

// ---------------------------------------------------------------------------
// Stored values
// ---------------------------------------------------------------------------

/// The on-disk preference values.
///
/// Ports are kept as raw integers so that out-of-range values written by hand
/// survive loading and are rejected by [`crate::vm::PortMap::resolve`] instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferenceValues {
    pub first_run: bool,
    pub show_extra_keys: bool,
    pub ignore_bell: bool,
    pub data_version: i64,
    pub default_ssh_user: String,
    pub ssh_port: i32,
    pub port_5678: i32,
    pub port_5700: i32,
    pub port_6379: i32,
    pub port_9000: i32,
}

impl Default for PreferenceValues {
    fn default() -> Self {
        Self {
            first_run: true,
            show_extra_keys: true,
            ignore_bell: false,
            data_version: 0,
            default_ssh_user: "root".to_string(),
            ssh_port: 8022,
            port_5678: 5678,
            port_5700: 5700,
            port_6379: 6379,
            port_9000: 9000,
        }
    }
}

impl PreferenceValues {
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::other(e).into())
    }

    pub fn from_toml(s: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Raw configured host port for a service.
    pub fn port(&self, service: Service) -> i32 {
        match service {
            Service::Ssh => self.ssh_port,
            Service::P5678 => self.port_5678,
            Service::P5700 => self.port_5700,
            Service::P6379 => self.port_6379,
            Service::P9000 => self.port_9000,
        }
    }

    fn port_mut(&mut self, service: Service) -> &mut i32 {
        match service {
            Service::Ssh => &mut self.ssh_port,
            Service::P5678 => &mut self.port_5678,
            Service::P5700 => &mut self.port_5700,
            Service::P6379 => &mut self.port_6379,
            Service::P9000 => &mut self.port_9000,
        }
    }
}

// ---------------------------------------------------------------------------
// Preferences store
// ---------------------------------------------------------------------------

/// File-backed preference store.
#[derive(Debug, Clone)]
pub struct Preferences {
    path: PathBuf,
    values: PreferenceValues,
}

impl Preferences {
    /// Load preferences from `path`, using defaults when the file is absent.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(text) => PreferenceValues::from_toml(&text).map_err(|source| {
                Error::PreferencesFormat {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no preferences file, using defaults");
                PreferenceValues::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, values })
    }

    /// In-memory preferences that are never written anywhere.
    ///
    /// Setters still validate but skip persistence; used by `vshell plan` when
    /// the config directory is unavailable.
    pub fn ephemeral(values: PreferenceValues) -> Self {
        Self {
            path: PathBuf::new(),
            values,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn values(&self) -> &PreferenceValues {
        &self.values
    }

    pub fn is_first_run(&self) -> bool {
        self.values.first_run
    }

    pub fn complete_first_run(&mut self) -> Result<()> {
        self.update(|v| v.first_run = false)
    }

    pub fn show_extra_keys(&self) -> bool {
        self.values.show_extra_keys
    }

    /// Flip `show_extra_keys` and return the new value.
    pub fn toggle_show_extra_keys(&mut self) -> Result<bool> {
        self.update(|v| v.show_extra_keys = !v.show_extra_keys)?;
        Ok(self.values.show_extra_keys)
    }

    pub fn ignore_bell(&self) -> bool {
        self.values.ignore_bell
    }

    pub fn set_ignore_bell(&mut self, ignore: bool) -> Result<()> {
        self.update(|v| v.ignore_bell = ignore)
    }

    pub fn data_version(&self) -> i64 {
        self.values.data_version
    }

    pub fn update_data_version(&mut self, version: i64) -> Result<()> {
        self.update(|v| v.data_version = version)
    }

    pub fn default_ssh_user(&self) -> &str {
        &self.values.default_ssh_user
    }

    /// Store a new default SSH user after checking it is a valid login name.
    pub fn set_default_ssh_user(&mut self, user: &str) -> Result<()> {
        if !is_valid_username(user) {
            return Err(Error::InvalidUsername(user.to_string()));
        }
        let user = user.to_string();
        self.update(|v| v.default_ssh_user = user)
    }

    pub fn port(&self, service: Service) -> i32 {
        self.values.port(service)
    }

    /// Store a raw port value. Range and collision checks happen at launch.
    pub fn set_port(&mut self, service: Service, port: i32) -> Result<()> {
        self.update(|v| *v.port_mut(service) = port)
    }

    fn update(&mut self, apply: impl FnOnce(&mut PreferenceValues)) -> Result<()> {
        let mut next = self.values.clone();
        apply(&mut next);
        if !self.path.as_os_str().is_empty() {
            write_durable(&self.path, &next)?;
        }
        self.values = next;
        Ok(())
    }
}

fn write_durable(path: &Path, values: &PreferenceValues) -> Result<()> {
    let text = values.to_toml()?;

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".preferences")
        .suffix(".tmp")
        .tempfile_in(parent)?;
    tmp.write_all(text.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    // Commit the rename itself.
    #[cfg(unix)]
    fs::File::open(parent)?.sync_all()?;

    info!(path = %path.display(), "preferences saved");
    Ok(())
}

/// `[a-z_][a-z0-9_-]{0,31}`
pub fn is_valid_username(name: &str) -> bool {
    USERNAME_PATTERN.is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefs_in(dir: &tempfile::TempDir) -> Preferences {
        Preferences::open(dir.path().join(PREFERENCES_FILE_NAME)).unwrap()
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = prefs_in(&dir);
        assert_eq!(prefs.values(), &PreferenceValues::default());
        assert!(prefs.is_first_run());
        assert!(prefs.show_extra_keys());
        assert!(!prefs.ignore_bell());
        assert_eq!(prefs.default_ssh_user(), "root");
        assert_eq!(prefs.port(Service::Ssh), 8022);
        assert_eq!(prefs.port(Service::P9000), 9000);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PREFERENCES_FILE_NAME);
        fs::write(&path, "ssh_port = 2222\nignore_bell = true\n").unwrap();

        let prefs = Preferences::open(&path).unwrap();
        assert_eq!(prefs.port(Service::Ssh), 2222);
        assert!(prefs.ignore_bell());
        assert_eq!(prefs.port(Service::P5678), 5678);
        assert_eq!(prefs.data_version(), 0);
    }

    #[test]
    fn malformed_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PREFERENCES_FILE_NAME);
        fs::write(&path, "ssh_port = \"not a number\"").unwrap();

        let err = Preferences::open(&path).unwrap_err();
        assert!(matches!(err, Error::PreferencesFormat { .. }));
    }

    #[test]
    fn rejects_uppercase_username() {
        let dir = tempfile::tempdir().unwrap();
        let mut prefs = prefs_in(&dir);
        let err = prefs.set_default_ssh_user("Root").unwrap_err();
        assert!(matches!(err, Error::InvalidUsername(ref u) if u == "Root"));
        assert_eq!(prefs.default_ssh_user(), "root");
    }

    #[test]
    fn valid_username_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut prefs = prefs_in(&dir);
        prefs.set_default_ssh_user("dev_1").unwrap();
        drop(prefs);

        let reopened = prefs_in(&dir);
        assert_eq!(reopened.default_ssh_user(), "dev_1");
    }

    #[test]
    fn username_pattern_edges() {
        assert!(is_valid_username("_"));
        assert!(is_valid_username("a-b_c9"));
        assert!(is_valid_username(&"a".repeat(32)));
        assert!(!is_valid_username(&"a".repeat(33)));
        assert!(!is_valid_username(""));
        assert!(!is_valid_username("9lives"));
        assert!(!is_valid_username("-dash"));
        assert!(!is_valid_username("dev user"));
        assert!(!is_valid_username("dév"));
        assert!(!is_valid_username("dev\n"));
        assert!(!is_valid_username("root;ls"));
    }

    #[test]
    fn separate_handles_on_one_file_do_not_clobber_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut config_cmd = prefs_in(&dir);
        let mut runner = prefs_in(&dir);

        config_cmd.set_port(Service::Ssh, 2222).unwrap();
        runner.complete_first_run().unwrap();
        config_cmd.set_ignore_bell(true).unwrap();

        let reopened = prefs_in(&dir);
        assert!(reopened.ignore_bell());
        assert_eq!(reopened.port(Service::Ssh), 2222);

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![PREFERENCES_FILE_NAME.to_string()]);
    }

    #[test]
    fn missing_parent_directories_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b").join(PREFERENCES_FILE_NAME);
        let mut prefs = Preferences::open(&nested).unwrap();
        prefs.update_data_version(3).unwrap();
        assert_eq!(Preferences::open(&nested).unwrap().data_version(), 3);
    }

    #[test]
    fn shown_document_reloads_to_the_same_values() {
        let values = PreferenceValues {
            default_ssh_user: "dev".into(),
            ssh_port: 70000,
            ..PreferenceValues::default()
        };
        let text = values.to_toml().unwrap();
        assert!(text.contains("default_ssh_user = \"dev\""));
        assert_eq!(PreferenceValues::from_toml(&text).unwrap(), values);
    }

    #[test]
    fn toggles_and_counters_persist() {
        let dir = tempfile::tempdir().unwrap();
        let mut prefs = prefs_in(&dir);
        assert!(!prefs.toggle_show_extra_keys().unwrap());
        prefs.complete_first_run().unwrap();
        prefs.update_data_version(7).unwrap();
        prefs.set_ignore_bell(true).unwrap();
        prefs.set_port(Service::P6379, 16379).unwrap();

        let reopened = prefs_in(&dir);
        assert!(!reopened.show_extra_keys());
        assert!(!reopened.is_first_run());
        assert_eq!(reopened.data_version(), 7);
        assert!(reopened.ignore_bell());
        assert_eq!(reopened.port(Service::P6379), 16379);
    }

    #[test]
    fn out_of_range_port_is_stored_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let mut prefs = prefs_in(&dir);
        prefs.set_port(Service::Ssh, 70000).unwrap();
        assert_eq!(prefs_in(&dir).port(Service::Ssh), 70000);
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mut prefs = prefs_in(&dir);
        prefs.set_ignore_bell(true).unwrap();
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![PREFERENCES_FILE_NAME.to_string()]);
    }

    #[test]
    fn ephemeral_preferences_do_not_touch_disk() {
        let mut prefs = Preferences::ephemeral(PreferenceValues::default());
        prefs.set_port(Service::Ssh, 2200).unwrap();
        assert_eq!(prefs.port(Service::Ssh), 2200);
        assert!(prefs.path().as_os_str().is_empty());
    }
}
