//! Configuration loading and parsing.
//!
//! `weft.toml` lives in the app directory (or wherever `--config` points).
//! Unknown fields are ignored so the format can grow without breaking older
//! files, and a parse failure falls back to defaults with a logged warning
//! rather than refusing to start.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use tracing::warn;

pub const CONFIG_FILE: &str = "weft.toml";

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "AppConfig::default_scripts_dir")]
    pub scripts_dir: String,
    #[serde(default = "AppConfig::default_views_dir")]
    pub views_dir: String,
    #[serde(default = "AppConfig::default_main")]
    pub main: String,
}

impl AppConfig {
    fn default_scripts_dir() -> String {
        "scripts".into()
    }
    fn default_views_dir() -> String {
        "views".into()
    }
    fn default_main() -> String {
        "main.wft".into()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scripts_dir: Self::default_scripts_dir(),
            views_dir: Self::default_views_dir(),
            main: Self::default_main(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    #[serde(default = "WatchConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "WatchConfig::default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "WatchConfig::default_tick_ms")]
    pub tick_ms: u64,
}

impl WatchConfig {
    const fn default_enabled() -> bool {
        true
    }
    const fn default_debounce_ms() -> u64 {
        100
    }
    const fn default_tick_ms() -> u64 {
        50
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            debounce_ms: Self::default_debounce_ms(),
            tick_ms: Self::default_tick_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "SessionConfig::default_queue_depth")]
    pub queue_depth: usize,
}

impl SessionConfig {
    const fn default_queue_depth() -> usize {
        256
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_depth: Self::default_queue_depth(),
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

impl Config {
    pub fn scripts_dir(&self, app_dir: &Path) -> PathBuf {
        app_dir.join(&self.app.scripts_dir)
    }

    pub fn views_dir(&self, app_dir: &Path) -> PathBuf {
        app_dir.join(&self.app.views_dir)
    }

    pub fn main_path(&self, app_dir: &Path) -> PathBuf {
        self.scripts_dir(app_dir).join(&self.app.main)
    }
}

/// Load from the override path or `<app_dir>/weft.toml`; defaults apply when
/// the file is absent or unparseable.
pub fn load_from(app_dir: &Path, over: Option<PathBuf>) -> Result<Config> {
    let path = over.unwrap_or_else(|| app_dir.join(CONFIG_FILE));
    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str::<Config>(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                warn!(target: "config", file = %path.display(), %err, "config_parse_failed");
                Ok(Config::default())
            }
        },
        Err(_) => Ok(Config::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_from(dir.path(), None).unwrap();
        assert_eq!(cfg.app.main, "main.wft");
        assert!(cfg.watch.enabled);
        assert_eq!(cfg.session.queue_depth, 256);
    }

    #[test]
    fn parses_overrides_and_ignores_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[app]\nmain = \"boot.wft\"\n[watch]\ndebounce_ms = 250\nfuture_field = 1\n",
        )
        .unwrap();
        let cfg = load_from(dir.path(), None).unwrap();
        assert_eq!(cfg.app.main, "boot.wft");
        assert_eq!(cfg.watch.debounce_ms, 250);
        assert_eq!(cfg.app.scripts_dir, "scripts");
    }

    #[test]
    fn parse_error_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "not [valid toml").unwrap();
        let cfg = load_from(dir.path(), None).unwrap();
        assert_eq!(cfg.app.main, "main.wft");
    }

    #[test]
    fn paths_resolve_relative_to_app_dir() {
        let cfg = Config::default();
        let base = Path::new("/srv/app");
        assert_eq!(cfg.scripts_dir(base), Path::new("/srv/app/scripts"));
        assert_eq!(cfg.main_path(base), Path::new("/srv/app/scripts/main.wft"));
    }
}
