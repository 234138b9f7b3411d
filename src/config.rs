//! Layered configuration resolver: defaults, then the TOML config file,
//! then `PIGEON_*` environment variables. CLI flags are the caller's
//! responsibility to apply on top.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default)]
    pub max_jobs: Option<usize>,
    #[serde(default)]
    pub poll_interval: Option<f64>,
    #[serde(default)]
    pub debug: Option<bool>,
    #[serde(default)]
    pub accept_untagged: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub cache: Option<String>,
    pub namespace: Option<String>,
    pub route: Option<String>,
    #[serde(default)]
    pub worker: WorkerSettingsOpt,
    #[serde(default)]
    pub remote_env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkerSettingsOpt {
    pub max_jobs: Option<usize>,
    pub poll_interval: Option<f64>,
    pub debug: Option<bool>,
    pub accept_untagged: Option<bool>,
}

/// Resolved, defaulted configuration the rest of the crate consumes.
#[derive(Debug, Clone)]
pub struct Config {
    pub cache_root: PathBuf,
    pub namespace: Option<String>,
    pub route: Option<String>,
    pub worker_max_jobs: usize,
    pub worker_poll_interval: f64,
    pub worker_debug: bool,
    pub worker_accept_untagged: bool,
    pub remote_env: HashMap<String, String>,
    pub append_fsync: bool,
    pub source_bashrc: bool,
    path: Option<PathBuf>,
}

impl Config {
    /// Resolves config-file path: `$PIGEON_CONFIG`, else
    /// `~/.config/pigeon/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(p) = std::env::var("PIGEON_CONFIG") {
            return Some(PathBuf::from(p));
        }
        dirs_home().map(|home| home.join(".config/pigeon/config.toml"))
    }

    /// Loads defaults, overlays the config file (if any), then overlays
    /// `PIGEON_*` env vars.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        let file_settings = match &path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p.display()))?;
                toml::from_str::<Settings>(&raw)
                    .with_context(|| format!("parsing config file {}", p.display()))?
            }
            _ => Settings::default(),
        };

        let mut cfg = Self {
            cache_root: default_cache_root(),
            namespace: None,
            route: None,
            worker_max_jobs: 4,
            worker_poll_interval: 1.0,
            worker_debug: false,
            worker_accept_untagged: false,
            remote_env: HashMap::new(),
            append_fsync: false,
            source_bashrc: false,
            path,
        };

        if let Some(cache) = file_settings.cache {
            cfg.cache_root = PathBuf::from(cache);
        }
        cfg.namespace = file_settings.namespace;
        cfg.route = file_settings.route;
        if let Some(n) = file_settings.worker.max_jobs {
            cfg.worker_max_jobs = n;
        }
        if let Some(p) = file_settings.worker.poll_interval {
            cfg.worker_poll_interval = p;
        }
        if let Some(d) = file_settings.worker.debug {
            cfg.worker_debug = d;
        }
        if let Some(a) = file_settings.worker.accept_untagged {
            cfg.worker_accept_untagged = a;
        }
        cfg.remote_env = file_settings.remote_env;

        cfg.apply_env();
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("PIGEON_CACHE") {
            self.cache_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PIGEON_NAMESPACE") {
            self.namespace = Some(v);
        } else if let Ok(v) = std::env::var("PIGEON_USER") {
            self.namespace = Some(v);
        }
        if let Ok(v) = std::env::var("PIGEON_ROUTE") {
            self.route = Some(v);
        }
        if let Ok(v) = std::env::var("PIGEON_WORKER_ROUTE") {
            self.route = Some(v);
        }
        if let Ok(v) = std::env::var("PIGEON_APPEND_FSYNC") {
            self.append_fsync = v.eq_ignore_ascii_case("always");
        }
        if std::env::var("PIGEON_SOURCE_BASHRC").is_ok() {
            self.source_bashrc = true;
        }
        if std::env::var("PIGEON_DEBUG").is_ok() {
            self.worker_debug = true;
        }
    }

    /// Cooperative reload: re-reads the file+env layer for the fields
    /// the worker is allowed to hot-reload. `pinned` lists keys fixed by
    /// a CLI flag, which this call must not touch.
    pub fn reload(&mut self, pinned: &std::collections::HashSet<&'static str>) -> Result<()> {
        let fresh = Self::load()?;
        if !pinned.contains("route") {
            self.route = fresh.route;
        }
        if !pinned.contains("poll_interval") {
            self.worker_poll_interval = fresh.worker_poll_interval;
        }
        if !pinned.contains("debug") {
            self.worker_debug = fresh.worker_debug;
        }
        if !pinned.contains("accept_untagged") {
            self.worker_accept_untagged = fresh.worker_accept_untagged;
        }
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// `pigeon config get <key>`.
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "cache" => Some(self.cache_root.display().to_string()),
            "namespace" => self.namespace.clone(),
            "route" => self.route.clone(),
            "worker.max_jobs" => Some(self.worker_max_jobs.to_string()),
            "worker.poll_interval" => Some(self.worker_poll_interval.to_string()),
            "worker.debug" => Some(self.worker_debug.to_string()),
            _ => None,
        }
    }

    /// `pigeon config set <key> <value>`: writes through to the config
    /// file, creating it if absent.
    pub fn set(key: &str, value: &str) -> Result<()> {
        let path = Self::default_path().context("no config path resolvable")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut settings: Settings = if path.exists() {
            toml::from_str(&std::fs::read_to_string(&path)?)?
        } else {
            Settings::default()
        };

        match key {
            "cache" => settings.cache = Some(value.to_string()),
            "namespace" => settings.namespace = Some(value.to_string()),
            "route" => settings.route = Some(value.to_string()),
            "worker.max_jobs" => settings.worker.max_jobs = Some(value.parse()?),
            "worker.poll_interval" => settings.worker.poll_interval = Some(value.parse()?),
            "worker.debug" => settings.worker.debug = Some(value.parse()?),
            "worker.accept_untagged" => settings.worker.accept_untagged = Some(value.parse()?),
            other => anyhow::bail!("unknown config key: {other}"),
        }

        let rendered = toml::to_string_pretty(&settings)?;
        std::fs::write(&path, rendered)?;
        Ok(())
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn default_cache_root() -> PathBuf {
    dirs_home()
        .map(|h| h.join(".cache/pigeon"))
        .unwrap_or_else(|| PathBuf::from("/tmp/pigeon"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        std::env::remove_var("PIGEON_CACHE");
        std::env::remove_var("PIGEON_NAMESPACE");
        let cfg = Config::load().unwrap();
        assert_eq!(cfg.worker_max_jobs, 4);
        assert!((cfg.worker_poll_interval - 1.0).abs() < f64::EPSILON);
        assert!(!cfg.worker_debug);
    }

    #[test]
    fn env_overrides_cache_and_namespace() {
        std::env::set_var("PIGEON_CACHE", "/tmp/custom-cache");
        std::env::set_var("PIGEON_NAMESPACE", "ci-user");
        let cfg = Config::load().unwrap();
        assert_eq!(cfg.cache_root, PathBuf::from("/tmp/custom-cache"));
        assert_eq!(cfg.namespace.as_deref(), Some("ci-user"));
        std::env::remove_var("PIGEON_CACHE");
        std::env::remove_var("PIGEON_NAMESPACE");
    }

    #[test]
    fn append_fsync_env_parses_always_vs_never() {
        std::env::set_var("PIGEON_APPEND_FSYNC", "always");
        let cfg = Config::load().unwrap();
        assert!(cfg.append_fsync);
        std::env::set_var("PIGEON_APPEND_FSYNC", "never");
        let cfg = Config::load().unwrap();
        assert!(!cfg.append_fsync);
        std::env::remove_var("PIGEON_APPEND_FSYNC");
    }

    #[test]
    fn reload_skips_pinned_keys() {
        std::env::set_var("PIGEON_ROUTE", "from-env");
        let mut cfg = Config::load().unwrap();
        cfg.route = Some("pinned-value".to_string());
        let mut pinned = std::collections::HashSet::new();
        pinned.insert("route");
        cfg.reload(&pinned).unwrap();
        assert_eq!(cfg.route.as_deref(), Some("pinned-value"));
        std::env::remove_var("PIGEON_ROUTE");
    }
}
