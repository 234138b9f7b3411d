//! Deterministic mapping from `(cache root, namespace, session id)` to
//! the files that back a session, plus per-cwd lock paths and
//! per-worker heartbeat paths.
//!
//! One directory per session holding a fixed set of file names is the
//! whole scheme; every other module addresses a session's files
//! through this type rather than building paths by hand.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// `<cache>/namespaces/<ns>/...`.
#[derive(Debug, Clone)]
pub struct PathLayout {
    namespace_root: PathBuf,
}

impl PathLayout {
    pub fn new(cache_root: impl AsRef<Path>, namespace: &str) -> Self {
        Self {
            namespace_root: cache_root.as_ref().join("namespaces").join(namespace),
        }
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.namespace_root.join("sessions")
    }

    pub fn workers_dir(&self) -> PathBuf {
        self.namespace_root.join("workers")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.namespace_root.join("locks")
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(session_id)
    }

    pub fn request_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("request.json")
    }

    pub fn status_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("status.json")
    }

    pub fn claim_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("worker.claim")
    }

    pub fn stream_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("stream.jsonl")
    }

    pub fn stdin_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("stdin.jsonl")
    }

    pub fn control_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("control.jsonl")
    }

    pub fn heartbeat_path(&self, host: &str, pid: u32) -> PathBuf {
        self.workers_dir().join(format!("{host}-{pid}.json"))
    }

    /// `locks/<sha256(abs_cwd)>.lock`.
    pub fn cwd_lock_path(&self, abs_cwd: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(abs_cwd.as_bytes());
        let digest = hasher.finalize();
        self.locks_dir().join(format!("{digest:x}.lock"))
    }

    /// Ensures every directory this layout can address exists.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.sessions_dir())?;
        std::fs::create_dir_all(self.workers_dir())?;
        std::fs::create_dir_all(self.locks_dir())?;
        Ok(())
    }

    /// Ensures the parent directory of a freshly created session exists.
    pub fn ensure_session_dir(&self, session_id: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(self.session_dir(session_id))
    }
}

/// Resolves the namespace: the configured user, then the OS user, then
/// `"default"`.
pub fn resolve_namespace(configured: Option<&str>) -> String {
    if let Some(ns) = configured {
        if !ns.is_empty() {
            return ns.to_string();
        }
    }
    for var in ["USER", "LOGNAME"] {
        if let Ok(v) = std::env::var(var) {
            if !v.is_empty() {
                return v;
            }
        }
    }
    "default".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_deterministic() {
        let layout = PathLayout::new("/cache", "alice");
        assert_eq!(
            layout.request_path("abc123"),
            PathBuf::from("/cache/namespaces/alice/sessions/abc123/request.json")
        );
        assert_eq!(
            layout.heartbeat_path("host1", 42),
            PathBuf::from("/cache/namespaces/alice/workers/host1-42.json")
        );
    }

    #[test]
    fn cwd_lock_path_is_stable_hash() {
        let layout = PathLayout::new("/cache", "alice");
        let a = layout.cwd_lock_path("/home/alice/project");
        let b = layout.cwd_lock_path("/home/alice/project");
        let c = layout.cwd_lock_path("/home/alice/other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.to_string_lossy().ends_with(".lock"));
    }

    #[test]
    fn resolve_namespace_prefers_configured() {
        assert_eq!(resolve_namespace(Some("explicit")), "explicit");
    }

    #[test]
    fn resolve_namespace_falls_back_to_default() {
        // Clearing USER/LOGNAME isn't safe in a parallel test binary, so
        // only assert the non-empty-configured path and the empty-string
        // fallthrough behavior.
        assert_ne!(resolve_namespace(Some("")), "");
    }
}
