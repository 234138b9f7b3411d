//! The on-disk session state machine: session-id generation, atomic
//! writes of `request.json`/`status.json`, and exclusive-create claim
//! arbitration.
//!
//! Every write goes through `tempfile::NamedTempFile::new_in` next to
//! the destination, then `persist` (rename), so a reader never
//! observes a partially written `request.json` or `status.json`.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::layout::PathLayout;
use crate::protocol::{Claim, Request, Status};
use crate::utils::epoch_now;

/// `CREATED -> QUEUED` happens the instant `request.json` exists; this
/// just generates the id: a millisecond timestamp prefix followed by a
/// random token, unique within a namespace.
pub fn new_session_id() -> String {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let token = Uuid::new_v4().simple().to_string();
    format!("{millis}-{}", &token[..10])
}

/// Writes `request.json` atomically. Fails if a session with this id
/// already exists, so a colliding id forces the caller to generate a
/// new one rather than silently reuse someone else's session.
pub fn create_request(layout: &PathLayout, request: &Request) -> Result<()> {
    layout.ensure_session_dir(&request.session_id)?;
    let path = layout.request_path(&request.session_id);
    if path.exists() {
        anyhow::bail!("session {} already exists", request.session_id);
    }
    atomic_write_json(&path, request)
}

pub fn read_request(layout: &PathLayout, session_id: &str) -> Result<Request> {
    let path = layout.request_path(session_id);
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

pub fn read_status(layout: &PathLayout, session_id: &str) -> Result<Option<Status>> {
    let path = layout.status_path(session_id);
    match std::fs::read_to_string(&path) {
        Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Writes a `status.json` transition. Callers must only ever move
/// forward (absent -> running -> terminal); this function does not
/// itself re-check the existing state; see [`write_status_if_not_terminal`].
pub fn write_status(layout: &PathLayout, session_id: &str, status: &Status) -> Result<()> {
    let path = layout.status_path(session_id);
    atomic_write_json(&path, status)
}

/// Enforces the monotonic invariant: refuses to overwrite a terminal
/// status once one has been written.
pub fn write_status_if_not_terminal(
    layout: &PathLayout,
    session_id: &str,
    status: &Status,
) -> Result<()> {
    if let Some(existing) = read_status(layout, session_id)? {
        if existing.is_terminal() {
            return Ok(());
        }
    }
    write_status(layout, session_id, status)
}

/// Attempts the claim arbitration primitive: exclusive-create of
/// `worker.claim`. At most one caller across all processes wins.
pub fn try_claim(layout: &PathLayout, session_id: &str, host: &str, pid: u32) -> Result<bool> {
    let path = layout.claim_path(session_id);
    let claim = Claim {
        host: host.to_string(),
        pid,
        epoch: epoch_now(),
    };
    let body = serde_json::to_vec(&claim)?;

    match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(mut file) => {
            file.write_all(&body)?;
            file.flush()?;
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e).with_context(|| format!("creating {}", path.display())),
    }
}

pub fn is_claimed(layout: &PathLayout, session_id: &str) -> bool {
    layout.claim_path(session_id).exists()
}

/// Lists session ids under the sessions directory in lexicographic
/// order, the order workers scan in.
pub fn list_session_ids(layout: &PathLayout) -> Result<Vec<String>> {
    let dir = layout.sessions_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut ids: Vec<String> = std::fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    ids.sort();
    Ok(ids)
}

fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("creating temp file in {}", parent.display()))?;
    let body = serde_json::to_vec_pretty(value)?;
    tmp.write_all(&body)?;
    tmp.flush()?;
    tmp.persist(path)
        .map_err(|e| anyhow::anyhow!("renaming temp file onto {}: {}", path.display(), e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientInfo, TerminalSize, WorkerRef};
    use tempfile::TempDir;

    fn sample_request(id: &str) -> Request {
        Request {
            session_id: id.to_string(),
            cwd: "/tmp".to_string(),
            argv: vec!["echo".to_string(), "hi".to_string()],
            use_shell: false,
            env_overrides: Default::default(),
            route: None,
            terminal: TerminalSize::default(),
            created_at: epoch_now(),
            client: ClientInfo {
                host: "h".into(),
                pid: 1,
                user: "u".into(),
                version: "0.1.0".into(),
            },
        }
    }

    #[test]
    fn new_session_id_has_millis_prefix_and_is_unique() {
        let a = new_session_id();
        let b = new_session_id();
        assert_ne!(a, b);
        assert!(a.contains('-'));
        let prefix: &str = a.split('-').next().unwrap();
        assert!(prefix.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn create_request_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let layout = PathLayout::new(dir.path(), "ns");
        let req = sample_request("s1");
        create_request(&layout, &req).unwrap();

        let read_back = read_request(&layout, "s1").unwrap();
        assert_eq!(read_back.argv, req.argv);
        assert_eq!(read_back.cwd, req.cwd);
    }

    #[test]
    fn create_request_rejects_collision() {
        let dir = TempDir::new().unwrap();
        let layout = PathLayout::new(dir.path(), "ns");
        let req = sample_request("dup");
        create_request(&layout, &req).unwrap();
        let err = create_request(&layout, &req).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn status_starts_absent_then_running_then_terminal() {
        let dir = TempDir::new().unwrap();
        let layout = PathLayout::new(dir.path(), "ns");
        layout.ensure_session_dir("s1").unwrap();

        assert!(read_status(&layout, "s1").unwrap().is_none());

        let running = Status::Running {
            worker: WorkerRef {
                host: "h".into(),
                pid: 1,
            },
            started_at: epoch_now(),
            pgid: Some(123),
        };
        write_status_if_not_terminal(&layout, "s1", &running).unwrap();
        assert!(!read_status(&layout, "s1").unwrap().unwrap().is_terminal());

        let exited = Status::Exited {
            code: 0,
            started_at: epoch_now(),
            ended_at: epoch_now(),
        };
        write_status_if_not_terminal(&layout, "s1", &exited).unwrap();
        assert!(read_status(&layout, "s1").unwrap().unwrap().is_terminal());
    }

    #[test]
    fn terminal_status_is_never_overwritten() {
        let dir = TempDir::new().unwrap();
        let layout = PathLayout::new(dir.path(), "ns");
        layout.ensure_session_dir("s1").unwrap();

        let exited = Status::Exited {
            code: 0,
            started_at: 1.0,
            ended_at: 2.0,
        };
        write_status_if_not_terminal(&layout, "s1", &exited).unwrap();

        let second = Status::Exited {
            code: 99,
            started_at: 1.0,
            ended_at: 3.0,
        };
        write_status_if_not_terminal(&layout, "s1", &second).unwrap();

        match read_status(&layout, "s1").unwrap().unwrap() {
            Status::Exited { code, .. } => assert_eq!(code, 0, "first terminal write must stick"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn try_claim_succeeds_exactly_once() {
        let dir = TempDir::new().unwrap();
        let layout = PathLayout::new(dir.path(), "ns");
        layout.ensure_session_dir("s1").unwrap();

        assert!(try_claim(&layout, "s1", "host", 1).unwrap());
        assert!(!try_claim(&layout, "s1", "host", 2).unwrap());
        assert!(is_claimed(&layout, "s1"));
    }

    #[test]
    fn list_session_ids_is_sorted_and_skips_files() {
        let dir = TempDir::new().unwrap();
        let layout = PathLayout::new(dir.path(), "ns");
        layout.ensure_session_dir("b").unwrap();
        layout.ensure_session_dir("a").unwrap();
        std::fs::write(layout.sessions_dir().join("not-a-dir.txt"), b"x").unwrap();

        let ids = list_session_ids(&layout).unwrap();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
