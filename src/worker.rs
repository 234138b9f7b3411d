//! The worker process: scans the sessions directory, claims unclaimed
//! requests that match its route, serializes jobs sharing a `cwd`
//! behind a [`FileLock`], and runs each one through [`crate::pty::run`]
//! on a bounded thread pool.
//!
//! Many worker processes on a shared filesystem race over the same
//! session directories, so claiming is exclusive-create arbitration
//! rather than a leader election, and dispatch is a poll loop rather
//! than a push.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::Result;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag as signal_flag;

use crate::config::Config;
use crate::debuglog;
use crate::filelock::FileLock;
use crate::layout::PathLayout;
use crate::protocol::{Heartbeat, Request, Status, WorkerRef};
use crate::pty;
use crate::session;
use crate::utils::epoch_now;

/// How long a heartbeat file may go unrefreshed before a client
/// considers the worker dead.
pub const HEARTBEAT_STALE_AFTER: f64 = 5.0;

pub struct Worker {
    layout: PathLayout,
    config: Config,
    host: String,
    pid: u32,
    pinned: HashSet<&'static str>,
    started_at: f64,
    in_flight: Arc<(Mutex<usize>, Condvar)>,
    /// Process group ids of children currently running under this
    /// worker, so a shutdown past its grace period can force-signal
    /// them.
    active_pgids: Arc<Mutex<HashSet<i32>>>,
}

impl Worker {
    pub fn new(layout: PathLayout, config: Config, pinned: HashSet<&'static str>) -> Result<Self> {
        layout.ensure_dirs()?;
        let host = hostname();
        let pid = std::process::id();

        FileLock::self_test(&layout.locks_dir().join(".self-test.lock"))?;

        Ok(Self {
            layout,
            config,
            host,
            pid,
            pinned,
            started_at: epoch_now(),
            in_flight: Arc::new((Mutex::new(0), Condvar::new())),
            active_pgids: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Runs the scan/claim/dispatch loop until `SIGINT`/`SIGTERM`, then
    /// waits (bounded) for in-flight jobs to finish before returning.
    pub fn run(&mut self) -> Result<()> {
        let shutdown = Arc::new(AtomicBool::new(false));
        signal_flag::register(SIGTERM, Arc::clone(&shutdown))?;
        signal_flag::register(SIGINT, Arc::clone(&shutdown))?;

        let mut last_reload = epoch_now();
        let mut last_heartbeat = 0.0;

        while !shutdown.load(Ordering::Relaxed) {
            let now = epoch_now();
            if now - last_heartbeat >= 1.0 {
                self.publish_heartbeat()?;
                last_heartbeat = now;
            }
            if now - last_reload >= 1.0 {
                self.config.reload(&self.pinned)?;
                last_reload = now;
            }

            self.scan_and_dispatch()?;
            std::thread::sleep(Duration::from_millis(
                (self.config.worker_poll_interval * 1000.0) as u64,
            ));
        }

        debuglog::job_end("worker", "shutting down, waiting for in-flight jobs");
        let (lock, cvar) = &*self.in_flight;
        let guard = lock.lock().unwrap();
        let (guard, timeout_result) = cvar
            .wait_timeout_while(guard, Duration::from_secs(10), |n| *n > 0)
            .unwrap();
        if timeout_result.timed_out() && *guard > 0 {
            for pgid in self.active_pgids.lock().unwrap().iter() {
                let _ = nix::sys::signal::killpg(
                    nix::unistd::Pid::from_raw(*pgid),
                    nix::sys::signal::Signal::SIGKILL,
                );
            }
        }
        drop(guard);

        // Heartbeat removal is the liveness signal clients key off; leaving
        // it behind on a clean exit would make a dead worker look alive for
        // up to HEARTBEAT_STALE_AFTER seconds.
        let _ = std::fs::remove_file(self.layout.heartbeat_path(&self.host, self.pid));
        Ok(())
    }

    fn scan_and_dispatch(&mut self) -> Result<()> {
        for session_id in session::list_session_ids(&self.layout)? {
            if session::is_claimed(&self.layout, &session_id) {
                continue;
            }
            let Ok(request) = session::read_request(&self.layout, &session_id) else {
                continue;
            };
            if !self.accepts_route(request.route.as_deref()) {
                continue;
            }
            if self.active_count() >= self.config.worker_max_jobs {
                continue;
            }

            match session::try_claim(&self.layout, &session_id, &self.host, self.pid)? {
                true => {
                    debuglog::claim_won(&session_id);
                    self.spawn_job(request);
                }
                false => debuglog::claim_lost(&session_id),
            }
        }
        Ok(())
    }

    /// Untagged requests (`route: None`) only run on a worker started
    /// with `--accept-untagged`; rejecting them by default is the safer
    /// posture on a shared filesystem with mixed-purpose workers.
    fn accepts_route(&self, route: Option<&str>) -> bool {
        match route {
            None => self.config.worker_accept_untagged,
            Some(r) => self.config.route.as_deref() == Some(r),
        }
    }

    fn active_count(&self) -> usize {
        *self.in_flight.0.lock().unwrap()
    }

    fn spawn_job(&self, request: Request) {
        let layout = self.layout.clone();
        let host = self.host.clone();
        let pid = self.pid;
        let remote_env = self.config.remote_env.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let active_pgids = Arc::clone(&self.active_pgids);
        let cwd_lock_path = layout.cwd_lock_path(&request.cwd);

        {
            let (lock, _) = &*in_flight;
            *lock.lock().unwrap() += 1;
        }

        std::thread::spawn(move || {
            let session_id = request.session_id.clone();
            debuglog::job_start(&session_id, &request.argv);

            debuglog::lock_wait(&request.cwd);
            let cwd_lock = match FileLock::acquire_blocking(&cwd_lock_path) {
                Ok(lock) => lock,
                Err(err) => {
                    let _ = session::write_status_if_not_terminal(
                        &layout,
                        &session_id,
                        &Status::Error {
                            message: format!("cwd lock unavailable: {err}"),
                            ended_at: epoch_now(),
                        },
                    );
                    decrement(&in_flight);
                    return;
                }
            };
            debuglog::lock_acquired(&request.cwd);

            let outcome = run_one(&layout, &request, &host, pid, &remote_env, &active_pgids);
            drop(cwd_lock);
            debuglog::lock_released(&request.cwd);

            match &outcome {
                Ok(_) => debuglog::job_end(&session_id, "completed"),
                Err(e) => debuglog::job_end(&session_id, &format!("error: {e}")),
            }
            decrement(&in_flight);
        });
    }

    fn publish_heartbeat(&self) -> Result<()> {
        let path = self.layout.heartbeat_path(&self.host, self.pid);
        let heartbeat = Heartbeat {
            host: self.host.clone(),
            pid: self.pid,
            route: self.config.route.clone(),
            started_at: self.started_at,
            updated_at: epoch_now(),
            max_jobs: self.config.worker_max_jobs,
            active: self.active_count(),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(self.layout.workers_dir())?;
        use std::io::Write as _;
        tmp.write_all(&serde_json::to_vec(&heartbeat)?)?;
        tmp.flush()?;
        tmp.persist(path)
            .map_err(|e| anyhow::anyhow!("publishing heartbeat: {}", e.error))?;
        Ok(())
    }
}

fn decrement(in_flight: &Arc<(Mutex<usize>, Condvar)>) {
    let (lock, cvar) = &**in_flight;
    let mut n = lock.lock().unwrap();
    *n -= 1;
    cvar.notify_all();
}

/// Runs one claimed job end to end: publish `running`, run the pty,
/// publish the terminal status. Stream and status writes are sequenced
/// so a client never observes a terminal `status.json` before the last
/// `stream.jsonl` record it corresponds to.
fn run_one(
    layout: &PathLayout,
    request: &Request,
    host: &str,
    worker_pid: u32,
    worker_remote_env: &HashMap<String, String>,
    active_pgids: &Arc<Mutex<HashSet<i32>>>,
) -> Result<()> {
    // The worker's own `remote_env` is layered on last, after the
    // request's own overrides, so a worker-host-specific entry always
    // wins even though client and worker read independent config files.
    let mut env_overrides = request.env_overrides.clone();
    env_overrides.extend(worker_remote_env.iter().map(|(k, v)| (k.clone(), v.clone())));

    let stream_log = crate::applog::AppendLog::new(layout.stream_path(&request.session_id), false);
    let stdin_log = crate::applog::AppendLog::new(layout.stdin_path(&request.session_id), false);
    let control_log =
        crate::applog::AppendLog::new(layout.control_path(&request.session_id), false);
    let mut stdin_tail = stdin_log.tail();
    let mut control_tail = control_log.tail();

    let session_id = request.session_id.clone();
    let layout_for_cb = layout.clone();
    let host_for_cb = host.to_string();
    let started_at = epoch_now();
    let pgids_for_cb = Arc::clone(active_pgids);
    let registered_pgid = Arc::new(Mutex::new(None::<i32>));
    let registered_for_cb = Arc::clone(&registered_pgid);

    let outcome = pty::run(
        &request.argv,
        &request.cwd,
        &env_overrides,
        request.terminal,
        &stream_log,
        &mut stdin_tail,
        &mut control_tail,
        move |_pid, pgid| {
            if let Some(pgid) = pgid {
                pgids_for_cb.lock().unwrap().insert(pgid);
                *registered_for_cb.lock().unwrap() = Some(pgid);
            }
            let _ = session::write_status_if_not_terminal(
                &layout_for_cb,
                &session_id,
                &Status::Running {
                    worker: WorkerRef {
                        host: host_for_cb.clone(),
                        pid: worker_pid,
                    },
                    started_at,
                    pgid,
                },
            );
        },
    );

    if let Some(pgid) = *registered_pgid.lock().unwrap() {
        active_pgids.lock().unwrap().remove(&pgid);
    }

    let ended_at = epoch_now();
    let status = match outcome {
        Ok(pty::Outcome::Exited(code)) => Status::Exited {
            code,
            started_at,
            ended_at,
        },
        Ok(pty::Outcome::Signaled(signo)) => Status::Signaled {
            signal: signal_name(signo),
            started_at,
            ended_at,
        },
        Ok(pty::Outcome::SpawnError(message)) => Status::Error { message, ended_at },
        Err(err) => Status::Error {
            message: err.to_string(),
            ended_at,
        },
    };
    session::write_status_if_not_terminal(layout, &request.session_id, &status)
}

fn signal_name(signo: i32) -> String {
    match signo {
        x if x == nix::sys::signal::Signal::SIGINT as i32 => "SIGINT".to_string(),
        x if x == nix::sys::signal::Signal::SIGTERM as i32 => "SIGTERM".to_string(),
        x if x == nix::sys::signal::Signal::SIGKILL as i32 => "SIGKILL".to_string(),
        x if x == nix::sys::signal::Signal::SIGQUIT as i32 => "SIGQUIT".to_string(),
        other => format!("signal {other}"),
    }
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn accepts_route_rejects_untagged_by_default() {
        let dir = TempDir::new().unwrap();
        let layout = PathLayout::new(dir.path(), "ns");
        let mut config = Config::load().unwrap();
        config.worker_accept_untagged = false;
        config.route = Some("gpu-box".to_string());
        let worker = Worker::new(layout, config, HashSet::new()).unwrap();

        assert!(!worker.accepts_route(None));
        assert!(worker.accepts_route(Some("gpu-box")));
        assert!(!worker.accepts_route(Some("other-box")));
    }

    #[test]
    fn accepts_route_honors_accept_untagged_flag() {
        let dir = TempDir::new().unwrap();
        let layout = PathLayout::new(dir.path(), "ns");
        let mut config = Config::load().unwrap();
        config.worker_accept_untagged = true;
        let worker = Worker::new(layout, config, HashSet::new()).unwrap();
        assert!(worker.accepts_route(None));
    }

    #[test]
    fn heartbeat_is_published_and_readable() {
        let dir = TempDir::new().unwrap();
        let layout = PathLayout::new(dir.path(), "ns");
        let config = Config::load().unwrap();
        let worker = Worker::new(layout.clone(), config, HashSet::new()).unwrap();
        worker.publish_heartbeat().unwrap();

        let path = layout.heartbeat_path(&worker.host, worker.pid);
        let raw = std::fs::read_to_string(path).unwrap();
        let hb: Heartbeat = serde_json::from_str(&raw).unwrap();
        assert_eq!(hb.pid, worker.pid);
    }
}
