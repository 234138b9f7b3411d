//! The client side of a session: checks a worker is alive, writes
//! `request.json`, then pumps stdin into `stdin.jsonl` and control
//! records while tailing `stream.jsonl`/`status.json` back out to the
//! local terminal.
//!
//! The terminal raw-mode dance (`tcgetattr`/`cfmakeraw`/`tcsetattr` with
//! a `RestoreTerm` drop guard) and the `SIGWINCH` flag-polling idiom
//! read like talking to a local pty directly, but every byte actually
//! passes through three files a worker process on another host is
//! driving.

use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use data_encoding::BASE64;
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, LocalFlags, SetArg, Termios};
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM, SIGWINCH};

use crate::applog::AppendLog;
use crate::argv;
use crate::config::Config;
use crate::layout::PathLayout;
use crate::protocol::{
    ClientInfo, ControlRecord, Request, SignalName, StdinRecord, StreamRecord, Status,
};
use crate::session;
use crate::utils::{epoch_now, get_winsize, is_pid_alive};
use crate::worker::HEARTBEAT_STALE_AFTER;

/// Exit code mirroring a worker liveness timeout: no worker answered
/// within `--wait-worker` and no session was ever created.
pub const EXIT_NO_WORKER: i32 = 124;
/// Exit code for a session that ended in `status = error` rather than a
/// normal or signaled process exit.
pub const EXIT_SESSION_ERROR: i32 = 125;

pub struct ClientOptions {
    pub argv: Vec<String>,
    pub route: Option<String>,
    pub wait_worker: Duration,
}

/// Restores a captured terminal state on drop.
struct RestoreTerm(Termios);

impl Drop for RestoreTerm {
    fn drop(&mut self) {
        let _ = tcsetattr(std::io::stdin(), SetArg::TCSAFLUSH, &self.0);
    }
}

pub fn run(layout: &PathLayout, config: &Config, opts: ClientOptions) -> Result<i32> {
    if !any_worker_alive(layout, opts.route.as_deref(), opts.wait_worker)? {
        eprintln!("pigeon: no worker answered within {:?}", opts.wait_worker);
        return Ok(EXIT_NO_WORKER);
    }

    let is_tty = atty::is(atty::Stream::Stdin);
    let normalized = argv::normalize(&opts.argv, &config.remote_env);
    let session_id = session::new_session_id();
    let terminal = if is_tty {
        get_winsize(std::io::stdin().as_fd()).unwrap_or_default()
    } else {
        Default::default()
    };

    let request = Request {
        session_id: session_id.clone(),
        cwd: std::env::current_dir()
            .context("resolving cwd")?
            .to_string_lossy()
            .to_string(),
        argv: normalized.argv,
        use_shell: normalized.use_shell,
        // The worker that ultimately claims this session applies its
        // own `remote_env` last, from its own config file; this client
        // has no business baking its local `remote_env` in here too.
        env_overrides: Default::default(),
        route: opts.route.or_else(|| config.route.clone()),
        terminal,
        created_at: epoch_now(),
        client: ClientInfo {
            host: hostname(),
            pid: std::process::id(),
            user: std::env::var("USER").unwrap_or_default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    };
    session::create_request(layout, &request)?;
    crate::debuglog::session_create(&session_id, &request.cwd, request.route.as_deref());

    let raw_term = if is_tty {
        tcgetattr(std::io::stdin()).ok()
    } else {
        None
    };
    let _restore = raw_term.as_ref().map(|attrs| {
        let mut raw = attrs.clone();
        cfmakeraw(&mut raw);
        raw.local_flags.remove(LocalFlags::ECHO);
        tcsetattr(std::io::stdin(), SetArg::TCSAFLUSH, &raw).ok();
        RestoreTerm(attrs.clone())
    });

    let control_log = AppendLog::new(layout.control_path(&session_id), false);
    spawn_stdin_pump(layout.stdin_path(&session_id));

    let got_winch = Arc::new(AtomicBool::new(false));
    let got_int = Arc::new(AtomicBool::new(false));
    let got_term = Arc::new(AtomicBool::new(false));
    let got_quit = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGWINCH, Arc::clone(&got_winch))?;
    signal_hook::flag::register(SIGINT, Arc::clone(&got_int))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&got_term))?;
    signal_hook::flag::register(SIGQUIT, Arc::clone(&got_quit))?;

    let mut stream_tail = AppendLog::new(layout.stream_path(&session_id), false).tail();
    let mut stdout = std::io::stdout();

    loop {
        if got_winch.swap(false, Ordering::Relaxed) {
            if let Some(size) = get_winsize(std::io::stdin().as_fd()) {
                control_log.append(&ControlRecord::Resize {
                    t: epoch_now(),
                    cols: size.cols,
                    rows: size.rows,
                })?;
            }
        }
        for (flag, signal) in [
            (&got_int, SignalName::SIGINT),
            (&got_term, SignalName::SIGTERM),
            (&got_quit, SignalName::SIGQUIT),
        ] {
            if flag.swap(false, Ordering::Relaxed) {
                control_log.append(&ControlRecord::Signal {
                    t: epoch_now(),
                    signal,
                })?;
                crate::debuglog::signal_forward(&session_id, &format!("{signal:?}"));
            }
        }

        let chunks: Vec<StreamRecord> = stream_tail.poll(|_| {})?;
        for chunk in chunks {
            let bytes = BASE64
                .decode(chunk.data_b64.as_bytes())
                .context("decoding stream.jsonl record")?;
            stdout.write_all(&bytes)?;
        }
        stdout.flush()?;

        if let Some(status) = session::read_status(layout, &session_id)? {
            if status.is_terminal() {
                drain_stream(&mut stream_tail, &mut stdout)?;
                return Ok(exit_code_for(&status));
            }
        }

        std::thread::sleep(Duration::from_millis(25));
    }
}

/// Drains `stream.jsonl` after a terminal status has been observed.
/// Keeps polling until the tail offset is stable across two consecutive
/// polls, so trailing output the worker appended just before writing
/// its terminal `status.json` is not lost.
fn drain_stream(stream_tail: &mut crate::applog::Tail, stdout: &mut std::io::Stdout) -> Result<()> {
    let mut stable_polls = 0;
    loop {
        let before = stream_tail.offset();
        let chunks: Vec<StreamRecord> = stream_tail.poll(|_| {})?;
        for chunk in chunks {
            let bytes = BASE64
                .decode(chunk.data_b64.as_bytes())
                .context("decoding stream.jsonl record")?;
            stdout.write_all(&bytes)?;
        }
        stdout.flush()?;

        if stream_tail.offset() == before {
            stable_polls += 1;
            if stable_polls >= 2 {
                return Ok(());
            }
        } else {
            stable_polls = 0;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn exit_code_for(status: &Status) -> i32 {
    match status {
        Status::Exited { code, .. } => *code,
        Status::Signaled { signal, .. } => 128 + signal_number(signal),
        Status::Error { .. } => EXIT_SESSION_ERROR,
        Status::Running { .. } => unreachable!("caller already checked is_terminal"),
    }
}

fn signal_number(name: &str) -> i32 {
    match name {
        "SIGINT" => nix::sys::signal::Signal::SIGINT as i32,
        "SIGTERM" => nix::sys::signal::Signal::SIGTERM as i32,
        "SIGQUIT" => nix::sys::signal::Signal::SIGQUIT as i32,
        "SIGKILL" => nix::sys::signal::Signal::SIGKILL as i32,
        _ => 0,
    }
}

/// Reads stdin on its own thread, appending base64 chunks to
/// `stdin.jsonl` and a final `eof` record when the stream closes. Runs
/// detached and fire-and-forget: the process exits (or the main loop
/// returns) before it would ever need joining.
fn spawn_stdin_pump(path: std::path::PathBuf) {
    std::thread::spawn(move || {
        let log = AppendLog::new(path, false);
        let mut buf = [0u8; 8192];
        let mut stdin = std::io::stdin();
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => {
                    let _ = log.append(&StdinRecord {
                        t: epoch_now(),
                        data_b64: None,
                        eof: true,
                    });
                    break;
                }
                Ok(n) => {
                    let record = StdinRecord {
                        t: epoch_now(),
                        data_b64: Some(BASE64.encode(&buf[..n])),
                        eof: false,
                    };
                    if log.append(&record).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
}

/// Polls worker heartbeats for up to `wait` for one that is both fresh
/// (updated within [`HEARTBEAT_STALE_AFTER`]) and route-compatible, so
/// a client doesn't create a session destined to sit unclaimed forever.
/// A worker qualifies if its route matches the request's route, or
/// either side has no route at all.
fn any_worker_alive(layout: &PathLayout, route: Option<&str>, wait: Duration) -> Result<bool> {
    let deadline = Instant::now() + wait;
    loop {
        if let Ok(entries) = std::fs::read_dir(layout.workers_dir()) {
            for entry in entries.filter_map(|e| e.ok()) {
                let Ok(raw) = std::fs::read_to_string(entry.path()) else {
                    continue;
                };
                let Ok(hb) = serde_json::from_str::<crate::protocol::Heartbeat>(&raw) else {
                    continue;
                };
                let fresh = epoch_now() - hb.updated_at <= HEARTBEAT_STALE_AFTER;
                let route_ok = route.is_none() || hb.route.is_none() || hb.route.as_deref() == route;
                if fresh && route_ok && is_pid_alive(hb.pid) {
                    return Ok(true);
                }
            }
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string())
}
