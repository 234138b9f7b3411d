//! The PTY execution engine: forks a child into a pseudo-terminal, then
//! multiplexes the child's output into `stream.jsonl`, `stdin.jsonl`
//! into the child's input, and `control.jsonl` into signals/resizes
//! delivered to the child's process group.
//!
//! `openpty` + `fork` + a `login_tty`-style slave attach, then a
//! `select()`-driven read/write loop. There's no real stdin fd to
//! select on here, since the client talking to this session may be on
//! a different host entirely, so each loop iteration instead polls the
//! `stdin.jsonl`/`control.jsonl` tails. EOF on stdin is delivered by
//! writing the terminal's VEOF character rather than closing the
//! master, so a canonical-mode reader in the child sees EOF without the
//! pty itself going away under it. Exit statuses follow the usual
//! `128 + signal` shell convention.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use anyhow::{Context, Result};
use data_encoding::BASE64;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::pty::{openpty, Winsize};
use nix::sys::select::{select, FdSet};
use nix::sys::signal::{killpg, Signal};
use nix::sys::termios::{tcgetattr, LocalFlags};
use nix::sys::time::TimeVal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, execvp, fork, pipe, read, setsid, write, ForkResult, Pid};

use crate::applog::{AppendLog, Tail};
use crate::protocol::{ControlRecord, SignalName, StdinRecord, StreamRecord, TerminalSize};
use crate::utils::{epoch_now, set_winsize};

/// A single append to `stream.jsonl` is never larger than this; longer
/// reads from the master are split across multiple records.
const MAX_CHUNK: usize = 64 * 1024;

/// Exit code the child reports itself with if it writes an error to
/// the exec-error pipe; distinguishes "we couldn't even spawn it" from
/// an ordinary exit in logs, though the parent never mistakes one for
/// the other regardless.
const SPAWN_FAILURE_EXIT: i32 = 71;

/// How the child process ended.
#[derive(Debug, Clone)]
pub enum Outcome {
    Exited(i32),
    Signaled(i32),
    /// The child never became a real program: `chdir` or `execvp`
    /// failed before the exec. Carries the reason so the caller can
    /// surface it instead of a bare exit code.
    SpawnError(String),
}

/// Forks, attaches a pty, execs `argv`, and runs the communication loop
/// until the child exits. `on_running` is called once the child is
/// forked, with its pid and process group id, so the caller can publish
/// `status.json = running` before the first byte of output is logged.
#[allow(clippy::too_many_arguments)]
pub fn run(
    argv: &[String],
    cwd: &str,
    env_overrides: &HashMap<String, String>,
    terminal: TerminalSize,
    stream_log: &AppendLog,
    stdin_tail: &mut Tail,
    control_tail: &mut Tail,
    mut on_running: impl FnMut(u32, Option<i32>),
) -> Result<Outcome> {
    let winsize = Winsize {
        ws_row: terminal.rows,
        ws_col: terminal.cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let pty = openpty(Some(&winsize), None).context("openpty")?;

    // A CLOEXEC pipe the child writes an error message to if it can't
    // get as far as exec. On success the pipe's write end vanishes with
    // the exec itself, so the parent sees a clean EOF instead.
    let (err_r, err_w) = pipe().context("creating exec-error pipe")?;
    fcntl(err_w.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).context("setting CLOEXEC")?;

    match unsafe { fork() }.context("fork")? {
        ForkResult::Parent { child } => {
            drop(pty.slave);
            drop(err_w);

            let mut err_msg = Vec::new();
            let mut chunk = [0u8; 512];
            loop {
                match read(&err_r, &mut chunk) {
                    Ok(0) => break,
                    Ok(n) => err_msg.extend_from_slice(&chunk[..n]),
                    Err(Errno::EINTR) => continue,
                    Err(_) => break,
                }
            }
            drop(err_r);

            if !err_msg.is_empty() {
                let _ = waitpid(child, None);
                return Ok(Outcome::SpawnError(
                    String::from_utf8_lossy(&err_msg).into_owned(),
                ));
            }

            let pgid = Pid::from_raw(child.as_raw());
            on_running(child.as_raw() as u32, Some(pgid.as_raw()));
            communication_loop(pty.master, child, stream_log, stdin_tail, control_tail)
        }
        ForkResult::Child => {
            drop(pty.master);
            drop(err_r);
            let err = match exec_child(pty.slave, argv, cwd, env_overrides) {
                Ok(never) => match never {},
                Err(err) => err,
            };
            let _ = write(err_w.as_fd(), format!("{err:#}").as_bytes());
            std::process::exit(SPAWN_FAILURE_EXIT);
        }
    }
}

fn exec_child(
    slave: OwnedFd,
    argv: &[String],
    cwd: &str,
    env_overrides: &HashMap<String, String>,
) -> Result<std::convert::Infallible> {
    setsid().ok();
    unsafe {
        if nix::libc::ioctl(slave.as_raw_fd(), nix::libc::TIOCSCTTY as nix::libc::c_ulong, 0) == -1
        {
            nix::libc::ioctl(slave.as_raw_fd(), nix::libc::TIOCSCTTY as nix::libc::c_ulong, 1);
        }
    }

    use std::os::fd::IntoRawFd;
    let slave_fd = slave.into_raw_fd();
    nix::unistd::dup2(slave_fd, 0)?;
    nix::unistd::dup2(slave_fd, 1)?;
    nix::unistd::dup2(slave_fd, 2)?;
    if slave_fd > 2 {
        nix::unistd::close(slave_fd).ok();
    }

    chdir(Path::new(cwd)).with_context(|| format!("chdir to {cwd}"))?;
    for (k, v) in env_overrides {
        std::env::set_var(k, v);
    }
    if std::env::var_os("TERM").is_none() {
        std::env::set_var("TERM", "xterm-256color");
    }

    let c_args: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(std::ffi::OsStr::new(a).as_bytes()))
        .collect::<std::result::Result<_, _>>()
        .context("argv contains NUL byte")?;
    if c_args.is_empty() {
        anyhow::bail!("empty argv");
    }
    Ok(execvp(&c_args[0], &c_args)?)
}

fn communication_loop(
    master: OwnedFd,
    child: Pid,
    stream_log: &AppendLog,
    stdin_tail: &mut Tail,
    control_tail: &mut Tail,
) -> Result<Outcome> {
    let mut buf = [0u8; MAX_CHUNK];
    let mut stdin_open = true;
    let mut warned_stdin_after_eof = false;

    loop {
        let mut read_fds = FdSet::new();
        read_fds.insert(master.as_fd());
        let mut timeout = TimeVal::new(0, 50_000);

        match select(None, Some(&mut read_fds), None, None, Some(&mut timeout)) {
            Ok(_) => {}
            Err(Errno::EINTR | Errno::EAGAIN) => continue,
            Err(err) => return Err(err).context("select"),
        }

        if read_fds.contains(master.as_fd()) {
            match read(&master, &mut buf) {
                Ok(0) | Err(Errno::EIO) => {
                    return Ok(reap(child)?);
                }
                Ok(n) => {
                    crate::debuglog::data_preview("stdout", &buf[..n], 32);
                    append_stream_chunk(stream_log, 1, &buf[..n])?;
                }
                Err(Errno::EAGAIN | Errno::EINTR) => {}
                Err(err) => return Err(err).context("reading pty master"),
            }
        }

        let records: Vec<StdinRecord> = stdin_tail.poll(|_| {})?;
        for rec in records {
            if !stdin_open {
                if !warned_stdin_after_eof {
                    crate::debuglog::stdin_after_eof();
                    warned_stdin_after_eof = true;
                }
                continue;
            }
            if let Some(data_b64) = rec.data_b64 {
                let bytes = BASE64
                    .decode(data_b64.as_bytes())
                    .context("decoding stdin.jsonl record")?;
                crate::debuglog::data_preview("stdin", &bytes, 32);
                write_all(master.as_fd(), &bytes)?;
            }
            if rec.eof {
                send_eof_sequence(master.as_fd());
                stdin_open = false;
            }
        }

        let controls: Vec<ControlRecord> = control_tail.poll(|_| {})?;
        for rec in controls {
            match rec {
                ControlRecord::Signal { signal, .. } => {
                    deliver_signal(child, signal);
                }
                ControlRecord::Resize { cols, rows, .. } => {
                    let size = TerminalSize { cols, rows };
                    set_winsize(master.as_fd(), size).ok();
                    if let Ok(pgrp) = nix::unistd::tcgetpgrp(master.as_fd()) {
                        killpg(pgrp, Signal::SIGWINCH).ok();
                    }
                }
            }
        }

        // A zombie child with a closed master means the loop above
        // would otherwise spin on repeated EAGAIN forever.
        match waitpid(child, Some(nix::sys::wait::WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => {}
            Ok(status) => return Ok(status_to_outcome(status)),
        }
    }
}

fn deliver_signal(child: Pid, signal: SignalName) {
    let pgid = Pid::from_raw(child.as_raw());
    killpg(pgid, signal.to_nix()).ok();
}

fn reap(child: Pid) -> Result<Outcome> {
    Ok(status_to_outcome(waitpid(child, None)?))
}

fn status_to_outcome(status: WaitStatus) -> Outcome {
    match status {
        WaitStatus::Exited(_, code) => Outcome::Exited(code),
        WaitStatus::Signaled(_, signal, _) => Outcome::Signaled(signal as i32),
        _ => Outcome::Exited(1),
    }
}

fn append_stream_chunk(stream_log: &AppendLog, fd: u8, data: &[u8]) -> Result<()> {
    for chunk in data.chunks(MAX_CHUNK) {
        let record = StreamRecord {
            t: epoch_now(),
            fd,
            data_b64: BASE64.encode(chunk),
        };
        stream_log.append(&record)?;
    }
    Ok(())
}

/// Sends the terminal's VEOF character rather than closing the master,
/// so a canonical-mode reader sees EOF without tearing down the pty.
fn send_eof_sequence(fd: BorrowedFd) {
    if let Ok(attrs) = tcgetattr(fd) {
        if attrs.local_flags.contains(LocalFlags::ICANON) {
            write(fd, &[attrs.control_chars[nix::libc::VEOF]]).ok();
        }
    }
}

fn write_all(fd: BorrowedFd, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        match write(fd, data) {
            Ok(0) => break,
            Ok(n) => data = &data[n..],
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => continue,
            Err(err) => return Err(io::Error::from(err)).context("writing to pty master"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applog::AppendLog;
    use tempfile::TempDir;

    #[test]
    fn append_stream_chunk_splits_on_max_chunk() {
        let dir = TempDir::new().unwrap();
        let log = AppendLog::new(dir.path().join("stream.jsonl"), false);
        let data = vec![7u8; MAX_CHUNK + 10];
        append_stream_chunk(&log, 1, &data).unwrap();

        let mut tail = log.tail();
        let records: Vec<StreamRecord> = tail.poll(|_| {}).unwrap();
        assert_eq!(records.len(), 2);
        let total: usize = records
            .iter()
            .map(|r| BASE64.decode(r.data_b64.as_bytes()).unwrap().len())
            .sum();
        assert_eq!(total, data.len());
    }

    #[test]
    fn run_true_exits_zero() {
        let dir = TempDir::new().unwrap();
        let stream_log = AppendLog::new(dir.path().join("stream.jsonl"), false);
        let stdin_log = AppendLog::new(dir.path().join("stdin.jsonl"), false);
        let control_log = AppendLog::new(dir.path().join("control.jsonl"), false);
        let mut stdin_tail = stdin_log.tail();
        let mut control_tail = control_log.tail();

        let outcome = run(
            &["/usr/bin/true".to_string()],
            "/tmp",
            &HashMap::new(),
            TerminalSize::default(),
            &stream_log,
            &mut stdin_tail,
            &mut control_tail,
            |_pid, _pgid| {},
        )
        .unwrap();

        match outcome {
            Outcome::Exited(code) => assert_eq!(code, 0),
            Outcome::Signaled(sig) => panic!("unexpected signal {sig}"),
        }
    }
}
