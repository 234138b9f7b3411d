//! Small host-facing helpers used by both the client and the worker:
//! terminal size probing, liveness checks, and epoch time.
//!
//! Window-size reads and writes go through `nix`'s
//! `ioctl_read_bad!`/`ioctl_write_ptr_bad!` macros rather than raw
//! `libc::ioctl` calls, so both the client (reading its own tty) and
//! the PTY engine (sizing the pty slave) share one typed code path.

use std::os::fd::BorrowedFd;

use nix::pty::Winsize;

use crate::protocol::TerminalSize;

nix::ioctl_read_bad!(get_window_size, libc::TIOCGWINSZ, Winsize);
nix::ioctl_write_ptr_bad!(set_window_size, libc::TIOCSWINSZ, Winsize);

/// Reads the window size of `fd` if it refers to a tty.
pub fn get_winsize(fd: BorrowedFd) -> Option<TerminalSize> {
    let mut size: Winsize = unsafe { std::mem::zeroed() };
    unsafe { get_window_size(std::os::fd::AsRawFd::as_raw_fd(&fd), &mut size).ok()? };
    if size.ws_col == 0 || size.ws_row == 0 {
        return None;
    }
    Some(TerminalSize {
        cols: size.ws_col,
        rows: size.ws_row,
    })
}

/// Sets the window size of `fd`, used to propagate a `resize` control
/// record into the PTY slave.
pub fn set_winsize(fd: BorrowedFd, size: TerminalSize) -> nix::Result<()> {
    let winsize = Winsize {
        ws_row: size.rows,
        ws_col: size.cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    unsafe { set_window_size(std::os::fd::AsRawFd::as_raw_fd(&fd), &winsize) }?;
    Ok(())
}

/// Current epoch time as a float, the unit every timestamp field in the
/// protocol uses.
pub fn epoch_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Whether `pid` refers to a live, non-zombie process.
///
/// Uses `kill(pid, 0)` to check existence without spawning a
/// subprocess, then additionally consults `/proc/<pid>/stat` on Linux
/// to exclude zombies, since `kill(pid, 0)` alone still succeeds
/// against a zombie.
pub fn is_pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            if let Some(paren) = stat.rfind(')') {
                let rest = stat[paren + 1..].trim_start();
                if rest.starts_with('Z') {
                    return false;
                }
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(is_pid_alive(std::process::id()));
    }

    #[test]
    fn bogus_pid_is_not_alive() {
        assert!(!is_pid_alive(u32::MAX - 1));
    }

    #[test]
    fn epoch_now_is_monotone_increasing_enough() {
        let a = epoch_now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = epoch_now();
        assert!(b >= a);
    }
}
