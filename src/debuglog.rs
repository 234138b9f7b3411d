//! A fixed taxonomy of structured debug events: session-create,
//! claim-won/lost, lock-wait/acquire/release, job-start/end,
//! stdin/stdout previews, and signal-forward.
//!
//! A thin `colored` formatting layer over `tracing` rather than a
//! bespoke logging framework: `tracing` carries the structured fields
//! (so a `--json` subscriber or log aggregator still works), and
//! `colored` only decorates the human-readable line printed to a
//! terminal-attached debug session.

use colored::Colorize;

/// Installs the global `tracing` subscriber. `debug` raises the filter
/// from `info` to `debug`; always honors `RUST_LOG` if set.
pub fn init(debug: bool) {
    use tracing_subscriber::EnvFilter;

    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pigeon={default_level}")));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

pub fn session_create(session_id: &str, cwd: &str, route: Option<&str>) {
    tracing::info!(session_id, cwd, route, "session created");
}

pub fn claim_won(session_id: &str) {
    tracing::debug!(session_id, "{}", "claim won".green());
}

pub fn claim_lost(session_id: &str) {
    tracing::debug!(session_id, "{}", "claim lost".yellow());
}

pub fn lock_wait(cwd: &str) {
    tracing::debug!(cwd, "{}", "waiting on cwd lock".yellow());
}

pub fn lock_acquired(cwd: &str) {
    tracing::debug!(cwd, "{}", "cwd lock acquired".green());
}

pub fn lock_released(cwd: &str) {
    tracing::debug!(cwd, "cwd lock released");
}

pub fn job_start(session_id: &str, argv: &[String]) {
    tracing::info!(session_id, argv = ?argv, "job started");
}

pub fn job_end(session_id: &str, outcome: &str) {
    tracing::info!(session_id, outcome, "job ended");
}

pub fn signal_forward(session_id: &str, signal: &str) {
    tracing::debug!(session_id, signal, "{}", "forwarding signal".red());
}

/// Hex + text preview of the first `n` bytes of an stdin/stdout chunk.
pub fn data_preview(label: &str, data: &[u8], n: usize) {
    let slice = &data[..data.len().min(n)];
    let hex: String = slice.iter().map(|b| format!("{b:02x}")).collect();
    let text = String::from_utf8_lossy(slice).replace(['\n', '\r'], "\\n");
    tracing::trace!(label, hex = %hex, text = %text, "{}", format!("{label} preview").cyan());
}

/// Logged the first time a stdin record arrives after EOF has already
/// been delivered to the child; the bytes are dropped.
pub fn stdin_after_eof() {
    tracing::warn!("{}", "stdin record dropped after eof".yellow());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_preview_truncates_to_n_bytes() {
        // No assertions on log output (tracing has no subscriber in
        // tests by default); this just verifies it never panics on
        // short buffers, empty buffers, or non-UTF8 bytes.
        data_preview("stdout", b"hello world", 4);
        data_preview("stdout", b"", 4);
        data_preview("stdout", &[0xff, 0xfe, 0x00], 8);
    }
}
