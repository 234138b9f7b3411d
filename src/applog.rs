//! Append-only newline-delimited record log with non-blocking tail
//! cursors: one writer, many readers.
//!
//! A single reusable append/tail primitive backs `stream.jsonl`,
//! `stdin.jsonl`, and `control.jsonl` alike: open, write one JSON line,
//! flush, close. No persistent file handle is kept between writes.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// A single writer onto an append-only `.jsonl` file.
pub struct AppendLog {
    path: PathBuf,
    fsync: bool,
}

impl AppendLog {
    pub fn new(path: impl Into<PathBuf>, fsync: bool) -> Self {
        Self {
            path: path.into(),
            fsync,
        }
    }

    /// Appends one JSON-serializable record as a single `\n`-terminated
    /// line. Opens, writes, and closes on every call: callers append
    /// infrequently enough (one stdin chunk, one stdout chunk) that
    /// holding a persistent handle isn't worth the lifetime complexity,
    /// and it keeps the "single writer" invariant trivially true across
    /// process restarts.
    pub fn append<T: serde::Serialize>(&self, record: &T) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {} for append", self.path.display()))?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.flush()?;
        if self.fsync {
            file.sync_data()?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens a tail cursor starting at offset 0.
    pub fn tail(&self) -> Tail {
        Tail {
            path: self.path.clone(),
            offset: 0,
        }
    }
}

/// A read cursor over an [`AppendLog`]'s file. Never blocks: a poll
/// reads whatever is available between the cursor and EOF and leaves a
/// partial trailing line for the next poll.
pub struct Tail {
    path: PathBuf,
    offset: u64,
}

impl Tail {
    pub fn at_offset(path: impl Into<PathBuf>, offset: u64) -> Self {
        Self {
            path: path.into(),
            offset,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reads new complete lines since the last poll. Malformed JSON
    /// lines are reported via `on_malformed` and otherwise skipped; they
    /// never abort the tail.
    pub fn poll<T, F>(&mut self, mut on_malformed: F) -> Result<Vec<T>>
    where
        T: serde::de::DeserializeOwned,
        F: FnMut(&str),
    {
        let Ok(mut file) = File::open(&self.path) else {
            return Ok(Vec::new());
        };
        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = String::new();
        let read = file.read_to_string(&mut buf)?;
        if read == 0 {
            return Ok(Vec::new());
        }

        let mut consumed = 0usize;
        let mut records = Vec::new();
        for line in buf.split_inclusive('\n') {
            if !line.ends_with('\n') {
                // Partial trailing line: re-read next poll.
                break;
            }
            consumed += line.len();
            let trimmed = line.trim_end_matches('\n');
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(trimmed) {
                Ok(record) => records.push(record),
                Err(_) => on_malformed(trimmed),
            }
        }

        self.offset += consumed as u64;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Rec {
        n: u32,
    }

    #[test]
    fn append_then_tail_from_zero_yields_record_once() {
        let dir = TempDir::new().unwrap();
        let log = AppendLog::new(dir.path().join("log.jsonl"), false);
        log.append(&Rec { n: 1 }).unwrap();

        let mut tail = log.tail();
        let recs: Vec<Rec> = tail.poll(|_| {}).unwrap();
        assert_eq!(recs, vec![Rec { n: 1 }]);

        let recs2: Vec<Rec> = tail.poll(|_| {}).unwrap();
        assert!(recs2.is_empty());
    }

    #[test]
    fn tail_from_offset_past_end_yields_nothing() {
        let dir = TempDir::new().unwrap();
        let log = AppendLog::new(dir.path().join("log.jsonl"), false);
        log.append(&Rec { n: 1 }).unwrap();
        let end = std::fs::metadata(log.path()).unwrap().len();

        let mut tail = Tail::at_offset(log.path(), end);
        let recs: Vec<Rec> = tail.poll(|_| {}).unwrap();
        assert!(recs.is_empty());
    }

    #[test]
    fn partial_trailing_line_is_not_consumed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");
        std::fs::write(&path, b"{\"n\":1}\n{\"n\":2").unwrap();

        let log = AppendLog::new(path, false);
        let mut tail = log.tail();
        let recs: Vec<Rec> = tail.poll(|_| {}).unwrap();
        assert_eq!(recs, vec![Rec { n: 1 }]);

        // Complete the partial line and poll again.
        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        file.write_all(b"}\n").unwrap();
        let recs2: Vec<Rec> = tail.poll(|_| {}).unwrap();
        assert_eq!(recs2, vec![Rec { n: 2 }]);
    }

    #[test]
    fn malformed_line_is_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");
        std::fs::write(&path, b"not json\n{\"n\":5}\n").unwrap();

        let log = AppendLog::new(path, false);
        let mut tail = log.tail();
        let mut malformed = Vec::new();
        let recs: Vec<Rec> = tail.poll(|line| malformed.push(line.to_string())).unwrap();
        assert_eq!(recs, vec![Rec { n: 5 }]);
        assert_eq!(malformed, vec!["not json".to_string()]);
    }

    #[test]
    fn tail_on_missing_file_yields_nothing() {
        let dir = TempDir::new().unwrap();
        let log = AppendLog::new(dir.path().join("missing.jsonl"), false);
        let mut tail = log.tail();
        let recs: Vec<Rec> = tail.poll(|_| {}).unwrap();
        assert!(recs.is_empty());
    }
}
