//! Buffered, append-only log file for supervised child output.
//!
//! Lines are timestamped when captured and held in memory until the buffer
//! grows past [`FLUSH_THRESHOLD`] or a forced flush happens at shutdown.
//! A flush is one append of the whole buffer followed by clearing it.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::Local;

/// Buffered line count that triggers a flush on the next write.
pub const FLUSH_THRESHOLD: usize = 500;

#[cfg(windows)]
const LINE_ENDING: &str = "\r\n";
#[cfg(not(windows))]
const LINE_ENDING: &str = "\n";

#[derive(Debug)]
pub struct BufferedLogSink {
    path: PathBuf,
    threshold: usize,
    buffer: Mutex<Vec<String>>,
}

impl BufferedLogSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_threshold(path, FLUSH_THRESHOLD)
    }

    pub fn with_threshold(path: impl Into<PathBuf>, threshold: usize) -> Self {
        Self {
            path: path.into(),
            threshold,
            buffer: Mutex::new(Vec::with_capacity(threshold + 1)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of lines waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Append a timestamped line, flushing in place once over the threshold.
    ///
    /// A failed flush drops the batch and is reported through `tracing`; the
    /// caller is never interrupted by log I/O.
    pub fn write(&self, message: &str) {
        let mut buffer = self.lock();
        buffer.push(format_line(message));
        if buffer.len() > self.threshold {
            if let Err(err) = self.flush_locked(&mut buffer) {
                tracing::warn!(path = %self.path.display(), "dropped buffered log lines: {err:#}");
            }
        }
    }

    /// Append the buffered lines to the log file.
    ///
    /// Without `force` nothing happens until the threshold is exceeded.
    /// Returns the number of lines written.
    pub fn flush(&self, force: bool) -> Result<usize> {
        let mut buffer = self.lock();
        if force || buffer.len() > self.threshold {
            self.flush_locked(&mut buffer)
        } else {
            Ok(0)
        }
    }

    fn flush_locked(&self, buffer: &mut Vec<String>) -> Result<usize> {
        if buffer.is_empty() {
            return Ok(0);
        }

        let mut chunk = String::with_capacity(buffer.iter().map(|l| l.len() + 2).sum());
        for line in buffer.iter() {
            chunk.push_str(line);
            chunk.push_str(LINE_ENDING);
        }
        let count = buffer.len();
        buffer.clear();

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(chunk.as_bytes())
            .with_context(|| format!("failed to append to {}", self.path.display()))?;

        Ok(count)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `yyyy-MM-dd HH:mm:ss.ffff <message>`
fn format_line(message: &str) -> String {
    let now = Local::now();
    format!(
        "{}.{:04} {}",
        now.format("%Y-%m-%d %H:%M:%S"),
        now.timestamp_subsec_micros() / 100,
        message
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use regex::Regex;

    use super::*;

    #[test]
    fn stays_in_memory_until_threshold_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.log");
        let sink = BufferedLogSink::new(&path);

        for i in 0..FLUSH_THRESHOLD {
            sink.write(&format!("line {i}"));
        }
        assert!(!path.exists());
        assert_eq!(sink.pending(), FLUSH_THRESHOLD);

        sink.write("one more");
        assert_eq!(sink.pending(), 0);
        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), FLUSH_THRESHOLD + 1);
        assert!(lines[0].ends_with(" line 0"));
        assert!(lines[FLUSH_THRESHOLD - 1].ends_with(&format!(" line {}", FLUSH_THRESHOLD - 1)));
        assert!(lines[FLUSH_THRESHOLD].ends_with(" one more"));
    }

    #[test]
    fn forced_flush_of_empty_buffer_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.log");
        let sink = BufferedLogSink::new(&path);

        assert_eq!(sink.flush(true).unwrap(), 0);
        assert!(!path.exists());

        sink.write("hello");
        assert_eq!(sink.flush(false).unwrap(), 0);
        assert_eq!(sink.flush(true).unwrap(), 1);
        assert_eq!(sink.flush(true).unwrap(), 0);
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 1);
    }

    #[test]
    fn lines_carry_timestamp_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("host.log");
        let sink = BufferedLogSink::new(&path);

        sink.write("svc Started");
        sink.flush(true).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let pattern = Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}\.\d{4} svc Started$").unwrap();
        assert!(pattern.is_match(contents.lines().next().unwrap()), "{contents}");
    }

    #[test]
    fn appends_across_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.log");
        fs::write(&path, "existing\n").unwrap();

        let sink = BufferedLogSink::with_threshold(&path, 2);
        sink.write("a");
        sink.write("b");
        sink.write("c");
        sink.write("d");
        sink.flush(true).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "existing");
        let tail: Vec<&str> = lines[1..].iter().map(|l| l.rsplit(' ').next().unwrap()).collect();
        assert_eq!(tail, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn write_failure_drops_batch() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes every open fail.
        let path = dir.path().join("blocked");
        fs::create_dir(&path).unwrap();

        let sink = BufferedLogSink::with_threshold(&path, 1);
        sink.write("a");
        sink.write("b");
        assert_eq!(sink.pending(), 0);

        sink.write("c");
        assert!(sink.flush(true).is_err());
        assert_eq!(sink.pending(), 0);
    }

    #[test]
    fn concurrent_writers_never_lose_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.log");
        let sink = Arc::new(BufferedLogSink::with_threshold(&path, 7));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let sink = Arc::clone(&sink);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        sink.write(&format!("t{t}-{i}"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        sink.flush(true).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 200);
        for t in 0..4 {
            let ours: Vec<usize> = contents
                .lines()
                .filter_map(|l| l.rsplit(' ').next())
                .filter_map(|m| m.strip_prefix(&format!("t{t}-")))
                .map(|n| n.parse().unwrap())
                .collect();
            assert_eq!(ours, (0..50).collect::<Vec<_>>());
        }
    }
}
