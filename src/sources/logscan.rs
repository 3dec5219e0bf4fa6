//! Grep-marker evaluation over log files.
//!
//! Each profile keeps its own read position per log file, so a line is only
//! counted once per profile. Rotation is detected through the inode and
//! truncation through the file length; both restart the scan at offset 0.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use memchr::memmem;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::LogScanSource;
use crate::marker::{GrepMarker, MarkerKind};

// ----------------------------------------------------------------------------
// Log Cursor
// ----------------------------------------------------------------------------

/// Read position of one profile in one log file
#[derive(Debug, Clone)]
struct LogCursor {
    path: PathBuf,
    offset: u64,
    inode: u64,
}

fn inode_of(path: &Path) -> u64 {
    fs::metadata(path)
        .map(|m| {
            #[cfg(unix)]
            {
                std::os::unix::fs::MetadataExt::ino(&m)
            }
            #[cfg(not(unix))]
            {
                let _ = m;
                0
            }
        })
        .unwrap_or(0)
}

impl LogCursor {
    fn new(path: PathBuf) -> Self {
        let inode = inode_of(&path);
        Self {
            path,
            offset: 0,
            inode,
        }
    }

    fn reset(&mut self) {
        self.offset = 0;
        self.inode = inode_of(&self.path);
    }

    fn check_rotation(&mut self) -> bool {
        let current = inode_of(&self.path);
        if current != self.inode && current != 0 {
            self.inode = current;
            self.offset = 0;
            true
        } else {
            false
        }
    }

    /// Lines appended since the last read
    fn read_new_lines(&mut self) -> Vec<String> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };

        let file_len = file.metadata().map(|m| m.len()).unwrap_or(0);
        if file_len < self.offset {
            self.offset = 0;
        }

        let mut reader = BufReader::new(file);
        if self.offset > 0 && reader.seek(SeekFrom::Start(self.offset)).is_err() {
            return Vec::new();
        }

        let mut lines = Vec::new();
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    self.offset += n as u64;
                    lines.push(String::from_utf8_lossy(&buf).trim_end().to_string());
                }
                Err(_) => break,
            }
        }
        lines
    }
}

// ----------------------------------------------------------------------------
// File Log Scanner
// ----------------------------------------------------------------------------

/// Default [`LogScanSource`] reading plain-text logs under one directory
#[derive(Debug)]
pub struct FileLogScanner {
    log_dir: PathBuf,
    /// profile -> log file -> cursor
    seek_map: Mutex<HashMap<String, HashMap<String, LogCursor>>>,
}

impl FileLogScanner {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            seek_map: Mutex::new(HashMap::new()),
        }
    }

    fn resolve(&self, log_file: &str) -> PathBuf {
        let path = Path::new(log_file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.log_dir.join(path)
        }
    }

    /// Number of profiles with a seek map
    pub fn tracked_profiles(&self) -> usize {
        self.seek_map.lock().len()
    }
}

/// Evaluate markers over a batch of lines
fn evaluate(markers: &[&GrepMarker], lines: &[String], out: &mut Vec<(String, String)>) {
    for marker in markers {
        let finder = memmem::Finder::new(marker.search_string.as_bytes());

        match marker.kind {
            MarkerKind::Absolute => {
                let last = lines.iter().rev().find_map(|line| {
                    finder
                        .find(line.as_bytes())
                        .map(|pos| line[pos + marker.search_string.len()..].trim().to_string())
                });
                match last {
                    Some(value) => out.push((marker.name.clone(), value)),
                    None if marker.report_empty => out.push((marker.name.clone(), String::new())),
                    None => {}
                }
            }
            // Accumulation has no meaning for log scans; count like a counter
            MarkerKind::Counter | MarkerKind::Accumulate => {
                let count = lines
                    .iter()
                    .filter(|line| finder.find(line.as_bytes()).is_some())
                    .count();
                if count > 0 || marker.report_empty {
                    out.push((marker.name.clone(), count.to_string()));
                }
            }
        }
    }
}

impl LogScanSource for FileLogScanner {
    fn grep_results(
        &self,
        profile: &str,
        markers: &[GrepMarker],
        clear_seek_map: bool,
    ) -> Vec<(String, String)> {
        // Group by file so every log is read once per report
        let mut by_file: BTreeMap<&str, Vec<&GrepMarker>> = BTreeMap::new();
        for marker in markers {
            by_file.entry(marker.log_file.as_str()).or_default().push(marker);
        }

        let mut seek_map = self.seek_map.lock();
        let cursors = seek_map.entry(profile.to_string()).or_default();
        let mut results = Vec::new();

        for (log_file, file_markers) in by_file {
            let cursor = cursors
                .entry(log_file.to_string())
                .or_insert_with(|| LogCursor::new(self.resolve(log_file)));

            if clear_seek_map {
                cursor.reset();
            } else if cursor.check_rotation() {
                debug!(
                    target: "telemetry::report",
                    profile,
                    log_file,
                    "Log rotated, rescanning from start"
                );
            }

            let lines = cursor.read_new_lines();
            trace!(
                target: "telemetry::report",
                profile,
                log_file,
                lines = lines.len(),
                offset = cursor.offset,
                "Scanned log"
            );
            evaluate(&file_markers, &lines, &mut results);
        }

        results
    }

    fn save_grep_config(&self, profile: &str, markers: &[GrepMarker]) {
        let mut seek_map = self.seek_map.lock();
        let cursors = seek_map.entry(profile.to_string()).or_default();
        for marker in markers {
            cursors
                .entry(marker.log_file.clone())
                .or_insert_with(|| LogCursor::new(self.resolve(&marker.log_file)));
        }
    }

    fn remove_grep_config(&self, profile: &str) {
        self.seek_map.lock().remove(profile);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn append(path: &Path, text: &str) {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    fn markers() -> Vec<GrepMarker> {
        vec![
            GrepMarker::new("SYS_ERROR_oom", "Out of memory", "messages.txt", MarkerKind::Counter),
            GrepMarker::new("SYS_INFO_fw", "Firmware:", "messages.txt", MarkerKind::Absolute),
        ]
    }

    #[test]
    fn test_counts_and_last_value() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("messages.txt");
        append(
            &log,
            "boot\nOut of memory: pid 12\nFirmware: 1.0\nOut of memory: pid 40\nFirmware: 1.2\n",
        );

        let scanner = FileLogScanner::new(dir.path());
        let results = scanner.grep_results("P", &markers(), false);

        assert_eq!(
            results,
            vec![
                ("SYS_ERROR_oom".to_string(), "2".to_string()),
                ("SYS_INFO_fw".to_string(), "1.2".to_string()),
            ]
        );
    }

    #[test]
    fn test_seek_map_skips_seen_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("messages.txt");
        append(&log, "Out of memory\n");

        let scanner = FileLogScanner::new(dir.path());
        assert_eq!(scanner.grep_results("P", &markers(), false).len(), 1);
        assert!(scanner.grep_results("P", &markers(), false).is_empty());

        append(&log, "Out of memory\nOut of memory\n");
        assert_eq!(
            scanner.grep_results("P", &markers(), false),
            vec![("SYS_ERROR_oom".to_string(), "2".to_string())]
        );
    }

    #[test]
    fn test_clear_seek_map_rescans() {
        let dir = tempfile::tempdir().unwrap();
        append(&dir.path().join("messages.txt"), "Out of memory\n");

        let scanner = FileLogScanner::new(dir.path());
        scanner.grep_results("P", &markers(), false);

        let results = scanner.grep_results("P", &markers(), true);
        assert_eq!(results, vec![("SYS_ERROR_oom".to_string(), "1".to_string())]);
    }

    #[test]
    fn test_profiles_have_independent_positions() {
        let dir = tempfile::tempdir().unwrap();
        append(&dir.path().join("messages.txt"), "Out of memory\n");

        let scanner = FileLogScanner::new(dir.path());
        assert_eq!(scanner.grep_results("A", &markers(), false).len(), 1);
        assert_eq!(scanner.grep_results("B", &markers(), false).len(), 1);
    }

    #[test]
    fn test_grep_config_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = FileLogScanner::new(dir.path());

        scanner.save_grep_config("P", &markers());
        assert_eq!(scanner.tracked_profiles(), 1);

        scanner.remove_grep_config("P");
        assert_eq!(scanner.tracked_profiles(), 0);
    }

    #[test]
    fn test_missing_log_reports_empty_only_when_asked() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = FileLogScanner::new(dir.path());

        let mut marker = GrepMarker::new("SYS_ERROR_x", "x", "absent.txt", MarkerKind::Counter);
        assert!(scanner.grep_results("P", &[marker.clone()], false).is_empty());

        marker.report_empty = true;
        assert_eq!(
            scanner.grep_results("P", &[marker], false),
            vec![("SYS_ERROR_x".to_string(), "0".to_string())]
        );
    }
}
