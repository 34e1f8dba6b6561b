//! Append-only event journal.
//!
//! Every [`SupervisionEvent`] is stored as one JSON object per line.  Several
//! processes (the host, the supervisor and the command surface) append to the
//! same file; each line is written with a single `write_all` on a file opened
//! in append mode.
//!
//! [`JournalReader`] follows the file incrementally for `kernos watch` and
//! answers "what was the most recent relevant event" for `kernos status`.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use kernos_types::{KernosError, SupervisionEvent};
use tracing::warn;

use crate::bus::EventSink;

/// [`EventSink`] that appends JSON lines to a file.
pub struct EventJournal {
    path: PathBuf,
    file: Mutex<File>,
}

impl EventJournal {
    /// Open (or create) the journal at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KernosError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for EventJournal {
    fn write(&self, event: &SupervisionEvent) -> Result<(), KernosError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = self
            .file
            .lock()
            .map_err(|e| KernosError::Io(format!("journal lock poisoned: {e}")))?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

/// Block size for reading the journal backwards.
const SCAN_BLOCK: u64 = 64 * 1024;

/// Incremental reader over an [`EventJournal`] file.
///
/// Lines that are not valid JSON events, including invalid UTF-8, are logged
/// and skipped.
pub struct JournalReader {
    path: PathBuf,
    offset: u64,
}

impl JournalReader {
    /// A reader positioned at the start of the journal.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            offset: 0,
        }
    }

    /// A reader positioned at the current end of the journal.
    pub fn at_end(path: impl AsRef<Path>) -> Result<Self, KernosError> {
        let path = path.as_ref().to_path_buf();
        let offset = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        let mut reader = Self { path, offset };
        // Start after the last complete line; a torn tail is read on the next poll.
        reader.offset = reader.complete_end()?;
        Ok(reader)
    }

    /// Return every complete event appended since the previous call.
    ///
    /// A trailing line without a newline is left for the next poll.  If the
    /// file shrank (rotated or truncated) reading restarts from the top.
    /// A missing file yields no events.
    pub fn poll(&mut self) -> Result<Vec<SupervisionEvent>, KernosError> {
        let Some(mut file) = open_existing(&self.path)? else {
            return Ok(Vec::new());
        };
        let len = file.metadata()?.len();
        if len < self.offset {
            self.offset = 0;
        }
        file.seek(SeekFrom::Start(self.offset))?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let Some(idx) = raw.iter().rposition(|b| *b == b'\n') else {
            return Ok(Vec::new());
        };
        let complete = &raw[..=idx];
        self.offset += complete.len() as u64;
        Ok(complete.split(|b| *b == b'\n').filter_map(parse_line).collect())
    }

    /// Every event currently in the journal at `path`.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<SupervisionEvent>, KernosError> {
        JournalReader::new(path).poll()
    }

    /// The last `n` events in the journal at `path`, oldest first.
    ///
    /// Reads backwards from the end, so the cost does not grow with the
    /// journal.
    pub fn tail(path: impl AsRef<Path>, n: usize) -> Result<Vec<SupervisionEvent>, KernosError> {
        let mut events = Vec::with_capacity(n);
        if n > 0 {
            scan_back(path.as_ref(), |event| {
                events.push(event);
                events.len() < n
            })?;
        }
        events.reverse();
        Ok(events)
    }

    /// The most recent event satisfying `pred`, searching from the end.
    pub fn last_matching(
        path: impl AsRef<Path>,
        pred: impl Fn(&SupervisionEvent) -> bool,
    ) -> Result<Option<SupervisionEvent>, KernosError> {
        let mut found = None;
        scan_back(path.as_ref(), |event| {
            if pred(&event) {
                found = Some(event);
                return false;
            }
            true
        })?;
        Ok(found)
    }

    /// Byte offset just past the last newline at or after `self.offset`.
    fn complete_end(&self) -> Result<u64, KernosError> {
        let Some(mut file) = open_existing(&self.path)? else {
            return Ok(0);
        };
        let mut pos = self.offset;
        while pos > 0 {
            let start = pos.saturating_sub(SCAN_BLOCK);
            let mut block = vec![0u8; (pos - start) as usize];
            file.seek(SeekFrom::Start(start))?;
            file.read_exact(&mut block)?;
            if let Some(idx) = block.iter().rposition(|b| *b == b'\n') {
                return Ok(start + idx as u64 + 1);
            }
            pos = start;
        }
        Ok(0)
    }
}

fn open_existing(path: &Path) -> Result<Option<File>, KernosError> {
    match File::open(path) {
        Ok(f) => Ok(Some(f)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Feed complete events to `visit`, newest first, until it returns `false`.
///
/// The file is read in [`SCAN_BLOCK`] chunks from the end.  An unterminated
/// last line is ignored.
fn scan_back(path: &Path, mut visit: impl FnMut(SupervisionEvent) -> bool) -> Result<(), KernosError> {
    let Some(mut file) = open_existing(path)? else {
        return Ok(());
    };
    let mut pos = file.metadata()?.len();
    // Bytes from `pos` onwards not yet split into lines.  Once `terminated`,
    // it always ends with a newline.
    let mut rest: Vec<u8> = Vec::new();
    let mut terminated = false;

    while pos > 0 {
        let start = pos.saturating_sub(SCAN_BLOCK);
        let mut block = vec![0u8; (pos - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut block)?;
        pos = start;
        block.extend_from_slice(&rest);
        rest = block;

        if !terminated {
            match rest.iter().rposition(|b| *b == b'\n') {
                Some(idx) => {
                    rest.truncate(idx + 1);
                    terminated = true;
                }
                None => {
                    rest.clear();
                    continue;
                }
            }
        }

        // Lines after the first newline are complete; the head may continue
        // into the previous block unless this is the start of the file.
        let cut = if pos == 0 {
            0
        } else {
            match rest.iter().position(|b| *b == b'\n') {
                Some(idx) => idx + 1,
                None => continue,
            }
        };
        for line in rest[cut..].rsplit(|b| *b == b'\n') {
            if let Some(event) = parse_line(line) {
                if !visit(event) {
                    return Ok(());
                }
            }
        }
        rest.truncate(cut);
    }
    Ok(())
}

fn parse_line(line: &[u8]) -> Option<SupervisionEvent> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    match serde_json::from_slice(line) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, "skipping malformed journal line");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernos_types::EventType;

    #[test]
    fn appended_events_are_read_back_in_order() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("events.jsonl");
        let journal = EventJournal::open(&path)?;

        journal.write(&SupervisionEvent::new(EventType::BootStarted, "boot"))?;
        journal.write(&SupervisionEvent::new(EventType::KernelStarted, "memory"))?;

        let events = JournalReader::read_all(&path)?;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::BootStarted);
        assert_eq!(events[1].subject, "memory");
        Ok(())
    }

    #[test]
    fn poll_only_returns_new_events() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("events.jsonl");
        let journal = EventJournal::open(&path)?;
        let mut reader = JournalReader::new(&path);

        journal.write(&SupervisionEvent::new(EventType::BootStarted, "boot"))?;
        assert_eq!(reader.poll()?.len(), 1);
        assert!(reader.poll()?.is_empty());

        journal.write(&SupervisionEvent::new(EventType::BootComplete, "boot"))?;
        let fresh = reader.poll()?;
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].event_type, EventType::BootComplete);
        Ok(())
    }

    #[test]
    fn partial_line_waits_for_newline() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("events.jsonl");
        let event = SupervisionEvent::new(EventType::ManualStop, "process");
        let line = serde_json::to_string(&event)?;
        let (head, rest) = line.split_at(10);

        fs::write(&path, head)?;
        let mut reader = JournalReader::new(&path);
        assert!(reader.poll()?.is_empty());

        let mut file = OpenOptions::new().append(true).open(&path)?;
        writeln!(file, "{rest}")?;
        let events = reader.poll()?;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, event.id);
        Ok(())
    }

    #[test]
    fn malformed_lines_are_skipped() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("events.jsonl");
        let good = serde_json::to_string(&SupervisionEvent::new(EventType::BootStarted, "boot"))?;
        fs::write(&path, format!("not json\n{good}\n"))?;

        assert_eq!(JournalReader::read_all(&path)?.len(), 1);
        Ok(())
    }

    #[test]
    fn invalid_utf8_line_is_skipped() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("events.jsonl");
        let first = SupervisionEvent::new(EventType::BootStarted, "boot");
        let second = SupervisionEvent::new(EventType::BootComplete, "boot");

        let mut raw = serde_json::to_vec(&first)?;
        raw.extend_from_slice(b"\n\xff\xfe garbage\n");
        raw.extend_from_slice(&serde_json::to_vec(&second)?);
        raw.push(b'\n');
        fs::write(&path, raw)?;

        let ids: Vec<_> = JournalReader::read_all(&path)?.into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);

        let tail = JournalReader::tail(&path, 5)?;
        assert_eq!(tail.len(), 2);
        let last = JournalReader::last_matching(&path, |e| e.event_type == EventType::BootStarted)?
            .ok_or("expected boot_started")?;
        assert_eq!(last.id, first.id);
        Ok(())
    }

    #[test]
    fn torn_multibyte_tail_is_read_once_complete() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("events.jsonl");
        let event = SupervisionEvent::new(EventType::KernelFailed, "mémoire");
        let line = serde_json::to_vec(&event)?;
        // Split inside the two-byte 'é'.
        let split = line.iter().position(|b| *b == 0xC3).ok_or("no multibyte char")? + 1;

        fs::write(&path, &line[..split])?;
        let mut reader = JournalReader::new(&path);
        assert!(reader.poll()?.is_empty());
        assert!(JournalReader::tail(&path, 1)?.is_empty());

        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(&line[split..])?;
        file.write_all(b"\n")?;
        let events = reader.poll()?;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].subject, "mémoire");
        Ok(())
    }

    #[test]
    fn backwards_scan_crosses_block_boundaries() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("events.jsonl");
        let journal = EventJournal::open(&path)?;

        let oldest = SupervisionEvent::new(EventType::ManualStop, "process");
        journal.write(&oldest)?;
        // One line longer than a whole block.
        let big = SupervisionEvent::new(EventType::KernelDegraded, "ingestion")
            .with("reason", "x".repeat(SCAN_BLOCK as usize + 100));
        journal.write(&big)?;
        for i in 0..2_000 {
            journal.write(&SupervisionEvent::new(EventType::KernelStarted, format!("k{i}")))?;
        }
        assert!(fs::metadata(&path)?.len() > 2 * SCAN_BLOCK);

        let all = JournalReader::read_all(&path)?;
        let tail = JournalReader::tail(&path, 7)?;
        let expected: Vec<_> = all[all.len() - 7..].iter().map(|e| e.id).collect();
        assert_eq!(tail.iter().map(|e| e.id).collect::<Vec<_>>(), expected);

        let degraded = JournalReader::last_matching(&path, |e| e.event_type == EventType::KernelDegraded)?
            .ok_or("expected the long line")?;
        assert_eq!(degraded.id, big.id);
        let stop = JournalReader::last_matching(&path, |e| e.event_type == EventType::ManualStop)?
            .ok_or("expected the first line")?;
        assert_eq!(stop.id, oldest.id);
        assert_eq!(JournalReader::tail(&path, 5_000)?.len(), all.len());
        Ok(())
    }

    #[test]
    fn reader_at_end_skips_history() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("events.jsonl");
        let journal = EventJournal::open(&path)?;
        journal.write(&SupervisionEvent::new(EventType::BootStarted, "boot"))?;

        let mut reader = JournalReader::at_end(&path)?;
        assert!(reader.poll()?.is_empty());
        journal.write(&SupervisionEvent::new(EventType::BootComplete, "boot"))?;
        let fresh = reader.poll()?;
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].event_type, EventType::BootComplete);
        Ok(())
    }

    #[test]
    fn missing_journal_reads_empty() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        assert!(JournalReader::read_all(dir.path().join("absent.jsonl"))?.is_empty());
        Ok(())
    }

    #[test]
    fn tail_and_last_matching() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("events.jsonl");
        let journal = EventJournal::open(&path)?;
        for t in [
            EventType::ProcessCrashDetected,
            EventType::ManualStop,
            EventType::ProcessRestartSuppressed,
            EventType::BootStarted,
        ] {
            journal.write(&SupervisionEvent::new(t, "process"))?;
        }

        let tail = JournalReader::tail(&path, 2)?;
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].event_type, EventType::ProcessRestartSuppressed);

        let last = JournalReader::last_matching(&path, |e| e.event_type.is_process_level())?
            .ok_or("expected a process-level event")?;
        assert_eq!(last.event_type, EventType::ProcessRestartSuppressed);
        Ok(())
    }
}
