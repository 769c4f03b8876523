//! Append-only CRC-protected key/value journal.
//!
//! # File format
//! One record per line, `<crc32:8 hex>\t<key>\t<value>\n`.  The CRC32 covers
//! `key\tvalue`.  The sentinel value `drop` is a tombstone erasing the key
//! from the journal's interpretation.
//!
//! # Interpretation
//! Records are replayed in file order.  A repeated key overwrites its
//! existing entry in place, so a surviving key sits at the position of its
//! first surviving append.  A tombstone removes the entry entirely; a later
//! re-append starts a fresh position at the tail.
//!
//! # Compaction
//! `flush` rewrites the whole journal through [`SafeWriter`] once the
//! duplicates factor (records per distinct key) and the on-disk size both
//! exceed their thresholds.  A rewrite failing with a `WriteFile` class
//! error (disk full and friends) falls back to a plain append.
//!
//! A single mutex serializes all public operations.

use crate::io::{SafeWriter, WriteError, classify_io_error};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

/// Tombstone value erasing a key.
pub const TOMBSTONE: &str = "drop";

const DEFAULT_DUPLICATES_FACTOR: f64 = 3.0;
const DEFAULT_MINIMAL_REWRITE_SIZE: u64 = 4096;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: String,
    pub value: String,
}

impl Record {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Record {
        Record {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Default)]
struct State {
    committed: Vec<Record>,
    dirty: Vec<Record>,
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

pub struct Journal {
    path: PathBuf,
    duplicates_factor: f64,
    minimal_rewrite_size: u64,
    state: Mutex<State>,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Journal {
        Journal {
            path: path.into(),
            duplicates_factor: DEFAULT_DUPLICATES_FACTOR,
            minimal_rewrite_size: DEFAULT_MINIMAL_REWRITE_SIZE,
            state: Mutex::new(State::default()),
        }
    }

    /// `duplicates_factor` must be at least 1.
    pub fn with_limits(
        path: impl Into<PathBuf>,
        duplicates_factor: f64,
        minimal_rewrite_size: u64,
    ) -> Result<Journal, JournalError> {
        if duplicates_factor < 1.0 {
            return Err(JournalError::InvalidArgument(
                "duplicates factor must be at least 1".into(),
            ));
        }
        Ok(Journal {
            path: path.into(),
            duplicates_factor,
            minimal_rewrite_size,
            state: Mutex::new(State::default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the journal file if absent; true when it was created.
    pub fn create_empty(&self) -> Result<bool, JournalError> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(classify_io_error(e, &self.path).into()),
        }
    }

    /// Validate filesystem preconditions for using the journal file.
    pub fn check_existing(&self, regular: bool, writable: bool) -> Result<(), JournalError> {
        match fs::metadata(&self.path) {
            Ok(meta) => {
                if fs::File::open(&self.path).is_err() {
                    return Err(WriteError::AccessDenied(format!(
                        "cannot read file {}",
                        self.path.display()
                    ))
                    .into());
                }
                if regular && !meta.is_file() {
                    return Err(JournalError::InvalidArgument(format!(
                        "file {} must be a regular file",
                        self.path.display()
                    )));
                }
                if writable && meta.permissions().readonly() {
                    return Err(WriteError::ReadOnly(format!(
                        "cannot write file {}",
                        self.path.display()
                    ))
                    .into());
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
                let meta = match fs::metadata(parent) {
                    Ok(meta) => meta,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        return Err(JournalError::NotFound(format!(
                            "directory {} does not exist",
                            parent.display()
                        )));
                    }
                    Err(e) => return Err(classify_io_error(e, parent).into()),
                };
                if !meta.is_dir() {
                    return Err(JournalError::InvalidArgument(format!(
                        "{} must be a directory",
                        parent.display()
                    )));
                }
                if fs::read_dir(parent).is_err() {
                    return Err(WriteError::AccessDenied(format!(
                        "cannot read from directory {}",
                        parent.display()
                    ))
                    .into());
                }
                if writable && meta.permissions().readonly() {
                    return Err(WriteError::ReadOnly(format!(
                        "cannot write into directory {}",
                        parent.display()
                    ))
                    .into());
                }
                Ok(())
            }
            Err(e) => Err(classify_io_error(e, &self.path).into()),
        }
    }

    /// Reparse the file into memory.  With `recover`, malformed lines are
    /// logged and skipped; without it, any malformed record fails the load.
    pub fn load(&self, recover: bool) -> Result<(), JournalError> {
        let contents =
            fs::read_to_string(&self.path).map_err(|e| classify_io_error(e, &self.path))?;
        let records = self.parse_contents(&contents, recover)?;

        let mut state = self.lock();
        state.committed = records;
        state.dirty.clear();
        Ok(())
    }

    /// Verify that the in-memory state matches the file state.
    pub fn check_consistent(&self) -> Result<(), JournalError> {
        let contents =
            fs::read_to_string(&self.path).map_err(|e| classify_io_error(e, &self.path))?;
        let parsed = interpret(self.parse_contents(&contents, true)?);

        if parsed != self.records() {
            return Err(JournalError::IllegalState("inconsistent journals".into()));
        }
        Ok(())
    }

    /// Enqueue a record; with `flush`, persist it immediately.
    pub fn append(&self, key: &str, value: &str, flush: bool) -> Result<(), JournalError> {
        check_record(key, value)?;

        let mut state = self.lock();
        state.dirty.push(Record::new(key, value));
        if flush {
            self.flush_locked(&mut state)?;
        }
        Ok(())
    }

    /// Enqueue a tombstone for `key`.
    pub fn drop_key(&self, key: &str, flush: bool) -> Result<(), JournalError> {
        let mut state = self.lock();
        state.dirty.push(Record::new(key, TOMBSTONE));
        if flush {
            self.flush_locked(&mut state)?;
        }
        Ok(())
    }

    /// Bulk tombstones.  The operation across the set is not atomic: a crash
    /// may leave only a prefix of the keys dropped.
    pub fn drop_keys(&self, keys: &BTreeSet<String>, flush: bool) -> Result<(), JournalError> {
        let mut state = self.lock();
        let count = keys.len();
        for (i, key) in keys.iter().enumerate() {
            state.dirty.push(Record::new(key.as_str(), TOMBSTONE));
            if flush && i + 1 == count {
                self.flush_locked(&mut state)?;
            }
        }
        Ok(())
    }

    /// Persist pending records, compacting when worthwhile.
    pub fn flush(&self) -> Result<(), JournalError> {
        let mut state = self.lock();
        self.flush_locked(&mut state)
    }

    /// The interpreted current state: one record per live key, in insertion
    /// order of the surviving append.
    pub fn records(&self) -> Vec<Record> {
        interpret(self.records_raw())
    }

    /// Value of a live key.
    pub fn get(&self, key: &str) -> Option<String> {
        self.records()
            .into_iter()
            .find(|r| r.key == key)
            .map(|r| r.value)
    }

    pub fn current_duplicates_factor(&self) -> f64 {
        let state = self.lock();
        duplicates_factor(&state.committed)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn records_raw(&self) -> Vec<Record> {
        let state = self.lock();
        let mut records = state.committed.clone();
        records.extend(state.dirty.iter().cloned());
        records
    }

    fn flush_locked(&self, state: &mut State) -> Result<(), JournalError> {
        let factor = duplicates_factor(&state.committed);
        let over_size =
            bytes_of(&state.committed) + bytes_of(&state.dirty) > self.minimal_rewrite_size;

        if factor > self.duplicates_factor && over_size {
            self.interpret_and_flush(state)
        } else {
            self.append_flush(state)
        }
    }

    fn interpret_and_flush(&self, state: &mut State) -> Result<(), JournalError> {
        let mut records = state.committed.clone();
        records.extend(state.dirty.iter().cloned());
        let records = interpret(records);

        match self.rewrite_and_flush(state, records) {
            Ok(()) => Ok(()),
            Err(JournalError::Write(WriteError::WriteFile(detail))) => {
                warn!(error = %detail, "journal rewrite failed, falling back to append");
                self.append_flush(state)
            }
            Err(e) => Err(e),
        }
    }

    fn rewrite_and_flush(
        &self,
        state: &mut State,
        records: Vec<Record>,
    ) -> Result<(), JournalError> {
        debug!(path = %self.path.display(), "rewriting journal");

        let mut writer = SafeWriter::sibling(&self.path, "lock");
        writer.stream(true)?;
        for record in &records {
            writer.write_all(format_record(record, false).as_bytes())?;
            writer.write_all(b"\n")?;
        }
        writer.finalize()?;
        writer.commit_as(&self.path)?;

        state.committed = records;
        state.dirty.clear();
        Ok(())
    }

    fn append_flush(&self, state: &mut State) -> Result<(), JournalError> {
        if state.dirty.is_empty() {
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| classify_io_error(e, &self.path))?;

        while let Some(record) = state.dirty.first().cloned() {
            let line = format_record(&record, false) + "\n";
            file.write_all(line.as_bytes())
                .map_err(|e| classify_io_error(e, &self.path))?;
            file.flush()
                .map_err(|e| classify_io_error(e, &self.path))?;

            state.dirty.remove(0);
            state.committed.push(record);
        }

        file.sync_data()
            .map_err(|e| classify_io_error(e, &self.path))?;
        Ok(())
    }

    fn parse_contents(&self, contents: &str, recover: bool) -> Result<Vec<Record>, JournalError> {
        let mut records = Vec::new();

        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(line, lineno + 1) {
                Ok(record) => records.push(record),
                Err(e) if recover => {
                    warn!(path = %self.path.display(), error = %e, "skipping malformed record");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(records)
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        let mut state = self.lock();
        if !state.dirty.is_empty() {
            if let Err(e) = self.append_flush(&mut state) {
                warn!(path = %self.path.display(), error = %e, "final journal flush failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Record helpers
// ---------------------------------------------------------------------------

fn check_record(key: &str, value: &str) -> Result<(), JournalError> {
    if key.contains('\t') {
        return Err(JournalError::InvalidArgument(
            "record key must not contain <TAB>".into(),
        ));
    }
    if value.contains('\n') {
        return Err(JournalError::InvalidArgument(
            "record value must not contain <LF>".into(),
        ));
    }
    if value == TOMBSTONE {
        return Err(JournalError::InvalidArgument(format!(
            "record value must not be '{TOMBSTONE}'"
        )));
    }
    Ok(())
}

/// Format a record as its journal line (without trailing newline).  With
/// `zero_sum` the checksum field is a placeholder, useful for sizing.
fn format_record(record: &Record, zero_sum: bool) -> String {
    let content = format!("{}\t{}", record.key, record.value);
    if zero_sum {
        format!("00000000\t{content}")
    } else {
        format!("{:08X}\t{content}", crc32fast::hash(content.as_bytes()))
    }
}

fn parse_line(line: &str, lineno: usize) -> Result<Record, JournalError> {
    let (checksum, content) = line.split_once('\t').ok_or_else(|| {
        JournalError::Malformed(format!("missing <TAB> separator at {lineno}"))
    })?;

    let expected = u32::from_str_radix(checksum, 16).map_err(|_| {
        JournalError::Malformed(format!("expected hexadecimal checksum at {lineno}"))
    })?;

    let computed = crc32fast::hash(content.as_bytes());
    if computed != expected {
        return Err(JournalError::Malformed(format!(
            "checksum mismatch: {expected:08X} != {computed:08X} at {lineno}"
        )));
    }

    let (key, value) = content.split_once('\t').ok_or_else(|| {
        JournalError::Malformed(format!("missing key/value separator at {lineno}"))
    })?;

    Ok(Record::new(key, value))
}

/// Replay raw records into the interpreted state.
fn interpret(records: Vec<Record>) -> Vec<Record> {
    let mut slots: Vec<Option<Record>> = Vec::with_capacity(records.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for record in records {
        if record.value == TOMBSTONE {
            if let Some(slot) = index.remove(&record.key) {
                slots[slot] = None;
            }
            continue;
        }

        match index.get(&record.key) {
            Some(&slot) => slots[slot] = Some(record),
            None => {
                index.insert(record.key.clone(), slots.len());
                slots.push(Some(record));
            }
        }
    }

    slots.into_iter().flatten().collect()
}

fn duplicates_factor(records: &[Record]) -> f64 {
    let unique: HashSet<&str> = records.iter().map(|r| r.key.as_str()).collect();
    if unique.is_empty() {
        return 1.0;
    }
    records.len() as f64 / unique.len() as f64
}

fn bytes_of(records: &[Record]) -> u64 {
    records
        .iter()
        .map(|r| format_record(r, true).len() as u64 + 1)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(pairs: &[(&str, &str)]) -> Vec<Record> {
        pairs.iter().map(|(k, v)| Record::new(*k, *v)).collect()
    }

    #[test]
    fn interpret_preserves_insertion_order_without_duplicates() {
        let input = records(&[("a", "1"), ("b", "2"), ("c", "3")]);
        assert_eq!(interpret(input.clone()), input);
    }

    #[test]
    fn interpret_keeps_first_surviving_position_with_latest_value() {
        let input = records(&[("a", "1"), ("b", "2"), ("a", "3")]);
        assert_eq!(interpret(input), records(&[("a", "3"), ("b", "2")]));
    }

    #[test]
    fn interpret_removes_tombstoned_keys_entirely() {
        let input = records(&[("a", "1"), ("b", "2"), ("a", TOMBSTONE), ("a", "4")]);
        // re-appended key starts a fresh position at the tail
        assert_eq!(interpret(input), records(&[("b", "2"), ("a", "4")]));
    }

    #[test]
    fn interpret_matches_the_reference_sequence() {
        let input = records(&[
            ("a", "0"),
            ("a", "256"),
            ("b", "0"),
            ("c", TOMBSTONE),
            ("d", "0"),
            ("b", "200"),
            ("a", "354"),
            ("c", "0"),
            ("b", TOMBSTONE),
            ("d", "56"),
        ]);
        assert_eq!(
            interpret(input),
            records(&[("a", "354"), ("d", "56"), ("c", "0")])
        );
    }

    #[test]
    fn formatted_line_carries_crc_of_the_remainder() {
        let line = format_record(&Record::new("key", "value"), false);
        let (checksum, content) = line.split_once('\t').unwrap();
        assert_eq!(
            u32::from_str_radix(checksum, 16).unwrap(),
            crc32fast::hash(content.as_bytes())
        );
        assert_eq!(content, "key\tvalue");
    }

    #[test]
    fn parse_rejects_checksum_mismatch() {
        assert!(matches!(
            parse_line("00000000\tkey\tvalue", 1),
            Err(JournalError::Malformed(_))
        ));
    }

    #[test]
    fn append_rejects_invalid_records() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().join("journal"));

        assert!(matches!(
            journal.append("a\tb", "1", false),
            Err(JournalError::InvalidArgument(_))
        ));
        assert!(matches!(
            journal.append("a", "1\n2", false),
            Err(JournalError::InvalidArgument(_))
        ));
        assert!(matches!(
            journal.append("a", TOMBSTONE, false),
            Err(JournalError::InvalidArgument(_))
        ));
    }

    #[test]
    fn duplicates_factor_must_be_at_least_one() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Journal::with_limits(dir.path().join("journal"), 0.5, 0),
            Err(JournalError::InvalidArgument(_))
        ));
    }

    #[test]
    fn append_reload_records_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");

        let journal = Journal::new(&path);
        journal.create_empty().unwrap();
        journal.append("a", "1", false).unwrap();
        journal.append("b", "2", false).unwrap();
        journal.append("a", "3", true).unwrap();
        let before = journal.records();

        let reloaded = Journal::new(&path);
        reloaded.load(false).unwrap();
        assert_eq!(reloaded.records(), before);

        reloaded.load(false).unwrap();
        assert_eq!(reloaded.records(), before);
    }

    #[test]
    fn load_with_recover_skips_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");

        let journal = Journal::new(&path);
        journal.create_empty().unwrap();
        journal.append("a", "1", true).unwrap();

        // emulate a torn append
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"garbage-no-tab\n00000000\tx\ty\n").unwrap();
        drop(file);

        let broken = Journal::new(&path);
        assert!(broken.load(false).is_err());
        broken.load(true).unwrap();
        assert_eq!(broken.records(), records(&[("a", "1")]));
    }

    #[test]
    fn flush_compacts_once_over_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");

        let journal = Journal::with_limits(&path, 2.0, 64).unwrap();
        journal.create_empty().unwrap();
        for i in 0..20 {
            journal.append("a", &i.to_string(), true).unwrap();
            journal.append("b", &i.to_string(), true).unwrap();
        }

        let contents = fs::read_to_string(&path).unwrap();
        let lines = contents.lines().count();
        assert!(lines < 40, "journal should have been compacted ({lines} lines)");

        journal.check_consistent().unwrap();
        assert_eq!(journal.get("a").as_deref(), Some("19"));
        assert_eq!(journal.get("b").as_deref(), Some("19"));
    }

    #[test]
    fn bulk_drop_tombstones_every_key() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().join("journal"));
        journal.create_empty().unwrap();
        journal.append("a", "1", false).unwrap();
        journal.append("b", "2", false).unwrap();
        journal.append("c", "3", true).unwrap();

        let keys: BTreeSet<String> = ["a", "c"].iter().map(|s| (*s).to_string()).collect();
        journal.drop_keys(&keys, true).unwrap();

        assert_eq!(journal.records(), records(&[("b", "2")]));
        assert_eq!(journal.get("a"), None);
    }

    #[test]
    fn check_consistent_detects_divergence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");

        let journal = Journal::new(&path);
        journal.create_empty().unwrap();
        journal.append("a", "1", true).unwrap();
        journal.check_consistent().unwrap();

        // out-of-band truncation diverges file from RAM
        fs::write(&path, "").unwrap();
        assert!(matches!(
            journal.check_consistent(),
            Err(JournalError::IllegalState(_))
        ));
    }

    #[test]
    fn check_existing_reports_missing_parent() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().join("missing").join("journal"));
        assert!(matches!(
            journal.check_existing(true, true),
            Err(JournalError::NotFound(_))
        ));
    }
}
