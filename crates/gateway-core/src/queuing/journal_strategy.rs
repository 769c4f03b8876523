//! Durable queuing strategy backed by an index journal and
//! content-addressed buffer files.
//!
//! Directory layout under the root:
//! - `index` — a [`Journal`] whose keys are buffer names (SHA-1 hex) and
//!   whose values are hex byte offsets of the next unconsumed entry; a
//!   tombstone retires the buffer.
//! - one file per buffer, named by the SHA-1 of its bytes,
//! - `data.tmp` — the in-flight push being written through [`SafeWriter`].

use super::buffer::{Entry, FileBuffer, format_entries, is_buffer_name};
use super::{QueuingStrategy, StrategyError};
use crate::io::{SafeWriter, WriteError};
use crate::journal::Journal;
use gw_protocol::SensorData;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub(crate) struct ScanOutcome {
    pub newest: Option<u64>,
    /// Buffers whose content no longer hashes to their name.
    pub broken: Vec<(String, u64)>,
}

// ---------------------------------------------------------------------------
// JournalQueuingStrategy
// ---------------------------------------------------------------------------

pub struct JournalQueuingStrategy {
    root_dir: PathBuf,
    gc_disabled: bool,
    never_drop_oldest: bool,
    bytes_limit: Option<u64>,
    ignore_index_errors: bool,
    index: Option<Journal>,
    /// Live buffers, oldest first, each with its next read offset.
    buffers: VecDeque<FileBuffer>,
    /// Fully read buffers awaiting their tombstone on pop.
    exhausted: HashMap<String, FileBuffer>,
    /// Read-ahead of parsed entries, the source of stable peeks.
    entry_cache: VecDeque<Entry>,
}

impl JournalQueuingStrategy {
    pub fn new(root_dir: impl Into<PathBuf>) -> JournalQueuingStrategy {
        JournalQueuingStrategy {
            root_dir: root_dir.into(),
            gc_disabled: false,
            never_drop_oldest: false,
            bytes_limit: None,
            ignore_index_errors: true,
            index: None,
            buffers: VecDeque::new(),
            exhausted: HashMap::new(),
            entry_cache: VecDeque::new(),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn set_gc_disabled(&mut self, disabled: bool) {
        self.gc_disabled = disabled;
    }

    pub fn set_never_drop_oldest(&mut self, never: bool) {
        self.never_drop_oldest = never;
    }

    /// Soft cap on the bytes the root directory may hold; `None` = no cap.
    pub fn set_bytes_limit(&mut self, limit: Option<u64>) {
        self.bytes_limit = limit;
    }

    pub fn set_ignore_index_errors(&mut self, ignore: bool) {
        self.ignore_index_errors = ignore;
    }

    /// Initialize the directory, load the index and register its buffers.
    /// Broken buffers are dropped from the index and their files removed.
    pub fn setup(&mut self) -> Result<(), StrategyError> {
        let outcome = self.init_index_and_scan()?;

        for (name, _) in &outcome.broken {
            warn!(buffer = %name, "dropping broken buffer");
            self.index()?.drop_key(name, false)?;
            whipe_file(&self.path_to(name));
        }
        self.index()?.flush()?;

        self.report_stats(outcome.newest);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Setup internals (shared with the recoverable variant)
    // -----------------------------------------------------------------------

    pub(crate) fn init_index_and_scan(&mut self) -> Result<ScanOutcome, StrategyError> {
        self.buffers.clear();
        self.exhausted.clear();
        self.entry_cache.clear();

        fs::create_dir_all(&self.root_dir)?;

        let index = Journal::new(self.path_to("index"));
        if index.create_empty()? {
            info!(path = %index.path().display(), "empty index created");
        } else {
            info!(path = %index.path().display(), "loading index");
            index.check_existing(false, true)?;
            index.load(self.ignore_index_errors)?;
        }
        self.index = Some(index);

        let mut newest = None;
        let mut broken = Vec::new();

        let records = self.index()?.records();
        for record in records {
            let name = record.key;

            if !is_buffer_name(&name) {
                warn!(buffer = %name, "unexpected buffer name, dropping");
                self.index()?.drop_key(&name, false)?;
                continue;
            }

            let Ok(offset) = u64::from_str_radix(&record.value, 16) else {
                warn!(buffer = %name, offset = %record.value, "unparseable offset, dropping");
                self.index()?.drop_key(&name, false)?;
                continue;
            };

            if let Err(e) = self.inspect_and_register(&name, offset, &mut newest) {
                warn!(buffer = %name, error = %e, "buffer failed inspection");
                broken.push((name, offset));
            }
        }

        Ok(ScanOutcome { newest, broken })
    }

    /// Verify a buffer file against its name and add it to the live list.
    pub(crate) fn inspect_and_register(
        &mut self,
        name: &str,
        offset: u64,
        newest: &mut Option<u64>,
    ) -> Result<(), StrategyError> {
        let path = self.path_to(name);
        let size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                // non-recoverable, just skip it
                warn!(buffer = %name, error = %e, "cannot stat buffer, dropping");
                self.index()?.drop_key(name, false)?;
                return Ok(());
            }
        };

        let buffer = FileBuffer::new(path, offset, size);
        debug!(buffer = %buffer.name(), offset, "inspecting buffer");
        let stat = buffer.inspect_and_verify(name)?;

        info!(
            buffer = %buffer.name(),
            offset,
            bytes = stat.bytes,
            entries = stat.count,
            broken = stat.broken,
            period = %period_string(stat.oldest, stat.newest),
            "registering buffer"
        );
        self.register_live(buffer);

        if let Some(ts) = stat.newest {
            *newest = Some(newest.map_or(ts, |n| n.max(ts)));
        }
        Ok(())
    }

    pub(crate) fn register_live(&mut self, buffer: FileBuffer) {
        if self.buffers.iter().any(|b| b.name() == buffer.name()) {
            debug!(buffer = %buffer.name(), "ignoring duplicate registration");
            return;
        }
        if buffer.exhausted() {
            self.exhausted.insert(buffer.name().to_string(), buffer);
        } else {
            self.buffers.push_back(buffer);
        }
    }

    pub(crate) fn index(&self) -> Result<&Journal, StrategyError> {
        self.index
            .as_ref()
            .ok_or_else(|| StrategyError::IllegalState("strategy is not set up".into()))
    }

    pub(crate) fn path_to(&self, name: &str) -> PathBuf {
        self.root_dir.join(name)
    }

    pub(crate) fn collect_referenced(&self) -> HashSet<String> {
        self.buffers
            .iter()
            .map(|b| b.name().to_string())
            .chain(self.exhausted.keys().cloned())
            .collect()
    }

    pub(crate) fn report_stats(&self, newest: Option<u64>) {
        info!(
            used = self.bytes_used(),
            total = self.bytes_used_all().unwrap_or(0),
            newest = %ts_string(newest),
            "queue storage ready"
        );
    }

    // -----------------------------------------------------------------------
    // Size accounting and space recovery
    // -----------------------------------------------------------------------

    fn over_limit(&self, bytes: u64) -> bool {
        self.bytes_limit.is_some_and(|limit| bytes >= limit)
    }

    /// Bytes held by live (unconsumed) buffers plus the index.
    fn bytes_used(&self) -> u64 {
        let buffers: u64 = self
            .buffers
            .iter()
            .filter(|b| !b.exhausted())
            .map(FileBuffer::size)
            .sum();
        let index = fs::metadata(self.path_to("index"))
            .map(|m| m.len())
            .unwrap_or(0);
        buffers + index
    }

    /// Bytes held by everything the strategy owns in the root directory.
    fn bytes_used_all(&self) -> Result<u64, StrategyError> {
        let mut total = 0;
        for entry in fs::read_dir(&self.root_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let counted = is_buffer_name(&name)
                || name == "index"
                || name == "index.lock"
                || name == "data.tmp";
            if !counted {
                continue;
            }
            match entry.metadata() {
                Ok(meta) => total += meta.len(),
                Err(e) => warn!(file = %name, error = %e, "cannot stat file"),
            }
        }
        Ok(total)
    }

    /// Delete orphan buffers (on disk but not referenced) to make room for
    /// `bytes` more.  True when enough space is available afterwards.
    fn garbage_collect(&mut self, bytes: u64) -> Result<bool, StrategyError> {
        let used = self.bytes_used_all()?;
        if !self.over_limit(used + bytes) {
            return Ok(true);
        }

        if self.gc_disabled {
            warn!(requested = used + bytes, "GC is disabled while over limit");
            return Ok(false);
        }

        warn!(requested = used + bytes, "running GC, over limit");

        let referenced = self.collect_referenced();
        let mut dangling: BTreeMap<(u64, String), PathBuf> = BTreeMap::new();
        let mut total = 0;

        for entry in fs::read_dir(&self.root_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_buffer_name(&name) || referenced.contains(&name) {
                continue;
            }
            match entry.metadata() {
                Ok(meta) => {
                    total += meta.len();
                    dangling.insert((meta.len(), name), entry.path());
                }
                Err(e) => warn!(file = %name, error = %e, "cannot stat dangling buffer"),
            }
        }

        info!(count = dangling.len(), bytes = total, "found dangling buffers");

        let mut removed = 0;
        // biggest first
        for ((size, _), path) in dangling.into_iter().rev() {
            if !self.over_limit(used + bytes - removed) {
                break;
            }
            if whipe_file(&path) {
                removed += size;
            }
        }

        info!(removed, requested = bytes, "GC finished");
        Ok(removed >= bytes)
    }

    /// Last resort below the byte cap: drop the oldest live buffers that
    /// have no unacked peeks.
    fn drop_oldest_buffers(&mut self, bytes: u64) {
        if self.never_drop_oldest {
            warn!(requested = bytes, "dropping oldest buffers is disabled");
            return;
        }

        warn!(requested = bytes, "dropping oldest buffers");

        let non_droppable: HashSet<String> = self
            .entry_cache
            .iter()
            .map(|e| e.buffer.clone())
            .chain(self.exhausted.keys().cloned())
            .collect();

        let mut removed = 0;
        let mut dropped: HashSet<String> = HashSet::new();

        for buffer in &self.buffers {
            if removed >= bytes {
                break;
            }
            if non_droppable.contains(buffer.name()) {
                debug!(buffer = %buffer.name(), "must not drop");
                continue;
            }
            if whipe_file(buffer.path()) {
                removed += buffer.size();
                if let Ok(index) = self.index() {
                    if let Err(e) = index.drop_key(buffer.name(), true) {
                        warn!(buffer = %buffer.name(), error = %e, "cannot tombstone dropped buffer");
                    }
                }
                dropped.insert(buffer.name().to_string());
            }
        }

        self.buffers.retain(|b| !dropped.contains(b.name()));
        info!(removed, requested = bytes, "dropped oldest buffers");
    }

    // -----------------------------------------------------------------------
    // Entry plumbing
    // -----------------------------------------------------------------------

    fn write_data(&self, data: &str) -> Result<String, StrategyError> {
        let mut writer = SafeWriter::new(self.path_to("data.tmp"));
        writer.stream(true)?;
        writer.write_all(data.as_bytes())?;
        let (digest, bytes) = writer.finalize()?;

        if bytes != data.len() as u64 {
            return Err(WriteError::WriteFile(format!(
                "written {bytes} B out of {} B",
                data.len()
            ))
            .into());
        }

        writer.commit_as(&self.path_to(&digest))?;
        Ok(digest)
    }

    fn read_entries(
        &mut self,
        count: usize,
        mut proc: impl FnMut(Entry),
    ) -> Result<usize, StrategyError> {
        let mut total = 0;

        while total < count {
            let Some(front) = self.buffers.front_mut() else {
                break;
            };

            let before = front.offset();
            debug!(buffer = %front.name(), want = count - total, "reading entries");
            total += front.read_entries(count - total, &mut proc)?;

            if front.exhausted() {
                // keep it around — it still needs its tombstone on pop
                let buffer = self.buffers.pop_front().unwrap_or_else(|| unreachable!());
                self.exhausted.insert(buffer.name().to_string(), buffer);
                continue;
            }

            if self.buffers.front().is_some_and(|b| b.offset() == before) {
                // a damaged region it cannot advance past
                break;
            }
        }

        Ok(total)
    }

    fn precache_entries(&mut self, count: usize) -> Result<usize, StrategyError> {
        let mut fresh = Vec::new();
        let total = self.read_entries(count, |entry| fresh.push(entry))?;
        self.entry_cache.extend(fresh);
        debug!(precached = total, requested = count, "precache");
        Ok(total)
    }
}

impl QueuingStrategy for JournalQueuingStrategy {
    fn empty(&mut self) -> bool {
        if !self.entry_cache.is_empty() {
            return false;
        }
        match self.precache_entries(1) {
            Ok(n) => n == 0,
            Err(e) => {
                warn!(error = %e, "cannot read queued entries");
                true
            }
        }
    }

    fn push(&mut self, data: &[SensorData]) -> Result<(), StrategyError> {
        let buffer = format_entries(data);

        if !self.garbage_collect(buffer.len() as u64)? {
            self.drop_oldest_buffers(buffer.len() as u64);
        }

        let name = self.write_data(&buffer)?;
        self.index()?.append(&name, "0", true)?;
        self.register_live(FileBuffer::new(
            self.path_to(&name),
            0,
            buffer.len() as u64,
        ));
        Ok(())
    }

    fn peek(&mut self, out: &mut Vec<SensorData>, count: usize) -> Result<usize, StrategyError> {
        let missing = count.saturating_sub(self.entry_cache.len());
        if missing > 0 {
            self.precache_entries(missing)?;
        }

        let total = count.min(self.entry_cache.len());
        out.extend(self.entry_cache.iter().take(total).map(|e| e.data.clone()));
        debug!(peeked = total, requested = count, "peek");
        Ok(total)
    }

    fn pop(&mut self, count: usize) -> Result<(), StrategyError> {
        // highest next-offset per source buffer
        let mut status: BTreeMap<String, u64> = BTreeMap::new();
        let mut update = |buffer: &str, next_offset: u64| {
            status
                .entry(buffer.to_string())
                .and_modify(|o| *o = (*o).max(next_offset))
                .or_insert(next_offset);
        };

        let cache_count = count.min(self.entry_cache.len());
        for entry in self.entry_cache.iter().take(cache_count) {
            update(&entry.buffer, entry.next_offset);
        }

        let mut total = cache_count;
        if count > cache_count {
            let mut extra = Vec::new();
            total += self.read_entries(count - cache_count, |entry| extra.push(entry))?;
            for entry in &extra {
                update(&entry.buffer, entry.next_offset);
            }
        }
        debug!(popped = total, requested = count, "pop");

        for (name, offset) in status {
            debug!(buffer = %name, offset, "advancing buffer");
            // retire a buffer only once the pop consumed its last entry;
            // before that, peeked-but-unpopped entries still live in it
            let consumed = self
                .exhausted
                .get(&name)
                .is_some_and(|b| offset >= b.size());
            if consumed {
                self.exhausted.remove(&name);
                self.index()?.drop_key(&name, true)?;
                whipe_file(&self.path_to(&name));
            } else {
                self.index()?.append(&name, &format!("{offset:X}"), true)?;
            }
        }

        self.entry_cache.drain(..cache_count);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Best-effort file removal; false when it could not be removed.
pub(crate) fn whipe_file(path: &Path) -> bool {
    debug!(path = %path.display(), "removing file");
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot remove file");
            false
        }
    }
}

pub(crate) fn ts_string(us: Option<u64>) -> String {
    match us.and_then(|us| chrono::DateTime::from_timestamp_micros(us as i64)) {
        Some(t) => t.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
        None => "none".to_string(),
    }
}

fn period_string(oldest: Option<u64>, newest: Option<u64>) -> String {
    format!("{}..{}", ts_string(oldest), ts_string(newest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_protocol::{DeviceID, SensorValue};
    use sha1::{Digest, Sha1};

    fn sample(n: u64) -> SensorData {
        SensorData::new(
            DeviceID::from_raw(0x4100_0000_0000_0000 + n),
            1_527_660_187_000_000 + n,
            vec![SensorValue::new(0, n as f64)],
        )
    }

    fn digest_of(content: &str) -> String {
        Sha1::digest(content.as_bytes())
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    fn seed_buffer(root: &Path, data: &[SensorData]) -> String {
        let content = format_entries(data);
        let name = digest_of(&content);
        fs::write(root.join(&name), &content).unwrap();
        name
    }

    fn seed_index(root: &Path, names: &[&str]) {
        let index = Journal::new(root.join("index"));
        index.create_empty().unwrap();
        for name in names {
            index.append(name, "0", true).unwrap();
        }
    }

    #[test]
    fn setup_from_scratch_creates_an_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut strategy = JournalQueuingStrategy::new(dir.path());
        strategy.setup().unwrap();

        assert!(dir.path().join("index").exists());
        assert!(strategy.empty());
    }

    #[test]
    fn setup_registers_existing_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let name = seed_buffer(dir.path(), &[sample(1), sample(2)]);
        seed_index(dir.path(), &[&name]);

        let mut strategy = JournalQueuingStrategy::new(dir.path());
        strategy.setup().unwrap();
        assert!(!strategy.empty());

        let mut out = Vec::new();
        assert_eq!(strategy.peek(&mut out, 10).unwrap(), 2);
        assert_eq!(out, vec![sample(1), sample(2)]);
    }

    #[test]
    fn setup_drops_broken_buffers_and_whipes_their_files() {
        let dir = tempfile::tempdir().unwrap();
        let good = seed_buffer(dir.path(), &[sample(1)]);

        // truncated content no longer hashes to its name
        let content = format_entries(&[sample(2), sample(3)]);
        let broken = digest_of(&content);
        fs::write(dir.path().join(&broken), &content[..content.len() / 2]).unwrap();

        seed_index(dir.path(), &[&broken, &good]);

        let mut strategy = JournalQueuingStrategy::new(dir.path());
        strategy.setup().unwrap();

        assert!(!dir.path().join(&broken).exists());
        assert!(strategy.index().unwrap().get(&broken).is_none());
        assert_eq!(strategy.index().unwrap().get(&good).as_deref(), Some("0"));
    }

    #[test]
    fn push_writes_a_content_named_buffer_and_indexes_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut strategy = JournalQueuingStrategy::new(dir.path());
        strategy.setup().unwrap();

        strategy.push(&[sample(1), sample(2)]).unwrap();

        let content = format_entries(&[sample(1), sample(2)]);
        let name = digest_of(&content);
        assert_eq!(fs::read_to_string(dir.path().join(&name)).unwrap(), content);
        assert_eq!(strategy.index().unwrap().get(&name).as_deref(), Some("0"));
        assert!(!dir.path().join("data.tmp").exists());
    }

    #[test]
    fn push_replaces_a_stale_data_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let mut strategy = JournalQueuingStrategy::new(dir.path());
        strategy.setup().unwrap();

        fs::write(dir.path().join("data.tmp"), b"leftover").unwrap();
        strategy.push(&[sample(1)]).unwrap();
        assert!(!dir.path().join("data.tmp").exists());
    }

    #[test]
    fn repeated_peek_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let a = seed_buffer(dir.path(), &[sample(1), sample(2), sample(3)]);
        let b = seed_buffer(dir.path(), &[sample(4), sample(5)]);
        seed_index(dir.path(), &[&a, &b]);

        let mut strategy = JournalQueuingStrategy::new(dir.path());
        strategy.setup().unwrap();

        for want in 1..=5 {
            let mut out = Vec::new();
            assert_eq!(strategy.peek(&mut out, want).unwrap(), want);
            for (i, data) in out.iter().enumerate() {
                assert_eq!(*data, sample(i as u64 + 1));
            }
        }

        let mut out = Vec::new();
        assert_eq!(strategy.peek(&mut out, 6).unwrap(), 5);
    }

    #[test]
    fn pop_advances_offsets_and_tombstones_exhausted_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let a = seed_buffer(dir.path(), &[sample(1), sample(2)]);
        let b = seed_buffer(dir.path(), &[sample(3)]);
        seed_index(dir.path(), &[&a, &b]);

        let mut strategy = JournalQueuingStrategy::new(dir.path());
        strategy.setup().unwrap();

        let mut out = Vec::new();
        strategy.peek(&mut out, 3).unwrap();
        strategy.pop(1).unwrap();

        // first buffer has an advanced offset recorded, still live
        let offset = strategy.index().unwrap().get(&a).unwrap();
        assert_ne!(offset, "0");
        assert!(dir.path().join(&a).exists());

        // popping the rest retires both buffers
        strategy.pop(2).unwrap();
        assert!(strategy.index().unwrap().get(&a).is_none());
        assert!(strategy.index().unwrap().get(&b).is_none());
        assert!(!dir.path().join(&a).exists());
        assert!(!dir.path().join(&b).exists());
        assert!(strategy.empty());
    }

    #[test]
    fn peek_after_pop_continues_where_pop_left_off() {
        let dir = tempfile::tempdir().unwrap();
        let mut strategy = JournalQueuingStrategy::new(dir.path());
        strategy.setup().unwrap();
        strategy
            .push(&[sample(1), sample(2), sample(3), sample(4)])
            .unwrap();

        let mut all = Vec::new();
        strategy.peek(&mut all, 4).unwrap();
        strategy.pop(2).unwrap();

        let mut rest = Vec::new();
        assert_eq!(strategy.peek(&mut rest, 2).unwrap(), 2);
        assert_eq!(rest.as_slice(), &all[2..4]);
    }

    #[test]
    fn restart_resumes_from_the_recorded_offset() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut strategy = JournalQueuingStrategy::new(dir.path());
            strategy.setup().unwrap();
            strategy.push(&[sample(1), sample(2), sample(3)]).unwrap();
            let mut out = Vec::new();
            strategy.peek(&mut out, 2).unwrap();
            strategy.pop(2).unwrap();
        }

        let mut strategy = JournalQueuingStrategy::new(dir.path());
        strategy.setup().unwrap();
        let mut out = Vec::new();
        assert_eq!(strategy.peek(&mut out, 10).unwrap(), 1);
        assert_eq!(out, vec![sample(3)]);
    }

    #[test]
    fn gc_removes_dangling_buffers_to_make_room() {
        let dir = tempfile::tempdir().unwrap();
        let live = seed_buffer(dir.path(), &[sample(1)]);
        // dangling: on disk but not in the index
        let dangling = seed_buffer(dir.path(), &[sample(2), sample(3)]);
        seed_index(dir.path(), &[&live]);

        let mut strategy = JournalQueuingStrategy::new(dir.path());
        strategy.set_bytes_limit(Some(400));
        strategy.setup().unwrap();

        strategy.push(&[sample(4)]).unwrap();

        assert!(!dir.path().join(&dangling).exists());
        assert!(dir.path().join(&live).exists());
    }

    #[test]
    fn over_limit_without_gc_drops_oldest_live_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let oldest = seed_buffer(dir.path(), &[sample(1)]);
        seed_index(dir.path(), &[&oldest]);

        let mut strategy = JournalQueuingStrategy::new(dir.path());
        strategy.set_gc_disabled(true);
        strategy.set_bytes_limit(Some(250));
        strategy.setup().unwrap();

        strategy.push(&[sample(2)]).unwrap();

        assert!(!dir.path().join(&oldest).exists());
        assert!(strategy.index().unwrap().get(&oldest).is_none());
    }

    #[test]
    fn never_drop_oldest_keeps_old_buffers_even_over_limit() {
        let dir = tempfile::tempdir().unwrap();
        let oldest = seed_buffer(dir.path(), &[sample(1)]);
        seed_index(dir.path(), &[&oldest]);

        let mut strategy = JournalQueuingStrategy::new(dir.path());
        strategy.set_gc_disabled(true);
        strategy.set_never_drop_oldest(true);
        strategy.set_bytes_limit(Some(250));
        strategy.setup().unwrap();

        strategy.push(&[sample(2)]).unwrap();
        assert!(dir.path().join(&oldest).exists());
    }
}
