//! Startup recovery for the journal-backed strategy.
//!
//! Every step is individually idempotent, so a crash during recovery leaves
//! the directory repairable by the next run:
//! 1. whipe a leftover `recover.tmp`,
//! 2. rewrite broken buffers from their parseable entries (instead of
//!    dropping them like the plain strategy does),
//! 3. adopt an interrupted `data.tmp` push as a proper buffer,
//! 4. adopt unreferenced buffers newer than the index — pushes whose index
//!    append never made it to disk.

use super::buffer::{FileBuffer, format_entries, is_buffer_name, scan_recoverable};
use super::journal_strategy::{JournalQueuingStrategy, whipe_file};
use super::{QueuingStrategy, StrategyError};
use crate::io::SafeWriter;
use gw_protocol::SensorData;
use sha1::{Digest, Sha1};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

pub struct RecoverableJournalQueuingStrategy {
    inner: JournalQueuingStrategy,
    tmp_data_recovery: bool,
    broken_recovery: bool,
    lost_recovery: bool,
}

impl RecoverableJournalQueuingStrategy {
    pub fn new(root_dir: impl Into<PathBuf>) -> RecoverableJournalQueuingStrategy {
        RecoverableJournalQueuingStrategy {
            inner: JournalQueuingStrategy::new(root_dir),
            tmp_data_recovery: true,
            broken_recovery: true,
            lost_recovery: true,
        }
    }

    pub fn set_tmp_data_recovery(&mut self, enabled: bool) {
        self.tmp_data_recovery = enabled;
    }

    pub fn set_broken_recovery(&mut self, enabled: bool) {
        self.broken_recovery = enabled;
    }

    pub fn set_lost_recovery(&mut self, enabled: bool) {
        self.lost_recovery = enabled;
    }

    pub fn set_gc_disabled(&mut self, disabled: bool) {
        self.inner.set_gc_disabled(disabled);
    }

    pub fn set_never_drop_oldest(&mut self, never: bool) {
        self.inner.set_never_drop_oldest(never);
    }

    pub fn set_bytes_limit(&mut self, limit: Option<u64>) {
        self.inner.set_bytes_limit(limit);
    }

    pub fn set_ignore_index_errors(&mut self, ignore: bool) {
        self.inner.set_ignore_index_errors(ignore);
    }

    /// Initialize like the plain strategy, then run the recovery steps.
    pub fn setup(&mut self) -> Result<(), StrategyError> {
        let index_modified = fs::metadata(self.inner.path_to("index"))
            .and_then(|m| m.modified())
            .unwrap_or_else(|_| SystemTime::now());

        let _ = fs::remove_file(self.inner.path_to("recover.tmp"));

        let outcome = self.inner.init_index_and_scan()?;
        let mut newest = outcome.newest;

        if self.broken_recovery {
            for (name, _) in &outcome.broken {
                warn!(buffer = %name, "buffer is broken");
                if let Err(e) = self.recover_broken(name, &mut newest) {
                    warn!(buffer = %name, error = %e, "broken buffer recovery failed");
                }
            }
        } else if !outcome.broken.is_empty() {
            info!(
                count = outcome.broken.len(),
                "recovery of broken buffers is disabled"
            );
        }
        self.inner.index()?.flush()?;

        if self.tmp_data_recovery {
            if let Err(e) = self.recover_tmp_data(&mut newest) {
                warn!(error = %e, "tmp data recovery failed");
            }
        } else {
            info!("recovery of data.tmp is disabled");
        }

        if self.lost_recovery {
            self.recover_lost(index_modified, newest)?;
        } else {
            info!("recovery of lost buffers is disabled");
        }

        self.inner.report_stats(newest);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Step 2: broken buffers
    // -----------------------------------------------------------------------

    fn recover_broken(&mut self, name: &str, newest: &mut Option<u64>) -> Result<(), StrategyError> {
        match self.rewrite_buffer(&self.inner.path_to(name))? {
            None => {
                // nothing parseable inside; the file is already gone
                self.inner.index()?.drop_key(name, true)?;
            }
            Some(recovered) if recovered == name => {
                warn!(
                    buffer = %name,
                    "recovered to the same digest, seems like an I/O issue - dropping"
                );
                self.inner.index()?.drop_key(name, true)?;
            }
            Some(recovered) => {
                self.inner.index()?.append(&recovered, "0", false)?;
                self.inner.index()?.drop_key(name, true)?;
                self.inner.inspect_and_register(&recovered, 0, newest)?;
            }
        }
        Ok(())
    }

    /// Rewrite whatever is parseable in `path` through `recover.tmp` into a
    /// properly content-named buffer.  Returns the resulting name, or `None`
    /// when nothing was recoverable (the file is removed in that case).
    /// When the rewrite hashes to the original name the file was actually
    /// valid and is left untouched.
    fn rewrite_buffer(&self, path: &Path) -> Result<Option<String>, StrategyError> {
        debug!(path = %path.display(), "recovering buffer");

        let (entries, errors) = scan_recoverable(path);
        let original = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if entries.is_empty() {
            info!(path = %path.display(), errors, "buffer has no recoverable entries, removing");
            whipe_file(path);
            return Ok(None);
        }

        let content = format_entries(&entries);
        let mut writer = SafeWriter::new(self.inner.path_to("recover.tmp"));
        writer.stream(true)?;
        writer.write_all(content.as_bytes())?;
        let (digest, _) = writer.finalize()?;

        if digest != original {
            writer.commit_as(&self.inner.path_to(&digest))?;
            whipe_file(path);
            warn!(
                recovered = entries.len(),
                errors,
                from = %original,
                to = %digest,
                "recovered entries into a new buffer"
            );
        } else {
            writer.reset();
            debug!(
                buffer = %digest,
                entries = entries.len(),
                "no recovery needed, the existing file is valid"
            );
        }

        Ok(Some(digest))
    }

    // -----------------------------------------------------------------------
    // Step 3: interrupted push
    // -----------------------------------------------------------------------

    fn recover_tmp_data(&mut self, newest: &mut Option<u64>) -> Result<(), StrategyError> {
        let tmp = self.inner.path_to("data.tmp");
        if !tmp.exists() {
            debug!("no tmp data file found");
            return Ok(());
        }

        warn!(path = %tmp.display(), "recovering tmp data file");

        // content-name the file first, then treat it like any other buffer
        let bytes = fs::read(&tmp)?;
        let digest: String = Sha1::digest(&bytes)
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        let committed = self.inner.path_to(&digest);

        if committed != tmp {
            debug!(from = %tmp.display(), to = %committed.display(), "fixing file name");
            if let Err(e) = fs::rename(&tmp, &committed) {
                warn!(error = %e, "cannot rename tmp data, removing it");
                whipe_file(&tmp);
                return Ok(());
            }
        }

        if let Some(name) = self.rewrite_buffer(&committed)? {
            self.inner.index()?.append(&name, "0", true)?;
            self.inner.inspect_and_register(&name, 0, newest)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Step 4: lost buffers
    // -----------------------------------------------------------------------

    fn recover_lost(
        &mut self,
        index_modified: SystemTime,
        newest: Option<u64>,
    ) -> Result<(), StrategyError> {
        let mut adopted = Vec::new();

        for path in self.collect_unreferenced()? {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let meta = match fs::metadata(&path) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(buffer = %name, error = %e, "cannot stat candidate buffer");
                    continue;
                }
            };
            if meta.modified().map(|m| m < index_modified).unwrap_or(true) {
                continue;
            }

            let buffer = FileBuffer::new(&path, 0, meta.len());
            let stat = match buffer.inspect_and_verify(&name) {
                Ok(stat) => stat,
                Err(e) => {
                    debug!(buffer = %name, error = %e, "candidate buffer is not adoptable");
                    continue;
                }
            };

            let is_newer = match (stat.oldest, newest) {
                (Some(oldest), Some(newest)) => oldest >= newest,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !is_newer {
                continue;
            }

            warn!(
                buffer = %name,
                "discovered a potentially lost buffer newer than the index"
            );
            adopted.push(buffer);
        }

        for buffer in adopted {
            self.inner.index()?.append(buffer.name(), "0", true)?;
            self.inner.register_live(buffer);
        }
        Ok(())
    }

    fn collect_unreferenced(&self) -> Result<Vec<PathBuf>, StrategyError> {
        let referenced = self.inner.collect_referenced();
        let mut files = Vec::new();

        for entry in fs::read_dir(self.inner.root_dir())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_buffer_name(&name) && !referenced.contains(&name) {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }
}

impl QueuingStrategy for RecoverableJournalQueuingStrategy {
    fn empty(&mut self) -> bool {
        self.inner.empty()
    }

    fn push(&mut self, data: &[SensorData]) -> Result<(), StrategyError> {
        self.inner.push(data)
    }

    fn peek(&mut self, out: &mut Vec<SensorData>, count: usize) -> Result<usize, StrategyError> {
        self.inner.peek(out, count)
    }

    fn pop(&mut self, count: usize) -> Result<(), StrategyError> {
        self.inner.pop(count)
    }
}
