//! Content-addressed buffer files.
//!
//! A buffer is named by the lowercase SHA-1 hex of its bytes and holds a
//! line-oriented sequence of CRC-protected serialized readings:
//! `<crc32:8 hex>\t<SensorData JSON>\n`.  Buffers are immutable once
//! committed; the index journal tracks how far each one has been consumed.

use super::StrategyError;
use gw_protocol::SensorData;
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::warn;

// ---------------------------------------------------------------------------
// Entry formatting / parsing
// ---------------------------------------------------------------------------

/// Serialize a batch into the buffer line format.
pub fn format_entries(data: &[SensorData]) -> String {
    let mut out = String::new();
    for one in data {
        // the JSON shape is infallible to serialize
        let json = serde_json::to_string(one).unwrap_or_default();
        out.push_str(&format!("{:08X}\t{json}\n", crc32fast::hash(json.as_bytes())));
    }
    out
}

/// Parse one buffer line, verifying its CRC.
pub fn parse_entry(line: &str) -> Result<SensorData, StrategyError> {
    let (checksum, json) = line
        .split_once('\t')
        .ok_or_else(|| StrategyError::Malformed("missing checksum prefix".into()))?;

    let expected = u32::from_str_radix(checksum, 16)
        .map_err(|_| StrategyError::Malformed("expected hexadecimal checksum".into()))?;
    let computed = crc32fast::hash(json.as_bytes());
    if computed != expected {
        return Err(StrategyError::Malformed(format!(
            "checksum mismatch: {expected:08X} != {computed:08X}"
        )));
    }

    serde_json::from_str(json).map_err(|e| StrategyError::Malformed(e.to_string()))
}

/// True for file names shaped like a buffer (40 hex digits).
pub fn is_buffer_name(name: &str) -> bool {
    name.len() == 40 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// A parsed reading together with its source buffer and the offset right
/// after it — the offset the index records once the entry is popped.
#[derive(Debug, Clone)]
pub struct Entry {
    pub data: SensorData,
    pub buffer: String,
    pub next_offset: u64,
}

// ---------------------------------------------------------------------------
// BufferStat
// ---------------------------------------------------------------------------

/// Inspection summary of a buffer file.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferStat {
    pub bytes: u64,
    pub count: usize,
    pub broken: usize,
    /// Offset just past the last parseable entry.
    pub entries_end: u64,
    pub oldest: Option<u64>,
    pub newest: Option<u64>,
}

impl BufferStat {
    fn update(&mut self, timestamp: u64) {
        self.oldest = Some(self.oldest.map_or(timestamp, |t| t.min(timestamp)));
        self.newest = Some(self.newest.map_or(timestamp, |t| t.max(timestamp)));
    }
}

// ---------------------------------------------------------------------------
// FileBuffer
// ---------------------------------------------------------------------------

/// A live buffer with its read position.
#[derive(Debug, Clone)]
pub struct FileBuffer {
    path: PathBuf,
    name: String,
    offset: u64,
    size: u64,
}

impl FileBuffer {
    pub fn new(path: impl Into<PathBuf>, offset: u64, size: u64) -> FileBuffer {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        FileBuffer {
            path,
            name,
            offset,
            size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn exhausted(&self) -> bool {
        self.offset >= self.size
    }

    /// Read up to `count` entries from the current offset, advancing it.
    ///
    /// Stops early at the first unparseable line; the offset still advances
    /// past it so a later call resumes behind the damage.
    pub fn read_entries(
        &mut self,
        count: usize,
        mut proc: impl FnMut(Entry),
    ) -> Result<usize, StrategyError> {
        if count == 0 || self.exhausted() {
            return Ok(0);
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut reader = BufReader::new(file);

        let mut consumed = 0u64;
        let mut total = 0usize;
        let mut line = String::new();

        while total < count {
            line.clear();
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                break;
            }
            consumed += n as u64;

            let trimmed = line.trim_end_matches('\n');
            if trimmed.trim().is_empty() {
                continue;
            }

            match parse_entry(trimmed) {
                Ok(data) => {
                    proc(Entry {
                        data,
                        buffer: self.name.clone(),
                        next_offset: self.offset + consumed,
                    });
                    total += 1;
                }
                Err(_) => break,
            }
        }

        self.offset += consumed;
        Ok(total)
    }

    /// Verify that the file content hashes to its name and collect stats
    /// about the entries inside.  Scans the whole file regardless of the
    /// current read offset.
    pub fn inspect_and_verify(&self, expected_name: &str) -> Result<BufferStat, StrategyError> {
        let bytes = std::fs::read(&self.path)?;

        let digest = Sha1::digest(&bytes);
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();

        let mut stat = BufferStat::default();
        let mut pos = 0u64;
        for chunk in bytes.split_inclusive(|b| *b == b'\n') {
            pos += chunk.len() as u64;
            let line = String::from_utf8_lossy(chunk);
            let line = line.trim_end_matches('\n');
            if line.trim().is_empty() {
                continue;
            }
            match parse_entry(line) {
                Ok(data) => {
                    stat.count += 1;
                    stat.entries_end = pos;
                    stat.update(data.timestamp);
                }
                Err(_) => stat.broken += 1,
            }
        }
        stat.bytes = bytes.len() as u64;

        if !hex.eq_ignore_ascii_case(expected_name) {
            return Err(StrategyError::DigestMismatch(format!(
                "{expected_name} != {hex}"
            )));
        }

        Ok(stat)
    }
}

/// Pull every parseable entry out of a (possibly damaged) buffer file.
/// Returns the recovered readings and the number of unparseable lines.
pub fn scan_recoverable(path: &Path) -> (Vec<SensorData>, usize) {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read buffer for recovery");
            return (Vec::new(), 0);
        }
    };

    let mut data = Vec::new();
    let mut errors = 0;
    for chunk in bytes.split_inclusive(|b| *b == b'\n') {
        let line = String::from_utf8_lossy(chunk);
        let line = line.trim_end_matches('\n');
        if line.trim().is_empty() {
            continue;
        }
        match parse_entry(line) {
            Ok(entry) => data.push(entry),
            Err(_) => errors += 1,
        }
    }
    (data, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_protocol::{DeviceID, SensorValue};
    use std::fs;

    fn sample(n: u64) -> SensorData {
        SensorData::new(
            DeviceID::from_raw(0x4100_0000_0000_0000 + n),
            1_527_660_187_000_000 + n,
            vec![SensorValue::new(0, n as f64)],
        )
    }

    #[test]
    fn entries_round_trip_through_the_line_format() {
        let formatted = format_entries(&[sample(1), sample(2)]);
        let mut lines = formatted.lines();
        assert_eq!(parse_entry(lines.next().unwrap()).unwrap(), sample(1));
        assert_eq!(parse_entry(lines.next().unwrap()).unwrap(), sample(2));
    }

    #[test]
    fn parse_rejects_a_flipped_byte() {
        let formatted = format_entries(&[sample(1)]);
        let corrupted = formatted.replace("41000000", "41000001");
        assert!(parse_entry(corrupted.trim_end()).is_err());
    }

    #[test]
    fn read_entries_walks_the_file_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let content = format_entries(&[sample(1), sample(2), sample(3)]);
        let path = dir.path().join("buffer");
        fs::write(&path, &content).unwrap();

        let mut fb = FileBuffer::new(&path, 0, content.len() as u64);
        let mut seen = Vec::new();
        assert_eq!(fb.read_entries(2, |e| seen.push(e)).unwrap(), 2);
        assert_eq!(seen[0].data, sample(1));
        assert_eq!(seen[1].data, sample(2));
        assert!(!fb.exhausted());

        assert_eq!(fb.read_entries(5, |e| seen.push(e)).unwrap(), 1);
        assert_eq!(seen[2].data, sample(3));
        assert!(fb.exhausted());
    }

    #[test]
    fn next_offset_points_past_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        let content = format_entries(&[sample(1), sample(2)]);
        let path = dir.path().join("buffer");
        fs::write(&path, &content).unwrap();

        let first_line_len = content.lines().next().unwrap().len() as u64 + 1;
        let mut fb = FileBuffer::new(&path, 0, content.len() as u64);
        let mut offsets = Vec::new();
        fb.read_entries(2, |e| offsets.push(e.next_offset)).unwrap();
        assert_eq!(offsets[0], first_line_len);
        assert_eq!(offsets[1], content.len() as u64);
    }

    #[test]
    fn inspect_detects_a_renamed_file() {
        let dir = tempfile::tempdir().unwrap();
        let content = format_entries(&[sample(1)]);
        let path = dir.path().join("buffer");
        fs::write(&path, &content).unwrap();

        let fb = FileBuffer::new(&path, 0, content.len() as u64);
        let digest = Sha1::digest(content.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();

        let stat = fb.inspect_and_verify(&hex).unwrap();
        assert_eq!(stat.count, 1);
        assert_eq!(stat.broken, 0);
        assert_eq!(stat.oldest, Some(sample(1).timestamp));

        let wrong = "0000000000000000000000000000000000000000";
        assert!(matches!(
            fb.inspect_and_verify(wrong),
            Err(StrategyError::DigestMismatch(_))
        ));
    }

    #[test]
    fn scan_recoverable_salvages_the_valid_prefix_and_tail() {
        let dir = tempfile::tempdir().unwrap();
        let mut content = format_entries(&[sample(1)]);
        content.push_str("deadbeef\tnot json\n");
        content.push_str(&format_entries(&[sample(2)]));
        let path = dir.path().join("buffer");
        fs::write(&path, &content).unwrap();

        let (data, errors) = scan_recoverable(&path);
        assert_eq!(data, vec![sample(1), sample(2)]);
        assert_eq!(errors, 1);
    }
}
