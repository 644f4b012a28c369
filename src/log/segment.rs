//! One segment file: a memory-mapped writer for the current segment, a
//! read-only memory-mapped reader for rolled segments, and the naming
//! scheme tying both to a roll cycle.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};

use crate::config::RollCycle;
use crate::error::Result;
use crate::log::record;

/// Default capacity pre-allocated for a new segment's memory mapping. The
/// file is truncated down to the bytes actually written when the segment
/// rolls.
pub const DEFAULT_SEGMENT_CAPACITY: u64 = 64 * 1024 * 1024;

/// Days-from-civil (Howard Hinnant's algorithm), used to turn a Unix
/// timestamp into the `YYYYMMDD`/`YYYYMMDDHH` fragment embedded in segment
/// file names without pulling in a calendar dependency the teacher stack
/// doesn't already carry.
fn civil_from_unix(seconds: i64) -> (i64, u32, u32, u32) {
    let days = seconds.div_euclid(86_400);
    let secs_of_day = seconds.rem_euclid(86_400);
    let hour = (secs_of_day / 3600) as u32;

    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let y = if m <= 2 { y + 1 } else { y };

    (y, m, d, hour)
}

/// Formats the roll-cycle fragment of a segment file name for the given
/// Unix timestamp (seconds).
pub fn roll_fragment(roll_cycle: RollCycle, unix_secs: i64) -> String {
    let (y, m, d, h) = civil_from_unix(unix_secs);
    match roll_cycle {
        RollCycle::Daily => format!("{y:04}{m:02}{d:02}"),
        RollCycle::Hourly => format!("{y:04}{m:02}{d:02}{h:02}"),
    }
}

/// Builds the on-disk segment file name: `{cache_name}-{fragment}-{seq}.seg`.
pub fn segment_file_name(cache_name: &str, roll_cycle: RollCycle, unix_secs: i64, seq: u64) -> String {
    format!("{cache_name}-{}-{seq}.seg", roll_fragment(roll_cycle, unix_secs))
}

/// Scans `data` forward from the start, returning the length of the longest
/// prefix consisting of whole, valid frames. Used both to find where a
/// newly-opened writer should resume and to truncate a torn tail on crash
/// recovery.
pub fn scan_valid_length(data: &[u8]) -> u64 {
    let mut offset = 0usize;
    loop {
        match record::parse(&data[offset..], offset as u64) {
            Ok(parsed) => offset += parsed.consumed,
            Err(_) => break,
        }
    }
    offset as u64
}

/// The current, writable segment. Memory-mapped so appends are plain memory
/// copies; a forced sync happens on roll and on explicit `flush`.
pub struct SegmentWriter {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    capacity: u64,
    cursor: u64,
}

impl SegmentWriter {
    /// Creates a new segment file pre-allocated to `capacity` bytes and maps
    /// it for writing.
    pub fn create(path: impl Into<PathBuf>, capacity: u64) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path)?;
        file.set_len(capacity)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { path, file, mmap, capacity, cursor: 0 })
    }

    /// Reopens an existing segment file (e.g. across a restart), scanning
    /// forward to find the valid prefix and resuming the write cursor there.
    /// Anything past the valid prefix is a torn tail and is overwritten by
    /// the next append.
    pub fn reopen(path: impl Into<PathBuf>, capacity: u64) -> Result<(Self, u64)> {
        let path = path.into();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let current_len = file.metadata()?.len();
        if current_len < capacity {
            file.set_len(capacity)?;
        }
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let valid_len = scan_valid_length(&mmap[..current_len.min(capacity) as usize]);
        let truncated = current_len.saturating_sub(valid_len);
        Ok((Self { path, file, mmap, capacity: capacity.max(current_len), cursor: valid_len }, truncated))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn remaining(&self) -> u64 {
        self.capacity - self.cursor
    }

    /// Appends an already-framed record (length + crc + body). Returns the
    /// byte offset the record was written at within this segment.
    pub fn append(&mut self, framed: &[u8]) -> Result<u64> {
        let offset = self.cursor;
        let end = offset + framed.len() as u64;
        if end > self.capacity {
            return Err(crate::error::PipelineError::SegmentFull);
        }
        self.mmap[offset as usize..end as usize].copy_from_slice(framed);
        self.cursor = end;
        Ok(offset)
    }

    /// Forces the mapped pages to disk.
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }

    /// Finalizes the segment: flush, truncate the backing file down to the
    /// bytes actually written, and fsync the directory entry. The segment is
    /// now immutable and ready to be opened read-only.
    pub fn finalize(self) -> Result<()> {
        self.mmap.flush()?;
        self.file.set_len(self.cursor)?;
        self.file.sync_all()?;
        fsync_parent_dir(&self.path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn fsync_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        let dir = File::open(parent)?;
        dir.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn fsync_parent_dir(_path: &Path) -> Result<()> {
    Ok(())
}

/// A read-only, memory-mapped view of a rolled (immutable) segment.
pub struct SegmentReader {
    mmap: Mmap,
    pub start_index: u64,
}

impl SegmentReader {
    pub fn open(path: impl AsRef<Path>, start_index: u64) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self { mmap, start_index })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.mmap
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_and_finalize_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg-0.seg");
        let mut writer = SegmentWriter::create(&path, 4096).unwrap();
        let off0 = writer.append(&record::frame(b"one")).unwrap();
        let off1 = writer.append(&record::frame(b"two")).unwrap();
        assert_eq!(off0, 0);
        assert!(off1 > off0);
        writer.finalize().unwrap();

        let reader = SegmentReader::open(&path, 0).unwrap();
        let p0 = record::parse(reader.bytes(), 0).unwrap();
        assert_eq!(p0.body, b"one");
        let p1 = record::parse(&reader.bytes()[p0.consumed..], 1).unwrap();
        assert_eq!(p1.body, b"two");
        assert_eq!(reader.len() as u64, off1 + record::frame(b"two").len() as u64);
    }

    #[test]
    fn reopen_after_torn_tail_truncates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg-0.seg");
        {
            let mut writer = SegmentWriter::create(&path, 4096).unwrap();
            writer.append(&record::frame(b"good")).unwrap();
            writer.flush().unwrap();
            // Simulate a torn write: corrupt a byte just past the good frame.
            let torn_offset = record::frame(b"good").len();
            writer.mmap[torn_offset] = 0xFF;
            writer.mmap[torn_offset + 1] = 0xFF;
            writer.mmap[torn_offset + 2] = 0xFF;
            writer.mmap[torn_offset + 3] = 0xFF;
            writer.cursor = (torn_offset + 20) as u64;
            writer.flush().unwrap();
            writer.file.set_len(writer.cursor).unwrap();
        }
        let (writer, _truncated) = SegmentWriter::reopen(&path, 4096).unwrap();
        assert_eq!(writer.cursor(), record::frame(b"good").len() as u64);
    }

    #[test]
    fn segment_full_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg-0.seg");
        let mut writer = SegmentWriter::create(&path, 8).unwrap();
        let framed = record::frame(b"too long for this segment");
        let err = writer.append(&framed).unwrap_err();
        assert!(matches!(err, crate::error::PipelineError::SegmentFull));
    }

    #[test]
    fn name_pattern_daily_vs_hourly() {
        // 2024-03-05 13:00:00 UTC
        let ts = 1_709_644_800 + 13 * 3600;
        assert_eq!(segment_file_name("cache", RollCycle::Daily, ts, 0), "cache-20240305-0.seg");
        assert_eq!(segment_file_name("cache", RollCycle::Hourly, ts, 0), "cache-2024030513-0.seg");
    }
}
