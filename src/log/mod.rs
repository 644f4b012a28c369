//! The segmented log (C1): an append-only, segmented, memory-mappable log
//! storing atomic multi-entry batches, with indexed tailing, corruption
//! detection, and crash recovery of a torn tail.

pub mod record;
pub mod segment;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::config::{DurabilityLevel, RollCycle};
use crate::error::{PipelineError, Result};
use crate::log::segment::{SegmentReader, SegmentWriter, DEFAULT_SEGMENT_CAPACITY};

/// Where a [`Tailer`] should start reading from.
#[derive(Debug, Clone, Copy)]
pub enum Position {
    Start,
    End,
    Index(u64),
}

/// Bookkeeping for what the startup integrity check found on open.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenReport {
    /// Bytes discarded from the current segment's torn tail, if any.
    pub truncated_tail_bytes: u64,
}

struct SealedSegment {
    reader: SegmentReader,
    start_index: u64,
    end_index: u64,
}

struct LogInner {
    dir: PathBuf,
    cache_name: String,
    roll_cycle: RollCycle,
    capacity: u64,
    sealed: Vec<SealedSegment>,
    current_writer: SegmentWriter,
    current_start_index: u64,
    current_seq: u64,
    current_fragment: String,
    next_index: u64,
    pending_unflushed: usize,
}

/// Append-only, segmented, memory-mappable log of length-prefixed,
/// CRC-protected records.
pub struct SegmentedLog {
    inner: RwLock<LogInner>,
    durability: DurabilityLevel,
    stop_flush_thread: Arc<AtomicBool>,
}

fn now_unix_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

impl SegmentedLog {
    /// Opens the log directory, creating it if absent, replaying the
    /// on-disk segment chain to recover `next_index`, and scanning the
    /// current segment's tail for torn writes.
    #[instrument(skip(durability))]
    pub fn open(
        dir: impl AsRef<Path>,
        cache_name: &str,
        roll_cycle: RollCycle,
        durability: DurabilityLevel,
    ) -> Result<(Arc<Self>, OpenReport)> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|ext| ext == "seg").unwrap_or(false))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&format!("{cache_name}-")))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        let mut sealed = Vec::new();
        let mut next_index = 0u64;
        let mut report = OpenReport::default();

        for (i, path) in paths.iter().enumerate() {
            let is_last = i == paths.len() - 1;
            if !is_last {
                let start_index = next_index;
                let reader = SegmentReader::open(path, start_index)?;
                let count = count_records(reader.bytes());
                next_index += count;
                sealed.push(SealedSegment { reader, start_index, end_index: next_index });
            }
        }

        let (current_writer, current_start_index, current_seq, current_fragment) =
            if let Some(last_path) = paths.last() {
                let start_index = next_index;
                let (writer, truncated) = SegmentWriter::reopen(last_path, DEFAULT_SEGMENT_CAPACITY)?;
                report.truncated_tail_bytes = truncated;
                let record_count = count_records(&writer_bytes(&writer));
                next_index = start_index + record_count;
                let (seq, fragment) = parse_segment_name(last_path, cache_name);
                (writer, start_index, seq, fragment)
            } else {
                let fragment = segment::roll_fragment(roll_cycle, now_unix_secs());
                let name = segment::segment_file_name(cache_name, roll_cycle, now_unix_secs(), 0);
                let writer = SegmentWriter::create(dir.join(&name), DEFAULT_SEGMENT_CAPACITY)?;
                (writer, 0, 0, fragment)
            };

        if report.truncated_tail_bytes > 0 {
            warn!(bytes = report.truncated_tail_bytes, "truncated torn tail on open");
        }

        let inner = LogInner {
            dir,
            cache_name: cache_name.to_string(),
            roll_cycle,
            capacity: DEFAULT_SEGMENT_CAPACITY,
            sealed,
            current_writer,
            current_start_index,
            current_seq,
            current_fragment,
            next_index,
            pending_unflushed: 0,
        };

        let stop_flush_thread = Arc::new(AtomicBool::new(false));
        let log = Arc::new(Self { inner: RwLock::new(inner), durability, stop_flush_thread: stop_flush_thread.clone() });

        if let DurabilityLevel::Periodic { interval_ms } = durability {
            spawn_flush_thread(Arc::downgrade(&log), interval_ms, stop_flush_thread);
        }

        Ok((log, report))
    }

    /// Appends a record body, returning its assigned log index.
    #[instrument(skip(self, body))]
    pub fn append(&self, body: &[u8]) -> Result<u64> {
        let framed = record::frame(body);
        let mut inner = self.inner.write();

        let now = now_unix_secs();
        let fresh_fragment = segment::roll_fragment(inner.roll_cycle, now);
        let needs_roll = fresh_fragment != inner.current_fragment
            || inner.current_writer.remaining() < framed.len() as u64;

        if needs_roll {
            if framed.len() as u64 > inner.capacity {
                return Err(PipelineError::SegmentFull);
            }
            roll_segment(&mut inner, now)?;
        }

        let index = inner.next_index;
        inner.current_writer.append(&framed)?;
        inner.next_index += 1;
        inner.pending_unflushed += 1;

        match self.durability {
            DurabilityLevel::Synchronous => {
                inner.current_writer.flush()?;
                inner.pending_unflushed = 0;
            }
            DurabilityLevel::GroupCommit { max_batch_size, .. } => {
                if inner.pending_unflushed >= max_batch_size {
                    inner.current_writer.flush()?;
                    inner.pending_unflushed = 0;
                }
            }
            DurabilityLevel::Periodic { .. } | DurabilityLevel::NoSync => {}
        }

        debug!(index, "appended record");
        Ok(index)
    }

    /// Forces a sync of the current segment regardless of durability level.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.write();
        inner.current_writer.flush()?;
        inner.pending_unflushed = 0;
        Ok(())
    }

    pub fn last_appended_index(&self) -> Option<u64> {
        let inner = self.inner.read();
        if inner.next_index == 0 {
            None
        } else {
            Some(inner.next_index - 1)
        }
    }

    /// Opens an independent tailer positioned at `start`.
    pub fn tailer(self: &Arc<Self>, start: Position) -> Tailer {
        let next = match start {
            Position::Start => 0,
            Position::End => self.inner.read().next_index,
            Position::Index(i) => i,
        };
        Tailer { log: self.clone(), next_index: next }
    }

    /// Moves the log's own directory aside under a timestamped name and
    /// opens a fresh, empty log in its place. Used when recovery gives up on
    /// the WAL entirely and rebuilds the cache from the relational store
    /// instead: the corrupted segments must not be tailed again on the next
    /// boot.
    #[instrument(skip(self))]
    pub fn archive_and_reopen(&self) -> Result<(Arc<Self>, OpenReport)> {
        let (dir, cache_name, roll_cycle) = {
            let inner = self.inner.read();
            (inner.dir.clone(), inner.cache_name.clone(), inner.roll_cycle)
        };
        self.flush()?;

        let suffix = now_unix_secs();
        let archived = match dir.file_name().and_then(|n| n.to_str()) {
            Some(name) => dir.with_file_name(format!("{name}.corrupt-{suffix}")),
            None => dir.with_extension(format!("corrupt-{suffix}")),
        };
        std::fs::rename(&dir, &archived)?;
        warn!(from = %dir.display(), to = %archived.display(), "archived corrupted WAL directory");

        Self::open(&dir, &cache_name, roll_cycle, self.durability)
    }
}

impl Drop for SegmentedLog {
    fn drop(&mut self) {
        self.stop_flush_thread.store(true, Ordering::SeqCst);
        if let Ok(inner) = self.inner.try_write() {
            let _ = inner.current_writer.flush();
        }
    }
}

fn spawn_flush_thread(log: std::sync::Weak<SegmentedLog>, interval_ms: u64, stop: Arc<AtomicBool>) {
    std::thread::spawn(move || loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        std::thread::sleep(Duration::from_millis(interval_ms));
        match log.upgrade() {
            Some(log) => {
                if let Err(e) = log.flush() {
                    warn!(error = %e, "periodic log flush failed");
                }
            }
            None => break,
        }
    });
}

fn roll_segment(inner: &mut LogInner, now: i64) -> Result<()> {
    inner.current_writer.flush()?;
    inner.current_seq += 1;
    let fragment = segment::roll_fragment(inner.roll_cycle, now);
    let name = format!("{}-{}-{}.seg", inner.cache_name, fragment, inner.current_seq);
    let path = inner.dir.join(name);
    let new_writer = SegmentWriter::create(&path, inner.capacity)?;

    let finished_start = inner.current_start_index;
    let finished_end = inner.next_index;
    let old_writer = std::mem::replace(&mut inner.current_writer, new_writer);
    let old_path = old_writer.path().to_path_buf();
    old_writer.finalize()?;
    let reader = SegmentReader::open(&old_path, finished_start)?;
    inner.sealed.push(SealedSegment { reader, start_index: finished_start, end_index: finished_end });

    inner.current_start_index = inner.next_index;
    inner.current_fragment = fragment;
    info!(path = %path.display(), "rolled to new segment");
    Ok(())
}

fn count_records(data: &[u8]) -> u64 {
    let mut offset = 0usize;
    let mut count = 0u64;
    while offset < data.len() {
        match record::parse(&data[offset..], offset as u64) {
            Ok(parsed) => {
                offset += parsed.consumed;
                count += 1;
            }
            Err(_) => break,
        }
    }
    count
}

fn writer_bytes(writer: &SegmentWriter) -> Vec<u8> {
    use std::io::Read;
    // The writer's mapped region is private; re-read just the written prefix
    // of the file for counting/parsing purposes to keep this a plain, safe
    // byte slice without entangling a tailer's lifetime with the mmap.
    let mut buf = vec![0u8; writer.cursor() as usize];
    if let Ok(mut f) = std::fs::File::open(writer.path()) {
        let _ = f.read_exact(&mut buf);
    }
    buf
}

fn parse_segment_name(path: &Path, cache_name: &str) -> (u64, String) {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let rest = stem.strip_prefix(&format!("{cache_name}-")).unwrap_or(stem);
    match rest.rsplit_once('-') {
        Some((fragment, seq)) => (seq.parse().unwrap_or(0), fragment.to_string()),
        None => (0, rest.to_string()),
    }
}

/// An independent, positioned reader over the log.
pub struct Tailer {
    log: Arc<SegmentedLog>,
    next_index: u64,
}

impl Tailer {
    /// Returns the next record, or `None` if the tailer has caught up to the
    /// tail. Fails with `Corrupt{index, kind}` when framing or the checksum
    /// is wrong.
    #[instrument(skip(self))]
    pub fn read_next(&mut self) -> Result<Option<(u64, Vec<u8>)>> {
        let inner = self.log.inner.read();
        if self.next_index >= inner.next_index {
            return Ok(None);
        }

        let index = self.next_index;
        if index >= inner.current_start_index {
            let byte_offset = offset_within_current(&inner, index);
            let bytes = writer_bytes(&inner.current_writer);
            let parsed = record::parse(&bytes[byte_offset as usize..], index)?;
            self.next_index += 1;
            return Ok(Some((index, parsed.body.to_vec())));
        }

        for seg in &inner.sealed {
            if index >= seg.start_index && index < seg.end_index {
                let byte_offset = offset_within_segment(seg, index);
                let parsed = record::parse(&seg.reader.bytes()[byte_offset as usize..], index)?;
                self.next_index += 1;
                return Ok(Some((index, parsed.body.to_vec())));
            }
        }

        Ok(None)
    }

    /// Repositions the tailer. If `index` lands inside an unreadable region,
    /// the next `read_next` surfaces `Corrupt`.
    pub fn move_to(&mut self, index: u64) {
        self.next_index = index;
    }

    pub fn position(&self) -> u64 {
        self.next_index
    }
}

fn offset_within_current(inner: &LogInner, index: u64) -> u64 {
    byte_offset_by_counting(&writer_bytes(&inner.current_writer), index - inner.current_start_index)
}

fn offset_within_segment(seg: &SealedSegment, index: u64) -> u64 {
    byte_offset_by_counting(seg.reader.bytes(), index - seg.start_index)
}

fn byte_offset_by_counting(data: &[u8], records_to_skip: u64) -> u64 {
    let mut offset = 0usize;
    for _ in 0..records_to_skip {
        match record::parse(&data[offset..], offset as u64) {
            Ok(parsed) => offset += parsed.consumed,
            Err(_) => break,
        }
    }
    offset as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_test_log(dir: &Path) -> Arc<SegmentedLog> {
        let (log, _report) =
            SegmentedLog::open(dir, "cache", RollCycle::Daily, DurabilityLevel::Synchronous).unwrap();
        log
    }

    #[test]
    fn append_then_tail_from_start() {
        let dir = tempdir().unwrap();
        let log = open_test_log(dir.path());
        let i0 = log.append(b"one").unwrap();
        let i1 = log.append(b"two").unwrap();
        assert_eq!((i0, i1), (0, 1));

        let mut tailer = log.tailer(Position::Start);
        assert_eq!(tailer.read_next().unwrap(), Some((0, b"one".to_vec())));
        assert_eq!(tailer.read_next().unwrap(), Some((1, b"two".to_vec())));
        assert_eq!(tailer.read_next().unwrap(), None);
    }

    #[test]
    fn tailer_past_tail_returns_none_not_error() {
        let dir = tempdir().unwrap();
        let log = open_test_log(dir.path());
        log.append(b"one").unwrap();
        let mut tailer = log.tailer(Position::Index(50));
        assert!(tailer.read_next().unwrap().is_none());
    }

    #[test]
    fn reopen_recovers_next_index() {
        let dir = tempdir().unwrap();
        {
            let log = open_test_log(dir.path());
            log.append(b"one").unwrap();
            log.append(b"two").unwrap();
            log.flush().unwrap();
        }
        let (log2, _report) =
            SegmentedLog::open(dir.path(), "cache", RollCycle::Daily, DurabilityLevel::Synchronous).unwrap();
        assert_eq!(log2.last_appended_index(), Some(1));
    }
}
