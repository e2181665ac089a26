//! External merge sort of the backfill log by timestamp.
//!
//! # Phases
//!
//! 1. **Split**: read the unsorted log into memory-bounded chunks, sort each
//!    chunk by `timestamp` and spill it to a temporary file.
//! 2. **Merge**: k-way merge of the chunk files, repeatedly emitting the
//!    line with the smallest timestamp across all chunk heads.
//!
//! Memory use is bounded by `max_chunk_bytes` plus one line per chunk, so the
//! log can be far larger than RAM. Order among equal timestamps is not
//! specified.

use crate::Result;
use serde::Deserialize;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};

/// Sort settings.
#[derive(Debug, Clone)]
pub struct SortConfig {
    /// Approximate bytes of log lines held in memory per chunk.
    pub max_chunk_bytes: usize,

    /// Where chunk files go. Defaults to the system temp directory.
    pub tmp_dir: Option<PathBuf>,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: 256 * 1024 * 1024,
            tmp_dir: None,
        }
    }
}

/// Statistics about one sort.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortStats {
    pub lines: u64,
    pub skipped: u64,
    pub chunks: usize,
}

#[derive(Deserialize)]
struct TimestampOnly {
    timestamp: i64,
}

fn line_timestamp(line: &str) -> Option<i64> {
    serde_json::from_str::<TimestampOnly>(line)
        .ok()
        .map(|t| t.timestamp)
}

/// Sort `input` into `output` in ascending timestamp order.
///
/// Lines without a numeric `timestamp` are logged and dropped.
pub fn sort_backfill_log(input: &Path, output: &Path, config: &SortConfig) -> Result<SortStats> {
    let tmp = match &config.tmp_dir {
        Some(dir) => tempfile::Builder::new()
            .prefix("skyfill-sort")
            .tempdir_in(dir)?,
        None => tempfile::Builder::new().prefix("skyfill-sort").tempdir()?,
    };

    let mut stats = SortStats::default();
    let chunk_paths = split_into_chunks(input, tmp.path(), config.max_chunk_bytes, &mut stats)?;
    stats.chunks = chunk_paths.len();

    tracing::info!(
        "Sorted {} lines of {} into {} chunks, merging",
        stats.lines,
        input.display(),
        stats.chunks
    );

    merge_chunks(&chunk_paths, output)?;

    tracing::info!(
        "Wrote {} ({} lines, {} skipped)",
        output.display(),
        stats.lines,
        stats.skipped
    );
    Ok(stats)
}

fn split_into_chunks(
    input: &Path,
    tmp: &Path,
    max_chunk_bytes: usize,
    stats: &mut SortStats,
) -> Result<Vec<PathBuf>> {
    let reader = BufReader::new(File::open(input)?);
    let mut chunk: Vec<(i64, String)> = Vec::new();
    let mut chunk_bytes = 0usize;
    let mut paths = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let Some(ts) = line_timestamp(&line) else {
            tracing::warn!("Skipping line {} without a timestamp", line_no);
            stats.skipped += 1;
            continue;
        };

        chunk_bytes += line.len();
        chunk.push((ts, line));
        stats.lines += 1;

        if chunk_bytes >= max_chunk_bytes {
            paths.push(spill_chunk(&mut chunk, tmp, paths.len())?);
            chunk_bytes = 0;
        }
    }

    if !chunk.is_empty() {
        paths.push(spill_chunk(&mut chunk, tmp, paths.len())?);
    }
    Ok(paths)
}

fn spill_chunk(chunk: &mut Vec<(i64, String)>, tmp: &Path, index: usize) -> Result<PathBuf> {
    chunk.sort_unstable_by_key(|(ts, _)| *ts);

    let path = tmp.join(format!("chunk-{index:05}.jsonl"));
    let mut writer = BufWriter::new(File::create(&path)?);
    for (_, line) in chunk.drain(..) {
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;

    tracing::debug!("Spilled chunk {} to {}", index, path.display());
    Ok(path)
}

/// Sorted chunk file and its current head line.
struct ChunkCursor {
    lines: Lines<BufReader<File>>,
    head: Option<String>,
}

impl ChunkCursor {
    /// Advance to the next line, returning its timestamp.
    fn advance(&mut self) -> Result<Option<i64>> {
        for line in self.lines.by_ref() {
            let line = line?;
            // Every spilled line parsed once already.
            if let Some(ts) = line_timestamp(&line) {
                self.head = Some(line);
                return Ok(Some(ts));
            }
        }
        self.head = None;
        Ok(None)
    }
}

fn merge_chunks(chunks: &[PathBuf], output: &Path) -> Result<()> {
    let mut cursors = Vec::with_capacity(chunks.len());
    let mut heap = BinaryHeap::with_capacity(chunks.len());

    for (idx, path) in chunks.iter().enumerate() {
        let mut cursor = ChunkCursor {
            lines: BufReader::new(File::open(path)?).lines(),
            head: None,
        };
        if let Some(ts) = cursor.advance()? {
            heap.push(Reverse((ts, idx)));
        }
        cursors.push(cursor);
    }

    let mut writer = BufWriter::new(File::create(output)?);
    while let Some(Reverse((_, idx))) = heap.pop() {
        let cursor = &mut cursors[idx];
        if let Some(line) = cursor.head.take() {
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
        }
        if let Some(ts) = cursor.advance()? {
            heap.push(Reverse((ts, idx)));
        }
    }
    writer.flush()?;
    Ok(())
}
