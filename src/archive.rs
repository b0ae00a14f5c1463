//! 录像归档目录与元数据索引
//! On-disk archive layout, segment metadata files and the metadata index
//!
//! ```text
//! <root>/<YYYY-MM-DD>/<camera_id>/
//!     index.m3u8                 running playlist (written by the encoder)
//!     segment_00000.ts, ...      media chunks (written by the encoder)
//!     segment_00000.json, ...    one FrameMetadata list per closed segment
//!     metadata_index.json        ordered [{segment, metadata_file}]
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::{Local, NaiveDate, TimeZone};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::detection::FrameMetadata;
use crate::error::{PipelineError, Result};

pub const PLAYLIST_FILE: &str = "index.m3u8";
pub const INDEX_FILE: &str = "metadata_index.json";
pub const SEGMENT_PATTERN: &str = "segment_%05d.ts";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Local calendar date of a capture timestamp (UNIX seconds).
pub fn date_of(ts: f64) -> NaiveDate {
    let secs = ts.floor() as i64;
    let nanos = ((ts - ts.floor()) * 1e9) as u32;
    Local
        .timestamp_opt(secs, nanos)
        .earliest()
        .map(|t| t.date_naive())
        .unwrap_or_else(|| Local::now().date_naive())
}

pub fn metadata_file_name(index: u64) -> String {
    format!("segment_{index:05}.json")
}

fn parse_metadata_file_name(name: &str) -> Option<u64> {
    name.strip_prefix("segment_")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

/// `<root>/<date>/<camera_id>/`
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentDir {
    date: NaiveDate,
    camera_id: String,
    path: PathBuf,
}

impl SegmentDir {
    pub fn new(root: &Path, date: NaiveDate, camera_id: &str) -> Self {
        let path = root
            .join(date.format(DATE_FORMAT).to_string())
            .join(camera_id);
        Self {
            date,
            camera_id: camera_id.to_string(),
            path,
        }
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.path).map_err(|e| PipelineError::persistence(&self.path, e))
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn playlist_path(&self) -> PathBuf {
        self.path.join(PLAYLIST_FILE)
    }

    pub fn segment_pattern(&self) -> PathBuf {
        self.path.join(SEGMENT_PATTERN)
    }

    pub fn index_path(&self) -> PathBuf {
        self.path.join(INDEX_FILE)
    }

    pub fn metadata_path(&self, index: u64) -> PathBuf {
        self.path.join(metadata_file_name(index))
    }
}

/// 索引条目 `{segment, metadata_file}`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    #[serde(rename = "segment")]
    pub index: u64,
    pub metadata_file: String,
}

impl IndexEntry {
    pub fn new(index: u64) -> Self {
        Self {
            index,
            metadata_file: metadata_file_name(index),
        }
    }
}

/// 索引文件写入频率
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexCadence {
    #[default]
    EverySegment,
    /// Rewrite the index once every K closed segments.
    Every(u32),
}

impl IndexCadence {
    pub fn interval(self) -> u32 {
        match self {
            IndexCadence::EverySegment => 1,
            IndexCadence::Every(k) => k.max(1),
        }
    }
}

/// In-memory metadata index for one segment directory.
///
/// The persisted file always holds a prefix of `entries`; with
/// `IndexCadence::Every(K)` it may lag by up to K entries until the next
/// cadence point or [`MetadataIndex::sync`].
#[derive(Debug)]
pub struct MetadataIndex {
    path: PathBuf,
    entries: Vec<IndexEntry>,
    next_index: u64,
    cadence: IndexCadence,
    pending: u32,
}

impl MetadataIndex {
    /// Rebuild the index from the segment files already in `dir`.
    ///
    /// The next index continues after the highest existing one.
    pub fn resume(dir: &SegmentDir, cadence: IndexCadence) -> Result<Self> {
        let indices = scan_segment_indices(dir.path())?;
        let entries: Vec<IndexEntry> = indices.iter().copied().map(IndexEntry::new).collect();
        let next_index = indices.last().map_or(0, |last| last + 1);

        let mut index = Self {
            path: dir.index_path(),
            entries,
            next_index,
            cadence,
            pending: 0,
        };

        if !index.entries.is_empty() {
            let stored = read_index(dir.path()).map(|e| e.len()).unwrap_or(0);
            if stored != index.entries.len() {
                debug!(
                    path = %index.path.display(),
                    stored,
                    rebuilt = index.entries.len(),
                    "repairing lagging metadata index"
                );
                index.pending = 1;
                // 修复失败不影响续写, 索引保持脏状态, 下次落盘时重试
                if let Err(e) = index.sync() {
                    warn!(path = %index.path.display(), "metadata index repair failed: {e}");
                }
            }
        }
        Ok(index)
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn is_dirty(&self) -> bool {
        self.pending > 0
    }

    /// Append a closed segment and persist when the cadence says so.
    pub fn record(&mut self, entry: IndexEntry) -> Result<()> {
        self.next_index = entry.index + 1;
        self.entries.push(entry);
        self.pending += 1;
        if self.pending >= self.cadence.interval() {
            self.sync()?;
        }
        Ok(())
    }

    /// Write the full index now.
    pub fn sync(&mut self) -> Result<()> {
        let json = serde_json::to_vec(&self.entries)?;
        write_atomic(&self.path, &json).map_err(|e| PipelineError::persistence(&self.path, e))?;
        self.pending = 0;
        Ok(())
    }
}

/// 写入一个分段的元数据文件, 失败时重试 `attempts` 次
pub fn write_segment_metadata(
    dir: &SegmentDir,
    index: u64,
    frames: &[FrameMetadata],
    attempts: u32,
) -> Result<IndexEntry> {
    let path = dir.metadata_path(index);
    let json = serde_json::to_vec(frames)?;

    let attempts = attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match write_atomic(&path, &json) {
            Ok(()) => return Ok(IndexEntry::new(index)),
            Err(e) => {
                warn!(path = %path.display(), attempt, attempts, "segment metadata write failed: {e}");
                last_err = Some(e);
                if attempt < attempts {
                    thread::sleep(Duration::from_millis(20 * attempt as u64));
                }
            }
        }
    }
    Err(PipelineError::persistence(
        path,
        last_err.unwrap_or_else(|| io::Error::other("no write attempted")),
    ))
}

/// Write to a sibling temp file, then rename over the target.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Sorted indices of every `segment_NNNNN.json` in `dir`; a missing directory is empty.
pub fn scan_segment_indices(dir: &Path) -> Result<Vec<u64>> {
    let read = match fs::read_dir(dir) {
        Ok(read) => read,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PipelineError::persistence(dir, e)),
    };
    let mut indices: Vec<u64> = read
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| parse_metadata_file_name(entry.file_name().to_str()?))
        .collect();
    indices.sort_unstable();
    Ok(indices)
}

// ========== 读取接口 (查询服务视角) ==========

/// Date directories under `root`, newest first.
pub fn list_dates(root: &Path) -> Result<Vec<String>> {
    let read = match fs::read_dir(root) {
        Ok(read) => read,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PipelineError::persistence(root, e)),
    };
    let mut dates: Vec<String> = read
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| NaiveDate::parse_from_str(name, DATE_FORMAT).is_ok())
        .collect();
    dates.sort_unstable_by(|a, b| b.cmp(a));
    Ok(dates)
}

/// Camera directories recorded on `date`, sorted.
pub fn list_cameras(root: &Path, date: &str) -> Result<Vec<String>> {
    let dir = root.join(date);
    let read = fs::read_dir(&dir).map_err(|e| PipelineError::persistence(&dir, e))?;
    let mut cameras: Vec<String> = read
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    cameras.sort();
    Ok(cameras)
}

pub fn read_index(dir: &Path) -> Result<Vec<IndexEntry>> {
    let path = dir.join(INDEX_FILE);
    let bytes = fs::read(&path).map_err(|e| PipelineError::persistence(&path, e))?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn read_segment(dir: &Path, entry: &IndexEntry) -> Result<Vec<FrameMetadata>> {
    let path = dir.join(&entry.metadata_file);
    let bytes = fs::read(&path).map_err(|e| PipelineError::persistence(&path, e))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// The last `n` indexed segments, oldest first.
pub fn recent_segments(dir: &Path, n: usize) -> Result<Vec<IndexEntry>> {
    let entries = read_index(dir)?;
    let skip = entries.len().saturating_sub(n);
    Ok(entries.into_iter().skip(skip).collect())
}
