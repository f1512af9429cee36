use std::{
    collections::VecDeque,
    io,
    path::{Path, PathBuf},
};

use logship_config::QueueSync;
use logship_error::{ErrorContext as _, GenericError};
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt as _,
};
use tracing::{debug, warn};

const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".jsonl";

/// A segment file.
///
/// Holds up to the configured number of entries, one JSON document per line.
struct Segment {
    index: u64,
    path: PathBuf,
    written: usize,
    read: usize,
    acknowledged: usize,
}

impl Segment {
    fn new(root_path: &Path, index: u64) -> Self {
        Self {
            index,
            path: root_path.join(segment_filename(index)),
            written: 0,
            read: 0,
            acknowledged: 0,
        }
    }
}

/// Position of an entry within a [`DiskQueue`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct QueuePosition {
    segment: u64,
    line: usize,
}

/// A durable FIFO queue of segment files.
///
/// Entries are appended to the newest segment until it is full, at which point a new segment is started.
///
/// Consuming an entry takes two steps. [`read_next`][DiskQueue::read_next] hands out entries in order without
/// removing them, and [`acknowledge`][DiskQueue::acknowledge] marks every entry up to a position as consumed. A
/// segment is deleted once it is full and all of its entries have been acknowledged.
/// [`rewind`][DiskQueue::rewind] makes every unacknowledged entry readable again.
///
/// Progress is only tracked in memory, so after a restart, every entry of the remaining segments is delivered again.
pub struct DiskQueue<T> {
    root_path: PathBuf,
    segment_size: usize,
    sync: QueueSync,
    segments: VecDeque<Segment>,
    next_index: u64,
    tail_file: Option<File>,
    read_cache: VecDeque<(usize, T)>,
    cached_segment: Option<u64>,
}

impl<T> DiskQueue<T>
where
    T: DeserializeOwned + Serialize,
{
    /// Opens the queue stored under `root_path`, creating the directory if needed.
    ///
    /// Existing segments are picked up, oldest first.
    ///
    /// # Errors
    ///
    /// If the directory cannot be created or scanned, an error is returned.
    pub async fn open(root_path: PathBuf, segment_size: usize, sync: QueueSync) -> Result<Self, GenericError> {
        tokio::fs::create_dir_all(&root_path)
            .await
            .with_error_context(|| format!("Failed to create queue directory '{}'.", root_path.display()))?;

        let mut queue = Self {
            root_path,
            segment_size: segment_size.max(1),
            sync,
            segments: VecDeque::new(),
            next_index: 0,
            tail_file: None,
            read_cache: VecDeque::new(),
            cached_segment: None,
        };
        queue
            .refresh_segment_state()
            .await
            .with_error_context(|| format!("Failed to scan queue directory '{}'.", queue.root_path.display()))?;

        Ok(queue)
    }

    /// Returns the number of entries not yet acknowledged.
    pub fn len(&self) -> usize {
        self.segments.iter().map(|segment| segment.written - segment.acknowledged).sum()
    }

    /// Returns `true` if every entry has been acknowledged.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends an entry.
    ///
    /// # Errors
    ///
    /// If the entry cannot be serialized or written to disk, an error is returned.
    pub async fn push(&mut self, entry: &T) -> Result<(), GenericError> {
        let mut serialized = serde_json::to_vec(entry).error_context("Failed to serialize queue entry.")?;
        serialized.push(b'\n');

        let needs_segment = self
            .segments
            .back()
            .map_or(true, |segment| segment.written >= self.segment_size);
        if needs_segment {
            self.segments.push_back(Segment::new(&self.root_path, self.next_index));
            self.next_index += 1;
            self.tail_file = None;
        }

        let Some(segment) = self.segments.back_mut() else {
            unreachable!("tail segment was ensured above");
        };

        let file = match self.tail_file.take() {
            Some(file) => file,
            None => OpenOptions::new()
                .create(true)
                .append(true)
                .open(&segment.path)
                .await
                .with_error_context(|| format!("Failed to open queue segment '{}'.", segment.path.display()))?,
        };
        let file = self.tail_file.insert(file);

        file.write_all(&serialized)
            .await
            .with_error_context(|| format!("Failed to append to queue segment '{}'.", segment.path.display()))?;
        file.flush()
            .await
            .with_error_context(|| format!("Failed to flush queue segment '{}'.", segment.path.display()))?;
        if self.sync == QueueSync::Full {
            file.sync_data()
                .await
                .with_error_context(|| format!("Failed to sync queue segment '{}'.", segment.path.display()))?;
        }

        segment.written += 1;
        Ok(())
    }

    /// Hands out the oldest entry that has not been read yet, if one exists.
    ///
    /// The entry stays queued until it is acknowledged.
    ///
    /// # Errors
    ///
    /// If a segment cannot be read, an error is returned.
    pub async fn read_next(&mut self) -> Result<Option<(QueuePosition, T)>, GenericError> {
        loop {
            let Some(segment) = self.segments.iter_mut().find(|segment| segment.read < segment.written) else {
                return Ok(None);
            };

            if self.cached_segment != Some(segment.index) || self.read_cache.is_empty() {
                self.read_cache = read_segment(&segment.path, segment.read).await?;
                self.cached_segment = Some(segment.index);
            }

            match self.read_cache.pop_front() {
                Some((line, entry)) => {
                    segment.read = line + 1;
                    let position = QueuePosition {
                        segment: segment.index,
                        line,
                    };
                    return Ok(Some((position, entry)));
                }
                None => {
                    warn!(
                        path = %segment.path.display(),
                        missing = segment.written - segment.read,
                        "Queue segment holds fewer entries than were written. Skipping the rest."
                    );
                    segment.read = segment.written;
                    self.cached_segment = None;
                }
            }
        }
    }

    /// Acknowledges every entry up to and including `position`, deleting segments that are no longer needed.
    ///
    /// # Errors
    ///
    /// If a segment cannot be removed, an error is returned.
    pub async fn acknowledge(&mut self, position: QueuePosition) -> Result<(), GenericError> {
        for segment in self.segments.iter_mut() {
            if segment.index < position.segment {
                segment.acknowledged = segment.written;
            } else if segment.index == position.segment {
                segment.acknowledged = segment.acknowledged.max(position.line + 1).min(segment.written);
            } else {
                break;
            }
            segment.read = segment.read.max(segment.acknowledged);
        }

        // The tail is only retired once full, so appends keep going to the same file.
        while let Some(head) = self.segments.front() {
            let is_tail = self.segments.len() == 1;
            let retired = head.written >= self.segment_size || !is_tail;
            if head.acknowledged < head.written || !retired {
                break;
            }

            if let Some(segment) = self.segments.pop_front() {
                if is_tail {
                    self.tail_file = None;
                }
                if self.cached_segment == Some(segment.index) {
                    self.cached_segment = None;
                    self.read_cache.clear();
                }
                remove_segment(&segment.path).await?;
                debug!(path = %segment.path.display(), "Removed consumed queue segment.");
            }
        }

        Ok(())
    }

    /// Makes every entry that was read but not acknowledged readable again.
    pub fn rewind(&mut self) {
        for segment in self.segments.iter_mut() {
            segment.read = segment.acknowledged;
        }
        self.read_cache.clear();
        self.cached_segment = None;
    }

    async fn refresh_segment_state(&mut self) -> io::Result<()> {
        let mut segments = Vec::new();

        let mut dir_reader = tokio::fs::read_dir(&self.root_path).await?;
        while let Some(entry) = dir_reader.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }

            let path = entry.path();
            match decode_segment_filename(&path) {
                Some(index) => {
                    let contents = tokio::fs::read(&path).await?;
                    let written = contents.split(|b| *b == b'\n').filter(|line| !line.is_empty()).count();
                    segments.push(Segment {
                        index,
                        path,
                        written,
                        read: 0,
                        acknowledged: 0,
                    });
                }
                None => warn!(
                    file_size = metadata.len(),
                    "Ignoring unrecognized file '{}' in queue directory.",
                    path.display()
                ),
            }
        }

        segments.sort_by_key(|segment| segment.index);
        let pending = segments.iter().map(|segment| segment.written).sum::<usize>();
        if pending > 0 {
            debug!(
                directory = %self.root_path.display(),
                segments = segments.len(),
                entries = pending,
                "Recovered queued entries."
            );
        }

        self.next_index = segments.last().map_or(0, |segment| segment.index + 1);
        self.segments = segments.into();
        self.read_cache.clear();
        self.cached_segment = None;
        self.tail_file = None;

        Ok(())
    }
}

/// Reads the entries of a segment starting at line `skip`, along with their line numbers.
async fn read_segment<T: DeserializeOwned>(path: &Path, skip: usize) -> Result<VecDeque<(usize, T)>, GenericError> {
    let contents = tokio::fs::read(path)
        .await
        .with_error_context(|| format!("Failed to read queue segment '{}'.", path.display()))?;

    let mut entries = VecDeque::new();
    let lines = contents.split(|b| *b == b'\n').filter(|line| !line.is_empty());
    for (line_number, line) in lines.enumerate().skip(skip) {
        match serde_json::from_slice(line) {
            Ok(entry) => entries.push_back((line_number, entry)),
            Err(e) => warn!(path = %path.display(), line = line_number, error = %e, "Skipping corrupted queue entry."),
        }
    }

    Ok(entries)
}

async fn remove_segment(path: &Path) -> Result<(), GenericError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_error_context(|| format!("Failed to remove queue segment '{}'.", path.display())),
    }
}

fn segment_filename(index: u64) -> String {
    format!("{}{:020}{}", SEGMENT_PREFIX, index, SEGMENT_SUFFIX)
}

fn decode_segment_filename(path: &Path) -> Option<u64> {
    let filename = path.file_name()?.to_str()?;
    filename
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}
