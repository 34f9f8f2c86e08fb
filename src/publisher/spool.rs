use crate::pipeline::types::TelemetryEvent;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum SpoolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Local durable buffer for batches the event log refused.
///
/// One JSON event per line, FIFO. The file is the source of truth across
/// restarts; `pending` mirrors it in memory.
///
/// Consuming only advances a head offset kept in a `.head` sidecar. The
/// event file is compacted once the consumed prefix outgrows what is left,
/// or when the queue empties.
pub struct Spool {
    file: BufWriter<File>,
    path: PathBuf,
    head_path: PathBuf,
    /// Events at the front of the file that were already consumed
    head: usize,
    pending: VecDeque<TelemetryEvent>,
}

impl Spool {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SpoolError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let head_path = head_path(path);
        let head = read_head(&head_path)?;

        let mut pending = VecDeque::new();
        let mut skipped = 0usize;
        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            for (index, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<TelemetryEvent>(&line) {
                    Ok(event) => pending.push_back(event),
                    // A torn final line from a crash mid-write
                    Err(e) => {
                        skipped += 1;
                        log::warn!("⚠️  Skipping unreadable spool line {}: {}", index + 1, e);
                    }
                }
            }
            let consumed = head.min(pending.len());
            pending.drain(..consumed);
            if !pending.is_empty() {
                log::info!("📦 Reloaded {} spooled events from {}", pending.len(), path.display());
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        let mut spool = Self {
            file: BufWriter::new(file),
            path: path.to_path_buf(),
            head_path,
            head,
            pending,
        };
        if skipped > 0 || (head > 0 && spool.pending.is_empty()) {
            spool.rewrite()?;
        }
        Ok(spool)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append events and sync them to disk before returning.
    pub fn append(&mut self, events: &[TelemetryEvent]) -> Result<(), SpoolError> {
        for event in events {
            let json = serde_json::to_string(event)?;
            writeln!(self.file, "{}", json)?;
        }
        self.file.flush()?;
        self.file.get_ref().sync_data()?;

        self.pending.extend(events.iter().cloned());
        Ok(())
    }

    /// Up to `max` events from the front, without removing them.
    pub fn peek(&self, max: usize) -> Vec<TelemetryEvent> {
        self.pending.iter().take(max).cloned().collect()
    }

    /// Drop `count` events from the front.
    pub fn consume(&mut self, count: usize) -> Result<(), SpoolError> {
        let count = count.min(self.pending.len());
        if count == 0 {
            return Ok(());
        }
        self.pending.drain(..count);
        self.head += count;

        if self.pending.is_empty() || self.head >= self.pending.len() {
            self.rewrite()
        } else {
            write_head(&self.head_path, self.head)
        }
    }

    /// Rewrite the file with only the pending events and reset the head.
    fn rewrite(&mut self) -> Result<(), SpoolError> {
        self.file.flush()?;

        let tmp_path = self.path.with_extension("jsonl.tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for event in &self.pending {
                writeln!(tmp, "{}", serde_json::to_string(event)?)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_data()?;
        }
        // Head reset lands first: a crash before the rename replays the
        // consumed prefix instead of skipping pending events.
        write_head(&self.head_path, 0)?;
        std::fs::rename(&tmp_path, &self.path)?;
        self.head = 0;

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.file = BufWriter::new(file);
        log::debug!("🧹 Compacted spool {} to {} events", self.path.display(), self.pending.len());
        Ok(())
    }
}

fn head_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".head");
    PathBuf::from(name)
}

fn read_head(path: &Path) -> Result<usize, SpoolError> {
    if !path.exists() {
        return Ok(0);
    }
    let raw = std::fs::read_to_string(path)?;
    match raw.trim().parse::<usize>() {
        Ok(head) => Ok(head),
        Err(e) => {
            log::warn!("⚠️  Unreadable spool head {}: {}, replaying from start", path.display(), e);
            Ok(0)
        }
    }
}

fn write_head(path: &Path, head: usize) -> Result<(), SpoolError> {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    let tmp_path = PathBuf::from(name);
    {
        let mut tmp = File::create(&tmp_path)?;
        write!(tmp, "{}", head)?;
        tmp.sync_data()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
