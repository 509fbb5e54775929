use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Larger length prefixes can only come from a corrupt tail.
const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

/// Length prefix plus checksum around every payload.
const FRAME_OVERHEAD: u64 = 8;

/// Encode a single event as `[len][bincode][crc32]`.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read one `[len][bincode][crc32]` record and its size on disk. `Ok(None)`
/// means clean end of log or a torn/corrupt tail, both of which end replay.
fn decode_event(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_or_eof(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Event>(&payload)
        .ok()
        .map(|event| (event, len as u64 + FRAME_OVERHEAD)))
}

fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Every intact event and the byte offset just past the last one.
fn replay_prefix(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut good_len = 0u64;
    while let Some((event, size)) = decode_event(&mut reader)? {
        events.push(event);
        good_len += size;
    }
    Ok((events, good_len))
}

/// Durable end of the log between batches: where a failed batch rewinds to.
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint {
    len: u64,
    appends: u64,
}

/// Append-only write-ahead log of committed transactions.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`. Each committed
/// transaction is one entry, so a crash mid-write drops the transaction whole.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// Set when a failed batch could not be cut back off the log. Refuses
    /// further appends so no acknowledged record lands behind garbage.
    poisoned: bool,
    #[cfg(test)]
    pub(crate) fail_at_append: Option<u64>,
}

impl Wal {
    /// Open (or create) the WAL file at `path` for appends.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            poisoned: false,
            #[cfg(test)]
            fail_at_append: None,
        })
    }

    /// Replay the log and cut off any torn or corrupt tail, so records
    /// appended afterwards stay reachable on the next replay.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let (events, good_len) = replay_prefix(path)?;
        let on_disk = match fs::metadata(path) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(events),
            Err(e) => return Err(e),
        };
        if on_disk > good_len {
            warn!(
                "truncating {} bytes of torn WAL tail at offset {good_len} in {}",
                on_disk - good_len,
                path.display()
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(good_len)?;
            file.sync_all()?;
        }
        Ok(events)
    }

    /// Append and fsync a single event.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event without syncing. `flush_sync` commits the batch.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL poisoned by an unrecoverable write failure"));
        }
        #[cfg(test)]
        if self.fail_at_append == Some(self.appends_since_compact) {
            return Err(io::Error::other("injected append failure"));
        }
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Mark the current end of the log. Only meaningful with an empty
    /// buffer, i.e. between batches.
    pub fn checkpoint(&self) -> io::Result<Checkpoint> {
        Ok(Checkpoint {
            len: self.writer.get_ref().metadata()?.len(),
            appends: self.appends_since_compact,
        })
    }

    /// Discard everything written or buffered since `cp`. On failure the log
    /// stays poisoned.
    pub fn rewind(&mut self, cp: Checkpoint) -> io::Result<()> {
        self.poisoned = true;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let (old, _unwritten) = stale.into_parts();
        drop(old);
        let file = self.writer.get_ref();
        file.set_len(cp.len)?;
        file.sync_all()?;
        self.appends_since_compact = cp.appends;
        self.poisoned = false;
        Ok(())
    }

    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write `events` to `<path>.wal.tmp` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted temp file over the log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Replay every intact event. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        replay_prefix(path).map(|(events, _)| events)
    }
}
