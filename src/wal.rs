use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Larger length prefixes are treated as corruption.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// Encode a single event as `[len][bincode][crc32]`.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read one `[len][bincode][crc32]` record and its size on disk. `Ok(None)`
/// means the log ends here, either cleanly or at a torn/corrupt record.
fn read_record(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(None);
    }

    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }

    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }

    Ok(bincode::deserialize::<Event>(&payload)
        .ok()
        .map(|event| (event, 8 + len as u64)))
}

/// `read_exact` that reports EOF as `false` instead of an error.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only write-ahead log of committed [`Event`]s.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`, little endian.
/// `len` counts the bincode payload only. A torn last entry left by a crash
/// fails the length or CRC check and is dropped on replay.
///
/// A batch that fails to write is cut back off the file, so the log only
/// ever holds batches whose callers were told they committed. If even that
/// fails the log is poisoned and refuses appends until reopened.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// File length after the last successful batch.
    committed_len: u64,
    poisoned: bool,
    scratch: Vec<u8>,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let committed_len = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            committed_len,
            poisoned: false,
            scratch: Vec::new(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync one event.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_batch(std::slice::from_ref(event))
    }

    /// Write `events` with a single fsync. Either the whole batch is durable
    /// or none of it is left in the file.
    pub fn append_batch<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL poisoned by an earlier failed rollback"));
        }

        self.scratch.clear();
        let mut count = 0u64;
        for event in events {
            encode_event(&mut self.scratch, event)?;
            count += 1;
        }

        let written = self
            .file
            .write_all(&self.scratch)
            .and_then(|()| self.file.sync_data());
        match written {
            Ok(()) => {
                self.committed_len += self.scratch.len() as u64;
                self.appends_since_compact += count;
                Ok(())
            }
            Err(e) => {
                self.rollback();
                Err(e)
            }
        }
    }

    /// Cut the file back to the last committed batch.
    fn rollback(&mut self) {
        let truncated = self
            .file
            .set_len(self.committed_len)
            .and_then(|()| self.file.sync_all());
        if let Err(e) = truncated {
            tracing::error!("WAL rollback to {} bytes failed, poisoning: {e}", self.committed_len);
            self.poisoned = true;
        }
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replace the log with `events`: write a sibling temp file, fsync it,
    /// rename it over the log and reopen for appends.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                encode_event(&mut writer, event)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.committed_len = file.metadata()?.len();
        self.file = file;
        self.poisoned = false;
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Read every valid event from disk. A missing file is an empty log;
    /// replay stops at the first truncated or corrupt entry and cuts the file
    /// back to the last good record so later appends stay readable.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let total_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut consumed = 0u64;

        while let Some((event, size)) = read_record(&mut reader)? {
            consumed += size;
            events.push(event);
        }

        if consumed < total_len {
            tracing::warn!(
                "WAL {}: discarded {} trailing bytes after {} records",
                path.display(),
                total_len - consumed,
                events.len()
            );
            OpenOptions::new().write(true).open(path)?.set_len(consumed)?;
        }
        Ok(events)
    }
}
