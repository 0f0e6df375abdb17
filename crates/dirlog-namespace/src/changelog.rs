//! Append-only change log file
//!
//! Record-oriented log with:
//! - A fixed header carrying the record schema tag and a compaction flag
//! - CRC32C checksums per record
//! - Sequential scans from any record offset
//! - Positional reads of single records
//! - A poll primitive for tailing readers
//!
//! File format:
//! ```text
//! Header (24 bytes, offset 0):
//! +-----------+---------+-------+------------+----------+-----------+
//! | FileMagic | Version | Flags | ContentTag | Reserved | HeaderCRC |
//! | 4B        | 2B      | 2B    | 4B         | 8B       | 4B        |
//! +-----------+---------+-------+------------+----------+-----------+
//!
//! Record:
//! +-------------+------+--------+---------+--------+
//! | RecordMagic | Type | Length | Payload | CRC32C |
//! | 4B          | 1B   | 4B     | var     | 4B     |
//! +-------------+------+--------+---------+--------+
//! ```
//!
//! A record is addressed by the file offset of its first byte. Offset 0
//! is the header, so it never names a record.

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use dirlog_common::{Error, Result, StoreConfig};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// File header magic number
const FILE_MAGIC: u32 = 0x474F_4C44; // "DLOG"

/// Schema tag for container metadata records
pub const CONTAINER_CONTENT_TAG: u32 = 0x544E_4F43; // "CONT"

/// On-disk format version
const FORMAT_VERSION: u16 = 1;

/// Header size, and the offset of the first record
pub const HEADER_SIZE: u64 = 24;

/// Record magic number
const RECORD_MAGIC: u32 = 0x4352_444D; // "MDRC"

/// Record header size (magic + type + length)
const RECORD_HEADER_SIZE: usize = 9;

/// Record trailer size (CRC32C)
const RECORD_TRAILER_SIZE: usize = 4;

/// Upper bound on a record payload, anything larger is treated as corruption
const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Read size used by sequential scans
const SCAN_CHUNK_SIZE: usize = 256 * 1024;

/// Header flag: the file was produced by compaction
pub const FLAG_COMPACTED: u16 = 0x0001;

/// Record type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    /// Full serialized object
    Update = 1,
    /// Id of a removed object
    Delete = 2,
    /// Marks the end of the data copied by a compaction
    CompactionStamp = 3,
}

impl RecordType {
    const fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Update),
            2 => Some(Self::Delete),
            3 => Some(Self::CompactionStamp),
            _ => None,
        }
    }
}

/// How a change log file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open for appending, creating the file (and header) when missing
    Append,
    /// Create an empty file with the given header flags, replacing any existing one
    CreateNew { flags: u16 },
    /// Open an existing file for reading only
    ReadOnly,
}

/// Options for the log writer
#[derive(Clone, Debug)]
pub struct LogOptions {
    /// Sync after every append
    pub sync_on_write: bool,
    /// Buffer size for writes
    pub write_buffer_size: usize,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            write_buffer_size: 64 * 1024, // 64KB
        }
    }
}

impl From<&StoreConfig> for LogOptions {
    fn from(config: &StoreConfig) -> Self {
        Self {
            sync_on_write: config.sync_on_write,
            write_buffer_size: config.write_buffer_size,
        }
    }
}

/// Change log file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    pub version: u16,
    pub flags: u16,
    pub content_tag: u32,
}

impl LogHeader {
    fn new(flags: u16) -> Self {
        Self {
            version: FORMAT_VERSION,
            flags,
            content_tag: CONTAINER_CONTENT_TAG,
        }
    }

    fn to_bytes(self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&FILE_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..12].copy_from_slice(&self.content_tag.to_le_bytes());
        // 12..20 reserved
        let crc = crc32c::crc32c(&buf[..20]);
        buf[20..24].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE as usize {
            return Err(Error::InvalidHeader("header too small".into()));
        }

        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic != FILE_MAGIC {
            return Err(Error::InvalidHeader(format!("bad magic {magic:#010x}")));
        }

        let stored_crc = u32::from_le_bytes([data[20], data[21], data[22], data[23]]);
        if crc32c::crc32c(&data[..20]) != stored_crc {
            return Err(Error::InvalidHeader("header CRC mismatch".into()));
        }

        let header = Self {
            version: u16::from_le_bytes([data[4], data[5]]),
            flags: u16::from_le_bytes([data[6], data[7]]),
            content_tag: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
        };

        if header.version != FORMAT_VERSION {
            return Err(Error::InvalidHeader(format!(
                "unsupported version {}",
                header.version
            )));
        }
        if header.content_tag != CONTAINER_CONTENT_TAG {
            return Err(Error::InvalidHeader(format!(
                "unexpected content tag {:#010x}",
                header.content_tag
            )));
        }

        Ok(header)
    }

    /// Whether the file was produced by compaction
    #[must_use]
    pub const fn is_compacted(&self) -> bool {
        self.flags & FLAG_COMPACTED != 0
    }
}

/// A record read back from the log
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Offset of the record in the file
    pub offset: u64,
    pub record_type: RecordType,
    pub payload: Bytes,
}

impl LogRecord {
    /// Size of the record on disk
    #[must_use]
    pub fn encoded_len(&self) -> u64 {
        (RECORD_HEADER_SIZE + self.payload.len() + RECORD_TRAILER_SIZE) as u64
    }

    /// Offset just past this record
    #[must_use]
    pub fn next_offset(&self) -> u64 {
        self.offset + self.encoded_len()
    }
}

/// Payload of a compaction stamp record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStamp {
    /// Unix millis when the compaction committed
    pub compacted_at_ms: u64,
    /// Number of records copied into the compacted log
    pub records_copied: u64,
}

impl CompactionStamp {
    pub fn to_bytes(self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[0..8].copy_from_slice(&self.compacted_at_ms.to_le_bytes());
        buf[8..16].copy_from_slice(&self.records_copied.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let compacted_at_ms = u64::from_le_bytes(data.get(0..8)?.try_into().ok()?);
        let records_copied = u64::from_le_bytes(data.get(8..16)?.try_into().ok()?);
        Some(Self {
            compacted_at_ms,
            records_copied,
        })
    }
}

/// Serialize a record to bytes
#[must_use]
pub fn encode_record(record_type: RecordType, payload: &[u8]) -> Vec<u8> {
    let total_size = RECORD_HEADER_SIZE + payload.len() + RECORD_TRAILER_SIZE;
    let mut buf = Vec::with_capacity(total_size);

    buf.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
    buf.push(record_type as u8);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);

    // CRC over everything except the CRC itself
    let crc = crc32c::crc32c(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());

    buf
}

/// Parse one record from the front of `data`
///
/// Returns `Ok(None)` when `data` holds only part of a record.
fn decode_record(data: &[u8], offset: u64) -> Result<Option<(RecordType, &[u8], usize)>> {
    if data.len() < RECORD_HEADER_SIZE {
        return Ok(None);
    }

    let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if magic != RECORD_MAGIC {
        return Err(Error::corrupt(offset, format!("bad record magic {magic:#010x}")));
    }

    let tag = data[4];
    let payload_len = u32::from_le_bytes([data[5], data[6], data[7], data[8]]) as usize;
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(Error::corrupt(
            offset,
            format!("record length {payload_len} exceeds limit"),
        ));
    }

    let total_size = RECORD_HEADER_SIZE + payload_len + RECORD_TRAILER_SIZE;
    if data.len() < total_size {
        return Ok(None);
    }

    let body_end = RECORD_HEADER_SIZE + payload_len;
    let stored_crc = u32::from_le_bytes([
        data[body_end],
        data[body_end + 1],
        data[body_end + 2],
        data[body_end + 3],
    ]);
    if crc32c::crc32c(&data[..body_end]) != stored_crc {
        return Err(Error::corrupt(offset, "record CRC mismatch"));
    }

    let record_type =
        RecordType::from_u8(tag).ok_or(Error::UnknownRecordType { offset, tag })?;

    Ok(Some((
        record_type,
        &data[RECORD_HEADER_SIZE..body_end],
        total_size,
    )))
}

/// Callback verdict during a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanControl {
    Continue,
    Stop,
}

/// How a scan ended
#[derive(Debug)]
pub enum ScanTail {
    /// Reached the scan limit on a record boundary
    Clean,
    /// The callback asked to stop
    Stopped,
    /// A partial record sits at `offset` (torn write, or a writer mid-append)
    Truncated { offset: u64 },
    /// An unreadable record sits at `offset`
    Corrupt { offset: u64, error: Error },
}

/// Result of a scan
#[derive(Debug)]
pub struct ScanSummary {
    /// Offset of the first record not consumed
    pub next_offset: u64,
    /// Number of records handed to the callback
    pub records: u64,
    pub tail: ScanTail,
}

/// Outcome of waiting for a tailing reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    DataAvailable,
    TimedOut,
    Cancelled,
}

/// Append-only change log
pub struct ChangeLog {
    /// Current file path
    path: Mutex<PathBuf>,
    /// Handle for positional reads
    reader: File,
    /// Writer, absent when opened read-only
    writer: Option<Mutex<BufWriter<File>>>,
    /// End of the appended data
    size: AtomicU64,
    header: LogHeader,
    options: LogOptions,
}

impl ChangeLog {
    /// Open a change log file
    pub fn open(path: impl AsRef<Path>, mode: OpenMode, options: LogOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if mode != OpenMode::ReadOnly {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer_file = match mode {
            OpenMode::ReadOnly => None,
            OpenMode::Append => Some(
                OpenOptions::new()
                    .create(true)
                    .read(true)
                    .append(true)
                    .open(&path)?,
            ),
            OpenMode::CreateNew { .. } => {
                // Truncate first, then reopen in append mode
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&path)?;
                Some(OpenOptions::new().read(true).append(true).open(&path)?)
            }
        };

        let reader = File::open(&path)?;
        let mut file_size = reader.metadata()?.len();

        let header = if file_size == 0 {
            let Some(file) = writer_file.as_ref() else {
                return Err(Error::InvalidHeader(format!(
                    "{} is empty",
                    path.display()
                )));
            };
            let flags = match mode {
                OpenMode::CreateNew { flags } => flags,
                _ => 0,
            };
            let header = LogHeader::new(flags);
            let mut file = file;
            file.write_all(&header.to_bytes())?;
            file.sync_all()?;
            file_size = HEADER_SIZE;
            debug!("Wrote change log header to {:?}", path);
            header
        } else {
            let mut buf = [0u8; HEADER_SIZE as usize];
            reader
                .read_exact_at(&mut buf, 0)
                .map_err(|_| Error::InvalidHeader(format!("{} is too short", path.display())))?;
            LogHeader::from_bytes(&buf)?
        };

        info!(
            "Opened change log {:?} ({:?}, {} bytes, compacted={})",
            path,
            mode,
            file_size,
            header.is_compacted()
        );

        Ok(Self {
            path: Mutex::new(path),
            reader,
            writer: writer_file.map(|f| Mutex::new(BufWriter::with_capacity(options.write_buffer_size, f))),
            size: AtomicU64::new(file_size),
            header,
            options,
        })
    }

    /// Offset of the first record
    #[must_use]
    pub const fn first_record_offset(&self) -> u64 {
        HEADER_SIZE
    }

    /// Whether the file was produced by compaction
    #[must_use]
    pub const fn is_compacted(&self) -> bool {
        self.header.is_compacted()
    }

    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.writer.is_none()
    }

    /// Current file path
    pub fn path(&self) -> PathBuf {
        self.path.lock().clone()
    }

    /// Size of the log as known to this handle
    ///
    /// For a writable log this is the end of the appended data. A read-only
    /// handle reports the size seen at open or at the last `refresh_size`.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Re-read the on-disk size (tailing readers)
    pub fn refresh_size(&self) -> Result<u64> {
        let len = self.reader.metadata()?.len();
        self.size.store(len, Ordering::Release);
        Ok(len)
    }

    /// Append a record, returning its offset
    pub fn append(&self, record_type: RecordType, payload: &[u8]) -> Result<u64> {
        self.append_raw(&encode_record(record_type, payload))
    }

    /// Append an already encoded record verbatim, returning its offset
    pub fn append_raw(&self, bytes: &[u8]) -> Result<u64> {
        let writer = self.writer.as_ref().ok_or(Error::ReadOnly)?;
        let mut writer = writer.lock();

        let offset = self.size.load(Ordering::Acquire);
        writer.write_all(bytes)?;
        // Flush so positional readers see the record right away
        writer.flush()?;
        if self.options.sync_on_write {
            writer.get_ref().sync_data()?;
        }

        self.size.fetch_add(bytes.len() as u64, Ordering::AcqRel);
        Ok(offset)
    }

    /// Append a compaction stamp
    pub fn append_compaction_stamp(&self, stamp: CompactionStamp) -> Result<u64> {
        self.append(RecordType::CompactionStamp, &stamp.to_bytes())
    }

    /// Read the encoded bytes of the record at `offset`
    pub fn read_raw(&self, offset: u64) -> Result<Vec<u8>> {
        if offset < HEADER_SIZE {
            return Err(Error::corrupt(offset, "offset inside file header"));
        }

        let mut head = [0u8; RECORD_HEADER_SIZE];
        self.reader
            .read_exact_at(&mut head, offset)
            .map_err(|e| Error::corrupt(offset, format!("short record header: {e}")))?;
        let payload_len = u32::from_le_bytes([head[5], head[6], head[7], head[8]]) as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(Error::corrupt(
                offset,
                format!("record length {payload_len} exceeds limit"),
            ));
        }

        let mut buf = vec![0u8; RECORD_HEADER_SIZE + payload_len + RECORD_TRAILER_SIZE];
        self.reader
            .read_exact_at(&mut buf, offset)
            .map_err(|e| Error::corrupt(offset, format!("short record: {e}")))?;

        // Validate before handing the bytes out
        match decode_record(&buf, offset)? {
            Some(_) => Ok(buf),
            None => Err(Error::corrupt(offset, "record truncated")),
        }
    }

    /// Read the record at `offset`
    pub fn read_record(&self, offset: u64) -> Result<LogRecord> {
        let buf = self.read_raw(offset)?;
        let (record_type, payload, _) =
            decode_record(&buf, offset)?.ok_or_else(|| Error::corrupt(offset, "record truncated"))?;
        Ok(LogRecord {
            offset,
            record_type,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Scan records sequentially starting at `from`
    ///
    /// The scan covers `[from, until)`, or up to the current end of the
    /// file when `until` is `None`. Corruption and torn tails are reported
    /// in the summary, only I/O and callback errors are returned as `Err`.
    pub fn scan<F>(&self, from: u64, until: Option<u64>, mut callback: F) -> Result<ScanSummary>
    where
        F: FnMut(LogRecord) -> Result<ScanControl>,
    {
        let from = from.max(HEADER_SIZE);
        let end = match until {
            Some(end) => end,
            None => self.reader.metadata()?.len(),
        };

        let mut buf: Vec<u8> = Vec::with_capacity(SCAN_CHUNK_SIZE);
        let mut buf_start = from;
        let mut pos = from;
        let mut records = 0u64;
        let mut chunk = vec![0u8; SCAN_CHUNK_SIZE];

        let tail = loop {
            let rel = (pos - buf_start) as usize;
            match decode_record(&buf[rel..], pos) {
                Ok(Some((record_type, payload, len))) => {
                    let record = LogRecord {
                        offset: pos,
                        record_type,
                        payload: Bytes::copy_from_slice(payload),
                    };
                    pos += len as u64;
                    records += 1;
                    if callback(record)? == ScanControl::Stop {
                        break ScanTail::Stopped;
                    }
                }
                Ok(None) => {
                    let read_from = buf_start + buf.len() as u64;
                    if read_from >= end {
                        break if pos >= end {
                            ScanTail::Clean
                        } else {
                            ScanTail::Truncated { offset: pos }
                        };
                    }

                    // Drop consumed bytes, then pull the next chunk
                    buf.drain(..rel);
                    buf_start = pos;

                    let want = SCAN_CHUNK_SIZE.min((end - read_from) as usize);
                    let n = self.reader.read_at(&mut chunk[..want], read_from)?;
                    if n == 0 {
                        break ScanTail::Truncated { offset: pos };
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                Err(error) => break ScanTail::Corrupt { offset: pos, error },
            }
        };

        Ok(ScanSummary {
            next_offset: pos,
            records,
            tail,
        })
    }

    /// Wait until the file grows past `offset`
    ///
    /// Returns early with `Cancelled` when `shutdown` fires or disconnects.
    pub fn wait_for_data(
        &self,
        offset: u64,
        timeout: Duration,
        shutdown: &Receiver<()>,
    ) -> Result<WaitOutcome> {
        if self.refresh_size()? > offset {
            return Ok(WaitOutcome::DataAvailable);
        }
        match shutdown.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => Ok(WaitOutcome::Cancelled),
            Err(RecvTimeoutError::Timeout) => {
                if self.refresh_size()? > offset {
                    Ok(WaitOutcome::DataAvailable)
                } else {
                    Ok(WaitOutcome::TimedOut)
                }
            }
        }
    }

    /// Whether the path no longer names the file this handle has open
    pub fn is_replaced(&self) -> Result<bool> {
        let open = self.reader.metadata()?;
        match std::fs::metadata(&*self.path.lock()) {
            Ok(current) => Ok(current.ino() != open.ino() || current.dev() != open.dev()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Cut the log at `offset`, dropping everything after it
    pub fn truncate(&self, offset: u64) -> Result<()> {
        let writer = self.writer.as_ref().ok_or(Error::ReadOnly)?;
        let mut writer = writer.lock();
        writer.flush()?;
        writer.get_ref().set_len(offset.max(HEADER_SIZE))?;
        writer.get_ref().sync_all()?;
        self.size.store(offset.max(HEADER_SIZE), Ordering::Release);
        info!("Truncated change log {:?} at offset {}", self.path(), offset);
        Ok(())
    }

    /// Sync to disk
    pub fn sync(&self) -> Result<()> {
        if let Some(writer) = self.writer.as_ref() {
            let mut writer = writer.lock();
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Atomically move the file to `new_path`, keeping the handles open
    pub fn rename_to(&self, new_path: impl AsRef<Path>) -> Result<()> {
        let new_path = new_path.as_ref().to_path_buf();
        let mut path = self.path.lock();
        std::fs::rename(&*path, &new_path)?;
        debug!("Renamed change log {:?} -> {:?}", *path, new_path);
        *path = new_path;
        Ok(())
    }
}
