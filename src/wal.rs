use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bincode::{Decode, Encode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::{ObjectId, RowId, Timestamp, Value};

/// Sink for the changes a committing transaction makes durable.
///
/// Calls arrive in the order the in-memory mutations were applied, between
/// `transaction_start` and `transaction_end`; `flush` follows once the commit
/// timestamp is known.
pub trait Logger: Send + Sync {
    fn transaction_start(&self, tid: Timestamp) -> Result<()>;

    fn log_segment_range(&self, table_id: ObjectId, start: RowId, count: u64, deleted: bool) -> Result<()>;

    fn log_column_append(&self, column_id: ObjectId, start: RowId, values: &[Value]) -> Result<()>;

    fn log_column_update(&self, column_id: ObjectId, ids: &[RowId], values: &[Value]) -> Result<()>;

    /// Full content of a column whose base was replaced.
    fn log_column_replace(&self, column_id: ObjectId, values: &[Value]) -> Result<()>;

    fn log_table_clear(&self, table_id: ObjectId) -> Result<()>;

    fn transaction_end(&self, tid: Timestamp) -> Result<()>;

    fn flush(&self, commit_ts: Timestamp) -> Result<()>;
}

/// One logger call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub enum LogRecord {
    TransactionStart { tid: Timestamp },
    SegmentRange { table_id: ObjectId, start: RowId, count: u64, deleted: bool },
    ColumnAppend { column_id: ObjectId, start: RowId, values: Vec<Value> },
    ColumnUpdate { column_id: ObjectId, ids: Vec<RowId>, values: Vec<Value> },
    ColumnReplace { column_id: ObjectId, values: Vec<Value> },
    TableClear { table_id: ObjectId },
    TransactionEnd { tid: Timestamp },
    Flush { commit_ts: Timestamp },
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullLogger;

impl Logger for NullLogger {
    fn transaction_start(&self, _tid: Timestamp) -> Result<()> {
        Ok(())
    }

    fn log_segment_range(&self, _table_id: ObjectId, _start: RowId, _count: u64, _deleted: bool) -> Result<()> {
        Ok(())
    }

    fn log_column_append(&self, _column_id: ObjectId, _start: RowId, _values: &[Value]) -> Result<()> {
        Ok(())
    }

    fn log_column_update(&self, _column_id: ObjectId, _ids: &[RowId], _values: &[Value]) -> Result<()> {
        Ok(())
    }

    fn log_column_replace(&self, _column_id: ObjectId, _values: &[Value]) -> Result<()> {
        Ok(())
    }

    fn log_table_clear(&self, _table_id: ObjectId) -> Result<()> {
        Ok(())
    }

    fn transaction_end(&self, _tid: Timestamp) -> Result<()> {
        Ok(())
    }

    fn flush(&self, _commit_ts: Timestamp) -> Result<()> {
        Ok(())
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        MemoryLogger::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    pub fn take(&self) -> Vec<LogRecord> {
        std::mem::take(&mut *self.records.lock())
    }

    fn push(&self, record: LogRecord) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }
}

impl Logger for MemoryLogger {
    fn transaction_start(&self, tid: Timestamp) -> Result<()> {
        self.push(LogRecord::TransactionStart { tid })
    }

    fn log_segment_range(&self, table_id: ObjectId, start: RowId, count: u64, deleted: bool) -> Result<()> {
        self.push(LogRecord::SegmentRange {
            table_id,
            start,
            count,
            deleted,
        })
    }

    fn log_column_append(&self, column_id: ObjectId, start: RowId, values: &[Value]) -> Result<()> {
        self.push(LogRecord::ColumnAppend {
            column_id,
            start,
            values: values.to_vec(),
        })
    }

    fn log_column_update(&self, column_id: ObjectId, ids: &[RowId], values: &[Value]) -> Result<()> {
        self.push(LogRecord::ColumnUpdate {
            column_id,
            ids: ids.to_vec(),
            values: values.to_vec(),
        })
    }

    fn log_column_replace(&self, column_id: ObjectId, values: &[Value]) -> Result<()> {
        self.push(LogRecord::ColumnReplace {
            column_id,
            values: values.to_vec(),
        })
    }

    fn log_table_clear(&self, table_id: ObjectId) -> Result<()> {
        self.push(LogRecord::TableClear { table_id })
    }

    fn transaction_end(&self, tid: Timestamp) -> Result<()> {
        self.push(LogRecord::TransactionEnd { tid })
    }

    fn flush(&self, commit_ts: Timestamp) -> Result<()> {
        self.push(LogRecord::Flush { commit_ts })
    }
}

/// WAL entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum WalEntryType {
    /// Transaction boundary (start or end)
    Boundary = 1,
    /// Segment range
    Segment = 2,
    /// Column append, update or replace
    Column = 3,
    /// Table clear
    Clear = 4,
    /// Durable commit marker
    Flush = 5,
}

impl WalEntryType {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(WalEntryType::Boundary),
            2 => Some(WalEntryType::Segment),
            3 => Some(WalEntryType::Column),
            4 => Some(WalEntryType::Clear),
            5 => Some(WalEntryType::Flush),
            _ => None,
        }
    }

    fn of(record: &LogRecord) -> Self {
        match record {
            LogRecord::TransactionStart { .. } | LogRecord::TransactionEnd { .. } => WalEntryType::Boundary,
            LogRecord::SegmentRange { .. } => WalEntryType::Segment,
            LogRecord::ColumnAppend { .. } | LogRecord::ColumnUpdate { .. } | LogRecord::ColumnReplace { .. } => {
                WalEntryType::Column
            }
            LogRecord::TableClear { .. } => WalEntryType::Clear,
            LogRecord::Flush { .. } => WalEntryType::Flush,
        }
    }
}

/// WAL entry header, fixed-width encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct WalEntryHeader {
    /// Magic number for validation
    pub magic: u32,
    /// Entry type
    pub entry_type: u8,
    /// Payload length (bytes following this header)
    pub payload_len: u32,
    /// Log sequence number
    pub lsn: u64,
    /// CRC32 of header (with this field zeroed) and payload
    pub crc32: u32,
}

fn header_config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

impl WalEntryHeader {
    const MAGIC: u32 = 0x574C4F47; // "WLOG"
    pub const SIZE: usize = 4 + 1 + 4 + 8 + 4;

    pub fn new(entry_type: WalEntryType, payload_len: u32, lsn: u64) -> Self {
        WalEntryHeader {
            magic: Self::MAGIC,
            entry_type: entry_type as u8,
            payload_len,
            lsn,
            crc32: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != Self::MAGIC {
            return Err(invalid_data("invalid WAL entry magic".to_string()));
        }
        if WalEntryType::from_u8(self.entry_type).is_none() {
            return Err(invalid_data(format!("unknown WAL entry type: {}", self.entry_type)));
        }
        Ok(())
    }

    fn to_bytes(self) -> Result<[u8; Self::SIZE]> {
        let mut buf = [0u8; Self::SIZE];
        bincode::encode_into_slice(self, &mut buf, header_config())?;
        Ok(buf)
    }

    fn from_bytes(buf: &[u8]) -> Result<Self> {
        let (header, _) = bincode::decode_from_slice(buf, header_config())?;
        Ok(header)
    }
}

fn invalid_data(msg: String) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::InvalidData, msg))
}

/// Single WAL entry: header + payload
#[derive(Debug)]
pub struct WalEntry {
    pub header: WalEntryHeader,
    pub payload: Vec<u8>,
}

impl WalEntry {
    pub fn new(entry_type: WalEntryType, payload: Vec<u8>, lsn: u64) -> Self {
        let payload_len = payload.len() as u32;
        WalEntry {
            header: WalEntryHeader::new(entry_type, payload_len, lsn),
            payload,
        }
    }

    pub fn record(&self) -> Result<LogRecord> {
        let (record, _) = bincode::decode_from_slice(&self.payload, bincode::config::standard())?;
        Ok(record)
    }
}

/// Append-only write-ahead log file
pub struct WalFile {
    file: File,
    path: PathBuf,
    /// Current write offset (next entry will be written here)
    next_offset: u64,
    next_lsn: u64,
}

impl WalFile {
    /// Open or create a WAL file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).append(true).create(true).open(&path)?;
        let len = file.metadata()?.len();
        let mut wal = WalFile {
            file,
            path,
            next_offset: len,
            next_lsn: 0,
        };
        let (valid_end, next_lsn) = wal.valid_prefix();
        if valid_end < len {
            warn!(path = %wal.path.display(), valid_end, len, "truncating torn WAL tail");
            wal.file.set_len(valid_end)?;
            wal.file.sync_data()?;
            wal.next_offset = valid_end;
        }
        wal.next_lsn = next_lsn;
        Ok(wal)
    }

    /// End offset and next LSN of the entries readable from the start.
    fn valid_prefix(&self) -> (u64, u64) {
        let (mut offset, mut next_lsn) = (0, 0);
        loop {
            match self.read_at(offset) {
                Ok(Some(entry)) => {
                    offset += WalEntryHeader::SIZE as u64 + entry.payload.len() as u64;
                    next_lsn = entry.header.lsn + 1;
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(offset, error = %e, "WAL scan stopped");
                    break;
                }
            }
        }
        (offset, next_lsn)
    }

    /// Append a WAL entry; returns its offset
    pub fn append(&mut self, entry: &WalEntry) -> Result<u64> {
        let mut header = entry.header;
        header.crc32 = 0;
        let mut buf = Vec::with_capacity(WalEntryHeader::SIZE + entry.payload.len());
        buf.extend_from_slice(&header.to_bytes()?);
        buf.extend_from_slice(&entry.payload);

        header.crc32 = crc32fast::hash(&buf);
        buf[..WalEntryHeader::SIZE].copy_from_slice(&header.to_bytes()?);

        self.file.write_all(&buf)?;

        let entry_offset = self.next_offset;
        self.next_offset += buf.len() as u64;
        Ok(entry_offset)
    }

    /// Encode and append one record
    pub fn append_record(&mut self, record: &LogRecord) -> Result<u64> {
        let payload = bincode::encode_to_vec(record, bincode::config::standard())?;
        let entry = WalEntry::new(WalEntryType::of(record), payload, self.next_lsn);
        let offset = self.append(&entry)?;
        self.next_lsn += 1;
        Ok(offset)
    }

    /// Read a WAL entry at given offset
    pub fn read_at(&self, offset: u64) -> Result<Option<WalEntry>> {
        if offset + WalEntryHeader::SIZE as u64 > self.next_offset {
            return Ok(None);
        }
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        let mut header_buf = [0u8; WalEntryHeader::SIZE];
        match file.read_exact(&mut header_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let header = WalEntryHeader::from_bytes(&header_buf)?;
        header.validate()?;
        let end = offset + WalEntryHeader::SIZE as u64 + header.payload_len as u64;
        if end > self.next_offset {
            return Err(invalid_data(format!("WAL entry at offset {} runs past the end {}", offset, self.next_offset)));
        }

        let mut payload = vec![0u8; header.payload_len as usize];
        file.read_exact(&mut payload)?;

        let mut unsigned = header;
        unsigned.crc32 = 0;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&unsigned.to_bytes()?);
        hasher.update(&payload);
        if header.crc32 != hasher.finalize() {
            return Err(invalid_data(format!("WAL entry CRC mismatch at offset {}", offset)));
        }

        Ok(Some(WalEntry { header, payload }))
    }

    /// Iterate through all entries in the log starting from offset
    pub fn iter_from(&self, start_offset: u64) -> WalIterator<'_> {
        WalIterator {
            wal: self,
            current_offset: start_offset,
            failed: false,
        }
    }

    pub fn records(&self) -> Result<Vec<LogRecord>> {
        self.iter_from(0).map(|e| e.and_then(|e| e.record())).collect()
    }

    /// Get current write offset
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Get file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Iterator for WAL entries; ends after the first error
pub struct WalIterator<'a> {
    wal: &'a WalFile,
    current_offset: u64,
    failed: bool,
}

impl Iterator for WalIterator<'_> {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.wal.read_at(self.current_offset) {
            Ok(Some(entry)) => {
                self.current_offset += WalEntryHeader::SIZE as u64 + entry.payload.len() as u64;
                Some(Ok(entry))
            }
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// [`Logger`] writing every record to a [`WalFile`]; `flush` syncs the file.
pub struct WalLogger {
    wal: Mutex<WalFile>,
}

impl WalLogger {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let wal = WalFile::open(path)?;
        debug!(path = %wal.path().display(), offset = wal.next_offset(), "opened write-ahead log");
        Ok(WalLogger { wal: Mutex::new(wal) })
    }

    pub fn records(&self) -> Result<Vec<LogRecord>> {
        self.wal.lock().records()
    }

    fn write(&self, record: LogRecord) -> Result<()> {
        self.wal.lock().append_record(&record)?;
        Ok(())
    }
}

impl Logger for WalLogger {
    fn transaction_start(&self, tid: Timestamp) -> Result<()> {
        self.write(LogRecord::TransactionStart { tid })
    }

    fn log_segment_range(&self, table_id: ObjectId, start: RowId, count: u64, deleted: bool) -> Result<()> {
        self.write(LogRecord::SegmentRange {
            table_id,
            start,
            count,
            deleted,
        })
    }

    fn log_column_append(&self, column_id: ObjectId, start: RowId, values: &[Value]) -> Result<()> {
        self.write(LogRecord::ColumnAppend {
            column_id,
            start,
            values: values.to_vec(),
        })
    }

    fn log_column_update(&self, column_id: ObjectId, ids: &[RowId], values: &[Value]) -> Result<()> {
        self.write(LogRecord::ColumnUpdate {
            column_id,
            ids: ids.to_vec(),
            values: values.to_vec(),
        })
    }

    fn log_column_replace(&self, column_id: ObjectId, values: &[Value]) -> Result<()> {
        self.write(LogRecord::ColumnReplace {
            column_id,
            values: values.to_vec(),
        })
    }

    fn log_table_clear(&self, table_id: ObjectId) -> Result<()> {
        self.write(LogRecord::TableClear { table_id })
    }

    fn transaction_end(&self, tid: Timestamp) -> Result<()> {
        self.write(LogRecord::TransactionEnd { tid })
    }

    fn flush(&self, commit_ts: Timestamp) -> Result<()> {
        let mut wal = self.wal.lock();
        wal.append_record(&LogRecord::Flush { commit_ts })?;
        wal.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip_is_fixed_size() {
        let header = WalEntryHeader::new(WalEntryType::Column, 17, 3);
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), WalEntryHeader::SIZE);
        assert_eq!(WalEntryHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let mut header = WalEntryHeader::new(WalEntryType::Flush, 0, 0);
        header.magic = 7;
        assert!(matches!(header.validate(), Err(Error::Io(_))));
    }

    #[test]
    fn test_wal_append_and_iterate() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = WalFile::open(dir.path().join("wal.log")).unwrap();
        assert_eq!(wal.next_offset(), 0);

        wal.append_record(&LogRecord::TransactionStart { tid: 9 }).unwrap();
        wal.append_record(&LogRecord::ColumnUpdate {
            column_id: 2,
            ids: vec![1, 4],
            values: vec![Value::Int(10), Value::from("x")],
        })
        .unwrap();
        wal.append_record(&LogRecord::Flush { commit_ts: 5 }).unwrap();

        let entries: Vec<_> = wal.iter_from(0).map(|e| e.unwrap()).collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].header.entry_type, WalEntryType::Column as u8);
        assert_eq!(entries[2].header.lsn, 2);
        assert_eq!(entries[2].record().unwrap(), LogRecord::Flush { commit_ts: 5 });
    }

    #[test]
    fn test_reopen_continues_lsn() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let mut wal = WalFile::open(&path).unwrap();
            wal.append_record(&LogRecord::TableClear { table_id: 1 }).unwrap();
        }
        let mut wal = WalFile::open(&path).unwrap();
        wal.append_record(&LogRecord::TableClear { table_id: 2 }).unwrap();
        let lsns: Vec<u64> = wal.iter_from(0).map(|e| e.unwrap().header.lsn).collect();
        assert_eq!(lsns, vec![0, 1]);
    }

    #[test]
    fn test_reopen_truncates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let first_end = {
            let mut wal = WalFile::open(&path).unwrap();
            wal.append_record(&LogRecord::TransactionStart { tid: 1 }).unwrap();
            let first_end = wal.next_offset();
            wal.append_record(&LogRecord::ColumnAppend {
                column_id: 2,
                start: 0,
                values: vec![Value::Int(1), Value::from("abc")],
            })
            .unwrap();
            first_end
        };
        let len = std::fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 10).unwrap();

        let mut wal = WalFile::open(&path).unwrap();
        assert_eq!(wal.next_offset(), first_end);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), first_end);
        assert_eq!(wal.records().unwrap(), vec![LogRecord::TransactionStart { tid: 1 }]);

        wal.append_record(&LogRecord::TransactionEnd { tid: 1 }).unwrap();
        let lsns: Vec<u64> = wal.iter_from(0).map(|e| e.unwrap().header.lsn).collect();
        assert_eq!(lsns, vec![0, 1]);
    }

    #[test]
    fn test_iterator_stops_after_corrupt_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let mut wal = WalFile::open(&path).unwrap();
        wal.append_record(&LogRecord::TransactionStart { tid: 9 }).unwrap();
        wal.append_record(&LogRecord::TransactionEnd { tid: 9 }).unwrap();
        {
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(WalEntryHeader::SIZE as u64)).unwrap();
            file.write_all(&[0xFF]).unwrap();
        }

        let items: Vec<_> = wal.iter_from(0).collect();
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());

        drop(wal);
        let wal = WalFile::open(&path).unwrap();
        assert_eq!(wal.next_offset(), 0);
        assert!(wal.records().unwrap().is_empty());
    }

    #[test]
    fn test_memory_logger_records_in_order() {
        let logger = MemoryLogger::new();
        logger.transaction_start(1).unwrap();
        logger.log_table_clear(3).unwrap();
        logger.transaction_end(1).unwrap();
        assert_eq!(
            logger.take(),
            vec![
                LogRecord::TransactionStart { tid: 1 },
                LogRecord::TableClear { table_id: 3 },
                LogRecord::TransactionEnd { tid: 1 },
            ]
        );
        assert!(logger.records().is_empty());
    }
}
