use crate::data::log_record::{
    compute_record_crc, decode_log_record_header, LogRecord, LogRecordPos, LogRecordType,
    ReadLogRecord, CRC_SIZE, MAX_LOG_RECORD_HEADER_SIZE,
};
use crate::errors::{Errors, Result};
use crate::fio::{new_io_manager, IoManager, IoType};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

pub const DATA_FILE_NAME_SUFFIX: &str = ".data";
pub const HINT_FILE_NAME: &str = "hint-index";
pub const MERGE_FINISHED_FILE_NAME: &str = "merge-finished";
pub const SEQ_NUM_FILE_NAME: &str = "seq-num";

/// A file-id-tagged append log: a thin adapter over an [`IoManager`] plus a
/// write-offset cursor. Sidecar files (hint, merge-finished, seq-num) reuse
/// the same record machinery under file id 0.
pub struct DataFile {
    file_id: u32,
    write_off: AtomicU64,
    io: Box<dyn IoManager>,
}

impl DataFile {
    /// Opens or creates the data file with the given id in `dir_path`.
    pub fn new(dir_path: &Path, file_id: u32, io_type: IoType) -> Result<Self> {
        let io = new_io_manager(&data_file_name(dir_path, file_id), io_type)?;
        Ok(Self { file_id, write_off: AtomicU64::new(0), io })
    }

    /// Opens the hint file emitted by merge.
    pub fn new_hint_file(dir_path: &Path) -> Result<Self> {
        Self::new_sidecar(&dir_path.join(HINT_FILE_NAME))
    }

    /// Opens the marker written when a merge completed.
    pub fn new_merge_finished_file(dir_path: &Path) -> Result<Self> {
        Self::new_sidecar(&dir_path.join(MERGE_FINISHED_FILE_NAME))
    }

    /// Opens the sidecar holding the engine sequence number across restarts.
    pub fn new_seq_num_file(dir_path: &Path) -> Result<Self> {
        Self::new_sidecar(&dir_path.join(SEQ_NUM_FILE_NAME))
    }

    fn new_sidecar(path: &Path) -> Result<Self> {
        let io = new_io_manager(path, IoType::StandardIo)?;
        Ok(Self { file_id: 0, write_off: AtomicU64::new(0), io })
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn write_off(&self) -> u64 {
        self.write_off.load(Ordering::SeqCst)
    }

    pub fn set_write_off(&self, offset: u64) {
        self.write_off.store(offset, Ordering::SeqCst);
    }

    pub fn file_size(&self) -> Result<u64> {
        self.io.size()
    }

    /// Reads the record starting at `offset`. Returns `ReadDataFileEof` when
    /// the offset is at or past the last record, and `InvalidRecordCrc` when
    /// the stored checksum does not match (a torn or corrupted record).
    pub fn read_log_record(&self, offset: u64) -> Result<ReadLogRecord> {
        let file_size = self.io.size()?;
        if offset >= file_size {
            return Err(Errors::ReadDataFileEof);
        }

        // Clamp the header read to the remaining bytes; a scan's final probe
        // may land closer than a full header to the end of the file.
        let header_bytes = MAX_LOG_RECORD_HEADER_SIZE.min((file_size - offset) as usize);
        let mut header_buf = vec![0u8; header_bytes];
        self.io.read_at(&mut header_buf, offset)?;

        let Some((header, header_len)) = decode_log_record_header(&header_buf) else {
            return Err(Errors::ReadDataFileEof);
        };
        if header.is_eof() {
            return Err(Errors::ReadDataFileEof);
        }

        let key_size = header.key_size as usize;
        let value_size = header.value_size as usize;
        let kv_offset = offset + header_len as u64;
        // A record claiming to extend past the end of the file is torn or
        // corrupted; report it the same way a checksum mismatch would be.
        if kv_offset + (key_size + value_size) as u64 > file_size {
            return Err(Errors::InvalidRecordCrc);
        }

        let mut kv_buf = vec![0u8; key_size + value_size];
        if !kv_buf.is_empty() {
            self.io.read_at(&mut kv_buf, kv_offset)?;
        }
        let value = kv_buf.split_off(key_size);
        let key = kv_buf;

        let crc = compute_record_crc(&header_buf[CRC_SIZE..header_len], &key, &value);
        if crc != header.crc {
            return Err(Errors::InvalidRecordCrc);
        }

        let record = LogRecord { key, value, rec_type: LogRecordType::from_u8(header.rec_type) };
        Ok(ReadLogRecord { record, size: header_len + key_size + value_size })
    }

    /// Appends `buf` and advances the write offset.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let n = self.io.write(buf)?;
        self.write_off.fetch_add(n as u64, Ordering::SeqCst);
        Ok(n)
    }

    /// Appends a hint record: an ordinary log record whose value is the
    /// encoded position of `key` in the merged data.
    pub fn write_hint_record(&self, key: Vec<u8>, pos: &LogRecordPos) -> Result<()> {
        let record = LogRecord { key, value: pos.encode(), rec_type: LogRecordType::Normal };
        self.write(&record.encode())?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.io.sync()
    }

    pub fn close(&self) -> Result<()> {
        self.io.close()
    }

    /// Rebinds the backing IO, used to swap the startup mmap backend for the
    /// buffered one before accepting writes.
    pub fn set_io_manager(&mut self, dir_path: &Path, io_type: IoType) -> Result<()> {
        self.io.close()?;
        self.io = new_io_manager(&data_file_name(dir_path, self.file_id), io_type)?;
        Ok(())
    }
}

/// Full path of the data file with the given id: a zero-padded nine-digit
/// basename with the `.data` suffix.
pub fn data_file_name(dir_path: &Path, file_id: u32) -> PathBuf {
    dir_path.join(format!("{file_id:09}{DATA_FILE_NAME_SUFFIX}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &[u8], value: &[u8], rec_type: LogRecordType) -> LogRecord {
        LogRecord { key: key.to_vec(), value: value.to_vec(), rec_type }
    }

    #[test]
    fn names_are_zero_padded() {
        let name = data_file_name(Path::new("/db"), 42);
        assert_eq!(name, PathBuf::from("/db/000000042.data"));
    }

    #[test]
    fn write_advances_offset() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("embercask-data")?;
        let file = DataFile::new(dir.path(), 0, IoType::StandardIo)?;
        assert_eq!(file.write_off(), 0);

        file.write(b"aaa")?;
        file.write(b"bbb")?;
        assert_eq!(file.write_off(), 6);
        assert_eq!(file.file_size()?, 6);
        Ok(())
    }

    #[test]
    fn read_round_trip() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("embercask-data")?;
        let file = DataFile::new(dir.path(), 7, IoType::StandardIo)?;
        assert_eq!(file.file_id(), 7);

        let records = [
            record(b"name", b"bitcask", LogRecordType::Normal),
            record(b"name", b"", LogRecordType::Deleted),
            record(b"other", b"value", LogRecordType::Normal),
        ];
        let mut offsets = Vec::new();
        for r in &records {
            offsets.push(file.write_off());
            file.write(&r.encode())?;
        }

        for (r, offset) in records.iter().zip(offsets) {
            let read = file.read_log_record(offset)?;
            assert_eq!(&read.record, r);
            assert_eq!(read.size, r.encoded_len());
        }
        Ok(())
    }

    #[test]
    fn read_past_end_is_eof() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("embercask-data")?;
        let file = DataFile::new(dir.path(), 0, IoType::StandardIo)?;
        assert!(matches!(file.read_log_record(0), Err(Errors::ReadDataFileEof)));

        let r = record(b"k", b"v", LogRecordType::Normal);
        file.write(&r.encode())?;
        assert!(matches!(
            file.read_log_record(r.encoded_len() as u64),
            Err(Errors::ReadDataFileEof)
        ));
        Ok(())
    }

    #[test]
    fn zeroed_tail_is_eof() -> Result<()> {
        // A pre-allocated or torn tail of zeroes reads as logical end-of-file.
        let dir = tempfile::TempDir::with_prefix("embercask-data")?;
        let file = DataFile::new(dir.path(), 0, IoType::StandardIo)?;
        file.write(&[0u8; 32])?;
        assert!(matches!(file.read_log_record(0), Err(Errors::ReadDataFileEof)));
        Ok(())
    }

    #[test]
    fn corruption_fails_crc() -> Result<()> {
        // Flipping any byte after the stored crc must fail the read.
        let r = record(b"name", b"bitcask", LogRecordType::Normal);
        let encoded = r.encode();

        for i in CRC_SIZE..encoded.len() {
            let dir = tempfile::TempDir::with_prefix("embercask-data")?;
            let file = DataFile::new(dir.path(), 0, IoType::StandardIo)?;
            let mut corrupted = encoded.clone();
            corrupted[i] ^= 0xff;
            file.write(&corrupted)?;
            assert!(
                matches!(file.read_log_record(0), Err(Errors::InvalidRecordCrc)),
                "flip at byte {i} went undetected"
            );
        }
        Ok(())
    }

    #[test]
    fn truncated_record_fails() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("embercask-data")?;
        let file = DataFile::new(dir.path(), 0, IoType::StandardIo)?;
        let encoded = record(b"key", b"a value long enough to cut", LogRecordType::Normal).encode();
        file.write(&encoded[..encoded.len() - 5])?;
        assert!(matches!(file.read_log_record(0), Err(Errors::InvalidRecordCrc)));
        Ok(())
    }

    #[test]
    fn hint_records_round_trip() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("embercask-data")?;
        let file = DataFile::new_hint_file(dir.path())?;
        let pos = LogRecordPos { file_id: 3, offset: 1024, size: 77 };
        file.write_hint_record(b"hinted".to_vec(), &pos)?;

        let read = file.read_log_record(0)?;
        assert_eq!(read.record.key, b"hinted");
        assert_eq!(crate::data::log_record::decode_log_record_pos(&read.record.value), pos);
        Ok(())
    }

    #[test]
    fn mmap_reads_match_standard_reads() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("embercask-data")?;
        let file = DataFile::new(dir.path(), 0, IoType::StandardIo)?;
        let r1 = record(b"alpha", b"1", LogRecordType::Normal);
        let r2 = record(b"beta", b"2", LogRecordType::Normal);
        file.write(&r1.encode())?;
        file.write(&r2.encode())?;
        file.sync()?;

        let mapped = DataFile::new(dir.path(), 0, IoType::MemoryMap)?;
        let read1 = mapped.read_log_record(0)?;
        assert_eq!(read1.record, r1);
        let read2 = mapped.read_log_record(read1.size as u64)?;
        assert_eq!(read2.record, r2);
        assert!(matches!(
            mapped.read_log_record((read1.size + read2.size) as u64),
            Err(Errors::ReadDataFileEof)
        ));
        Ok(())
    }
}
