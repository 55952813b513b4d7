use bytes::{BufMut, BytesMut};
use prost::encoding::{decode_varint, encode_varint, encoded_len_varint};

/// Maximum encoded header length: crc (4) + type (1) + two size varints of
/// up to 5 bytes each.
pub const MAX_LOG_RECORD_HEADER_SIZE: usize = 15;

/// Width of the crc32 checksum at the start of every record.
pub const CRC_SIZE: usize = 4;

/// Kind of a persisted record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogRecordType {
    /// A live key/value pair.
    Normal = 0,

    /// A tombstone; the value is empty.
    Deleted = 1,

    /// Marks a committed batch; every record of the batch precedes it.
    TxnFinished = 2,
}

impl LogRecordType {
    /// Converts a type byte back. Only call on CRC-verified data; any other
    /// byte means the format changed underneath us.
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogRecordType::Normal,
            1 => LogRecordType::Deleted,
            2 => LogRecordType::TxnFinished,
            t => panic!("unknown log record type {t}"),
        }
    }
}

/// The unit of persistence: an entry in the append-only log. Stored keys
/// carry an unsigned-varint sequence number prefix; sequence 0 marks a
/// non-transactional write.
///
/// Encoded layout, little-endian where fixed:
///
/// ```text
/// [ crc32 : 4 ][ type : 1 ][ key_size : varint ][ value_size : varint ][ key ][ value ]
/// ```
///
/// The crc covers every byte from `type` on. Size varints are signed
/// (zigzag), at most 5 bytes each for 32-bit lengths.
#[derive(Clone, Debug, PartialEq)]
pub struct LogRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub rec_type: LogRecordType,
}

impl LogRecord {
    /// Encodes the record, with the crc patched into the first four bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32_le(0);
        buf.put_u8(self.rec_type as u8);
        encode_varint(zigzag_encode(self.key.len() as i64), &mut buf);
        encode_varint(zigzag_encode(self.value.len() as i64), &mut buf);
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);

        let crc = crc32fast::hash(&buf[CRC_SIZE..]);
        let mut bytes = buf.to_vec();
        bytes[..CRC_SIZE].copy_from_slice(&crc.to_le_bytes());
        bytes
    }

    /// Total encoded length of the record.
    pub fn encoded_len(&self) -> usize {
        CRC_SIZE
            + 1
            + encoded_len_varint(zigzag_encode(self.key.len() as i64))
            + encoded_len_varint(zigzag_encode(self.value.len() as i64))
            + self.key.len()
            + self.value.len()
    }
}

/// Decoded header fields. The type stays a raw byte until the crc has been
/// verified.
#[derive(Debug)]
pub struct LogRecordHeader {
    pub crc: u32,
    pub rec_type: u8,
    pub key_size: u32,
    pub value_size: u32,
}

impl LogRecordHeader {
    /// An all-zero (crc, key_size, value_size) triple is the scan's logical
    /// end-of-file marker.
    pub fn is_eof(&self) -> bool {
        self.crc == 0 && self.key_size == 0 && self.value_size == 0
    }
}

/// A record plus its total encoded size, as returned by a data file read.
#[derive(Debug)]
pub struct ReadLogRecord {
    pub record: LogRecord,
    pub size: usize,
}

/// A batched record buffered during replay until its finisher shows up.
pub struct TransactionRecord {
    pub record: LogRecord,
    pub pos: LogRecordPos,
}

/// Decodes a header from `buf`, returning the fields and the header length
/// actually consumed. Returns `None` when the buffer cannot hold a header,
/// which a scanner treats as end-of-file.
pub fn decode_log_record_header(buf: &[u8]) -> Option<(LogRecordHeader, usize)> {
    if buf.len() <= CRC_SIZE {
        return None;
    }
    let crc = u32::from_le_bytes(buf[..CRC_SIZE].try_into().expect("4-byte slice"));
    let rec_type = buf[CRC_SIZE];

    let mut tail = &buf[CRC_SIZE + 1..];
    let key_size = zigzag_decode(decode_varint(&mut tail).ok()?) as u32;
    let value_size = zigzag_decode(decode_varint(&mut tail).ok()?) as u32;
    let header_len = buf.len() - tail.len();

    Some((LogRecordHeader { crc, rec_type, key_size, value_size }, header_len))
}

/// Crc32 over the header tail (everything after the stored crc) plus key and
/// value, matching what `encode` produced.
pub fn compute_record_crc(header_tail: &[u8], key: &[u8], value: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header_tail);
    hasher.update(key);
    hasher.update(value);
    hasher.finalize()
}

/// Where a record lives on disk: the keydir value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogRecordPos {
    pub file_id: u32,
    pub offset: u64,
    /// Total encoded length, needed for reclaim accounting.
    pub size: u32,
}

impl LogRecordPos {
    /// Serializes as signed varints: file_id, offset, size.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_varint(zigzag_encode(self.file_id as i64), &mut buf);
        encode_varint(zigzag_encode(self.offset as i64), &mut buf);
        encode_varint(zigzag_encode(self.size as i64), &mut buf);
        buf.to_vec()
    }
}

/// Decodes a position serialized by [`LogRecordPos::encode`]. Hint file
/// values are crc-protected by their enclosing record, so a failure here
/// means the format changed underneath us.
pub fn decode_log_record_pos(mut buf: &[u8]) -> LogRecordPos {
    let file_id = zigzag_decode(decode_varint(&mut buf).expect("position file id"));
    let offset = zigzag_decode(decode_varint(&mut buf).expect("position offset"));
    let size = zigzag_decode(decode_varint(&mut buf).expect("position size"));
    LogRecordPos { file_id: file_id as u32, offset: offset as u64, size: size as u32 }
}

fn zigzag_encode(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

fn zigzag_decode(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout() {
        let record = LogRecord {
            key: b"name".to_vec(),
            value: b"bitcask".to_vec(),
            rec_type: LogRecordType::Normal,
        };
        let bytes = record.encode();
        assert_eq!(bytes.len(), record.encoded_len());

        // type byte sits right after the crc, sizes are single-byte varints.
        assert_eq!(bytes[4], 0);
        assert_eq!(&bytes[7..11], b"name");
        assert_eq!(&bytes[11..], b"bitcask");

        // stored crc matches a recomputation over everything after it.
        let crc = u32::from_le_bytes(bytes[..4].try_into().unwrap());
        assert_eq!(crc, crc32fast::hash(&bytes[4..]));
    }

    #[test]
    fn header_round_trip() {
        let record = LogRecord {
            key: b"k".to_vec(),
            value: vec![7u8; 300],
            rec_type: LogRecordType::Deleted,
        };
        let bytes = record.encode();

        let (header, header_len) = decode_log_record_header(&bytes).expect("header");
        assert_eq!(header.rec_type, LogRecordType::Deleted as u8);
        assert_eq!(header.key_size, 1);
        assert_eq!(header.value_size, 300);
        assert_eq!(header_len + 1 + 300, bytes.len());
        assert!(!header.is_eof());
    }

    #[test]
    fn header_needs_more_than_crc() {
        assert!(decode_log_record_header(&[]).is_none());
        assert!(decode_log_record_header(&[0, 0, 0, 0]).is_none());
    }

    #[test]
    fn zeroed_header_is_eof() {
        let (header, _) = decode_log_record_header(&[0u8; MAX_LOG_RECORD_HEADER_SIZE]).unwrap();
        assert!(header.is_eof());
    }

    #[test]
    fn empty_value_encodes() {
        let record =
            LogRecord { key: b"k".to_vec(), value: vec![], rec_type: LogRecordType::Normal };
        let bytes = record.encode();
        let (header, _) = decode_log_record_header(&bytes).unwrap();
        assert_eq!(header.key_size, 1);
        assert_eq!(header.value_size, 0);
        assert!(!header.is_eof());
    }

    #[test]
    fn pos_round_trip() {
        let pos = LogRecordPos { file_id: 42, offset: 1 << 33, size: 987654 };
        assert_eq!(decode_log_record_pos(&pos.encode()), pos);

        let zero = LogRecordPos { file_id: 0, offset: 0, size: 0 };
        assert_eq!(decode_log_record_pos(&zero.encode()), zero);
    }

    #[test]
    fn zigzag_round_trip() {
        for n in [0i64, 1, -1, 127, -128, i64::from(u32::MAX), i64::MAX, i64::MIN] {
            assert_eq!(zigzag_decode(zigzag_encode(n)), n);
        }
        // 32-bit lengths never need more than 5 varint bytes.
        assert!(encoded_len_varint(zigzag_encode(u32::MAX as i64)) <= 5);
    }
}
