//! Framing for the recipe log.
//!
//! File layout:
//! ```text
//! [magic: 4 bytes "AHRL"][version: 1 byte]
//! repeated: [length: 4 bytes LE][data: N bytes JSON][crc32 of data: 4 bytes LE]
//! ```
//! A record cut short by a crash is reported as a torn tail so the caller can
//! truncate it. A complete record with a bad checksum is corruption.

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

/// Magic bytes identifying a recipe log.
pub(crate) const MAGIC: [u8; 4] = *b"AHRL";

/// Current log format version.
pub(crate) const FORMAT_VERSION: u8 = 1;

/// Size of the file header.
pub(crate) const HEADER_LEN: u64 = 5;

const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// One step of reading the log.
#[derive(Debug)]
pub(crate) enum Frame<T> {
    /// A verified record and its encoded size in bytes.
    Record(T, u64),
    /// Clean end of the log.
    End,
    /// The log ends inside a record.
    TornTail,
}

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Encodes one record.
pub(crate) fn encode_record<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let data = serde_json::to_vec(value)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("serialization failed: {e}")))?;
    let len = u32::try_from(data.len())
        .ok()
        .filter(|len| (*len as usize) <= MAX_RECORD_SIZE)
        .ok_or_else(|| {
            IoError::new(
                ErrorKind::InvalidData,
                format!("record size {} exceeds maximum {MAX_RECORD_SIZE}", data.len()),
            )
        })?;

    let mut out = Vec::with_capacity(4 + data.len() + 4);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&data);
    out.extend_from_slice(&checksum(&data).to_le_bytes());
    Ok(out)
}

/// Reads until `buf` is full or the input ends; returns the bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> IoResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Reads the next record.
pub(crate) fn read_record<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<Frame<T>> {
    let mut len_bytes = [0u8; 4];
    match read_full(reader, &mut len_bytes)? {
        0 => return Ok(Frame::End),
        4 => {}
        _ => return Ok(Frame::TornTail),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_RECORD_SIZE {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("record size {len} exceeds maximum {MAX_RECORD_SIZE}"),
        ));
    }

    let mut data = vec![0u8; len];
    if read_full(reader, &mut data)? < len {
        return Ok(Frame::TornTail);
    }
    let mut crc_bytes = [0u8; 4];
    if read_full(reader, &mut crc_bytes)? < 4 {
        return Ok(Frame::TornTail);
    }

    let stored = u32::from_le_bytes(crc_bytes);
    let computed = checksum(&data);
    if stored != computed {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("CRC mismatch: stored={stored:08x}, computed={computed:08x} (data corrupted)"),
        ));
    }

    let value = serde_json::from_slice(&data)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("deserialization failed: {e}")))?;
    Ok(Frame::Record(value, 8 + len as u64))
}

/// Writes the file header.
pub(crate) fn write_header(writer: &mut impl Write) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[FORMAT_VERSION])
}

/// Reads and validates the file header.
pub(crate) fn read_header(reader: &mut impl Read) -> IoResult<()> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header)?;
    if header[..4] != MAGIC {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("invalid magic bytes: expected {MAGIC:?}, got {:?}", &header[..4]),
        ));
    }
    if header[4] != FORMAT_VERSION {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!(
                "unsupported recipe log version: {} (expected {FORMAT_VERSION})",
                header[4]
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn reads_records_then_end() {
        let mut log = Vec::new();
        write_header(&mut log).unwrap();
        log.extend(encode_record(&"first").unwrap());
        log.extend(encode_record(&"second").unwrap());

        let mut cursor = Cursor::new(log);
        read_header(&mut cursor).unwrap();
        let Frame::Record(first, size) = read_record::<String>(&mut cursor).unwrap() else {
            panic!("expected record");
        };
        assert_eq!(first, "first");
        assert_eq!(size, 8 + "\"first\"".len() as u64);
        assert!(matches!(read_record::<String>(&mut cursor).unwrap(), Frame::Record(..)));
        assert!(matches!(read_record::<String>(&mut cursor).unwrap(), Frame::End));
    }

    #[test]
    fn short_record_is_a_torn_tail() {
        let mut encoded = encode_record(&"cut short").unwrap();
        encoded.truncate(encoded.len() - 2);
        let mut cursor = Cursor::new(encoded);
        assert!(matches!(read_record::<String>(&mut cursor).unwrap(), Frame::TornTail));

        let mut cursor = Cursor::new(vec![1u8, 0]);
        assert!(matches!(read_record::<String>(&mut cursor).unwrap(), Frame::TornTail));
    }

    #[test]
    fn flipped_byte_is_corruption() {
        let mut encoded = encode_record(&"test data").unwrap();
        encoded[6] ^= 0xFF;
        let err = read_record::<String>(&mut Cursor::new(encoded)).unwrap_err();
        assert!(err.to_string().contains("CRC"));
    }

    #[test]
    fn rejects_foreign_header() {
        let err = read_header(&mut Cursor::new(b"ABCD\x01".to_vec())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
