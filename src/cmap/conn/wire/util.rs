use std::{
    io::Read,
    sync::atomic::{AtomicI32, Ordering},
};

use bson::Document;
use lazy_static::lazy_static;

use crate::error::{ErrorKind, Result};

lazy_static! {
    static ref REQUEST_ID: AtomicI32 = AtomicI32::new(0);
}

/// Returns a monotonically increasing id for use with wire protocol headers.
pub(crate) fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// Appends a string to the buffer as a wire protocol cstring (UTF-8 bytes followed by a
/// trailing NUL).
pub(crate) fn write_cstring(buffer: &mut Vec<u8>, s: &str) -> Result<()> {
    if s.as_bytes().contains(&0) {
        return Err(ErrorKind::InvalidArgument {
            message: format!("cstring with interior null: {:?}", s),
        }
        .into());
    }

    buffer.extend_from_slice(s.as_bytes());
    buffer.push(0);

    Ok(())
}

/// Reads a wire protocol cstring from the reader.
pub(crate) fn read_cstring<R: Read>(reader: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        reader.read_exact(&mut byte)?;
        if byte[0] == 0 {
            break;
        }
        bytes.push(byte[0]);
    }

    String::from_utf8(bytes).map_err(|_| {
        ErrorKind::InvalidResponse {
            message: "cstring was not valid UTF-8".to_string(),
        }
        .into()
    })
}

/// Reads a BSON document from the reader, checking that its length prefix does not exceed the
/// number of bytes remaining.
pub(crate) fn read_document<R: Read>(reader: &mut R, remaining: usize) -> Result<Document> {
    if remaining < 4 {
        return Err(ErrorKind::InvalidResponse {
            message: "BSON document truncated in wire message".to_string(),
        }
        .into());
    }
    Document::from_reader(reader).map_err(|e| {
        ErrorKind::InvalidResponse {
            message: format!("invalid BSON document in wire message: {}", e),
        }
        .into()
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_ids_are_unique_and_increasing() {
        let first = next_request_id();
        let second = next_request_id();
        assert!(second > first);
    }

    #[test]
    fn cstring_rejects_interior_null() {
        let mut buffer = Vec::new();
        assert!(write_cstring(&mut buffer, "foo\0bar").is_err());
        assert!(write_cstring(&mut buffer, "foo.bar").is_ok());
        assert_eq!(buffer, b"foo.bar\0");
    }

    #[test]
    fn cstring_roundtrip() {
        let mut buffer = Vec::new();
        write_cstring(&mut buffer, "db.collection").unwrap();
        let mut cursor = std::io::Cursor::new(buffer);
        assert_eq!(read_cstring(&mut cursor).unwrap(), "db.collection");
    }
}
