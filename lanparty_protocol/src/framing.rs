// Line-delimited framing over a byte stream.
//
// The reliable channel carries one encoded envelope per line. `write_frame`
// appends the `\n` terminator and flushes, so a frame is written as a unit by
// whoever holds the writer (callers serialize access per connection).
// `read_frame` reads up to and excluding the next `\n`, returning `Ok(None)`
// on a clean EOF between frames.
//
// Both functions operate on raw bytes; the caller runs `codec::decode`
// separately, so a corrupt record costs one line and the stream stays in
// sync for the next one. A line longer than `MAX_RECORD_SIZE` cannot be
// resynchronized cheaply and is reported as `InvalidData`.

use std::io::{self, BufRead, Write};

use crate::codec::MAX_RECORD_SIZE;

/// Write one frame: the record bytes followed by `\n`, then flush.
pub fn write_frame<W: Write>(writer: &mut W, record: &[u8]) -> io::Result<()> {
    if record.len() > MAX_RECORD_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "frame too large: {} bytes (max {MAX_RECORD_SIZE})",
                record.len()
            ),
        ));
    }
    if record.contains(&b'\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "frame contains a newline",
        ));
    }
    writer.write_all(record)?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/// Read one frame without its terminator.
///
/// Returns `Ok(None)` when the stream ends cleanly before any byte of a new
/// frame. A final unterminated line is returned as a frame. Returns
/// `InvalidData` if a line exceeds `MAX_RECORD_SIZE`.
pub fn read_frame<R: BufRead>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    // +2 leaves room for a "\r\n" terminator on a maximum-size record.
    let limit = (MAX_RECORD_SIZE + 2) as u64;
    let read = io::Read::take(&mut *reader, limit).read_until(b'\n', &mut line)?;
    if read == 0 {
        return Ok(None);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    } else if read as u64 == limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame exceeds {MAX_RECORD_SIZE} bytes"),
        ));
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip_simple_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"{\"hello\":1}").unwrap();
        assert_eq!(buf.last(), Some(&b'\n'));

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"{\"hello\":1}");
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn multiple_frames_in_sequence() {
        let frames: Vec<&[u8]> = vec![b"first", b"second", b"third"];
        let mut buf = Vec::new();
        for frame in &frames {
            write_frame(&mut buf, frame).unwrap();
        }

        let mut cursor = Cursor::new(buf);
        for expected in &frames {
            assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), *expected);
        }
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn rejects_embedded_newline() {
        let mut buf = Vec::new();
        let err = write_frame(&mut buf, b"a\nb").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_oversized_write() {
        let big = vec![b'x'; MAX_RECORD_SIZE + 1];
        let err = write_frame(&mut Vec::new(), &big).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn rejects_oversized_read() {
        let big = vec![b'x'; MAX_RECORD_SIZE + 10];
        let mut cursor = Cursor::new(big);
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn strips_carriage_return() {
        let mut cursor = Cursor::new(b"abc\r\ndef".to_vec());
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"abc");
        // Unterminated tail is still a frame.
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"def");
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn corrupt_line_does_not_desync_stream() {
        let mut buf = b"{not json\n".to_vec();
        let good = crate::codec::encode(&crate::Envelope::registered(crate::ClientId(2))).unwrap();
        write_frame(&mut buf, &good).unwrap();

        let mut cursor = Cursor::new(buf);
        let first = read_frame(&mut cursor).unwrap().unwrap();
        assert!(crate::codec::decode(&first).is_err());
        let second = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(
            crate::codec::decode(&second).unwrap(),
            crate::Envelope::registered(crate::ClientId(2))
        );
    }
}
