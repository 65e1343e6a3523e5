//! Length + crc32c framing for the recorder file.

use std::io::{Read, Write};

use crc32c::crc32c;
use thiserror::Error;

pub const FRAME_HEADER_LEN: usize = 8;

/// Upper bound on a single framed entry. Node messages are small; anything
/// near this size indicates corruption.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame length invalid: {reason}")]
    InvalidLength { reason: &'static str },
    #[error("frame too large: max {max} got {got}")]
    TooLarge { max: usize, got: usize },
    #[error("frame crc mismatch: expected {expected:#010x} got {got:#010x}")]
    CrcMismatch { expected: u32, got: u32 },
}

pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::InvalidLength {
            reason: "frame cannot be empty",
        });
    }
    if payload.len() > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge {
            max: MAX_FRAME_BYTES,
            got: payload.len(),
        });
    }
    let length = payload.len() as u32;
    let crc = crc32c(payload);
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

pub struct FrameWriter<W> {
    writer: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        let frame = encode_frame(payload)?;
        self.writer.write_all(&frame)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), FrameError> {
        self.writer.flush()?;
        Ok(())
    }
}

pub struct FrameReader<R> {
    reader: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the next frame, or `None` at a clean end of stream.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        match read_exact_or_eof(&mut self.reader, &mut header)? {
            ReadOutcome::Eof => return Ok(None),
            ReadOutcome::Filled => {}
        }

        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if length == 0 {
            return Err(FrameError::InvalidLength {
                reason: "frame cannot be empty",
            });
        }
        if length > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge {
                max: MAX_FRAME_BYTES,
                got: length,
            });
        }
        let expected = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let mut body = vec![0u8; length];
        self.reader.read_exact(&mut body)?;

        let got = crc32c(&body);
        if got != expected {
            return Err(FrameError::CrcMismatch { expected, got });
        }
        Ok(Some(body))
    }
}

enum ReadOutcome {
    Filled,
    Eof,
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<ReadOutcome, FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(ReadOutcome::Eof);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "frame header truncated",
            )
            .into());
        }
        filled += n;
    }
    Ok(ReadOutcome::Filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip_validates_crc() {
        let mut buf = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut buf);
            writer.write_frame(b"hello").unwrap();
            writer.write_frame(b"world").unwrap();
        }
        let mut reader = FrameReader::new(Cursor::new(buf));
        assert_eq!(reader.read_next().unwrap().unwrap(), b"hello");
        assert_eq!(reader.read_next().unwrap().unwrap(), b"world");
        assert!(reader.read_next().unwrap().is_none());
    }

    #[test]
    fn corrupted_body_is_rejected() {
        let mut frame = encode_frame(b"payload").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let mut reader = FrameReader::new(Cursor::new(frame));
        assert!(matches!(
            reader.read_next(),
            Err(FrameError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn truncated_header_is_an_error() {
        let frame = encode_frame(b"payload").unwrap();
        let mut reader = FrameReader::new(Cursor::new(&frame[..4]));
        assert!(matches!(reader.read_next(), Err(FrameError::Io(_))));
    }

    #[test]
    fn empty_frames_are_rejected() {
        assert!(matches!(
            encode_frame(b""),
            Err(FrameError::InvalidLength { .. })
        ));
    }
}
