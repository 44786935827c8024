//! Tap segment files: raw datagrams, length-prefixed, behind a magic
//! header. Written live by the recording tap and replayed offline.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// File magic; the trailing digits version the record layout.
pub const SEGMENT_MAGIC: &[u8; 8] = b"VRGSEG01";
/// Upper bound on one record; anything larger means a corrupt file.
pub const MAX_RECORD_LEN: usize = 64 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum SegmentError {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("not a segment file (bad magic)")]
    BadMagic,
    #[error("corrupt segment record of {len} bytes")]
    OversizedRecord { len: usize },
}

pub struct SegmentWriter<W: Write> {
    inner: W,
}

impl<W: Write> SegmentWriter<W> {
    /// Write the header and return a ready writer.
    pub fn new(mut inner: W) -> Result<Self, SegmentError> {
        inner.write_all(SEGMENT_MAGIC)?;
        Ok(SegmentWriter { inner })
    }

    pub fn write_datagram(&mut self, datagram: &[u8]) -> Result<(), SegmentError> {
        self.inner.write_u32::<LittleEndian>(datagram.len() as u32)?;
        self.inner.write_all(datagram)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), SegmentError> {
        self.inner.flush()?;
        Ok(())
    }
}

pub struct SegmentReader<R: Read> {
    inner: R,
}

impl<R: Read> SegmentReader<R> {
    /// Validate the header and return a ready reader.
    pub fn new(mut inner: R) -> Result<Self, SegmentError> {
        let mut magic = [0u8; 8];
        inner.read_exact(&mut magic)?;
        if &magic != SEGMENT_MAGIC {
            return Err(SegmentError::BadMagic);
        }
        Ok(SegmentReader { inner })
    }

    /// Next datagram, or `None` at a clean end of file.
    pub fn next_datagram(&mut self) -> Result<Option<Vec<u8>>, SegmentError> {
        let len = match self.inner.read_u32::<LittleEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if len > MAX_RECORD_LEN {
            return Err(SegmentError::OversizedRecord { len });
        }
        let mut datagram = vec![0u8; len];
        self.inner.read_exact(&mut datagram)?;
        Ok(Some(datagram))
    }
}
