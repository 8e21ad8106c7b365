//! Chunk file reader

use crate::{Result, SeriesError};
use byteorder::{BigEndian, ReadBytesExt};
use lz4_flex::frame::FrameDecoder;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

/// Forward, single-pass iterator over the raw records of one chunk file.
///
/// A record limit bounds iteration for files whose writer is still open;
/// without one, iteration proceeds until EOF. A truncated trailing record
/// terminates iteration silently, other I/O faults are fatal.
pub struct ChunkReader {
    decoder: FrameDecoder<BufReader<File>>,
    fixed_length: Option<usize>,
    remaining: Option<usize>,
    done: bool,
}

impl ChunkReader {
    /// Open a chunk file for forward iteration
    pub fn open(
        path: impl AsRef<Path>,
        fixed_length: Option<usize>,
        limit: Option<usize>,
    ) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(Self {
            decoder: FrameDecoder::new(BufReader::new(file)),
            fixed_length,
            remaining: limit,
            done: false,
        })
    }

    fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        match self.fixed_length {
            Some(fixed) => {
                let mut buf = vec![0u8; fixed];
                match self.decoder.read_exact(&mut buf) {
                    Ok(()) => Ok(Some(buf)),
                    Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
                    Err(e) => Err(SeriesError::Io(e)),
                }
            }
            None => {
                // any fault on the length prefix means the stream ended
                let len = match self.decoder.read_u32::<BigEndian>() {
                    Ok(len) => len as usize,
                    Err(_) => return Ok(None),
                };
                if len == 0 {
                    return Err(SeriesError::Corruption(
                        "zero-length record, empty entries are rejected on write".to_string(),
                    ));
                }
                let mut buf = vec![0u8; len];
                match self.decoder.read_exact(&mut buf) {
                    Ok(()) => Ok(Some(buf)),
                    Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
                    Err(e) => Err(SeriesError::Io(e)),
                }
            }
        }
    }
}

impl Iterator for ChunkReader {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(remaining) = self.remaining {
            if remaining == 0 {
                self.done = true;
                return None;
            }
        }
        match self.read_record() {
            Ok(Some(record)) => {
                if let Some(remaining) = self.remaining.as_mut() {
                    *remaining -= 1;
                }
                Some(Ok(record))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Decode a whole chunk eagerly, in record order.
///
/// Used where the full chunk is needed anyway (reverse iteration,
/// redo-last-file, latest-value scans over small chunks).
pub fn read_records(
    path: impl AsRef<Path>,
    fixed_length: Option<usize>,
    limit: Option<usize>,
) -> Result<Vec<Vec<u8>>> {
    ChunkReader::open(path, fixed_length, limit)?.collect()
}
