//! Chunk file writer

use crate::{Result, SeriesError};
use byteorder::{BigEndian, WriteBytesExt};
use lz4_flex::frame::FrameEncoder;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Append-only writer for one chunk file.
///
/// The file is created lazily on the first append so that short-lived
/// writers do not exhaust file handles. Once closed, further appends fail.
pub struct ChunkWriter {
    path: PathBuf,
    fixed_length: Option<usize>,
    encoder: Option<FrameEncoder<BufWriter<File>>>,
    count: usize,
    closed: bool,
}

impl ChunkWriter {
    /// Create a writer for a path that must not exist yet
    pub fn create(path: impl AsRef<Path>, fixed_length: Option<usize>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            return Err(SeriesError::InvalidArgument(format!(
                "chunk file {:?} already exists",
                path
            )));
        }
        Ok(Self {
            path,
            fixed_length,
            encoder: None,
            count: 0,
            closed: false,
        })
    }

    /// Chunk file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records appended so far
    pub fn count(&self) -> usize {
        self.count
    }

    /// Append one encoded record
    pub fn append(&mut self, payload: &[u8]) -> Result<()> {
        if self.closed {
            return Err(SeriesError::InvalidArgument(format!(
                "chunk file {:?} is closed for appends",
                self.path
            )));
        }
        if payload.is_empty() {
            return Err(SeriesError::InvalidArgument(
                "encoded record must contain actual data".to_string(),
            ));
        }
        match self.fixed_length {
            Some(fixed) if payload.len() != fixed => {
                return Err(SeriesError::InvalidArgument(format!(
                    "encoded record has length {} while fixed length {} was expected",
                    payload.len(),
                    fixed
                )));
            }
            _ => {}
        }

        let dynamic = self.fixed_length.is_none();
        let encoder = self.encoder_mut()?;
        if dynamic {
            encoder.write_u32::<BigEndian>(payload.len() as u32)?;
        }
        encoder.write_all(payload)?;
        self.count += 1;
        Ok(())
    }

    /// Flush buffered records so concurrent readers can observe them
    pub fn flush(&mut self) -> Result<()> {
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.flush()?;
        }
        Ok(())
    }

    /// Finish the compressed frame and close the file for appends
    pub fn close(&mut self) -> Result<()> {
        if let Some(encoder) = self.encoder.take() {
            let mut inner = encoder
                .finish()
                .map_err(|e| SeriesError::Io(std::io::Error::other(e)))?;
            inner.flush()?;
        }
        self.closed = true;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn encoder_mut(&mut self) -> Result<&mut FrameEncoder<BufWriter<File>>> {
        if self.encoder.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = File::create(&self.path)?;
            self.encoder = Some(FrameEncoder::new(BufWriter::new(file)));
        }
        Ok(self.encoder.as_mut().expect("encoder just initialized"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkReader;
    use tempfile::tempdir;

    #[test]
    fn test_duplicate_path_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunk.dat");
        std::fs::write(&path, b"x").unwrap();

        let result = ChunkWriter::create(&path, None);
        assert!(matches!(result, Err(SeriesError::InvalidArgument(_))));
    }

    #[test]
    fn test_empty_payload_rejected() {
        let dir = tempdir().unwrap();
        let mut writer = ChunkWriter::create(dir.path().join("chunk.dat"), None).unwrap();

        let result = writer.append(&[]);
        assert!(matches!(result, Err(SeriesError::InvalidArgument(_))));
    }

    #[test]
    fn test_fixed_length_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let mut writer = ChunkWriter::create(dir.path().join("chunk.dat"), Some(8)).unwrap();

        writer.append(&[0u8; 8]).unwrap();
        let result = writer.append(&[0u8; 4]);
        assert!(matches!(result, Err(SeriesError::InvalidArgument(_))));
    }

    #[test]
    fn test_append_after_close_rejected() {
        let dir = tempdir().unwrap();
        let mut writer = ChunkWriter::create(dir.path().join("chunk.dat"), None).unwrap();

        writer.append(b"record").unwrap();
        writer.close().unwrap();

        let result = writer.append(b"late");
        assert!(matches!(result, Err(SeriesError::InvalidArgument(_))));
    }

    #[test]
    fn test_flush_visible_to_bounded_reader() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunk.dat");
        let mut writer = ChunkWriter::create(&path, None).unwrap();

        writer.append(b"one").unwrap();
        writer.append(b"two").unwrap();
        writer.flush().unwrap();

        // iteration bounded to the observed record count while the frame
        // is still open
        let records: Vec<_> = ChunkReader::open(&path, None, Some(writer.count()))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records, vec![b"one".to_vec(), b"two".to_vec()]);

        writer.append(b"three").unwrap();
        writer.close().unwrap();

        let records: Vec<_> = ChunkReader::open(&path, None, None)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 3);
    }
}
