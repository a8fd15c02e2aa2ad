//! Random access byte sources for the parsers.
//!
//! Trace files can be many gigabytes so nothing assumes the whole file is in
//! memory; the parsers ask for ranges and read them in chunks.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::Path,
};

use crate::error::{WaveError, WaveResult};

pub trait FileSource {
    /// Total size in bytes.
    fn size(&self) -> u64;

    /// Read up to `length` bytes starting at `offset`. Returns fewer bytes
    /// only at the end of the source.
    fn read(&mut self, offset: u64, length: usize) -> io::Result<Vec<u8>>;

    /// Read exactly `length` bytes or fail with `TruncatedFile`.
    fn read_exact_at(&mut self, offset: u64, length: usize) -> WaveResult<Vec<u8>> {
        let data = self.read(offset, length)?;
        if data.len() < length {
            return Err(WaveError::TruncatedFile {
                offset,
                needed: length as u64,
                available: data.len() as u64,
            });
        }
        Ok(data)
    }
}

/// A file on disk.
pub struct DiskSource {
    file: File,
    size: u64,
}

impl DiskSource {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }
}

impl FileSource for DiskSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&mut self, offset: u64, length: usize) -> io::Result<Vec<u8>> {
        let available = self.size.saturating_sub(offset).min(length as u64) as usize;
        let mut buf = vec![0; available];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// An in-memory buffer, used for decompressed files and in tests.
pub struct MemorySource {
    data: Vec<u8>,
}

impl MemorySource {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }
}

impl FileSource for MemorySource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read(&mut self, offset: u64, length: usize) -> io::Result<Vec<u8>> {
        let start = (offset as usize).min(self.data.len());
        let end = start.saturating_add(length).min(self.data.len());
        Ok(self.data[start..end].to_vec())
    }
}

impl<S: FileSource + ?Sized> FileSource for Box<S> {
    fn size(&self) -> u64 {
        (**self).size()
    }

    fn read(&mut self, offset: u64, length: usize) -> io::Result<Vec<u8>> {
        (**self).read(offset, length)
    }
}

impl<S: FileSource + ?Sized> FileSource for &mut S {
    fn size(&self) -> u64 {
        (**self).size()
    }

    fn read(&mut self, offset: u64, length: usize) -> io::Result<Vec<u8>> {
        (**self).read(offset, length)
    }
}

/// Adapts a [`FileSource`] to `Read + Seek` so it can be wrapped in a
/// `BufReader` or a decompressor.
pub struct SourceReader<'a, S: FileSource + ?Sized> {
    source: &'a mut S,
    position: u64,
}

impl<'a, S: FileSource + ?Sized> SourceReader<'a, S> {
    pub fn new(source: &'a mut S, position: u64) -> Self {
        Self { source, position }
    }
}

impl<S: FileSource + ?Sized> Read for SourceReader<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.source.read(self.position, buf.len())?;
        buf[..data.len()].copy_from_slice(&data);
        self.position += data.len() as u64;
        Ok(data.len())
    }
}

impl<S: FileSource + ?Sized> Seek for SourceReader<'_, S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_position = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(d) => self.source.size().checked_add_signed(d),
            SeekFrom::Current(d) => self.position.checked_add_signed(d),
        };
        self.position = new_position.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of source")
        })?;
        Ok(self.position)
    }
}
