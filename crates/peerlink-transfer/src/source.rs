//! Readable file sources for the send queue.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;

/// A file offered for sending. Chunks are read on demand, one at a time.
pub trait FileSource: Send {
    fn name(&self) -> &str;

    /// Path relative to a dropped folder, if the file came from one.
    fn relative_path(&self) -> Option<&str>;

    fn size(&self) -> u64;

    fn mime_type(&self) -> &str;

    /// Read exactly `len` bytes starting at `offset`.
    fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>>;
}

/// A file on the local filesystem.
pub struct LocalFile {
    path: PathBuf,
    file: File,
    name: String,
    relative_path: Option<String>,
    size: u64,
    mime_type: String,
}

impl LocalFile {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
        let mime_type = mime_guess::from_path(&path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        Ok(Self {
            path,
            file,
            name,
            relative_path: None,
            size,
            mime_type,
        })
    }

    pub fn with_relative_path(mut self, relative_path: impl Into<String>) -> Self {
        self.relative_path = Some(relative_path.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileSource for LocalFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn relative_path(&self) -> Option<&str> {
        self.relative_path.as_deref()
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// An in-memory file.
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    relative_path: Option<String>,
    mime_type: String,
    data: Bytes,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let name = name.into();
        let mime_type = mime_guess::from_path(&name)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Self {
            name,
            relative_path: None,
            mime_type,
            data: data.into(),
        }
    }

    pub fn with_relative_path(mut self, relative_path: impl Into<String>) -> Self {
        self.relative_path = Some(relative_path.into());
        self
    }
}

impl FileSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn relative_path(&self) -> Option<&str> {
        self.relative_path.as_deref()
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let start = offset as usize;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of source"))?;
        Ok(self.data.slice(start..end).to_vec())
    }
}
