//! Module image input and output.
//!
//! A module image is the persisted form of a [`crate::Module`]. Reading goes through a
//! [`File`], which owns the raw bytes either as a memory-mapped file or as an in-memory buffer,
//! and a bounds checked [`parser::Parser`]. Writing goes through [`writer::Writer`]. The
//! section layout lives in [`image`], the encoding of individual values in [`codec`].
//!
//! # Examples
//!
//! ```rust,no_run
//! use dotbind::Module;
//! use std::path::Path;
//!
//! let module = Module::from_file(Path::new("Native.dbm"))?;
//! module.write_to(Path::new("Native.out.dbm"))?;
//! # Ok::<(), dotbind::Error>(())
//! ```

/// Value encoding
pub mod codec;
/// Section layout of a module image
pub mod image;
/// Primitive reads and writes
pub mod io;
/// Bounds checked reader
pub mod parser;
mod physical;
/// Image writer
pub mod writer;

use std::path::Path;

use crate::Result;
use physical::Physical;

/// Source of image bytes.
pub trait Backend: Send + Sync {
    /// The complete image.
    fn data(&self) -> &[u8];

    /// Image size in bytes.
    fn len(&self) -> usize {
        self.data().len()
    }

    /// Returns `true` for an empty image.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An in-memory image.
#[derive(Debug)]
pub struct Memory {
    data: Vec<u8>,
}

impl Memory {
    /// Wraps a buffer.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Memory {
        Memory { data }
    }
}

impl Backend for Memory {
    fn data(&self) -> &[u8] {
        self.data.as_slice()
    }
}

/// A loaded module image.
pub struct File {
    data: Box<dyn Backend>,
}

impl File {
    /// Maps the image at `path`.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be opened, or
    /// [`crate::Error::NotSupported`] for an empty file.
    pub fn from_file(path: &Path) -> Result<File> {
        Self::load(Physical::new(path)?)
    }

    /// Takes ownership of an in-memory image.
    ///
    /// # Errors
    /// Returns [`crate::Error::NotSupported`] for an empty buffer.
    pub fn from_mem(data: Vec<u8>) -> Result<File> {
        Self::load(Memory::new(data))
    }

    fn load<T: Backend + 'static>(backend: T) -> Result<File> {
        if backend.is_empty() {
            return Err(crate::Error::NotSupported);
        }
        Ok(File {
            data: Box::new(backend),
        })
    }

    /// The image bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.data()
    }

    /// Image size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` for an empty image; never the case for a loaded file.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(File::from_mem(Vec::new()), Err(Error::NotSupported)));
    }

    #[test]
    fn mapped_file_matches_contents() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("image.dbm");
        std::fs::write(&path, b"DBMI\x01\x00")?;
        let file = File::from_file(&path)?;
        assert_eq!(file.data(), b"DBMI\x01\x00");
        assert_eq!(file.len(), 6);
        assert!(matches!(
            File::from_file(&dir.path().join("missing.dbm")),
            Err(Error::FileError(_))
        ));
        Ok(())
    }
}
