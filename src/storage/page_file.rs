//! Page file - low-level I/O for the durable chunk store.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::common::{Error, Result};

/// A single data file of fixed-size pages.
///
/// # File Layout
/// Pages are laid out sequentially; page N lives at byte offset
/// `N * page_size`. The page size is fixed when the file is created and
/// must match on reopen (the disk manager carries it in its config).
///
/// # Thread Safety
/// `PageFile` is single-threaded; the owning disk manager serializes
/// access behind its state lock.
///
/// # Durability
/// Individual writes are buffered by the OS; callers batch their page
/// writes and call [`sync`] once, and must not treat any write as
/// durable before `sync` returns.
///
/// [`sync`]: PageFile::sync
pub struct PageFile {
    file: File,
    page_size: usize,
    /// Number of pages in the file.
    page_count: u32,
}

impl PageFile {
    /// Create a new page file.
    ///
    /// # Errors
    /// Returns an error if the file already exists or cannot be created.
    pub fn create<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        assert!(page_size > 0, "page_size must be > 0");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        Ok(Self {
            file,
            page_size,
            page_count: 0,
        })
    }

    /// Open an existing page file.
    ///
    /// The page count is derived from the file size.
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        assert!(page_size > 0, "page_size must be > 0");
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let file_size = file.metadata()?.len();
        let page_count = (file_size / page_size as u64) as u32;

        Ok(Self {
            file,
            page_size,
            page_count,
        })
    }

    /// Open an existing page file, or create one if absent.
    pub fn open_or_create<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        if path.as_ref().exists() {
            Self::open(path, page_size)
        } else {
            Self::create(path, page_size)
        }
    }

    /// Allocate a new zeroed page at the end of the file.
    pub fn allocate_page(&mut self) -> Result<u32> {
        let page_id = self.page_count;
        let offset = (page_id as u64) * (self.page_size as u64);
        self.file.seek(SeekFrom::Start(offset))?;

        let zeros = vec![0u8; self.page_size];
        self.file.write_all(&zeros)?;

        self.page_count += 1;
        Ok(page_id)
    }

    /// Read one page into `dst`.
    ///
    /// # Panics
    /// Panics if `dst.len() != page_size`.
    ///
    /// # Errors
    /// `Error::PageNotFound` if the page was never allocated.
    pub fn read_page_into(&mut self, page_id: u32, dst: &mut [u8]) -> Result<()> {
        assert_eq!(dst.len(), self.page_size);
        if page_id >= self.page_count {
            return Err(Error::PageNotFound(page_id));
        }

        let offset = (page_id as u64) * (self.page_size as u64);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(dst)?;
        Ok(())
    }

    /// Write one page.
    ///
    /// Not durable until [`sync`] returns.
    ///
    /// # Panics
    /// Panics if `src.len() != page_size`.
    ///
    /// # Errors
    /// `Error::PageNotFound` if the page was never allocated.
    ///
    /// [`sync`]: PageFile::sync
    pub fn write_page(&mut self, page_id: u32, src: &[u8]) -> Result<()> {
        assert_eq!(src.len(), self.page_size);
        if page_id >= self.page_count {
            return Err(Error::PageNotFound(page_id));
        }

        let offset = (page_id as u64) * (self.page_size as u64);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(src)?;
        Ok(())
    }

    /// fsync the file.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn page_count(&self) -> u32 {
        self.page_count
    }
}
