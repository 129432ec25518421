//! Shelf file create/open/map plumbing.

use std::fs::{File, OpenOptions, Permissions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use tracing::error;

use crate::fam::{self, RegisteredRegion};

/// A shared mapping of a shelf file, registered for persistent atomics.
pub(crate) struct Mapping {
    addr: NonNull<u8>,
    len: usize,
    region: RegisteredRegion,
}

impl Mapping {
    /// Map `len` bytes of `file` shared at offset 0.
    pub(crate) fn map(file: &File, len: usize) -> io::Result<Self> {
        // SAFETY: len is nonzero and the fd is valid for the duration of the
        // call; the mapping is unmapped in Drop before the file is closed.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let addr = NonNull::new(addr.cast::<u8>()).ok_or_else(|| io::Error::other("mmap returned null"))?;
        // SAFETY: the span was just mapped and lives until Drop.
        let region = unsafe { RegisteredRegion::register(addr.as_ptr(), len) };
        Ok(Self { addr, len, region })
    }

    /// Base address of the mapping.
    #[inline]
    pub(crate) fn base(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Length of the mapping in bytes.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Flush the whole mapping to the backing file.
    pub(crate) fn sync(&self) -> io::Result<()> {
        // SAFETY: addr/len describe a live mapping created by mmap.
        let rc = unsafe { libc::msync(self.addr.as_ptr().cast(), self.len, libc::MS_SYNC) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: addr/len describe a live mapping created by mmap.
        let rc = unsafe { libc::munmap(self.addr.as_ptr().cast(), self.len) };
        if rc != 0 {
            error!(len = self.len, "failed to unmap shelf");
        }
    }
}

// SAFETY: the mapping is plain shared memory; all concurrent access goes
// through the persistent-atomics interface.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// An open, mapped shelf backing file.
pub(crate) struct ShelfFile {
    path: PathBuf,
    len: u64,
    file: File,
    mapping: Mapping,
}

impl ShelfFile {
    /// Create a new shelf file of exactly `len` bytes and map it.
    ///
    /// Fails if the file already exists. The file mode is set explicitly so
    /// the caller's requested permissions are not umask-masked. The caller
    /// is responsible for formatting the mapping and writing the magic word
    /// last.
    pub(crate) fn create(path: impl AsRef<Path>, len: u64, mode: u32) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .inspect_err(|e| error!(path = %path.display(), %e, "failed to create shelf file"))?;
        file.set_len(len)?;
        file.set_permissions(Permissions::from_mode(mode))?;

        let mapping = Mapping::map(&file, len as usize)
            .inspect_err(|e| error!(path = %path.display(), %e, "failed to map shelf file"))?;

        Ok(Self {
            path,
            len,
            file,
            mapping,
        })
    }

    /// Open and map an existing shelf file, verifying `magic`.
    pub(crate) fn open(path: impl AsRef<Path>, magic: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .inspect_err(|e| error!(path = %path.display(), %e, "failed to open shelf file"))?;
        let len = file.metadata()?.len();
        if len == 0 || !len.is_power_of_two() {
            return Err(io::Error::other("shelf file has invalid length"));
        }

        let mapping = Mapping::map(&file, len as usize)
            .inspect_err(|e| error!(path = %path.display(), %e, "failed to map shelf file"))?;

        let shelf = Self {
            path,
            len,
            file,
            mapping,
        };
        if shelf.read_magic() != magic {
            error!(path = %shelf.path.display(), "shelf file has wrong magic");
            return Err(io::Error::other("shelf file has wrong magic"));
        }
        Ok(shelf)
    }

    /// Whether a shelf file exists at `path`.
    pub(crate) fn exists(path: impl AsRef<Path>) -> bool {
        path.as_ref().exists()
    }

    /// Remove the backing file.
    pub(crate) fn destroy(path: impl AsRef<Path>) -> io::Result<()> {
        std::fs::remove_file(path.as_ref())
            .inspect_err(|e| error!(path = %path.as_ref().display(), %e, "failed to remove shelf file"))
    }

    /// Base address of the mapping.
    #[inline]
    pub(crate) fn base(&self) -> *mut u8 {
        self.mapping.base()
    }

    /// File length in bytes.
    #[inline]
    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    /// Path of the backing file.
    #[inline]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Read the magic word at offset 0.
    pub(crate) fn read_magic(&self) -> u64 {
        // SAFETY: offset 0 of the mapping is in bounds and 8-aligned.
        unsafe { fam::load64(self.base().cast()) }
    }

    /// Write the magic word at offset 0 and persist it.
    ///
    /// Done last during formatting so a crash mid-create leaves a file that
    /// fails verification instead of one that parses as empty.
    pub(crate) fn write_magic(&self, magic: u64) {
        // SAFETY: offset 0 of the mapping is in bounds and 8-aligned.
        unsafe {
            fam::store64(self.base().cast(), magic);
            fam::persist(self.base(), 8);
        }
    }

    /// Flush the whole mapping to the backing file.
    pub(crate) fn sync(&self) -> io::Result<()> {
        self.mapping.sync()
    }

    /// Read the file permission bits.
    pub(crate) fn mode(&self) -> io::Result<u32> {
        Ok(self.file.metadata()?.permissions().mode() & 0o7777)
    }

    /// Set the file permission bits. Affects only future opens.
    pub(crate) fn set_mode(&self, mode: u32) -> io::Result<()> {
        self.file.set_permissions(Permissions::from_mode(mode))
    }
}
