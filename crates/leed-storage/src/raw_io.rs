//! Raw file and block-device access
//!
//! Positioned reads and writes (`pread`/`pwrite`) over a regular file or a
//! block device, optionally opened with `O_DIRECT` on Linux. Direct handles
//! need block-aligned offsets, lengths and buffers; [`AlignedBuf`] provides
//! the buffers.

use leed_common::{Error, Result};
use std::alloc::{self, Layout};
use std::fs::{File, OpenOptions};
use std::ops::{Deref, DerefMut};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Alignment for direct I/O buffers and offsets
pub const DIRECT_ALIGNMENT: usize = 4096;

/// Positioned-I/O handle on a file or block device
#[derive(Debug)]
pub struct RawFile {
    file: File,
    path: PathBuf,
    size: u64,
    direct: bool,
}

impl RawFile {
    /// Open an existing file or block device
    ///
    /// # Errors
    /// Returns an error if the path cannot be opened or sized.
    pub fn open(path: impl AsRef<Path>, direct: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = Self::options(direct)
            .open(path)
            .map_err(|e| Error::storage(format!("failed to open {}: {e}", path.display())))?;
        let size = Self::device_size(&file, path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            size,
            direct,
        })
    }

    /// Create a regular file of `size` bytes, or open a block device as is
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or resized.
    pub fn create(path: impl AsRef<Path>, size: u64, direct: bool) -> Result<Self> {
        let path = path.as_ref();
        if is_block_device(path) {
            return Self::open(path, direct);
        }

        let mut options = Self::options(direct);
        options.create(true).truncate(true);
        let file = options
            .open(path)
            .map_err(|e| Error::storage(format!("failed to create {}: {e}", path.display())))?;
        file.set_len(size).map_err(|e| {
            Error::storage(format!("failed to size {} to {size} bytes: {e}", path.display()))
        })?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            size,
            direct,
        })
    }

    fn options(direct: bool) -> OpenOptions {
        let mut options = OpenOptions::new();
        options.read(true).write(true);
        #[cfg(target_os = "linux")]
        if direct {
            options.custom_flags(libc::O_DIRECT);
        }
        #[cfg(not(target_os = "linux"))]
        let _ = direct;
        options
    }

    fn device_size(file: &File, path: &Path) -> Result<u64> {
        if is_block_device(path) {
            return block_device_size(file, path);
        }
        file.metadata()
            .map(|m| m.len())
            .map_err(|e| Error::storage(format!("failed to stat {}: {e}", path.display())))
    }

    /// Size in bytes
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn is_direct(&self) -> bool {
        self.direct
    }

    /// Fill `buf` from `offset`
    ///
    /// # Errors
    /// Returns an error on misaligned direct I/O, short reads or device errors.
    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_alignment(offset, buf.as_ptr(), buf.len())?;
        self.file.read_exact_at(buf, offset).map_err(|e| {
            Error::storage(format!(
                "read of {} bytes at {offset} failed on {}: {e}",
                buf.len(),
                self.path.display()
            ))
        })
    }

    /// Write all of `buf` at `offset`
    ///
    /// # Errors
    /// Returns an error on misaligned direct I/O or device errors.
    pub fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_alignment(offset, buf.as_ptr(), buf.len())?;
        self.file.write_all_at(buf, offset).map_err(|e| {
            Error::storage(format!(
                "write of {} bytes at {offset} failed on {}: {e}",
                buf.len(),
                self.path.display()
            ))
        })
    }

    /// Flush data to stable storage
    ///
    /// # Errors
    /// Returns an error if `fdatasync` fails.
    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| Error::storage(format!("sync failed on {}: {e}", self.path.display())))
    }

    fn check_alignment(&self, offset: u64, ptr: *const u8, len: usize) -> Result<()> {
        if !self.direct {
            return Ok(());
        }
        if offset % DIRECT_ALIGNMENT as u64 != 0
            || len % DIRECT_ALIGNMENT != 0
            || (ptr as usize) % DIRECT_ALIGNMENT != 0
        {
            return Err(Error::invalid_argument(format!(
                "direct I/O at {offset} len {len} is not {DIRECT_ALIGNMENT}-aligned"
            )));
        }
        Ok(())
    }
}

fn is_block_device(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(path).is_ok_and(|m| m.file_type().is_block_device())
}

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn block_device_size(file: &File, path: &Path) -> Result<u64> {
    use std::os::unix::io::AsRawFd;

    const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

    let mut size: u64 = 0;
    // SAFETY: BLKGETSIZE64 writes one u64 through the pointer.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &raw mut size) };
    if ret == -1 {
        return Err(Error::storage(format!(
            "failed to size block device {}: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }
    Ok(size)
}

#[cfg(not(target_os = "linux"))]
fn block_device_size(file: &File, path: &Path) -> Result<u64> {
    use std::io::{Seek, SeekFrom};
    let mut handle = file;
    handle
        .seek(SeekFrom::End(0))
        .map_err(|e| Error::storage(format!("failed to size {}: {e}", path.display())))
}

/// Zeroed heap buffer aligned for direct I/O
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer is uniquely owned heap memory.
#[allow(unsafe_code)]
unsafe impl Send for AlignedBuf {}
// SAFETY: shared access only hands out `&[u8]`.
#[allow(unsafe_code)]
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    /// Allocate `len` zeroed bytes; `len` is rounded up to the alignment
    ///
    /// # Panics
    /// Panics if the allocation fails.
    #[must_use]
    #[allow(unsafe_code)]
    pub fn zeroed(len: usize) -> Self {
        let len = len.max(1).next_multiple_of(DIRECT_ALIGNMENT);
        let layout = Layout::from_size_align(len, DIRECT_ALIGNMENT)
            .unwrap_or_else(|_| panic!("invalid aligned buffer length {len}"));
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout)
        };
        Self { ptr, layout }
    }

    /// Copy `data` into a fresh aligned buffer
    #[must_use]
    pub fn copy_from(data: &[u8]) -> Self {
        let mut buf = Self::zeroed(data.len());
        buf[..data.len()].copy_from_slice(data);
        buf
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    #[allow(unsafe_code)]
    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialized bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl DerefMut for AlignedBuf {
    #[allow(unsafe_code)]
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid and uniquely borrowed.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuf {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.img");

        let file = RawFile::create(&path, 64 * 1024, false).unwrap();
        assert_eq!(file.size(), 64 * 1024);

        file.write_all_at(4096, b"hello raw").unwrap();
        let mut buf = vec![0u8; 9];
        file.read_exact_at(4096, &mut buf).unwrap();
        assert_eq!(&buf, b"hello raw");
        file.sync().unwrap();

        let reopened = RawFile::open(&path, false).unwrap();
        assert_eq!(reopened.size(), 64 * 1024);
    }

    #[test]
    fn test_read_past_end_fails() {
        let dir = tempdir().unwrap();
        let file = RawFile::create(dir.path().join("small.img"), 4096, false).unwrap();
        let mut buf = vec![0u8; 4096];
        assert!(file.read_exact_at(4096, &mut buf).is_err());
    }

    #[test]
    fn test_aligned_buf() {
        let buf = AlignedBuf::copy_from(b"abc");
        assert_eq!(buf.len(), DIRECT_ALIGNMENT);
        assert_eq!(buf.as_ptr() as usize % DIRECT_ALIGNMENT, 0);
        assert_eq!(&buf[..3], b"abc");
        assert!(buf[3..].iter().all(|&b| b == 0));
    }
}
