//! Anonymous and file-backed memory mappings.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use crate::error::{DbError, Result};

/// An owned `mmap` region, unmapped on drop.
#[derive(Debug)]
pub struct Mmap {
    data: *mut u8,
    len: usize,
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

impl Mmap {
    /// Map `len` bytes of anonymous memory, hinted for huge pages.
    pub fn map_memory(len: usize) -> Result<Mmap> {
        unsafe {
            let data = libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if data == libc::MAP_FAILED {
                return Err(DbError::Io(io::Error::last_os_error()));
            }
            #[cfg(target_os = "linux")]
            libc::madvise(data, len, libc::MADV_HUGEPAGE);
            Ok(Mmap { data: data.cast(), len })
        }
    }

    /// Map a file read-only.
    pub fn map_file(path: &Path) -> Result<Mmap> {
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| DbError::Storage("path contains NUL".into()))?;
        unsafe {
            let fd = libc::open(cpath.as_ptr(), libc::O_RDONLY);
            if fd < 0 {
                return Err(DbError::Io(io::Error::last_os_error()));
            }
            let mut stat: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut stat) != 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(DbError::Io(err));
            }
            let len = stat.st_size as usize;
            let data = libc::mmap(ptr::null_mut(), len, libc::PROT_READ, libc::MAP_PRIVATE, fd, 0);
            libc::close(fd);
            if data == libc::MAP_FAILED {
                return Err(DbError::Io(io::Error::last_os_error()));
            }
            Ok(Mmap { data: data.cast(), len })
        }
    }

    /// Touch every OS page in `[data, data + len)` so later accesses do not
    /// fault. Only valid ahead of any live allocation in the region.
    pub fn prefault(data: *mut u8, len: usize) {
        let os_page = 4096;
        let mut offset = 0;
        while offset < len {
            unsafe {
                let p = data.add(offset);
                ptr::write_volatile(p, ptr::read_volatile(p));
            }
            offset += os_page;
        }
    }

    #[inline]
    pub fn data(&self) -> *mut u8 {
        self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        if !self.data.is_null() {
            unsafe {
                libc::munmap(self.data.cast(), self.len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_mapping() {
        let map = Mmap::map_memory(1 << 20).unwrap();
        assert_eq!(map.len(), 1 << 20);
        unsafe {
            *map.data() = 42;
            assert_eq!(*map.data(), 42);
        }
        Mmap::prefault(map.data(), 1 << 20);
    }
}
