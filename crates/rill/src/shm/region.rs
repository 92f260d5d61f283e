// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rill developers

//! POSIX shared-memory region lifecycle.
//!
//! Thin safe wrapper around `shm_open` / `ftruncate` / `mmap`. The
//! creating side owns the name: its drop unlinks the object. Attaching
//! readers only unmap.
//!
//! Names follow POSIX rules: leading `/`, no other `/`, at most 255
//! bytes. Callers pass already-normalized names (see
//! [`super::normalize_name`]).

use super::{Result, ShmError};
use std::ffi::CString;
use std::io;
use std::ptr;

/// A mapped POSIX shared-memory object.
pub struct ShmRegion {
    ptr: *mut u8,
    size: usize,
    name: String,
    /// Creator unlinks the name on drop; readers leave it.
    owner: bool,
}

// SAFETY: the mapping is shared between processes by construction; all
// concurrently-mutated bytes inside it are accessed through atomics or
// raw-pointer copies governed by the PSHM publish protocol.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Create (writer side). Replaces any stale object with this name,
    /// sizes it, maps read-write, and zero-fills.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;
        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is a valid NUL-terminated string. Unlinking a
        // missing name is harmless; shm_open returns a valid fd or -1.
        let fd = unsafe {
            libc::shm_unlink(c_name.as_ptr());
            libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR | libc::O_EXCL, 0o600)
        };
        if fd < 0 {
            return Err(ShmError::Create(io::Error::last_os_error()));
        }

        // SAFETY: fd is the valid descriptor from shm_open above.
        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is still open; error path closes and unlinks.
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(ShmError::Create(err));
        }

        let ptr = Self::map(fd, size);
        // SAFETY: the mapping (if any) holds its own reference to the
        // object; the fd is no longer needed either way.
        unsafe { libc::close(fd) };
        let Some(ptr) = ptr else {
            let err = io::Error::last_os_error();
            // SAFETY: c_name is still valid; remove the unusable object.
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
            return Err(ShmError::Map(err));
        };

        // SAFETY: ptr maps exactly `size` writable bytes and no other
        // process can have mapped the object yet (O_EXCL after unlink).
        unsafe { ptr::write_bytes(ptr, 0, size) };

        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
            owner: true,
        })
    }

    /// Open (reader side). Maps an existing object read-write.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;
        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is a valid NUL-terminated string.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(ShmError::NotFound(name.to_string()));
            }
            return Err(ShmError::Open(err));
        }

        let ptr = Self::map(fd, size);
        // SAFETY: mapping holds its own reference; fd can close.
        unsafe { libc::close(fd) };
        let Some(ptr) = ptr else {
            return Err(ShmError::Map(io::Error::last_os_error()));
        };

        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
            owner: false,
        })
    }

    fn map(fd: libc::c_int, size: usize) -> Option<*mut u8> {
        // SAFETY: null hint lets the kernel pick the address; fd is valid
        // and the protection/flags combination is the standard shared
        // read-write mapping. MAP_FAILED is checked below.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            None
        } else {
            Some(ptr.cast())
        }
    }

    fn validate_name(name: &str) -> Result<()> {
        if !name.starts_with('/') {
            return Err(ShmError::InvalidName(format!(
                "name must start with '/': {name}"
            )));
        }
        if name.len() > 1 && name[1..].contains('/') {
            return Err(ShmError::InvalidName(format!(
                "name cannot contain '/' after the prefix: {name}"
            )));
        }
        if name.len() > 255 {
            return Err(ShmError::InvalidName(format!("name too long: {name}")));
        }
        Ok(())
    }

    /// Remove a named object. Missing names are not an error (idempotent
    /// cleanup after crashes).
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;
        // SAFETY: c_name is a valid NUL-terminated string; shm_unlink
        // only touches the filesystem namespace.
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(ShmError::Open(err));
            }
        }
        Ok(())
    }

    /// Whether a named object currently exists.
    #[must_use]
    pub fn exists(name: &str) -> bool {
        let Ok(c_name) = CString::new(name) else {
            return false;
        };
        // SAFETY: read-only open purely as an existence probe.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd >= 0 {
            // SAFETY: fd is valid and closed exactly once.
            unsafe { libc::close(fd) };
            true
        } else {
            false
        }
    }

    /// Raw pointer to the mapped bytes.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Mapping size in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The object name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/size came from the successful mmap in create/open
        // and Drop runs once.
        unsafe {
            libc::munmap(self.ptr.cast(), self.size);
        }
        if self.owner {
            let _ = Self::unlink(&self.name);
        }
    }
}
