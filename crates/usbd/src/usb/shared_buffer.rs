//! Shared-memory mapping for bulk streaming
//!
//! Callers hand over a file descriptor and a size. The region is mapped
//! read/write and shared, the descriptor is closed right after mapping, and
//! the mapping is released when the [`SharedBuffer`] drops.

use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap};
use protocol::{Result, UsbdError};
use std::ffi::c_void;
use std::fs::File;
use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use tracing::{debug, warn};

/// Caller-supplied shared memory handle
#[derive(Debug)]
pub struct SharedMemory {
    fd: OwnedFd,
    size: usize,
}

impl SharedMemory {
    pub fn new(fd: OwnedFd, size: usize) -> Self {
        Self { fd, size }
    }

    /// Share an already sized file
    pub fn from_file(file: File, size: usize) -> Self {
        Self::new(OwnedFd::from(file), size)
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Mapped shared memory region
pub struct SharedBuffer {
    addr: NonNull<c_void>,
    size: usize,
}

// The mapping is plain memory shared with the caller; all access goes
// through the owning stream's buffer lock.
unsafe impl Send for SharedBuffer {}
unsafe impl Sync for SharedBuffer {}

impl SharedBuffer {
    /// Map the whole region, consuming its descriptor
    pub fn map(memory: SharedMemory) -> Result<Self> {
        let length = NonZeroUsize::new(memory.size).ok_or(UsbdError::InvalidParam)?;

        // SAFETY: fresh shared mapping of a caller-owned descriptor, not
        // aliased by any Rust reference.
        let addr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &memory.fd,
                0,
            )
        }
        .map_err(|e| {
            warn!("mmap of {} bytes failed: {}", memory.size, e);
            UsbdError::MallocFail
        })?;

        debug!("Mapped {} bytes of shared memory", memory.size);
        Ok(Self {
            addr,
            size: memory.size,
        })
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: addr points to `size` mapped bytes for the life of self.
        unsafe { std::slice::from_raw_parts(self.addr.as_ptr().cast::<u8>(), self.size) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self gives exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.addr.as_ptr().cast::<u8>(), self.size) }
    }

    /// Copy out up to `len` bytes starting at `offset`
    pub fn read_at(&self, offset: usize, len: usize) -> Vec<u8> {
        let start = offset.min(self.size);
        let end = offset.saturating_add(len).min(self.size);
        self.as_slice()[start..end].to_vec()
    }

    /// Copy `data` in at `offset`, returning the bytes that fit
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> usize {
        let start = offset.min(self.size);
        let count = data.len().min(self.size - start);
        self.as_mut_slice()[start..start + count].copy_from_slice(&data[..count]);
        count
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        // SAFETY: addr/size came from a successful mmap and are unmapped once.
        if let Err(e) = unsafe { munmap(self.addr, self.size) } {
            warn!("munmap of {} bytes failed: {}", self.size, e);
        } else {
            debug!("Unmapped {} bytes of shared memory", self.size);
        }
    }
}
