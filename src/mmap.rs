use std::ffi::c_void;
use std::os::fd::AsFd;
use std::ptr::null_mut;

use anyhow::{ensure, Context, Result};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};

/// A specfile mapped read-only.  Strings decoded out of the mapping borrow
/// from it through an `Arc` instead of copying, so the region stays mapped
/// for as long as any of them is alive and is unmapped exactly once.
pub struct MmapArea {
    addr: *mut c_void,
    len: usize,
}

// The mapping is PROT_READ and private: nothing ever writes through it.
unsafe impl Send for MmapArea {}
unsafe impl Sync for MmapArea {}

impl MmapArea {
    pub fn new(fd: impl AsFd, len: u64) -> Result<MmapArea> {
        ensure!(len > 0, "refusing to map an empty file");
        let len = len as usize;
        let addr = unsafe {
            mmap(null_mut(), len, ProtFlags::READ, MapFlags::PRIVATE, fd, 0)
                .context("mmap of specfile failed")?
        };
        Ok(MmapArea { addr, len })
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the mapping covers exactly len readable bytes until drop
        unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.len) }
    }
}

impl Drop for MmapArea {
    fn drop(&mut self) {
        // SAFETY: addr/len are the values the kernel handed us in new()
        let _ = unsafe { munmap(self.addr, self.len) };
    }
}
