// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::num::NonZeroUsize;

use libc::c_void;
use log::error;
use nix::sys::mman::mmap;
use nix::sys::mman::munmap;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;

use crate::mux_os::descriptor::AsRawDescriptor;
use crate::mux_utils::MuxError;
use crate::mux_utils::MuxIovec;
use crate::mux_utils::MuxResult;
use crate::mux_utils::VIRTMUX_MAP_ACCESS_MASK;
use crate::mux_utils::VIRTMUX_MAP_ACCESS_READ;
use crate::mux_utils::VIRTMUX_MAP_ACCESS_RW;
use crate::mux_utils::VIRTMUX_MAP_ACCESS_WRITE;

/// Wraps a shared memory mapping in the current process. Provides RAII semantics including munmap
/// when no longer needed.
#[derive(Debug)]
pub struct MemoryMapping {
    addr: *mut c_void,
    size: usize,
}

// The mapping is plain shared memory; synchronization is left to the users of the bytes.
unsafe impl Send for MemoryMapping {}
unsafe impl Sync for MemoryMapping {}

impl Drop for MemoryMapping {
    fn drop(&mut self) {
        // This is safe because we mmap the area at addr ourselves, and nobody
        // else is holding a reference to it.
        if let Err(e) = unsafe { munmap(self.addr, self.size) } {
            error!("munmap of {} bytes failed: {}", self.size, e);
        }
    }
}

impl MemoryMapping {
    pub fn from_descriptor(
        descriptor: &dyn AsRawDescriptor,
        size: usize,
        map_info: u32,
    ) -> MuxResult<MemoryMapping> {
        let prot = match map_info & VIRTMUX_MAP_ACCESS_MASK {
            VIRTMUX_MAP_ACCESS_READ => ProtFlags::PROT_READ,
            VIRTMUX_MAP_ACCESS_WRITE => ProtFlags::PROT_WRITE,
            VIRTMUX_MAP_ACCESS_RW => ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            _ => return Err(MuxError::InvalidArgument("incorrect access flags")),
        };

        let non_zero_size =
            NonZeroUsize::new(size).ok_or(MuxError::InvalidArgument("zero size mapping"))?;
        // Safe because we map a fresh region and check the result.
        let addr = unsafe {
            mmap(
                None,
                non_zero_size,
                prot,
                MapFlags::MAP_SHARED,
                descriptor.as_raw_descriptor(),
                0,
            )?
        };
        Ok(MemoryMapping { addr, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Describes the whole mapping as a single iovec. The iovec is valid while `self` lives.
    pub fn as_iovec(&self) -> MuxIovec {
        MuxIovec {
            base: self.addr,
            len: self.size,
        }
    }
}
