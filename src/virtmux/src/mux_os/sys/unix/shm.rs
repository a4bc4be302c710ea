// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::convert::TryInto;
use std::ffi::CString;

use libc::off_t;
use nix::sys::memfd::memfd_create;
use nix::sys::memfd::MemFdCreateFlag;
use nix::unistd::ftruncate;
use nix::unistd::sysconf;
use nix::unistd::SysconfVar;

use crate::mux_os::descriptor::AsRawDescriptor;
use crate::mux_os::descriptor::FromRawDescriptor;
use crate::mux_os::descriptor::IntoRawDescriptor;
use crate::mux_os::descriptor::SafeDescriptor;
use crate::mux_os::RawDescriptor;
use crate::mux_utils::MuxError;
use crate::mux_utils::MuxResult;

/// An anonymous, sealable memory file.
pub struct SharedMemory {
    descriptor: SafeDescriptor,
    size: u64,
}

impl SharedMemory {
    /// Creates a new shared memory file descriptor of `size` bytes.
    ///
    /// `debug_name` appears in `/proc/self/fd/<shm fd>` and does not need to be unique. The file
    /// descriptor is opened with the close on exec flag and allows memfd sealing.
    pub fn new(debug_name: &str, size: u64) -> MuxResult<SharedMemory> {
        let debug_name = CString::new(debug_name)?;
        let fd = memfd_create(
            &debug_name,
            MemFdCreateFlag::MFD_CLOEXEC | MemFdCreateFlag::MFD_ALLOW_SEALING,
        )?;
        // Safe because memfd_create just handed us this descriptor.
        let descriptor = unsafe { SafeDescriptor::from_raw_descriptor(fd) };

        let size_off_t: off_t = size.try_into()?;
        ftruncate(descriptor.as_raw_descriptor(), size_off_t)?;

        Ok(SharedMemory { descriptor, size })
    }

    /// Gets the size in bytes of the shared memory.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl AsRawDescriptor for SharedMemory {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.descriptor.as_raw_descriptor()
    }
}

impl IntoRawDescriptor for SharedMemory {
    fn into_raw_descriptor(self) -> RawDescriptor {
        self.descriptor.into_raw_descriptor()
    }
}

impl From<SharedMemory> for SafeDescriptor {
    fn from(sm: SharedMemory) -> SafeDescriptor {
        sm.descriptor
    }
}

/// Uses the system's page size in bytes to round the given value up to the nearest page boundary.
pub fn round_up_to_page_size(v: u64) -> MuxResult<u64> {
    let page_size_opt = sysconf(SysconfVar::PAGE_SIZE)?;
    let page_size = page_size_opt.ok_or(MuxError::InvalidArgument("no page size"))? as u64;
    let mask = page_size - 1;
    let padded = checked_arithmetic!(v + mask)?;
    Ok(padded & !mask)
}
