// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use nix::errno::Errno;
use nix::poll::poll;
use nix::poll::PollFd;
use nix::poll::PollFlags;

use crate::mux_os::descriptor::AsRawDescriptor;
use crate::mux_utils::MuxResult;

/// Waits up to `timeout_ms` (negative blocks forever) for `descriptor` to become readable.
pub fn wait_readable(descriptor: &dyn AsRawDescriptor, timeout_ms: i32) -> MuxResult<bool> {
    let mut fds = [PollFd::new(
        descriptor.as_raw_descriptor(),
        PollFlags::POLLIN,
    )];
    loop {
        match poll(&mut fds, timeout_ms) {
            Ok(n) => return Ok(n > 0),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
