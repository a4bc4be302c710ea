// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fence sequencing.  Fences retire strictly in creation order and the fence handler sees every
//! fence exactly once.

use std::collections::VecDeque;
use std::os::unix::io::AsRawFd;

use log::debug;
use log::warn;
use vmm_sys_util::eventfd::EventFd;
use vmm_sys_util::eventfd::EFD_NONBLOCK;

use crate::mux_os::SafeDescriptor;
use crate::mux_utils::*;

struct PendingFence {
    fence: MuxFence,
    waiters: Vec<EventFd>,
}

impl PendingFence {
    fn signal(&self) {
        for waiter in &self.waiters {
            if let Err(e) = waiter.write(1) {
                warn!("failed to signal waiter of fence {}: {}", self.fence.fence_id, e);
            }
        }
    }
}

fn event_handle(event: &EventFd) -> MuxResult<MuxHandle> {
    let os_handle = SafeDescriptor::try_from(event as &dyn AsRawFd)?;
    Ok(MuxHandle {
        os_handle,
        handle_type: VIRTMUX_FENCE_HANDLE_TYPE_OPAQUE_FD,
    })
}

fn signaled_handle() -> MuxResult<MuxHandle> {
    let event = EventFd::new(EFD_NONBLOCK)?;
    event.write(1)?;
    event_handle(&event)
}

pub struct FenceSequencer {
    pending: VecDeque<PendingFence>,
    last_created: Option<u64>,
    last_retired: u64,
    handler: MuxFenceHandler,
}

impl FenceSequencer {
    pub fn new(handler: MuxFenceHandler) -> FenceSequencer {
        FenceSequencer {
            pending: VecDeque::new(),
            last_created: None,
            last_retired: 0,
            handler,
        }
    }

    /// Fails unless `fence_id` is above every fence created so far.
    pub fn check_next(&self, fence_id: u64) -> MuxResult<()> {
        match self.last_created {
            Some(last) if fence_id <= last => {
                Err(MuxError::InvalidArgument("fence ids must increase"))
            }
            _ => Ok(()),
        }
    }

    /// Queues `fence` behind every pending fence.
    pub fn create_fence(&mut self, fence: MuxFence) -> MuxResult<()> {
        self.check_next(fence.fence_id)?;
        self.last_created = Some(fence.fence_id);
        self.pending.push_back(PendingFence {
            fence,
            waiters: Vec::new(),
        });
        Ok(())
    }

    /// Retires pending fences up to and including `retired_through`, oldest first.
    pub fn poll(&mut self, retired_through: Option<u64>) {
        let retired_through = match retired_through {
            Some(id) => id,
            None => return,
        };

        while self
            .pending
            .front()
            .map_or(false, |p| p.fence.fence_id <= retired_through)
        {
            if let Some(pending) = self.pending.pop_front() {
                pending.signal();
                self.last_retired = pending.fence.fence_id;
                self.handler.call(pending.fence);
            }
        }
    }

    /// The id of the most recently retired fence, 0 before any retires.
    pub fn last_fence(&self) -> u64 {
        self.last_retired
    }

    /// The id of the most recently created fence, 0 before any are created.
    pub fn last_created(&self) -> u64 {
        self.last_created.unwrap_or(0)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Returns a descriptor that becomes readable once fence `seqno` has retired.  Anything at or
    /// before the oldest pending fence is handed out already signaled.
    pub fn export_fence(&mut self, seqno: u64) -> MuxResult<MuxHandle> {
        let oldest = match self.pending.front() {
            Some(pending) => pending.fence.fence_id,
            None => return signaled_handle(),
        };
        if seqno <= oldest {
            return signaled_handle();
        }

        match self.pending.iter_mut().find(|p| p.fence.fence_id == seqno) {
            Some(pending) => {
                let event = EventFd::new(EFD_NONBLOCK)?;
                let handle = event_handle(&event)?;
                pending.waiters.push(event);
                Ok(handle)
            }
            None => {
                debug!("export of fence {} which is not pending", seqno);
                Err(MuxError::NotFound)
            }
        }
    }

    /// Drops every pending fence.  Exported handles are signaled so nobody waits forever.
    pub fn reset(&mut self) {
        for pending in self.pending.drain(..) {
            pending.signal();
        }
        self.last_created = None;
        self.last_retired = 0;
    }
}
