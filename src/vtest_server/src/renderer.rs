// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-connection command handling of the vtest transport.

use std::collections::BTreeMap as Map;
use std::io::ErrorKind;
use std::io::IoSlice;
use std::io::IoSliceMut;
use std::io::Read;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::thread;

use log::debug;
use log::info;
use log::warn;
use nix::sys::socket::sendmsg;
use nix::sys::socket::ControlMessage;
use nix::sys::socket::MsgFlags;
use virtmux::*;
use zerocopy::AsBytes;

use crate::config::TransportConfig;
use crate::protocol::*;

static NEXT_CTX_ID: AtomicU32 = AtomicU32::new(1);

const BUSY_WAIT_POLL_MS: i32 = 10;

/// The multiplexer and fence counter shared by every connection of a server.
pub struct SharedRenderer {
    pub mux: Virtmux,
    next_fence_id: u64,
}

impl SharedRenderer {
    pub fn new(mux: Virtmux) -> SharedRenderer {
        SharedRenderer {
            mux,
            next_fence_id: 1,
        }
    }

    /// Creates the next fence on `ctx_id`.  Ids are handed out under the lock so they reach the
    /// sequencer in increasing order.
    fn create_fence(&mut self, ctx_id: u32) -> MuxResult<u64> {
        let fence_id = self.next_fence_id;
        self.mux.create_fence(MuxFence {
            flags: VIRTMUX_FLAG_FENCE,
            fence_id,
            ctx_id,
            ring_idx: 0,
        })?;
        self.next_fence_id += 1;
        Ok(fence_id)
    }
}

pub type RendererHandle = Arc<Mutex<SharedRenderer>>;

/// Builds the renderer shared by the connections of one server.
pub fn new_renderer() -> MuxResult<RendererHandle> {
    let fence_handler =
        MuxFenceHandler::new(|fence: MuxFence| debug!("fence {} retired", fence.fence_id));
    let mux = VirtmuxBuilder::new(0)
        .set_use_thread_sync(true)
        .build(fence_handler)?;
    Ok(Arc::new(Mutex::new(SharedRenderer::new(mux))))
}

fn lock(renderer: &RendererHandle) -> MuxResult<MutexGuard<SharedRenderer>> {
    renderer
        .lock()
        .map_err(|_| MuxError::ComponentError(libc::EIO))
}

struct VtestContext {
    ctx_id: u32,
    capset_id: u32,
}

#[derive(Default)]
struct VtestResource {
    shm: Option<MemoryMapping>,
}

/// One client.  Contexts and resources it created are released when it is dropped.
pub struct VtestConnection {
    stream: UnixStream,
    renderer: RendererHandle,
    config: TransportConfig,
    protocol_version: u32,
    debug_name: String,
    // The last entry is the current context.
    contexts: Vec<VtestContext>,
    resources: Map<u32, VtestResource>,
    last_fence_id: u64,
    poll_descriptor: Option<MuxDescriptor>,
}

impl VtestConnection {
    pub fn new(
        stream: UnixStream,
        renderer: RendererHandle,
        config: TransportConfig,
    ) -> VtestConnection {
        VtestConnection {
            stream,
            renderer,
            config,
            protocol_version: 0,
            debug_name: String::new(),
            contexts: Vec::new(),
            resources: Map::new(),
            last_fence_id: 0,
            poll_descriptor: None,
        }
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    /// Handles frames until the client hangs up or a command fails.
    pub fn serve(&mut self) -> MuxResult<()> {
        while self.process_one()? {}
        Ok(())
    }

    /// Reads and applies one frame.  Returns false once the client has hung up.
    pub fn process_one(&mut self) -> MuxResult<bool> {
        let mut header = [0u32; VTEST_HDR_SIZE];
        match self.stream.read_exact(header[..].as_bytes_mut()) {
            Ok(()) => (),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        let (length, cmd) = (header[VTEST_CMD_LEN], header[VTEST_CMD_ID]);

        // TRANSFER_PUT data trails the header but is not counted in its length.
        if let Some(expected) = vcmd_fixed_length(cmd) {
            if length as usize != expected {
                warn!(
                    "{} declares {} dwords, expected {}",
                    vcmd_str(cmd),
                    length,
                    expected
                );
                return Err(MuxError::ProtocolViolation("frame length mismatch"));
            }
        }

        lock(&self.renderer)?.mux.event_poll();
        let result = match cmd {
            VCMD_GET_CAPS => self.get_caps(),
            VCMD_RESOURCE_CREATE => self.resource_create(),
            VCMD_RESOURCE_UNREF => self.resource_unref(),
            VCMD_TRANSFER_GET => self.transfer_get(),
            VCMD_TRANSFER_PUT => self.transfer_put(),
            VCMD_SUBMIT_CMD => self.submit_cmd(length),
            VCMD_RESOURCE_BUSY_WAIT => self.resource_busy_wait(),
            VCMD_CREATE_RENDERER => self.create_renderer(length),
            VCMD_GET_CAPS2 => self.get_caps2(),
            VCMD_PING_PROTOCOL_VERSION => self.write_reply(VCMD_PING_PROTOCOL_VERSION, &[]),
            VCMD_PROTOCOL_VERSION => self.negotiate_version(),
            VCMD_RESOURCE_CREATE2 => self.resource_create2(),
            VCMD_TRANSFER_GET2 => self.transfer_get2(),
            VCMD_TRANSFER_PUT2 => self.transfer_put2(),
            VCMD_GET_PARAM => self.get_param(),
            VCMD_GET_CAPSET => self.get_capset(),
            VCMD_CONTEXT_INIT => self.context_init(),
            _ => Err(MuxError::UnknownCommand(cmd)),
        };

        if let Err(e) = &result {
            warn!("{} ({} dwords) failed: {}", vcmd_str(cmd), length, e);
        }
        result.map(|()| true)
    }

    fn read_dwords(&mut self, buf: &mut [u32]) -> MuxResult<()> {
        self.stream.read_exact(buf.as_bytes_mut())?;
        Ok(())
    }

    fn read_payload(&mut self, len: usize) -> MuxResult<Vec<u8>> {
        if len > self.config.max_length {
            return Err(MuxError::OutOfMemory);
        }
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload)?;
        Ok(payload)
    }

    fn write_header(&mut self, length: u32, cmd: u32) -> MuxResult<()> {
        let header = [length, cmd];
        self.stream.write_all(header[..].as_bytes())?;
        Ok(())
    }

    fn write_reply(&mut self, cmd: u32, payload: &[u32]) -> MuxResult<()> {
        self.write_header(payload.len() as u32, cmd)?;
        self.stream.write_all(payload.as_bytes())?;
        Ok(())
    }

    fn send_descriptor(&self, descriptor: &dyn AsRawDescriptor) -> MuxResult<()> {
        let fds = [descriptor.as_raw_descriptor()];
        let marker = [0u8; 1];
        sendmsg::<()>(
            self.stream.as_raw_fd(),
            &[IoSlice::new(&marker)],
            &[ControlMessage::ScmRights(&fds)],
            MsgFlags::empty(),
            None,
        )?;
        Ok(())
    }

    fn create_context(&mut self, capset_id: u32) -> MuxResult<u32> {
        let ctx_id = NEXT_CTX_ID.fetch_add(1, Ordering::SeqCst);
        lock(&self.renderer)?
            .mux
            .create_context(ctx_id, capset_id, Some(self.debug_name.as_str()))?;
        info!(
            "context {} (capset {}) for \"{}\"",
            ctx_id, capset_id, self.debug_name
        );
        self.contexts.push(VtestContext { ctx_id, capset_id });
        Ok(ctx_id)
    }

    /// The current context, created on first use.
    fn current_context(&mut self) -> MuxResult<u32> {
        match self.contexts.last() {
            Some(ctx) => Ok(ctx.ctx_id),
            None => self.create_context(0),
        }
    }

    fn create_fence(&mut self, ctx_id: u32) -> MuxResult<()> {
        self.last_fence_id = lock(&self.renderer)?.create_fence(ctx_id)?;
        Ok(())
    }

    fn create_renderer(&mut self, length: u32) -> MuxResult<()> {
        if length > VTEST_MAX_NAME_LENGTH {
            return Err(MuxError::InvalidArgument("debug name too long"));
        }
        let name = self.read_payload(length as usize)?;
        self.debug_name = String::from_utf8_lossy(&name)
            .trim_end_matches('\0')
            .to_string();
        info!("client \"{}\"", self.debug_name);
        Ok(())
    }

    fn negotiate_version(&mut self) -> MuxResult<()> {
        let mut buf = [0u32; VCMD_PROTOCOL_VERSION_SIZE];
        self.read_dwords(&mut buf)?;
        let mut version = buf[0].min(VTEST_PROTOCOL_VERSION);
        // Version 2 moved transfers into shared memory.
        if version >= 2 && !self.config.use_shm {
            version = 1;
        }
        self.protocol_version = version;
        debug!("client proposed version {}, using {}", buf[0], version);
        self.write_reply(VCMD_PROTOCOL_VERSION, &[version])
    }

    fn get_caps(&mut self) -> MuxResult<()> {
        let caps = lock(&self.renderer)?
            .mux
            .get_capset(VIRTMUX_CAPSET_VIRGL, 1);
        if caps.is_empty() {
            return Err(MuxError::Unsupported);
        }
        // Clients size the caps from the length field minus one, counted in bytes.
        self.write_header(caps.len() as u32 + 1, VCMD_GET_CAPS)?;
        self.stream.write_all(&caps)?;
        Ok(())
    }

    fn get_caps2(&mut self) -> MuxResult<()> {
        let caps = {
            let renderer = lock(&self.renderer)?;
            let mut caps = Vec::new();
            for index in 0..renderer.mux.get_num_capsets() {
                let (capset_id, version, _) = renderer.mux.get_capset_info(index)?;
                if capset_id == VIRTMUX_CAPSET_VIRGL2 {
                    caps = renderer.mux.get_capset(capset_id, version);
                }
            }
            caps
        };
        if caps.is_empty() {
            return Err(MuxError::Unsupported);
        }
        // Clients recognize v2 caps by reply id 2.
        self.write_header(caps.len() as u32 + 1, VCMD_RESOURCE_CREATE)?;
        self.stream.write_all(&caps)?;
        Ok(())
    }

    fn get_capset(&mut self) -> MuxResult<()> {
        let mut buf = [0u32; VCMD_GET_CAPSET_SIZE];
        self.read_dwords(&mut buf)?;
        let caps = lock(&self.renderer)?
            .mux
            .get_capset(buf[VCMD_GET_CAPSET_ID], buf[VCMD_GET_CAPSET_VERSION]);
        if caps.is_empty() {
            return self.write_reply(VCMD_GET_CAPSET, &[0]);
        }
        if caps.len() % 4 != 0 {
            return Err(MuxError::InvalidArgument("capset is not dword sized"));
        }
        self.write_header(1 + caps.len() as u32 / 4, VCMD_GET_CAPSET)?;
        self.stream.write_all(1u32.as_bytes())?;
        self.stream.write_all(&caps)?;
        Ok(())
    }

    fn get_param(&mut self) -> MuxResult<()> {
        let mut buf = [0u32; VCMD_GET_PARAM_SIZE];
        self.read_dwords(&mut buf)?;
        let reply = match buf[VCMD_GET_PARAM_PARAM] {
            // Valid, and no sync queues.
            VCMD_PARAM_MAX_SYNC_QUEUE_COUNT => [1, 0],
            _ => [0, 0],
        };
        self.write_reply(VCMD_GET_PARAM, &reply)
    }

    fn context_init(&mut self) -> MuxResult<()> {
        let mut buf = [0u32; VCMD_CONTEXT_INIT_SIZE];
        self.read_dwords(&mut buf)?;
        let capset_id = buf[0];
        if capset_id == 0 {
            return Err(MuxError::InvalidArgument("context init without capset"));
        }
        match self.contexts.last() {
            Some(ctx) if ctx.capset_id == capset_id => Ok(()),
            Some(_) => Err(MuxError::InvalidArgument("context already initialized")),
            None => self.create_context(capset_id).map(|_| ()),
        }
    }

    fn create_resource(&mut self, handle: u32, args: ResourceCreate3D) -> MuxResult<()> {
        if self.resources.contains_key(&handle) {
            return Err(MuxError::AlreadyExists);
        }
        let ctx_id = self.current_context()?;
        let mut renderer = lock(&self.renderer)?;
        renderer.mux.resource_create_3d(handle, args)?;
        renderer.mux.context_attach_resource(ctx_id, handle);
        self.resources.insert(handle, VtestResource::default());
        Ok(())
    }

    fn resource_create(&mut self) -> MuxResult<()> {
        let mut buf = [0u32; VCMD_RES_CREATE_SIZE];
        self.read_dwords(&mut buf)?;
        self.create_resource(buf[VCMD_RES_CREATE_RES_HANDLE], create_args(&buf))
    }

    fn resource_create2(&mut self) -> MuxResult<()> {
        let mut buf = [0u32; VCMD_RES_CREATE2_SIZE];
        self.read_dwords(&mut buf)?;
        let handle = buf[VCMD_RES_CREATE_RES_HANDLE];
        let data_size = buf[VCMD_RES_CREATE2_DATA_SIZE] as usize;

        let shm = if data_size > 0 {
            if !self.config.use_shm {
                return Err(MuxError::Unsupported);
            }
            if data_size > self.config.max_length {
                return Err(MuxError::OutOfMemory);
            }
            let shm = SharedMemory::new("vtest-resource", data_size as u64)?;
            let mapping = MemoryMapping::from_descriptor(&shm, data_size, VIRTMUX_MAP_ACCESS_RW)?;
            Some((shm, mapping))
        } else {
            None
        };

        self.create_resource(handle, create_args(&buf))?;
        if let Some((_, mapping)) = &shm {
            let backing = vec![BackingRegion::unmanaged(mapping.as_iovec())];
            let mut renderer = lock(&self.renderer)?;
            if let Err(e) = renderer.mux.attach_backing(handle, backing) {
                renderer.mux.unref_resource(handle)?;
                self.resources.remove(&handle);
                return Err(e);
            }
        }

        let shm = match shm {
            Some((shm, mapping)) => {
                if let Some(resource) = self.resources.get_mut(&handle) {
                    resource.shm = Some(mapping);
                }
                Some(shm)
            }
            None => None,
        };

        self.write_reply(VCMD_RESOURCE_CREATE2, &[handle])?;
        if let Some(shm) = shm {
            self.send_descriptor(&shm)?;
        }
        Ok(())
    }

    fn resource_unref(&mut self) -> MuxResult<()> {
        let mut buf = [0u32; VCMD_RES_UNREF_SIZE];
        self.read_dwords(&mut buf)?;
        let handle = buf[0];
        let resource = match self.resources.remove(&handle) {
            Some(resource) => resource,
            None => {
                debug!("unref of unknown resource {}", handle);
                return Ok(());
            }
        };
        lock(&self.renderer)?.mux.unref_resource(handle)?;
        // The shared memory stays mapped until the backing is gone.
        drop(resource);
        Ok(())
    }

    fn read_transfer(&mut self) -> MuxResult<(u32, Transfer3D, usize)> {
        let mut buf = [0u32; VCMD_TRANSFER_HDR_SIZE];
        self.read_dwords(&mut buf)?;
        let handle = buf[VCMD_TRANSFER_RES_HANDLE];
        let transfer = Transfer3D {
            x: buf[VCMD_TRANSFER_X],
            y: buf[VCMD_TRANSFER_Y],
            z: buf[VCMD_TRANSFER_Z],
            w: buf[VCMD_TRANSFER_WIDTH],
            h: buf[VCMD_TRANSFER_HEIGHT],
            d: buf[VCMD_TRANSFER_DEPTH],
            level: buf[VCMD_TRANSFER_LEVEL],
            stride: buf[VCMD_TRANSFER_STRIDE],
            layer_stride: buf[VCMD_TRANSFER_LAYER_STRIDE],
            offset: 0,
        };
        let data_size = buf[VCMD_TRANSFER_DATA_SIZE] as usize;

        if !self.resources.contains_key(&handle) {
            return Err(MuxError::InvalidResourceId);
        }
        if data_size > self.config.max_length {
            return Err(MuxError::OutOfMemory);
        }
        Ok((handle, transfer, data_size))
    }

    fn transfer_get(&mut self) -> MuxResult<()> {
        let (handle, transfer, data_size) = self.read_transfer()?;
        let ctx_id = self.current_context()?;
        let mut data = vec![0u8; data_size];
        let result = lock(&self.renderer)?.mux.transfer_read(
            ctx_id,
            handle,
            transfer,
            Some(IoSliceMut::new(&mut data)),
        );
        // The client waits for `data_size` bytes either way.
        if let Err(e) = result {
            warn!("transfer read of resource {} failed: {}", handle, e);
        }
        self.stream.write_all(&data)?;
        Ok(())
    }

    fn transfer_put(&mut self) -> MuxResult<()> {
        let (handle, transfer, data_size) = self.read_transfer()?;
        let data = self.read_payload(data_size)?;
        let ctx_id = self.current_context()?;
        let result = lock(&self.renderer)?
            .mux
            .transfer_write(ctx_id, handle, transfer, Some(&data[..]));
        if let Err(e) = result {
            warn!("transfer write of resource {} failed: {}", handle, e);
        }
        self.create_fence(ctx_id)
    }

    fn read_transfer2(&mut self) -> MuxResult<(u32, Transfer3D)> {
        let mut buf = [0u32; VCMD_TRANSFER2_HDR_SIZE];
        self.read_dwords(&mut buf)?;
        let handle = buf[VCMD_TRANSFER2_RES_HANDLE];
        let offset = buf[VCMD_TRANSFER2_OFFSET] as u64;

        let resource = self
            .resources
            .get(&handle)
            .ok_or(MuxError::InvalidResourceId)?;
        let shm = resource
            .shm
            .as_ref()
            .ok_or(MuxError::InvalidArgument("resource has no shared memory"))?;
        if offset > shm.size() as u64 {
            return Err(MuxError::InvalidIovec);
        }

        let transfer = Transfer3D {
            x: buf[VCMD_TRANSFER2_X],
            y: buf[VCMD_TRANSFER2_Y],
            z: buf[VCMD_TRANSFER2_Z],
            w: buf[VCMD_TRANSFER2_WIDTH],
            h: buf[VCMD_TRANSFER2_HEIGHT],
            d: buf[VCMD_TRANSFER2_DEPTH],
            level: buf[VCMD_TRANSFER2_LEVEL],
            stride: 0,
            layer_stride: 0,
            offset,
        };
        Ok((handle, transfer))
    }

    fn transfer_get2(&mut self) -> MuxResult<()> {
        let (handle, transfer) = self.read_transfer2()?;
        let ctx_id = self.current_context()?;
        lock(&self.renderer)?
            .mux
            .transfer_read(ctx_id, handle, transfer, None)
    }

    fn transfer_put2(&mut self) -> MuxResult<()> {
        let (handle, transfer) = self.read_transfer2()?;
        let ctx_id = self.current_context()?;
        lock(&self.renderer)?
            .mux
            .transfer_write(ctx_id, handle, transfer, None)?;
        self.create_fence(ctx_id)
    }

    fn submit_cmd(&mut self, length: u32) -> MuxResult<()> {
        let size = (length as usize)
            .checked_mul(4)
            .ok_or(MuxError::InvalidCommandSize(length as usize))?;
        if size > self.config.max_length {
            return Err(MuxError::InvalidCommandSize(size));
        }
        let commands = self.read_payload(size)?;
        let ctx_id = self.current_context()?;
        lock(&self.renderer)?
            .mux
            .submit_command(ctx_id, &commands)?;
        self.create_fence(ctx_id)
    }

    fn is_busy(&self) -> MuxResult<bool> {
        let mut renderer = lock(&self.renderer)?;
        renderer.mux.event_poll();
        Ok(renderer.mux.last_fence() < self.last_fence_id)
    }

    /// Polls until every fence of this connection retired.  The renderer lock is only held
    /// while polling.
    fn wait_idle(&mut self) -> MuxResult<()> {
        if self.poll_descriptor.is_none() {
            self.poll_descriptor = lock(&self.renderer)?.mux.poll_descriptor();
        }
        while self.is_busy()? {
            match &self.poll_descriptor {
                Some(descriptor) => {
                    wait_readable(descriptor, BUSY_WAIT_POLL_MS)?;
                }
                None => thread::yield_now(),
            }
        }
        Ok(())
    }

    fn resource_busy_wait(&mut self) -> MuxResult<()> {
        let mut buf = [0u32; VCMD_BUSY_WAIT_SIZE];
        self.read_dwords(&mut buf)?;
        let handle = buf[VCMD_BUSY_WAIT_HANDLE];
        if self.contexts.is_empty() && handle != 0 {
            return Err(MuxError::InvalidResourceId);
        }

        let busy = if buf[VCMD_BUSY_WAIT_FLAGS] & VCMD_BUSY_WAIT_FLAG_WAIT != 0 {
            self.wait_idle()?;
            false
        } else {
            self.is_busy()?
        };
        self.write_reply(VCMD_RESOURCE_BUSY_WAIT, &[busy as u32])
    }
}

impl Drop for VtestConnection {
    fn drop(&mut self) {
        let mut renderer = match self.renderer.lock() {
            Ok(renderer) => renderer,
            Err(_) => return,
        };
        for ctx in self.contexts.drain(..) {
            if let Err(e) = renderer.mux.destroy_context(ctx.ctx_id) {
                warn!("failed to destroy context {}: {}", ctx.ctx_id, e);
            }
        }
        for &handle in self.resources.keys() {
            if let Err(e) = renderer.mux.unref_resource(handle) {
                warn!("failed to release resource {}: {}", handle, e);
            }
        }
        // Mappings go only after the resources that used them as backing.
        self.resources.clear();
    }
}

fn create_args(buf: &[u32]) -> ResourceCreate3D {
    ResourceCreate3D {
        target: buf[VCMD_RES_CREATE_TARGET],
        format: buf[VCMD_RES_CREATE_FORMAT],
        bind: buf[VCMD_RES_CREATE_BIND],
        width: buf[VCMD_RES_CREATE_WIDTH],
        height: buf[VCMD_RES_CREATE_HEIGHT],
        depth: buf[VCMD_RES_CREATE_DEPTH],
        array_size: buf[VCMD_RES_CREATE_ARRAY_SIZE],
        last_level: buf[VCMD_RES_CREATE_LAST_LEVEL],
        nr_samples: buf[VCMD_RES_CREATE_NR_SAMPLES],
        flags: 0,
    }
}
