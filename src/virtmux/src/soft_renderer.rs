// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! soft_renderer: a CPU backend that stores level 0 of every resource in host memory and
//! executes a subset of the virgl command stream.

use std::any::Any;
use std::cmp::min;
use std::collections::BTreeMap as Map;
use std::mem::size_of;
use std::os::raw::c_void;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use log::debug;
use log::error;
use log::trace;
use vmm_sys_util::eventfd::EventFd;
use vmm_sys_util::eventfd::EFD_NONBLOCK;
use zerocopy::AsBytes;
use zerocopy::FromBytes;

use crate::context::MuxContext;
use crate::context::MuxContextKind;
use crate::context::ResourceScope;
use crate::mux_core::GlContextHandle;
use crate::mux_core::GlContextProvider;
use crate::mux_core::MuxComponent;
use crate::mux_os::SafeDescriptor;
use crate::mux_utils::*;
use crate::resource::BackendObject;
use crate::resource::MuxResource;
use crate::virgl_protocol::*;

const SOFT_MAX_IMAGE_BYTES: u64 = 256 << 20;

const SOFT_MAX_TEXTURE_2D_SIZE: u32 = 8192;
const SOFT_MAX_TEXTURE_3D_SIZE: u32 = 256;
const SOFT_MAX_TEXTURE_ARRAY_LAYERS: u32 = 256;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
struct SoftFormatMask {
    bitmask: [u32; 16],
}

impl SoftFormatMask {
    fn supported() -> SoftFormatMask {
        let mut mask = SoftFormatMask::default();
        for format in formats() {
            mask.bitmask[(format / 32) as usize] |= 1 << (format % 32);
        }
        mask
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
struct SoftCapsV1 {
    max_version: u32,
    sampler: SoftFormatMask,
    render: SoftFormatMask,
    depthstencil: SoftFormatMask,
    vertexbuffer: SoftFormatMask,
    bset: u32,
    glsl_level: u32,
    max_texture_array_layers: u32,
    max_streamout_buffers: u32,
    max_dual_source_render_targets: u32,
    max_render_targets: u32,
    max_samples: u32,
}

impl SoftCapsV1 {
    fn new(max_version: u32) -> SoftCapsV1 {
        SoftCapsV1 {
            max_version,
            sampler: SoftFormatMask::supported(),
            render: SoftFormatMask::supported(),
            glsl_level: 130,
            max_texture_array_layers: SOFT_MAX_TEXTURE_ARRAY_LAYERS,
            max_render_targets: PIPE_MAX_COLOR_BUFS,
            ..Default::default()
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
struct SoftCapsV2 {
    v1: SoftCapsV1,
    max_texture_2d_size: u32,
    max_texture_3d_size: u32,
    max_texture_cube_size: u32,
    capability_bits: u32,
}

/// Host storage for one resource: every layer of level 0, rows packed.
pub struct SoftImage {
    format: u32,
    bpp: u32,
    width: u32,
    height: u32,
    layers: u32,
    stride: u32,
    layer_stride: u64,
    host_mem: Vec<u8>,
}

impl SoftImage {
    fn new(create: &ResourceCreate3D) -> MuxResult<SoftImage> {
        let bpp = if create.target == VIRTMUX_PIPE_BUFFER {
            1
        } else {
            bytes_per_pixel(create.format).ok_or(MuxError::InvalidFormat(create.format))?
        };

        let width = create.width as u64;
        let height = create.height as u64;
        let layers = create.depth as u64 * create.array_size as u64;
        let pixel_bytes = bpp as u64;
        let stride = checked_arithmetic!(width * pixel_bytes)?;
        let layer_stride = checked_arithmetic!(stride * height)?;
        let total = checked_arithmetic!(layer_stride * layers)?;
        if total > SOFT_MAX_IMAGE_BYTES {
            error!("refusing {} byte image", total);
            return Err(MuxError::OutOfMemory);
        }

        let total = usize::try_from(total)?;
        let mut host_mem = Vec::new();
        host_mem
            .try_reserve_exact(total)
            .map_err(|_| MuxError::OutOfMemory)?;
        host_mem.resize(total, 0);

        Ok(SoftImage {
            format: create.format,
            bpp,
            width: create.width,
            height: create.height,
            layers: u32::try_from(layers)?,
            stride: u32::try_from(stride)?,
            layer_stride,
            host_mem,
        })
    }

    fn check_box(&self, x: u32, y: u32, z: u32, w: u32, h: u32, d: u32) -> MuxResult<()> {
        let fits = |start: u32, len: u32, max: u32| start as u64 + len as u64 <= max as u64;
        if fits(x, w, self.width) && fits(y, h, self.height) && fits(z, d, self.layers) {
            Ok(())
        } else {
            Err(MuxError::InvalidArgument("box outside of resource"))
        }
    }

    /// Byte offset of a pixel.  The coordinates must have passed `check_box`.
    fn offset(&self, x: u32, y: u32, z: u32) -> usize {
        (z as u64 * self.layer_stride + y as u64 * self.stride as u64 + x as u64 * self.bpp as u64)
            as usize
    }

    fn pixel(&self, x: u32, y: u32, z: u32) -> &[u8] {
        let start = self.offset(x, y, z);
        &self.host_mem[start..start + self.bpp as usize]
    }

    fn pixel_mut(&mut self, x: u32, y: u32, z: u32) -> &mut [u8] {
        let start = self.offset(x, y, z);
        let bpp = self.bpp as usize;
        &mut self.host_mem[start..start + bpp]
    }

    fn row_mut(&mut self, x: u32, y: u32, z: u32, w: u32) -> &mut [u8] {
        let start = self.offset(x, y, z);
        let len = (w * self.bpp) as usize;
        &mut self.host_mem[start..start + len]
    }
}

fn soft_image(object: &Option<BackendObject>) -> MuxResult<&SoftImage> {
    object
        .as_ref()
        .and_then(|o| (**o).downcast_ref::<SoftImage>())
        .ok_or(MuxError::InvalidBackendObject)
}

fn soft_image_mut(object: &mut Option<BackendObject>) -> MuxResult<&mut SoftImage> {
    object
        .as_mut()
        .and_then(|o| (**o).downcast_mut::<SoftImage>())
        .ok_or(MuxError::InvalidBackendObject)
}

fn image_in_scope<'s>(scope: &'s mut ResourceScope, resource_id: u32) -> MuxResult<&'s mut SoftImage> {
    soft_image_mut(&mut scope.get_mut(resource_id)?.backend_object)
}

fn read_iovecs(iovecs: &[MuxIovec], offset: u64, dst: &mut [u8]) -> MuxResult<()> {
    let mut offset = usize::try_from(offset)?;
    let mut copied = 0;
    for iovec in iovecs {
        if copied == dst.len() {
            break;
        }
        if offset >= iovec.len {
            offset -= iovec.len;
            continue;
        }

        let count = min(iovec.len - offset, dst.len() - copied);
        // Safe because the iovec describes memory that stays mapped for the transfer and
        // `offset + count` is within it.
        let src = unsafe { std::slice::from_raw_parts((iovec.base as *const u8).add(offset), count) };
        dst[copied..copied + count].copy_from_slice(src);
        copied += count;
        offset = 0;
    }

    if copied != dst.len() {
        return Err(MuxError::InvalidIovec);
    }
    Ok(())
}

fn write_iovecs(iovecs: &[MuxIovec], offset: u64, src: &[u8]) -> MuxResult<()> {
    let mut offset = usize::try_from(offset)?;
    let mut copied = 0;
    for iovec in iovecs {
        if copied == src.len() {
            break;
        }
        if offset >= iovec.len {
            offset -= iovec.len;
            continue;
        }

        let count = min(iovec.len - offset, src.len() - copied);
        // Safe because the iovec describes writable memory that stays mapped for the transfer
        // and `offset + count` is within it.
        let dst = unsafe { std::slice::from_raw_parts_mut((iovec.base as *mut u8).add(offset), count) };
        dst.copy_from_slice(&src[copied..copied + count]);
        copied += count;
        offset = 0;
    }

    if copied != src.len() {
        return Err(MuxError::InvalidIovec);
    }
    Ok(())
}

/// Copies the transfer box between `image` and the linear layout described by `transfer` inside
/// `iovecs`.  Every byte is bounds checked before the first copy.
fn copy_box(
    image: &mut SoftImage,
    transfer: &Transfer3D,
    iovecs: &[MuxIovec],
    to_host: bool,
) -> MuxResult<()> {
    if transfer.level != 0 {
        return Err(MuxError::InvalidArgument("only level 0 is stored"));
    }
    if transfer.is_empty() {
        return Ok(());
    }
    image.check_box(
        transfer.x, transfer.y, transfer.z, transfer.w, transfer.h, transfer.d,
    )?;

    let row_bytes = transfer.w as u64 * image.bpp as u64;
    let stride = match transfer.stride {
        0 => image.stride as u64,
        stride => stride as u64,
    };
    if stride < row_bytes {
        return Err(MuxError::InvalidArgument("stride shorter than a row"));
    }
    let layer_stride = match transfer.layer_stride {
        0 => stride * image.height as u64,
        layer_stride => layer_stride as u64,
    };

    let last_layer = (transfer.d - 1) as u64;
    let last_row = (transfer.h - 1) as u64;
    let layer_span = checked_arithmetic!(last_layer * layer_stride)?;
    let row_span = checked_arithmetic!(last_row * stride)?;
    if transfer.d > 1 && layer_stride < row_span + row_bytes {
        return Err(MuxError::InvalidArgument("layer stride shorter than a layer"));
    }

    let offset = transfer.offset;
    let start = checked_arithmetic!(offset + layer_span)?;
    let start = checked_arithmetic!(start + row_span)?;
    let end = checked_arithmetic!(start + row_bytes)?;
    let available: u64 = iovecs.iter().map(|iovec| iovec.len as u64).sum();
    checked_range!(end <= available).map_err(|_| MuxError::InvalidIovec)?;

    for layer in 0..transfer.d {
        for row in 0..transfer.h {
            let linear = offset + layer as u64 * layer_stride + row as u64 * stride;
            let host = image.row_mut(transfer.x, transfer.y + row, transfer.z + layer, transfer.w);
            if to_host {
                read_iovecs(iovecs, linear, host)?;
            } else {
                write_iovecs(iovecs, linear, host)?;
            }
        }
    }
    Ok(())
}

/// Moves the transfer box between the resource and a caller buffer, or its attached backing
/// when no buffer is given.
fn transfer_resource(
    resource: &mut MuxResource,
    transfer: Transfer3D,
    direction: TransferDirection,
) -> MuxResult<()> {
    let backing = resource.backing_iovecs();
    let image = soft_image_mut(&mut resource.backend_object)?;

    match direction {
        TransferDirection::ToHost(Some(buf)) => {
            let iovec = MuxIovec {
                base: buf.as_ptr() as *mut c_void,
                len: buf.len(),
            };
            copy_box(image, &transfer, &[iovec], true)
        }
        TransferDirection::FromHost(Some(mut buf)) => {
            let iovec = MuxIovec::from_mut_slice(&mut buf);
            copy_box(image, &transfer, &[iovec], false)
        }
        TransferDirection::ToHost(None) | TransferDirection::FromHost(None) => {
            if backing.is_empty() {
                return Err(MuxError::InvalidArgument("transfer without backing"));
            }
            let to_host = matches!(direction, TransferDirection::ToHost(_));
            copy_box(image, &transfer, &backing, to_host)
        }
    }
}

/// CPU backend.  Work completes synchronously so every fence retires as soon as it is created.
pub struct SoftRenderer {
    flags: VirtmuxFlags,
    gl: Option<Arc<dyn GlContextProvider>>,
    last_fence: Option<u64>,
    fence_event: Option<EventFd>,
}

impl SoftRenderer {
    /// Initializes the software renderer.  With thread sync a pollable descriptor signals
    /// fence retirement.
    pub fn init(
        flags: VirtmuxFlags,
        gl: Option<Arc<dyn GlContextProvider>>,
    ) -> MuxResult<Box<dyn MuxComponent>> {
        let fence_event = if flags.thread_sync() {
            Some(EventFd::new(EFD_NONBLOCK)?)
        } else {
            None
        };

        debug!("soft renderer initialized with flags {:#x}", u32::from(flags));
        Ok(Box::new(SoftRenderer {
            flags,
            gl,
            last_fence: None,
            fence_event,
        }))
    }
}

impl MuxComponent for SoftRenderer {
    fn get_capset_info(&self, capset_id: u32) -> (u32, u32) {
        match capset_id {
            VIRTMUX_CAPSET_VIRGL => (1, size_of::<SoftCapsV1>() as u32),
            VIRTMUX_CAPSET_VIRGL2 => (2, size_of::<SoftCapsV2>() as u32),
            _ => (0, 0),
        }
    }

    fn get_capset(&self, capset_id: u32, version: u32) -> Vec<u8> {
        match (capset_id, version) {
            (VIRTMUX_CAPSET_VIRGL, 0..=1) => SoftCapsV1::new(1).as_bytes().to_vec(),
            (VIRTMUX_CAPSET_VIRGL2, 0..=2) => SoftCapsV2 {
                v1: SoftCapsV1::new(2),
                max_texture_2d_size: SOFT_MAX_TEXTURE_2D_SIZE,
                max_texture_3d_size: SOFT_MAX_TEXTURE_3D_SIZE,
                max_texture_cube_size: SOFT_MAX_TEXTURE_2D_SIZE,
                capability_bits: 0,
            }
            .as_bytes()
            .to_vec(),
            _ => Vec::new(),
        }
    }

    fn create_fence(&mut self, fence: MuxFence) -> MuxResult<()> {
        self.last_fence = Some(fence.fence_id);
        if let Some(event) = &self.fence_event {
            event.write(1)?;
        }
        Ok(())
    }

    fn retired_fence(&mut self) -> Option<u64> {
        if let Some(event) = &self.fence_event {
            // EAGAIN only means nothing retired since the last poll.
            let _ = event.read();
        }
        self.last_fence
    }

    fn poll_descriptor(&self) -> Option<SafeDescriptor> {
        let event = self.fence_event.as_ref()?;
        SafeDescriptor::try_from(event as &dyn AsRawFd).ok()
    }

    fn create_3d(&self, resource_id: u32, create: &ResourceCreate3D) -> MuxResult<BackendObject> {
        let image = SoftImage::new(create)?;
        debug!(
            "resource {}: {}x{}x{} format {} ({} bytes)",
            resource_id,
            image.width,
            image.height,
            image.layers,
            image.format,
            image.host_mem.len()
        );
        Ok(Box::new(image) as Box<dyn Any + Send>)
    }

    fn unref_resource(&self, resource_id: u32) {
        trace!("resource {} released", resource_id);
    }

    fn transfer_write(
        &self,
        _ctx_id: u32,
        resource: &mut MuxResource,
        transfer: Transfer3D,
        buf: Option<&[u8]>,
    ) -> MuxResult<()> {
        transfer_resource(resource, transfer, TransferDirection::ToHost(buf))
    }

    fn transfer_read(
        &self,
        _ctx_id: u32,
        resource: &mut MuxResource,
        transfer: Transfer3D,
        buf: Option<std::io::IoSliceMut>,
    ) -> MuxResult<()> {
        transfer_resource(resource, transfer, TransferDirection::FromHost(buf))
    }

    fn create_context(
        &self,
        ctx_id: u32,
        context_init: u32,
        context_name: Option<&str>,
    ) -> MuxResult<Box<dyn MuxContext>> {
        if !self.flags.virgl() {
            return Err(MuxError::Unsupported);
        }
        match context_init & VIRTMUX_CONTEXT_INIT_CAPSET_ID_MASK {
            0 | VIRTMUX_CAPSET_VIRGL | VIRTMUX_CAPSET_VIRGL2 => (),
            _ => return Err(MuxError::InvalidCapset),
        }

        let gl = match &self.gl {
            Some(provider) => Some((provider.clone(), provider.create_gl_context(0)?)),
            None => None,
        };
        debug!(
            "soft context {} \"{}\"",
            ctx_id,
            context_name.unwrap_or_default()
        );
        Ok(Box::new(SoftContext::new(ctx_id, gl)))
    }

    fn reset(&mut self) {
        self.last_fence = None;
        if let Some(event) = &self.fence_event {
            let _ = event.read();
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct SoftSurface {
    res_handle: u32,
    format: u32,
    first_layer: u32,
    last_layer: u32,
}

/// One side of a blit: resource, level, format and box.
#[derive(Copy, Clone, Debug)]
struct BlitBox {
    res_handle: u32,
    level: u32,
    format: u32,
    x: u32,
    y: u32,
    z: u32,
    w: u32,
    h: u32,
    d: u32,
}

impl BlitBox {
    fn from_dwords(dwords: &[u32]) -> BlitBox {
        BlitBox {
            res_handle: dwords[0],
            level: dwords[1],
            format: dwords[2],
            x: dwords[3],
            y: dwords[4],
            z: dwords[5],
            w: dwords[6],
            h: dwords[7],
            d: dwords[8],
        }
    }

    fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0 || self.d == 0
    }
}

/// A rendering context on the software renderer.
struct SoftContext {
    ctx_id: u32,
    surfaces: Map<u32, SoftSurface>,
    cbufs: [u32; PIPE_MAX_COLOR_BUFS as usize],
    nr_cbufs: u32,
    zsurf: u32,
    gl: Option<(Arc<dyn GlContextProvider>, GlContextHandle)>,
}

impl SoftContext {
    fn new(ctx_id: u32, gl: Option<(Arc<dyn GlContextProvider>, GlContextHandle)>) -> SoftContext {
        SoftContext {
            ctx_id,
            surfaces: Map::new(),
            cbufs: [0; PIPE_MAX_COLOR_BUFS as usize],
            nr_cbufs: 0,
            zsurf: 0,
            gl,
        }
    }

    fn execute(&mut self, header: u32, payload: &[u32], scope: &mut ResourceScope) -> MuxResult<()> {
        match header_cmd(header) {
            VIRGL_CCMD_NOP => Ok(()),
            VIRGL_CCMD_CREATE_OBJECT => match header_object(header) {
                VIRGL_OBJECT_SURFACE => self.create_surface(payload, scope),
                object => {
                    trace!("ctx {}: object type {} not tracked", self.ctx_id, object);
                    Ok(())
                }
            },
            VIRGL_CCMD_DESTROY_OBJECT => self.destroy_object(header_object(header), payload),
            VIRGL_CCMD_SET_FRAMEBUFFER_STATE => self.set_framebuffer_state(payload),
            VIRGL_CCMD_CLEAR => self.clear(payload, scope),
            VIRGL_CCMD_RESOURCE_INLINE_WRITE => self.inline_write(payload, scope),
            VIRGL_CCMD_BLIT => self.blit(payload, scope),
            VIRGL_CCMD_RESOURCE_COPY_REGION => self.copy_region(payload, scope),
            cmd => {
                trace!("ctx {}: command {} has no software path", self.ctx_id, cmd);
                Ok(())
            }
        }
    }

    fn create_surface(&mut self, payload: &[u32], scope: &mut ResourceScope) -> MuxResult<()> {
        if payload.len() < VIRGL_OBJ_SURFACE_SIZE as usize {
            return Err(MuxError::InvalidCommandBuffer);
        }
        let handle = payload[0];
        let res_handle = payload[1];
        let format = payload[2];
        if handle == 0 {
            return Err(MuxError::InvalidArgument("surface handle 0"));
        }
        if self.surfaces.contains_key(&handle) {
            return Err(MuxError::AlreadyExists);
        }

        let resource = scope.get(res_handle)?;
        if resource.create.target == VIRTMUX_PIPE_BUFFER {
            return Err(MuxError::Unsupported);
        }
        let image = soft_image(&resource.backend_object)?;
        match bytes_per_pixel(format) {
            Some(bpp) if bpp == image.bpp => (),
            _ => return Err(MuxError::InvalidFormat(format)),
        }
        if payload[3] != 0 {
            return Err(MuxError::InvalidArgument("surface level"));
        }
        let first_layer = payload[4] & 0xffff;
        let last_layer = payload[4] >> 16;
        if first_layer > last_layer || last_layer >= image.layers {
            return Err(MuxError::InvalidArgument("surface layers"));
        }

        self.surfaces.insert(
            handle,
            SoftSurface {
                res_handle,
                format,
                first_layer,
                last_layer,
            },
        );
        Ok(())
    }

    fn destroy_object(&mut self, object: u32, payload: &[u32]) -> MuxResult<()> {
        let handle = *payload.first().ok_or(MuxError::InvalidCommandBuffer)?;
        if object == VIRGL_OBJECT_SURFACE && self.surfaces.remove(&handle).is_some() {
            self.unbind_surface(handle);
        }
        Ok(())
    }

    fn unbind_surface(&mut self, handle: u32) {
        for cbuf in self.cbufs.iter_mut().filter(|cbuf| **cbuf == handle) {
            *cbuf = 0;
        }
        if self.zsurf == handle {
            self.zsurf = 0;
        }
    }

    fn set_framebuffer_state(&mut self, payload: &[u32]) -> MuxResult<()> {
        if payload.len() < 2 {
            return Err(MuxError::InvalidCommandBuffer);
        }
        let nr_cbufs = payload[0];
        if nr_cbufs > PIPE_MAX_COLOR_BUFS {
            return Err(MuxError::InvalidArgument("too many color buffers"));
        }
        let handles = payload
            .get(2..2 + nr_cbufs as usize)
            .ok_or(MuxError::InvalidCommandBuffer)?;

        let zsurf = payload[1];
        for handle in handles.iter().chain(std::iter::once(&zsurf)) {
            if *handle != 0 && !self.surfaces.contains_key(handle) {
                return Err(MuxError::InvalidArgument("unknown surface"));
            }
        }

        self.cbufs = [0; PIPE_MAX_COLOR_BUFS as usize];
        self.cbufs[..handles.len()].copy_from_slice(handles);
        self.nr_cbufs = nr_cbufs;
        self.zsurf = zsurf;
        Ok(())
    }

    fn clear(&mut self, payload: &[u32], scope: &mut ResourceScope) -> MuxResult<()> {
        if payload.len() < VIRGL_OBJ_CLEAR_SIZE as usize {
            return Err(MuxError::InvalidCommandBuffer);
        }
        let buffers = payload[0];
        let rgba = unorm8([
            f32::from_bits(payload[1]),
            f32::from_bits(payload[2]),
            f32::from_bits(payload[3]),
            f32::from_bits(payload[4]),
        ]);

        for (i, handle) in self.cbufs[..self.nr_cbufs as usize].iter().enumerate() {
            if buffers & (PIPE_CLEAR_COLOR0 << i) == 0 || *handle == 0 {
                continue;
            }
            let surface = self
                .surfaces
                .get(handle)
                .ok_or(MuxError::InvalidArgument("unknown surface"))?;
            fill_surface(surface, rgba, scope)?;
        }

        if buffers & (PIPE_CLEAR_DEPTH | PIPE_CLEAR_STENCIL) != 0 && self.zsurf != 0 {
            trace!("ctx {}: depth/stencil clear skipped", self.ctx_id);
        }
        Ok(())
    }

    fn inline_write(&mut self, payload: &[u32], scope: &mut ResourceScope) -> MuxResult<()> {
        let header_size = VIRGL_RESOURCE_IW_HDR_SIZE as usize;
        if payload.len() < header_size {
            return Err(MuxError::InvalidCommandBuffer);
        }
        let transfer = Transfer3D {
            level: payload[1],
            stride: payload[3],
            layer_stride: payload[4],
            x: payload[5],
            y: payload[6],
            z: payload[7],
            w: payload[8],
            h: payload[9],
            d: payload[10],
            offset: 0,
        };
        let data: Vec<u8> = payload[header_size..]
            .iter()
            .flat_map(|dword| dword.to_le_bytes())
            .collect();

        let image = image_in_scope(scope, payload[0])?;
        let iovec = MuxIovec {
            base: data.as_ptr() as *mut c_void,
            len: data.len(),
        };
        copy_box(image, &transfer, &[iovec], true)
    }

    fn blit(&mut self, payload: &[u32], scope: &mut ResourceScope) -> MuxResult<()> {
        if payload.len() < VIRGL_CMD_BLIT_SIZE as usize {
            return Err(MuxError::InvalidCommandBuffer);
        }
        let mask = payload[0];
        let scissor_enable = payload[2] != 0;
        let (min_x, min_y) = (payload[3] & 0xffff, payload[3] >> 16);
        let (max_x, max_y) = (payload[4] & 0xffff, payload[4] >> 16);
        let dst = BlitBox::from_dwords(&payload[5..14]);
        let src = BlitBox::from_dwords(&payload[14..23]);

        // Formats and levels are validated before either resource is touched.
        let src_bpp = bytes_per_pixel(src.format).ok_or(MuxError::InvalidFormat(src.format))?;
        let dst_bpp = bytes_per_pixel(dst.format).ok_or(MuxError::InvalidFormat(dst.format))?;
        if src.level != 0 || dst.level != 0 {
            return Err(MuxError::InvalidArgument("only level 0 is stored"));
        }
        if src.is_empty() || dst.is_empty() || mask & PIPE_MASK_RGBA == 0 {
            return Ok(());
        }

        let image = image_in_scope(scope, src.res_handle)?;
        if image.bpp != src_bpp {
            return Err(MuxError::InvalidFormat(src.format));
        }
        image.check_box(src.x, src.y, src.z, src.w, src.h, src.d)?;
        let mut texels = Vec::with_capacity((src.w * src.h * src.d) as usize);
        for z in 0..src.d {
            for y in 0..src.h {
                for x in 0..src.w {
                    let pixel = image.pixel(src.x + x, src.y + y, src.z + z);
                    texels.push(unpack_rgba(src.format, pixel)?);
                }
            }
        }

        let image = image_in_scope(scope, dst.res_handle)?;
        if image.bpp != dst_bpp {
            return Err(MuxError::InvalidFormat(dst.format));
        }
        image.check_box(dst.x, dst.y, dst.z, dst.w, dst.h, dst.d)?;
        for z in 0..dst.d {
            let sz = (z as u64 * src.d as u64 / dst.d as u64) as u32;
            for y in 0..dst.h {
                let sy = (y as u64 * src.h as u64 / dst.h as u64) as u32;
                let py = dst.y + y;
                for x in 0..dst.w {
                    let px = dst.x + x;
                    if scissor_enable && (px < min_x || px >= max_x || py < min_y || py >= max_y) {
                        continue;
                    }
                    let sx = (x as u64 * src.w as u64 / dst.w as u64) as u32;
                    let texel = texels[((sz * src.h + sy) * src.w + sx) as usize];

                    let pixel = image.pixel_mut(px, py, dst.z + z);
                    let mut merged = unpack_rgba(dst.format, pixel)?;
                    for (channel, value) in merged.iter_mut().enumerate() {
                        if mask & (PIPE_MASK_R << channel) != 0 {
                            *value = texel[channel];
                        }
                    }
                    pack_rgba(dst.format, merged, pixel)?;
                }
            }
        }
        Ok(())
    }

    fn copy_region(&mut self, payload: &[u32], scope: &mut ResourceScope) -> MuxResult<()> {
        if payload.len() < VIRGL_CMD_RESOURCE_COPY_REGION_SIZE as usize {
            return Err(MuxError::InvalidCommandBuffer);
        }
        let (dst_handle, dst_level) = (payload[0], payload[1]);
        let (dst_x, dst_y, dst_z) = (payload[2], payload[3], payload[4]);
        let (src_handle, src_level) = (payload[5], payload[6]);
        let (src_x, src_y, src_z) = (payload[7], payload[8], payload[9]);
        let (w, h, d) = (payload[10], payload[11], payload[12]);
        if src_level != 0 || dst_level != 0 {
            return Err(MuxError::InvalidArgument("only level 0 is stored"));
        }
        if w == 0 || h == 0 || d == 0 {
            return Ok(());
        }

        let image = image_in_scope(scope, src_handle)?;
        image.check_box(src_x, src_y, src_z, w, h, d)?;
        let bpp = image.bpp;
        let mut rows = Vec::with_capacity((h * d) as usize);
        for z in 0..d {
            for y in 0..h {
                rows.push(image.row_mut(src_x, src_y + y, src_z + z, w).to_vec());
            }
        }

        let image = image_in_scope(scope, dst_handle)?;
        if image.bpp != bpp {
            return Err(MuxError::InvalidArgument("copy between different pixel sizes"));
        }
        image.check_box(dst_x, dst_y, dst_z, w, h, d)?;
        let mut rows = rows.into_iter();
        for z in 0..d {
            for y in 0..h {
                if let Some(row) = rows.next() {
                    image
                        .row_mut(dst_x, dst_y + y, dst_z + z, w)
                        .copy_from_slice(&row);
                }
            }
        }
        Ok(())
    }
}

fn fill_surface(surface: &SoftSurface, rgba: [u8; 4], scope: &mut ResourceScope) -> MuxResult<()> {
    let image = image_in_scope(scope, surface.res_handle)?;
    let mut pixel = vec![0u8; image.bpp as usize];
    pack_rgba(surface.format, rgba, &mut pixel)?;

    let bpp = image.bpp as usize;
    let layer_stride = image.layer_stride as usize;
    let last_layer = min(surface.last_layer, image.layers - 1);
    for layer in surface.first_layer..=last_layer {
        let start = image.offset(0, 0, layer);
        for texel in image.host_mem[start..start + layer_stride].chunks_exact_mut(bpp) {
            texel.copy_from_slice(&pixel);
        }
    }
    Ok(())
}

impl MuxContext for SoftContext {
    fn submit_cmd(&mut self, commands: &[u8], scope: &mut ResourceScope) -> MuxResult<()> {
        if commands.len() % size_of::<u32>() != 0 {
            return Err(MuxError::InvalidCommandSize(commands.len()));
        }
        let dwords: Vec<u32> = commands
            .chunks_exact(size_of::<u32>())
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        // Frame the whole stream first so a malformed tail rejects it without side effects.
        let mut framed = Vec::new();
        let mut pos = 0;
        while pos < dwords.len() {
            let header = dwords[pos];
            let end = pos + 1 + header_len(header) as usize;
            if end > dwords.len() {
                error!(
                    "ctx {}: command {} overruns the stream",
                    self.ctx_id,
                    header_cmd(header)
                );
                return Err(MuxError::InvalidCommandBuffer);
            }
            if !is_known_command(header_cmd(header)) {
                return Err(MuxError::UnknownCommand(header_cmd(header)));
            }
            framed.push((header, pos + 1..end));
            pos = end;
        }

        if let Some((gl, handle)) = &self.gl {
            gl.make_current(0, *handle)?;
        }
        for (header, payload) in framed {
            self.execute(header, &dwords[payload], scope)?;
        }
        Ok(())
    }

    fn detach(&mut self, resource: &MuxResource) {
        let stale: Vec<u32> = self
            .surfaces
            .iter()
            .filter(|(_, surface)| surface.res_handle == resource.resource_id)
            .map(|(handle, _)| *handle)
            .collect();
        for handle in stale {
            self.surfaces.remove(&handle);
            self.unbind_surface(handle);
        }
    }

    fn transfer(
        &mut self,
        resource: &mut MuxResource,
        transfer: Transfer3D,
        direction: TransferDirection,
    ) -> MuxResult<()> {
        transfer_resource(resource, transfer, direction)
    }

    fn kind(&self) -> MuxContextKind {
        MuxContextKind::Rendering
    }

    fn destroy(&mut self) {
        if let Some((gl, handle)) = self.gl.take() {
            gl.destroy_gl_context(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::io::IoSliceMut;

    use super::*;
    use crate::mux_os::wait_readable;
    use crate::resource::ResourceTable;

    struct Harness {
        renderer: Box<dyn MuxComponent>,
        resources: ResourceTable,
        attached: BTreeSet<u32>,
        context: Box<dyn MuxContext>,
    }

    impl Harness {
        fn new() -> Harness {
            let renderer = SoftRenderer::init(VirtmuxFlags::default(), None).unwrap();
            let context = renderer.create_context(1, 0, None).unwrap();
            Harness {
                renderer,
                resources: ResourceTable::new(),
                attached: BTreeSet::new(),
                context,
            }
        }

        fn create(&mut self, resource_id: u32, width: u32, height: u32, format: u32) {
            let args = ResourceCreate3D {
                target: VIRTMUX_PIPE_TEXTURE_2D,
                format,
                bind: VIRTMUX_PIPE_BIND_RENDER_TARGET,
                width,
                height,
                depth: 1,
                array_size: 1,
                ..Default::default()
            };
            let renderer = &self.renderer;
            self.resources
                .create(resource_id, args, |id, create| renderer.create_3d(id, create))
                .unwrap();
            self.attached.insert(resource_id);
        }

        fn submit(&mut self, stream: &[u32]) -> MuxResult<()> {
            let bytes: Vec<u8> = stream.iter().flat_map(|d| d.to_le_bytes()).collect();
            let mut scope = ResourceScope::new(&mut self.resources, &self.attached);
            self.context.submit_cmd(&bytes, &mut scope)
        }

        fn read(&mut self, resource_id: u32) -> Vec<u8> {
            let resource = self.resources.get_mut(resource_id).unwrap();
            let (w, h) = (resource.create.width, resource.create.height);
            let bpp = bytes_per_pixel(resource.create.format).unwrap();
            let mut buf = vec![0u8; (w * h * bpp) as usize];
            transfer_resource(
                resource,
                Transfer3D::new_2d(0, 0, w, h),
                TransferDirection::FromHost(Some(IoSliceMut::new(&mut buf))),
            )
            .unwrap();
            buf
        }
    }

    fn surface(handle: u32, res_handle: u32, format: u32) -> Vec<u32> {
        vec![
            virgl_cmd0(VIRGL_CCMD_CREATE_OBJECT, VIRGL_OBJECT_SURFACE, 5),
            handle,
            res_handle,
            format,
            0,
            0,
        ]
    }

    fn framebuffer(cbufs: &[u32]) -> Vec<u32> {
        let mut cmd = vec![
            virgl_cmd0(VIRGL_CCMD_SET_FRAMEBUFFER_STATE, 0, cbufs.len() as u32 + 2),
            cbufs.len() as u32,
            0,
        ];
        cmd.extend_from_slice(cbufs);
        cmd
    }

    fn clear(rgba: [f32; 4]) -> Vec<u32> {
        vec![
            virgl_cmd0(VIRGL_CCMD_CLEAR, 0, 8),
            PIPE_CLEAR_COLOR0,
            rgba[0].to_bits(),
            rgba[1].to_bits(),
            rgba[2].to_bits(),
            rgba[3].to_bits(),
            0,
            0,
            0,
        ]
    }

    fn inline_write(res_handle: u32, w: u32, h: u32, data: &[u8]) -> Vec<u32> {
        let words: Vec<u32> = data
            .chunks(4)
            .map(|c| {
                let mut word = [0u8; 4];
                word[..c.len()].copy_from_slice(c);
                u32::from_le_bytes(word)
            })
            .collect();
        let mut cmd = vec![
            virgl_cmd0(
                VIRGL_CCMD_RESOURCE_INLINE_WRITE,
                0,
                VIRGL_RESOURCE_IW_HDR_SIZE + words.len() as u32,
            ),
            res_handle,
            0,
            0,
            0,
            0,
            0,
            0,
            0,
            w,
            h,
            1,
        ];
        cmd.extend(words);
        cmd
    }

    fn blit(dst: [u32; 9], src: [u32; 9], mask: u32, scissor: Option<[u32; 4]>) -> Vec<u32> {
        let (enable, min_xy, max_xy) = match scissor {
            Some([x0, y0, x1, y1]) => (1, x0 | y0 << 16, x1 | y1 << 16),
            None => (0, 0, 0),
        };
        let mut cmd = vec![
            virgl_cmd0(VIRGL_CCMD_BLIT, 0, VIRGL_CMD_BLIT_SIZE),
            mask,
            0,
            enable,
            min_xy,
            max_xy,
        ];
        cmd.extend_from_slice(&dst);
        cmd.extend_from_slice(&src);
        cmd
    }

    const BGRX: u32 = VIRGL_FORMAT_B8G8R8X8_UNORM;
    const RGBA: u32 = VIRGL_FORMAT_R8G8B8A8_UNORM;

    #[test]
    fn clear_fills_bound_surface() {
        let mut h = Harness::new();
        h.create(1, 4, 4, BGRX);
        let mut stream = surface(1, 1, BGRX);
        stream.extend(framebuffer(&[1]));
        stream.extend(clear([0.0, 1.0, 0.0, 1.0]));
        h.submit(&stream).unwrap();

        for pixel in h.read(1).chunks_exact(4) {
            assert_eq!(pixel, [0x00, 0xff, 0x00, 0xff]);
        }
    }

    #[test]
    fn inline_write_lands_in_box() {
        let mut h = Harness::new();
        h.create(1, 2, 2, RGBA);
        let data: Vec<u8> = (1..=16).collect();
        h.submit(&inline_write(1, 2, 2, &data)).unwrap();
        assert_eq!(h.read(1), data);
    }

    #[test]
    fn blit_scales_with_scissor_and_mask() {
        let mut h = Harness::new();
        h.create(1, 2, 2, RGBA);
        h.create(2, 4, 4, RGBA);
        let texels = [
            10, 0, 0, 255, 20, 0, 0, 255, //
            30, 0, 0, 255, 40, 9, 0, 255,
        ];
        h.submit(&inline_write(1, 2, 2, &texels)).unwrap();

        let src = [1, 0, RGBA, 0, 0, 0, 2, 2, 1];
        let dst = [2, 0, RGBA, 0, 0, 0, 4, 4, 1];
        h.submit(&blit(dst, src, PIPE_MASK_RGBA, Some([0, 0, 4, 2])))
            .unwrap();
        let out = h.read(2);
        let at = |x: usize, y: usize| &out[(y * 4 + x) * 4..(y * 4 + x) * 4 + 4];
        assert_eq!(at(0, 0), [10, 0, 0, 255]);
        assert_eq!(at(3, 1), [20, 0, 0, 255]);
        // Rows 2 and 3 are outside the scissor.
        assert_eq!(at(0, 2), [0, 0, 0, 0]);

        h.submit(&blit(dst, src, PIPE_MASK_G, None)).unwrap();
        let out = h.read(2);
        // Only green is written outside the earlier scissor.
        assert_eq!(&out[(3 * 4 + 3) * 4..(3 * 4 + 3) * 4 + 4], [0, 9, 0, 0]);
    }

    #[test]
    fn blit_onto_itself_with_bad_format_fails_cleanly() {
        let mut h = Harness::new();
        h.create(10, 8, 8, BGRX);
        let src = [10, 0, BGRX, 0, 0, 0, 4, 4, 1];
        let dst = [10, 0, 9999, 4, 4, 0, 4, 4, 1];

        assert!(matches!(
            h.submit(&blit(dst, src, PIPE_MASK_RGBA, None)),
            Err(MuxError::InvalidFormat(9999))
        ));
        assert!(h.resources.contains(10));
        assert_eq!(h.read(10).len(), 8 * 8 * 4);

        let dst = [10, 0, BGRX, 4, 4, 0, 4, 4, 1];
        h.submit(&blit(dst, src, PIPE_MASK_RGBA, None)).unwrap();
    }

    #[test]
    fn copy_region_between_resources() {
        let mut h = Harness::new();
        h.create(1, 4, 4, BGRX);
        h.create(2, 4, 4, BGRX);
        let mut stream = surface(1, 1, BGRX);
        stream.extend(framebuffer(&[1]));
        stream.extend(clear([1.0, 0.0, 0.0, 1.0]));
        stream.extend([
            virgl_cmd0(
                VIRGL_CCMD_RESOURCE_COPY_REGION,
                0,
                VIRGL_CMD_RESOURCE_COPY_REGION_SIZE,
            ),
            2,
            0,
            1,
            1,
            0,
            1,
            0,
            0,
            0,
            0,
            2,
            2,
            1,
        ]);
        h.submit(&stream).unwrap();

        let out = h.read(2);
        let at = |x: usize, y: usize| &out[(y * 4 + x) * 4..(y * 4 + x) * 4 + 4];
        assert_eq!(at(1, 1), [0x00, 0x00, 0xff, 0xff]);
        assert_eq!(at(2, 2), [0x00, 0x00, 0xff, 0xff]);
        assert_eq!(at(0, 0), [0, 0, 0, 0]);
        assert_eq!(at(3, 3), [0, 0, 0, 0]);
    }

    #[test]
    fn malformed_streams_have_no_effect() {
        let mut h = Harness::new();
        h.create(1, 4, 4, BGRX);

        assert!(matches!(
            h.context
                .submit_cmd(&[0; 6], &mut ResourceScope::new(&mut h.resources, &h.attached)),
            Err(MuxError::InvalidCommandSize(6))
        ));

        let mut stream = surface(1, 1, BGRX);
        stream.extend(framebuffer(&[1]));
        stream.extend(clear([1.0, 1.0, 1.0, 1.0]));
        stream.push(virgl_cmd0(VIRGL_CCMD_CLEAR, 0, 8));
        assert!(matches!(
            h.submit(&stream),
            Err(MuxError::InvalidCommandBuffer)
        ));
        assert!(h.read(1).iter().all(|b| *b == 0));

        assert!(matches!(
            h.submit(&[virgl_cmd0(200, 0, 0)]),
            Err(MuxError::UnknownCommand(200))
        ));
        assert!(matches!(
            h.submit(&surface(2, 77, BGRX)),
            Err(MuxError::InvalidResourceId)
        ));
        assert!(matches!(
            h.submit(&surface(0, 1, BGRX)),
            Err(MuxError::InvalidArgument(_))
        ));
        assert!(matches!(
            h.submit(&surface(2, 1, VIRGL_FORMAT_R8_UNORM)),
            Err(MuxError::InvalidFormat(_))
        ));
    }

    #[test]
    fn detach_drops_surfaces() {
        let mut h = Harness::new();
        h.create(1, 4, 4, BGRX);
        let mut stream = surface(5, 1, BGRX);
        stream.extend(framebuffer(&[5]));
        h.submit(&stream).unwrap();

        let resource = h.resources.get(1).unwrap();
        h.context.detach(resource);
        assert!(matches!(
            h.submit(&framebuffer(&[5])),
            Err(MuxError::InvalidArgument(_))
        ));
        // The slot was unbound, so a clear touches nothing.
        h.submit(&clear([1.0, 1.0, 1.0, 1.0])).unwrap();
        assert!(h.read(1).iter().all(|b| *b == 0));
    }

    #[test]
    fn transfers_are_bounds_checked() {
        let mut h = Harness::new();
        h.create(1, 4, 4, BGRX);
        let resource = h.resources.get_mut(1).unwrap();

        let short = [0u8; 63];
        assert!(matches!(
            transfer_resource(
                resource,
                Transfer3D::new_2d(0, 0, 4, 4),
                TransferDirection::ToHost(Some(&short))
            ),
            Err(MuxError::InvalidIovec)
        ));

        let data = [7u8; 64];
        let narrow = Transfer3D {
            stride: 8,
            ..Transfer3D::new_2d(0, 0, 4, 4)
        };
        assert!(transfer_resource(resource, narrow, TransferDirection::ToHost(Some(&data))).is_err());

        let mip = Transfer3D {
            level: 1,
            ..Transfer3D::new_2d(0, 0, 1, 1)
        };
        assert!(transfer_resource(resource, mip, TransferDirection::ToHost(Some(&data))).is_err());

        let outside = Transfer3D::new_2d(3, 3, 2, 1);
        assert!(transfer_resource(resource, outside, TransferDirection::ToHost(Some(&data))).is_err());

        assert!(matches!(
            transfer_resource(
                resource,
                Transfer3D::new_2d(0, 0, 1, 1),
                TransferDirection::ToHost(None)
            ),
            Err(MuxError::InvalidArgument(_))
        ));
        assert!(h.read(1).iter().all(|b| *b == 0));
    }

    #[test]
    fn strided_transfer_uses_offset() {
        let mut h = Harness::new();
        h.create(1, 2, 2, BGRX);
        let mut staging = vec![0u8; 64];
        for (i, b) in staging[16..].iter_mut().enumerate() {
            *b = i as u8;
        }
        let transfer = Transfer3D {
            stride: 16,
            offset: 16,
            ..Transfer3D::new_2d(0, 0, 2, 2)
        };
        let resource = h.resources.get_mut(1).unwrap();
        transfer_resource(resource, transfer, TransferDirection::ToHost(Some(&staging))).unwrap();

        let out = h.read(1);
        assert_eq!(&out[..8], &staging[16..24]);
        assert_eq!(&out[8..], &staging[32..40]);
    }

    #[test]
    fn oversized_images_are_refused() {
        let renderer = SoftRenderer::init(VirtmuxFlags::default(), None).unwrap();
        let huge = ResourceCreate3D {
            target: VIRTMUX_PIPE_TEXTURE_2D,
            format: BGRX,
            width: 16384,
            height: 16384,
            depth: 1,
            array_size: 1,
            ..Default::default()
        };
        assert!(matches!(
            renderer.create_3d(1, &huge),
            Err(MuxError::OutOfMemory)
        ));
        assert!(matches!(
            renderer.create_3d(1, &ResourceCreate3D { format: 0, ..huge }),
            Err(MuxError::InvalidFormat(0))
        ));
    }

    #[test]
    fn capsets_match_their_info() {
        let renderer = SoftRenderer::init(VirtmuxFlags::default(), None).unwrap();
        for capset_id in [VIRTMUX_CAPSET_VIRGL, VIRTMUX_CAPSET_VIRGL2] {
            let (version, size) = renderer.get_capset_info(capset_id);
            assert_eq!(renderer.get_capset(capset_id, version).len(), size as usize);
            assert!(renderer.get_capset(capset_id, version + 1).is_empty());
        }
        assert_eq!(renderer.get_capset_info(9), (0, 0));
    }

    #[test]
    fn thread_sync_signals_descriptor() {
        let mut renderer =
            SoftRenderer::init(VirtmuxFlags::default().use_thread_sync(true), None).unwrap();
        let descriptor = renderer.poll_descriptor().unwrap();
        assert!(!wait_readable(&descriptor, 0).unwrap());

        renderer
            .create_fence(MuxFence {
                fence_id: 4,
                ..Default::default()
            })
            .unwrap();
        assert!(wait_readable(&descriptor, 0).unwrap());
        assert_eq!(renderer.retired_fence(), Some(4));
        assert!(!wait_readable(&descriptor, 0).unwrap());
    }
}
