// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

///! C-bindings for the virtmux crate
extern crate virtmux;

use std::collections::BTreeMap as Map;
use std::ffi::CStr;
use std::io::IoSliceMut;
use std::os::raw::c_char;
use std::os::raw::c_void;
use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::ptr::copy_nonoverlapping;
use std::ptr::null_mut;
use std::slice::from_raw_parts;
use std::slice::from_raw_parts_mut;
use std::sync::Arc;
use std::sync::Mutex;

use libc::iovec;
use libc::EINVAL;
use libc::ESRCH;
use log::debug;
use log::info;
use log::warn;
use log::LevelFilter;
use once_cell::sync::Lazy;
use virtmux::*;

const NO_ERROR: i32 = 0;

/// Newest callback table layout understood by `virtmux_init`.
pub const VIRTMUX_CALLBACKS_VERSION: i32 = 2;

/// `flags` bits for `virtmux_init`.
pub const VIRTMUX_USE_EGL: i32 = 1 << 0;
pub const VIRTMUX_THREAD_SYNC: i32 = 1 << 1;
pub const VIRTMUX_USE_GLX: i32 = 1 << 2;
pub const VIRTMUX_USE_SURFACELESS: i32 = 1 << 3;
pub const VIRTMUX_USE_GLES: i32 = 1 << 4;

static STATE: Lazy<Mutex<Option<Virtmux>>> = Lazy::new(|| Mutex::new(None));

#[allow(non_camel_case_types)]
pub type virtmux_gl_context = *mut c_void;

#[allow(non_camel_case_types)]
pub type virtmux_write_fence = extern "C" fn(cookie: *mut c_void, fence: u32);

#[allow(non_camel_case_types)]
pub type virtmux_map_iov = extern "C" fn(iov: *mut iovec, addr: u64) -> i32;

#[allow(non_camel_case_types)]
pub type virtmux_unmap_iov = extern "C" fn(iov: *mut iovec);

#[allow(non_camel_case_types)]
pub type virtmux_create_gl_context =
    extern "C" fn(cookie: *mut c_void, scanout_idx: i32) -> virtmux_gl_context;

#[allow(non_camel_case_types)]
pub type virtmux_destroy_gl_context = extern "C" fn(cookie: *mut c_void, ctx: virtmux_gl_context);

#[allow(non_camel_case_types)]
pub type virtmux_make_current =
    extern "C" fn(cookie: *mut c_void, scanout_idx: i32, ctx: virtmux_gl_context) -> i32;

#[allow(non_camel_case_types)]
pub type virtmux_rect_update =
    extern "C" fn(cookie: *mut c_void, idx: i32, x: i32, y: i32, width: i32, height: i32);

#[allow(non_camel_case_types)]
pub type virtmux_get_drm_fd = extern "C" fn(cookie: *mut c_void) -> i32;

/// Host hooks.  `get_drm_fd` is only read when `version` is at least 2.
#[repr(C)]
pub struct virtmux_callbacks {
    pub version: i32,
    pub write_fence: virtmux_write_fence,
    pub map_iov: Option<virtmux_map_iov>,
    pub unmap_iov: Option<virtmux_unmap_iov>,
    pub create_gl_context: Option<virtmux_create_gl_context>,
    pub destroy_gl_context: Option<virtmux_destroy_gl_context>,
    pub make_current: Option<virtmux_make_current>,
    pub rect_update: Option<virtmux_rect_update>,
    pub get_drm_fd: Option<virtmux_get_drm_fd>,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct virtmux_box {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub w: u32,
    pub h: u32,
    pub d: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct virtmux_resource_create_args {
    pub handle: u32,
    pub target: u32,
    pub format: u32,
    pub bind: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub array_size: u32,
    pub last_level: u32,
    pub nr_samples: u32,
    pub flags: u32,
}

impl From<virtmux_resource_create_args> for ResourceCreate3D {
    fn from(args: virtmux_resource_create_args) -> ResourceCreate3D {
        ResourceCreate3D {
            target: args.target,
            format: args.format,
            bind: args.bind,
            width: args.width,
            height: args.height,
            depth: args.depth,
            array_size: args.array_size,
            last_level: args.last_level,
            nr_samples: args.nr_samples,
            flags: args.flags,
        }
    }
}

// The cookie is only handed back to the host, never dereferenced.
#[derive(Copy, Clone)]
struct Cookie(usize);

impl Cookie {
    fn ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }
}

struct FfiMemoryMapper {
    map_iov: virtmux_map_iov,
    unmap_iov: Option<virtmux_unmap_iov>,
}

impl GuestMemoryMapper for FfiMemoryMapper {
    fn map(&self, addr: u64, len: usize) -> MuxResult<MuxIovec> {
        let mut iov = iovec {
            iov_base: null_mut(),
            iov_len: len,
        };
        let ret = (self.map_iov)(&mut iov, addr);
        if ret != 0 {
            return Err(MuxError::MappingFailed(ret));
        }
        if iov.iov_base.is_null() || iov.iov_len < len {
            if let Some(unmap_iov) = self.unmap_iov {
                unmap_iov(&mut iov);
            }
            return Err(MuxError::InvalidIovec);
        }
        Ok(MuxIovec {
            base: iov.iov_base,
            len,
        })
    }

    fn unmap(&self, iovec: MuxIovec) {
        if let Some(unmap_iov) = self.unmap_iov {
            let mut iov = iovec {
                iov_base: iovec.base,
                iov_len: iovec.len,
            };
            unmap_iov(&mut iov);
        }
    }
}

struct FfiGlProvider {
    cookie: Cookie,
    create: virtmux_create_gl_context,
    destroy: virtmux_destroy_gl_context,
    make_current: virtmux_make_current,
}

impl GlContextProvider for FfiGlProvider {
    fn create_gl_context(&self, scanout_idx: i32) -> MuxResult<GlContextHandle> {
        let ctx = (self.create)(self.cookie.ptr(), scanout_idx);
        if ctx.is_null() {
            return Err(MuxError::ComponentError(-EINVAL));
        }
        Ok(GlContextHandle(ctx as usize))
    }

    fn destroy_gl_context(&self, context: GlContextHandle) {
        (self.destroy)(self.cookie.ptr(), context.0 as virtmux_gl_context)
    }

    fn make_current(&self, scanout_idx: i32, context: GlContextHandle) -> MuxResult<()> {
        let ctx = context.0 as virtmux_gl_context;
        match (self.make_current)(self.cookie.ptr(), scanout_idx, ctx) {
            0 => Ok(()),
            ret => Err(MuxError::ComponentError(ret)),
        }
    }
}

/// Forwards flushes of scanned-out resources to `rect_update`.
struct FfiDisplay {
    cookie: Cookie,
    rect_update: virtmux_rect_update,
    scanouts: Map<u32, u32>,
}

impl DisplaySink for FfiDisplay {
    fn set_scanout(&mut self, scanout_id: u32, resource_id: u32, _rect: MuxRect) -> MuxResult<()> {
        if resource_id == 0 {
            self.scanouts.remove(&scanout_id);
        } else {
            self.scanouts.insert(scanout_id, resource_id);
        }
        Ok(())
    }

    fn flush(&mut self, resource_id: u32, rect: MuxRect) -> MuxResult<()> {
        let shown = self.scanouts.iter().filter(|(_, res)| **res == resource_id);
        for (&scanout_id, _) in shown {
            (self.rect_update)(
                self.cookie.ptr(),
                scanout_id.try_into()?,
                rect.x.try_into()?,
                rect.y.try_into()?,
                rect.width.try_into()?,
                rect.height.try_into()?,
            );
        }
        Ok(())
    }
}

fn errno_of(e: MuxError) -> i32 {
    warn!("{}", e);
    e.to_errno()
}

/// Runs `f` against the initialized multiplexer.
fn with_mux<F>(f: F) -> i32
where
    F: FnOnce(&mut Virtmux) -> MuxResult<i32>,
{
    catch_unwind(AssertUnwindSafe(|| {
        let mut state = match STATE.lock() {
            Ok(state) => state,
            Err(_) => return EINVAL,
        };
        match state.as_mut() {
            Some(mux) => f(mux).unwrap_or_else(errno_of),
            None => EINVAL,
        }
    }))
    .unwrap_or(ESRCH)
}

fn iovecs_to_regions(iovecs: &[iovec]) -> Vec<BackingRegion> {
    iovecs
        .iter()
        .map(|iov| {
            BackingRegion::unmanaged(MuxIovec {
                base: iov.iov_base,
                len: iov.iov_len,
            })
        })
        .collect()
}

/// # Safety
/// - `iov` must be null or point to `num_iovs` valid iovecs.
unsafe fn iovec_slice<'a>(iov: *const iovec, num_iovs: u32) -> &'a [iovec] {
    if iov.is_null() || num_iovs == 0 {
        &[]
    } else {
        from_raw_parts(iov, num_iovs as usize)
    }
}

#[no_mangle]
pub extern "C" fn virtmux_set_log_level(level: u32) -> i32 {
    let log_level = match level {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    // A second call only changes the level.
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .try_init();
    log::set_max_level(log_level);
    NO_ERROR
}

/// # Safety
/// - `cb` must point to a valid callback table that outlives the library's use of it.
/// - `write_fence` is called with the library lock held and must not call back into it.
#[no_mangle]
pub unsafe extern "C" fn virtmux_init(
    cookie: *mut c_void,
    flags: i32,
    cb: *const virtmux_callbacks,
) -> i32 {
    catch_unwind(AssertUnwindSafe(|| {
        if cb.is_null() {
            return EINVAL;
        }
        let cb = &*cb;
        if cb.version < 1 || cb.version > VIRTMUX_CALLBACKS_VERSION {
            warn!("unsupported callback version {}", cb.version);
            return EINVAL;
        }

        let mut state = match STATE.lock() {
            Ok(state) => state,
            Err(_) => return EINVAL,
        };
        if state.is_some() {
            return errno_of(MuxError::AlreadyInUse);
        }

        let cookie = Cookie(cookie as usize);
        let write_fence = cb.write_fence;
        let fence_handler = MuxFenceHandler::new(move |fence: MuxFence| {
            write_fence(cookie.ptr(), fence.fence_id as u32)
        });

        let mux_flags = VirtmuxFlags::new()
            .use_virgl(true)
            .use_egl(flags & VIRTMUX_USE_EGL != 0)
            .use_thread_sync(flags & VIRTMUX_THREAD_SYNC != 0)
            .use_glx(flags & VIRTMUX_USE_GLX != 0)
            .use_surfaceless(flags & VIRTMUX_USE_SURFACELESS != 0)
            .use_gles(flags & VIRTMUX_USE_GLES != 0);
        let mut builder = VirtmuxBuilder::new(0).set_flags(mux_flags);

        if let Some(map_iov) = cb.map_iov {
            builder = builder.set_memory_mapper(Arc::new(FfiMemoryMapper {
                map_iov,
                unmap_iov: cb.unmap_iov,
            }));
        }
        if let (Some(create), Some(destroy), Some(make_current)) =
            (cb.create_gl_context, cb.destroy_gl_context, cb.make_current)
        {
            builder = builder.set_gl_provider(Arc::new(FfiGlProvider {
                cookie,
                create,
                destroy,
                make_current,
            }));
        }
        if let Some(rect_update) = cb.rect_update {
            builder = builder.set_display_sink(Box::new(FfiDisplay {
                cookie,
                rect_update,
                scanouts: Map::new(),
            }));
        }
        if cb.version >= 2 {
            if let Some(get_drm_fd) = cb.get_drm_fd {
                // The software renderer does not render through a DRM device.
                debug!("host drm fd {} left unused", get_drm_fd(cookie.ptr()));
            }
        }

        match builder.build(fence_handler) {
            Ok(mux) => {
                *state = Some(mux);
                info!("virtmux initialized (flags {:#x})", flags);
                NO_ERROR
            }
            Err(e) => errno_of(e),
        }
    }))
    .unwrap_or(ESRCH)
}

#[no_mangle]
pub extern "C" fn virtmux_cleanup() {
    let _ = catch_unwind(AssertUnwindSafe(|| {
        if let Ok(mut state) = STATE.lock() {
            state.take();
        }
    }));
}

/// Retires completed fences, calling `write_fence` for each.
#[no_mangle]
pub extern "C" fn virtmux_poll() {
    with_mux(|mux| {
        mux.event_poll();
        Ok(NO_ERROR)
    });
}

/// Returns a descriptor that becomes readable when fences may have retired, or -1.  The
/// caller owns the returned descriptor.
#[no_mangle]
pub extern "C" fn virtmux_get_poll_fd() -> i32 {
    catch_unwind(AssertUnwindSafe(|| {
        let state = match STATE.lock() {
            Ok(state) => state,
            Err(_) => return -1,
        };
        state
            .as_ref()
            .and_then(|mux| mux.poll_descriptor())
            .map(|descriptor| descriptor.into_raw_descriptor())
            .unwrap_or(-1)
    }))
    .unwrap_or(-1)
}

/// # Safety
/// - `cmd` must point to `cmd_len` readable bytes.
/// - `iov` must be null or point to `num_iovs` valid iovecs.
#[no_mangle]
pub unsafe extern "C" fn virtmux_process_vcmd(
    cmd: *const c_void,
    cmd_len: u32,
    iov: *const iovec,
    num_iovs: u32,
) -> i32 {
    if cmd.is_null() {
        return EINVAL;
    }
    let record = from_raw_parts(cmd as *const u8, cmd_len as usize);
    let regions: Vec<MuxIovec> = iovec_slice(iov, num_iovs)
        .iter()
        .map(|iov| MuxIovec {
            base: iov.iov_base,
            len: iov.iov_len,
        })
        .collect();
    with_mux(|mux| {
        let response = process_gpu_command(mux, record, &regions);
        Ok(response.to_errno())
    })
}

#[no_mangle]
pub extern "C" fn virtmux_create_fence(client_fence_id: u32, ctx_id: u32) -> i32 {
    with_mux(|mux| {
        mux.create_fence(MuxFence {
            flags: VIRTMUX_FLAG_FENCE,
            fence_id: client_fence_id as u64,
            ctx_id,
            ring_idx: 0,
        })?;
        Ok(NO_ERROR)
    })
}

/// # Safety
/// - `fd` must be valid for writes.  The caller owns the returned descriptor.
#[no_mangle]
pub unsafe extern "C" fn virtmux_export_fence(seqno: u64, fd: *mut i32) -> i32 {
    if fd.is_null() {
        return EINVAL;
    }
    with_mux(|mux| {
        let handle = mux.export_fence(seqno)?;
        *fd = handle.os_handle.into_raw_descriptor();
        Ok(NO_ERROR)
    })
}

#[no_mangle]
pub extern "C" fn virtmux_resource_set_priv(res_handle: u32, data: *mut c_void) -> i32 {
    with_mux(|mux| {
        mux.resource_set_private(res_handle, data as u64)?;
        Ok(NO_ERROR)
    })
}

/// Returns the pointer stored with `virtmux_resource_set_priv`, or null.
#[no_mangle]
pub extern "C" fn virtmux_resource_get_priv(res_handle: u32) -> *mut c_void {
    catch_unwind(AssertUnwindSafe(|| {
        let state = STATE.lock().ok()?;
        let private = state.as_ref()?.resource_private(res_handle).ok()?;
        Some(private as *mut c_void)
    }))
    .ok()
    .flatten()
    .unwrap_or(null_mut())
}

/// Reports the newest version and the size of capset `set`.  Unknown capsets report zeroes.
///
/// # Safety
/// - `max_ver` and `max_size` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn virtmux_get_cap_set(set: u32, max_ver: *mut u32, max_size: *mut u32) {
    if max_ver.is_null() || max_size.is_null() {
        return;
    }
    *max_ver = 0;
    *max_size = 0;
    with_mux(|mux| {
        for index in 0..mux.get_num_capsets() {
            let (capset_id, version, size) = mux.get_capset_info(index)?;
            if capset_id == set {
                *max_ver = version;
                *max_size = size;
            }
        }
        Ok(NO_ERROR)
    });
}

/// # Safety
/// - `caps` must be valid for writes of the size reported by `virtmux_get_cap_set`.
#[no_mangle]
pub unsafe extern "C" fn virtmux_fill_caps(set: u32, version: u32, caps: *mut c_void) {
    if caps.is_null() {
        return;
    }
    with_mux(|mux| {
        let data = mux.get_capset(set, version);
        copy_nonoverlapping(data.as_ptr(), caps as *mut u8, data.len());
        Ok(NO_ERROR)
    });
}

#[no_mangle]
pub extern "C" fn virtmux_reset() {
    with_mux(|mux| {
        mux.reset();
        Ok(NO_ERROR)
    });
}

/// # Safety
/// - `name` must be null or point to `nlen` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn virtmux_context_create(handle: u32, nlen: u32, name: *const c_char) -> i32 {
    let name = if name.is_null() || nlen == 0 {
        None
    } else {
        std::str::from_utf8(from_raw_parts(name as *const u8, nlen as usize)).ok()
    };
    with_mux(|mux| {
        mux.create_context(handle, 0, name)?;
        Ok(NO_ERROR)
    })
}

/// Like `virtmux_context_create`, with `name` a null-terminated string and a `context_init`
/// selecting the capset.
///
/// # Safety
/// - `name` must be null or a null-terminated C-string.
#[no_mangle]
pub unsafe extern "C" fn virtmux_context_create_with_flags(
    handle: u32,
    context_init: u32,
    name: *const c_char,
) -> i32 {
    let name = if name.is_null() {
        None
    } else {
        CStr::from_ptr(name).to_str().ok()
    };
    with_mux(|mux| {
        mux.create_context(handle, context_init, name)?;
        Ok(NO_ERROR)
    })
}

#[no_mangle]
pub extern "C" fn virtmux_context_destroy(handle: u32) {
    with_mux(|mux| {
        mux.destroy_context(handle)?;
        Ok(NO_ERROR)
    });
}

#[no_mangle]
pub extern "C" fn virtmux_ctx_attach_resource(ctx_id: u32, res_handle: u32) {
    with_mux(|mux| {
        mux.context_attach_resource(ctx_id, res_handle);
        Ok(NO_ERROR)
    });
}

#[no_mangle]
pub extern "C" fn virtmux_ctx_detach_resource(ctx_id: u32, res_handle: u32) {
    with_mux(|mux| {
        mux.context_detach_resource(ctx_id, res_handle);
        Ok(NO_ERROR)
    });
}

/// Creates a resource, attaching `iov` as its backing when given.
///
/// # Safety
/// - `args` must point to valid creation arguments.
/// - `iov` must be null or point to `num_iovs` iovecs that stay valid until the backing is
///   detached or the resource is unreferenced.
#[no_mangle]
pub unsafe extern "C" fn virtmux_resource_create(
    args: *const virtmux_resource_create_args,
    iov: *const iovec,
    num_iovs: u32,
) -> i32 {
    if args.is_null() {
        return EINVAL;
    }
    let args = *args;
    let regions = iovecs_to_regions(iovec_slice(iov, num_iovs));
    with_mux(|mux| {
        mux.resource_create_3d(args.handle, args.into())?;
        if !regions.is_empty() {
            mux.attach_backing(args.handle, regions)?;
        }
        Ok(NO_ERROR)
    })
}

#[no_mangle]
pub extern "C" fn virtmux_resource_unref(res_handle: u32) {
    with_mux(|mux| {
        mux.unref_resource(res_handle)?;
        Ok(NO_ERROR)
    });
}

/// # Safety
/// - `iov` must point to `num_iovs` iovecs that stay valid until the backing is detached or the
///   resource is unreferenced.
#[no_mangle]
pub unsafe extern "C" fn virtmux_resource_attach_iov(
    res_handle: u32,
    iov: *const iovec,
    num_iovs: u32,
) -> i32 {
    let regions = iovecs_to_regions(iovec_slice(iov, num_iovs));
    with_mux(|mux| {
        mux.attach_backing(res_handle, regions)?;
        Ok(NO_ERROR)
    })
}

#[no_mangle]
pub extern "C" fn virtmux_resource_detach_iov(res_handle: u32) {
    with_mux(|mux| {
        mux.detach_backing(res_handle)?;
        Ok(NO_ERROR)
    });
}

fn transfer_of(
    level: u32,
    stride: u32,
    layer_stride: u32,
    b: &virtmux_box,
    offset: u64,
) -> Transfer3D {
    Transfer3D {
        x: b.x,
        y: b.y,
        z: b.z,
        w: b.w,
        h: b.h,
        d: b.d,
        level,
        stride,
        layer_stride,
        offset,
    }
}

/// Copies `box_` of the resource into `iov`, or into the attached backing when `iov` is null.
///
/// # Safety
/// - `box_` must point to a valid box.
/// - `iov` must be null or point to `num_iovs` valid, writable iovecs.
#[no_mangle]
pub unsafe extern "C" fn virtmux_transfer_read_iov(
    handle: u32,
    ctx_id: u32,
    level: u32,
    stride: u32,
    layer_stride: u32,
    box_: *const virtmux_box,
    offset: u64,
    iov: *const iovec,
    num_iovs: u32,
) -> i32 {
    if box_.is_null() {
        return EINVAL;
    }
    let transfer = transfer_of(level, stride, layer_stride, &*box_, offset);
    let iovecs = iovec_slice(iov, num_iovs);
    with_mux(|mux| {
        if iovecs.is_empty() {
            mux.transfer_read(ctx_id, handle, transfer, None)?;
            return Ok(NO_ERROR);
        }

        let total: usize = iovecs.iter().map(|iov| iov.iov_len).sum();
        let mut staging = vec![0u8; total];
        mux.transfer_read(ctx_id, handle, transfer, Some(IoSliceMut::new(&mut staging)))?;
        let mut remaining = &staging[..];
        for iov in iovecs {
            let (head, tail) = remaining.split_at(iov.iov_len);
            from_raw_parts_mut(iov.iov_base as *mut u8, iov.iov_len).copy_from_slice(head);
            remaining = tail;
        }
        Ok(NO_ERROR)
    })
}

/// Copies `iov` into `box_` of the resource, or the attached backing when `iov` is null.
///
/// # Safety
/// - `box_` must point to a valid box.
/// - `iov` must be null or point to `num_iovs` valid iovecs.
#[no_mangle]
pub unsafe extern "C" fn virtmux_transfer_write_iov(
    handle: u32,
    ctx_id: u32,
    level: u32,
    stride: u32,
    layer_stride: u32,
    box_: *const virtmux_box,
    offset: u64,
    iov: *const iovec,
    num_iovs: u32,
) -> i32 {
    if box_.is_null() {
        return EINVAL;
    }
    let transfer = transfer_of(level, stride, layer_stride, &*box_, offset);
    let iovecs = iovec_slice(iov, num_iovs);
    with_mux(|mux| {
        if iovecs.is_empty() {
            mux.transfer_write(ctx_id, handle, transfer, None)?;
            return Ok(NO_ERROR);
        }

        let mut staging = Vec::new();
        for iov in iovecs {
            staging.extend_from_slice(from_raw_parts(iov.iov_base as *const u8, iov.iov_len));
        }
        mux.transfer_write(ctx_id, handle, transfer, Some(&staging))?;
        Ok(NO_ERROR)
    })
}

/// # Safety
/// - `buffer` must point to `ndw` readable dwords.
#[no_mangle]
pub unsafe extern "C" fn virtmux_submit_cmd(buffer: *const c_void, ctx_id: u32, ndw: u32) -> i32 {
    if buffer.is_null() && ndw != 0 {
        return EINVAL;
    }
    let commands = if ndw == 0 {
        &[][..]
    } else {
        from_raw_parts(buffer as *const u8, ndw as usize * 4)
    };
    with_mux(|mux| {
        mux.submit_command(ctx_id, commands)?;
        Ok(NO_ERROR)
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use super::*;

    static LAST_FENCE: AtomicU32 = AtomicU32::new(0);

    extern "C" fn write_fence(_cookie: *mut c_void, fence: u32) {
        LAST_FENCE.store(fence, Ordering::SeqCst);
    }

    fn callbacks() -> virtmux_callbacks {
        virtmux_callbacks {
            version: 1,
            write_fence,
            map_iov: None,
            unmap_iov: None,
            create_gl_context: None,
            destroy_gl_context: None,
            make_current: None,
            rect_update: None,
            get_drm_fd: None,
        }
    }

    fn texture(handle: u32) -> virtmux_resource_create_args {
        virtmux_resource_create_args {
            handle,
            target: VIRTMUX_PIPE_TEXTURE_2D,
            format: virgl::VIRGL_FORMAT_B8G8R8A8_UNORM,
            bind: VIRTMUX_PIPE_BIND_RENDER_TARGET,
            width: 4,
            height: 4,
            depth: 1,
            array_size: 1,
            ..Default::default()
        }
    }

    #[test]
    fn errno_is_returned_positive() {
        assert_eq!(errno_of(MuxError::AlreadyExists), libc::EEXIST);
        assert_eq!(errno_of(MuxError::InvalidResourceId), ESRCH);
        assert_eq!(errno_of(MuxError::OutOfMemory), libc::ENOMEM);
        assert_eq!(errno_of(MuxError::ComponentError(-EINVAL)), EINVAL);
    }

    // The library state is global, so one test walks the whole lifecycle.
    #[test]
    fn lifecycle() {
        let cb = callbacks();
        unsafe {
            assert_eq!(virtmux_init(null_mut(), 0, std::ptr::null()), EINVAL);
            assert_eq!(virtmux_init(null_mut(), 0, &cb), NO_ERROR);
            assert_eq!(virtmux_init(null_mut(), 0, &cb), libc::EBUSY);

            let mut max_ver = 0;
            let mut max_size = 0;
            virtmux_get_cap_set(VIRTMUX_CAPSET_VIRGL2, &mut max_ver, &mut max_size);
            assert_eq!(max_ver, 2);
            let mut caps = vec![0u8; max_size as usize];
            virtmux_fill_caps(VIRTMUX_CAPSET_VIRGL2, max_ver, caps.as_mut_ptr() as *mut c_void);
            assert!(caps.iter().any(|b| *b != 0));

            assert_eq!(virtmux_resource_create(&texture(1), std::ptr::null(), 0), NO_ERROR);
            assert_eq!(
                virtmux_resource_create(&texture(1), std::ptr::null(), 0),
                libc::EEXIST
            );
            assert_eq!(virtmux_context_create(1, 0, std::ptr::null()), NO_ERROR);
            let unknown = [0u8; 24];
            assert_eq!(
                virtmux_process_vcmd(unknown.as_ptr() as *const c_void, 24, std::ptr::null(), 0),
                EINVAL
            );
            virtmux_ctx_attach_resource(1, 1);

            let pixels: Vec<u8> = (0..64).collect();
            let iov = iovec {
                iov_base: pixels.as_ptr() as *mut c_void,
                iov_len: pixels.len(),
            };
            let full = virtmux_box {
                w: 4,
                h: 4,
                d: 1,
                ..Default::default()
            };
            assert_eq!(
                virtmux_transfer_write_iov(1, 1, 0, 0, 0, &full, 0, &iov, 1),
                NO_ERROR
            );
            let mut first = [0u8; 16];
            let mut rest = [0u8; 48];
            let out = [
                iovec {
                    iov_base: first.as_mut_ptr() as *mut c_void,
                    iov_len: first.len(),
                },
                iovec {
                    iov_base: rest.as_mut_ptr() as *mut c_void,
                    iov_len: rest.len(),
                },
            ];
            assert_eq!(
                virtmux_transfer_read_iov(1, 1, 0, 0, 0, &full, 0, out.as_ptr(), 2),
                NO_ERROR
            );
            assert_eq!(first[..], pixels[..16]);
            assert_eq!(rest[..], pixels[16..]);

            let nop = [0u32];
            assert_eq!(
                virtmux_submit_cmd(nop.as_ptr() as *const c_void, 1, 1),
                NO_ERROR
            );
            assert_eq!(virtmux_submit_cmd(nop.as_ptr() as *const c_void, 9, 1), ESRCH);

            let mut value = 7u32;
            let data = &mut value as *mut u32 as *mut c_void;
            assert_eq!(virtmux_resource_set_priv(1, data), NO_ERROR);
            assert_eq!(virtmux_resource_get_priv(1), data);
            assert!(virtmux_resource_get_priv(2).is_null());

            assert_eq!(virtmux_create_fence(4, 1), NO_ERROR);
            assert_eq!(virtmux_create_fence(4, 1), EINVAL);
            virtmux_poll();
            assert_eq!(LAST_FENCE.load(Ordering::SeqCst), 4);
            let mut fd = -1;
            assert_eq!(virtmux_export_fence(4, &mut fd), NO_ERROR);
            assert!(fd >= 0);
            libc::close(fd);

            virtmux_reset();
            assert!(virtmux_resource_get_priv(1).is_null());
            virtmux_resource_unref(1);
            virtmux_context_destroy(1);

            virtmux_cleanup();
            assert_eq!(virtmux_create_fence(5, 0), EINVAL);
        }
    }
}
