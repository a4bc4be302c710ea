// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! mux_core: Cross-platform, Rust-based, GPU command multiplexer.

use std::io::IoSliceMut;
use std::sync::Arc;

use log::debug;
use log::info;
use log::warn;

use crate::context::ContextTable;
use crate::context::MuxContext;
use crate::context::ScopedContext;
use crate::fence::FenceSequencer;
use crate::mux_os::SafeDescriptor;
use crate::mux_utils::*;
use crate::resource::BackendObject;
use crate::resource::BackingRegion;
use crate::resource::GuestMemoryMapper;
use crate::resource::MuxResource;
use crate::resource::ResourceTable;
use crate::soft_renderer::SoftRenderer;

/// A backend that owns the host side of resources and builds rendering contexts.
pub trait MuxComponent: Send {
    /// Implementations should return the version and size of the given capset_id.  (0, 0) is
    /// returned by default.
    fn get_capset_info(&self, _capset_id: u32) -> (u32, u32) {
        (0, 0)
    }

    /// Implementations should return the capabilites of given a `capset_id` and `version`.  A
    /// zero-sized array is returned by default.
    fn get_capset(&self, _capset_id: u32, _version: u32) -> Vec<u8> {
        Vec::new()
    }

    /// Implementations must record the fence and retire it once all prior work is done.
    fn create_fence(&mut self, fence: MuxFence) -> MuxResult<()>;

    /// Implementations must return the id of the newest fence whose work has completed.
    fn retired_fence(&mut self) -> Option<u64>;

    /// Implementations should return a descriptor that becomes readable when fences retire.
    fn poll_descriptor(&self) -> Option<SafeDescriptor> {
        None
    }

    /// Implementations must allocate the host object backing a new resource.
    fn create_3d(&self, resource_id: u32, create: &ResourceCreate3D) -> MuxResult<BackendObject>;

    /// Implementations should release any host state tied to `resource_id`.
    fn unref_resource(&self, _resource_id: u32) {}

    /// Implementations must copy from the attached backing (or `buf`) into the host resource.
    fn transfer_write(
        &self,
        _ctx_id: u32,
        _resource: &mut MuxResource,
        _transfer: Transfer3D,
        _buf: Option<&[u8]>,
    ) -> MuxResult<()> {
        Err(MuxError::Unsupported)
    }

    /// Implementations must copy from the host resource into `buf`, or into the attached backing
    /// when `buf` is absent.
    fn transfer_read(
        &self,
        _ctx_id: u32,
        _resource: &mut MuxResource,
        _transfer: Transfer3D,
        _buf: Option<IoSliceMut>,
    ) -> MuxResult<()> {
        Err(MuxError::Unsupported)
    }

    /// Implementations should return a rendering context, or `Unsupported` to get a decode-only
    /// context instead.
    fn create_context(
        &self,
        _ctx_id: u32,
        _context_init: u32,
        _context_name: Option<&str>,
    ) -> MuxResult<Box<dyn MuxContext>> {
        Err(MuxError::Unsupported)
    }

    /// Implementations should forget every fence and resource.
    fn reset(&mut self) {}
}

/// Host display hooks.  Failures are logged and never reach the guest.
pub trait DisplaySink: Send {
    fn set_scanout(&mut self, scanout_id: u32, resource_id: u32, rect: MuxRect) -> MuxResult<()>;
    fn flush(&mut self, resource_id: u32, rect: MuxRect) -> MuxResult<()>;
}

/// An offscreen GL context owned by the host.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GlContextHandle(pub usize);

/// Host hooks for offscreen GL contexts.
pub trait GlContextProvider: Send + Sync {
    fn create_gl_context(&self, scanout_idx: i32) -> MuxResult<GlContextHandle>;
    fn destroy_gl_context(&self, context: GlContextHandle);
    fn make_current(&self, scanout_idx: i32, context: GlContextHandle) -> MuxResult<()>;
}

#[derive(Copy, Clone, Debug)]
pub struct MuxCapsetInfo {
    pub capset_id: u32,
    pub name: &'static str,
}

const VIRTMUX_CAPSETS: [MuxCapsetInfo; 2] = [
    MuxCapsetInfo {
        capset_id: VIRTMUX_CAPSET_VIRGL,
        name: "virgl",
    },
    MuxCapsetInfo {
        capset_id: VIRTMUX_CAPSET_VIRGL2,
        name: "virgl2",
    },
];

/// The multiplexer: resource and context registries, the fence sequencer and one backend.
///
/// Not thread-safe.  Transports serialize access through a single lock.
pub struct Virtmux {
    resources: ResourceTable,
    contexts: ContextTable,
    fences: FenceSequencer,
    display: Option<Box<dyn DisplaySink>>,
    mapper: Option<Arc<dyn GuestMemoryMapper>>,
    capset_info: Vec<MuxCapsetInfo>,
    // Declared last so it is dropped after every resource and context.
    component: Box<dyn MuxComponent>,
}

impl Virtmux {
    /// Gets the capset id, version and size for the capabilty set `index`.
    pub fn get_capset_info(&self, index: u32) -> MuxResult<(u32, u32, u32)> {
        let capset_info = self
            .capset_info
            .get(index as usize)
            .ok_or(MuxError::InvalidCapset)?;

        let (capset_version, capset_size) = self.component.get_capset_info(capset_info.capset_id);
        Ok((capset_info.capset_id, capset_version, capset_size))
    }

    /// Gets the capability set for the `capset_id` and `version`.  Unsupported pairs yield an
    /// empty blob.
    pub fn get_capset(&self, capset_id: u32, version: u32) -> Vec<u8> {
        if !self.capset_info.iter().any(|c| c.capset_id == capset_id) {
            return Vec::new();
        }
        self.component.get_capset(capset_id, version)
    }

    pub fn get_num_capsets(&self) -> u32 {
        self.capset_info.len() as u32
    }

    /// Queues `fence` behind all previously submitted work.  Ring indices share one timeline.
    pub fn create_fence(&mut self, fence: MuxFence) -> MuxResult<()> {
        if fence.flags & VIRTMUX_FLAG_INFO_RING_IDX != 0 {
            debug!(
                "fence {} on ring {} shares the global timeline",
                fence.fence_id, fence.ring_idx
            );
        }
        self.fences.check_next(fence.fence_id)?;
        self.component.create_fence(fence)?;
        self.fences.create_fence(fence)
    }

    /// Retires completed fences, calling the fence handler once per fence in creation order.
    pub fn event_poll(&mut self) {
        let retired = self.component.retired_fence();
        self.fences.poll(retired);
    }

    pub fn last_fence(&self) -> u64 {
        self.fences.last_fence()
    }

    pub fn last_created_fence(&self) -> u64 {
        self.fences.last_created()
    }

    /// Returns a descriptor that is readable once fence `seqno` retired.
    pub fn export_fence(&mut self, seqno: u64) -> MuxResult<MuxHandle> {
        self.fences.export_fence(seqno)
    }

    /// Returns a pollable descriptor for the backend, if it has one.
    pub fn poll_descriptor(&self) -> Option<SafeDescriptor> {
        self.component.poll_descriptor()
    }

    /// Creates a resource with the `resource_create_3d` metadata.
    pub fn resource_create_3d(
        &mut self,
        resource_id: u32,
        resource_create_3d: ResourceCreate3D,
    ) -> MuxResult<()> {
        let component = &self.component;
        self.resources
            .create(resource_id, resource_create_3d, |resource_id, create| {
                component.create_3d(resource_id, create)
            })
    }

    pub fn resource_exists(&self, resource_id: u32) -> bool {
        self.resources.contains(resource_id)
    }

    /// Attaches `regions` to the resource, replacing any previous backing.
    pub fn attach_backing(
        &mut self,
        resource_id: u32,
        regions: Vec<BackingRegion>,
    ) -> MuxResult<()> {
        self.resources.attach_backing(resource_id, regions)
    }

    /// Maps every `(addr, len)` guest range and attaches the result.  Either every range is
    /// attached or none is.
    pub fn attach_guest_backing(&mut self, resource_id: u32, entries: &[(u64, u32)]) -> MuxResult<()> {
        let mapper = self.mapper.clone().ok_or(MuxError::Unsupported)?;
        if !self.resources.contains(resource_id) {
            return Err(MuxError::InvalidResourceId);
        }

        let mut regions = Vec::with_capacity(entries.len());
        for (addr, len) in entries {
            regions.push(BackingRegion::map(&mapper, *addr, *len as usize)?);
        }
        self.resources.attach_backing(resource_id, regions)
    }

    /// Detaches any previously attached regions from the resource.
    pub fn detach_backing(&mut self, resource_id: u32) -> MuxResult<()> {
        self.resources.invalidate_backing(resource_id)
    }

    /// Releases the guest reference on the resource after detaching it from every context.
    /// Unknown handles are tolerated.
    pub fn unref_resource(&mut self, resource_id: u32) -> MuxResult<()> {
        let contexts = &mut self.contexts;
        if let Some(resource) = self
            .resources
            .remove(resource_id, |res| contexts.detach_everywhere(res))
        {
            self.component.unref_resource(resource_id);
            drop(resource);
        }
        Ok(())
    }

    /// Copies from the attached backing (or `buf`) to the host resource.  A non-zero `ctx_id`
    /// routes the transfer through that context.
    pub fn transfer_write(
        &mut self,
        ctx_id: u32,
        resource_id: u32,
        transfer: Transfer3D,
        buf: Option<&[u8]>,
    ) -> MuxResult<()> {
        if ctx_id != 0 {
            return self.contexts.transfer(
                ctx_id,
                &mut self.resources,
                resource_id,
                transfer,
                TransferDirection::ToHost(buf),
            );
        }

        let resource = self.resources.get_mut(resource_id)?;
        self.component.transfer_write(0, resource, transfer, buf)
    }

    /// Copies from the host resource to `buf`, or to the attached backing.
    pub fn transfer_read(
        &mut self,
        ctx_id: u32,
        resource_id: u32,
        transfer: Transfer3D,
        buf: Option<IoSliceMut>,
    ) -> MuxResult<()> {
        if ctx_id != 0 {
            return self.contexts.transfer(
                ctx_id,
                &mut self.resources,
                resource_id,
                transfer,
                TransferDirection::FromHost(buf),
            );
        }

        let resource = self.resources.get_mut(resource_id)?;
        self.component.transfer_read(0, resource, transfer, buf)
    }

    /// Points a scanout at a resource.  Never fails.
    pub fn set_scanout(&mut self, scanout_id: u32, resource_id: u32, rect: MuxRect) {
        if resource_id != 0 && !self.resources.contains(resource_id) {
            warn!("scanout {} set to unknown resource {}", scanout_id, resource_id);
            return;
        }
        if let Some(display) = self.display.as_mut() {
            if let Err(e) = display.set_scanout(scanout_id, resource_id, rect) {
                warn!("set_scanout {} -> {}", scanout_id, e);
            }
        }
    }

    /// Presents a resource region.  Never fails.
    pub fn resource_flush(&mut self, resource_id: u32, rect: MuxRect) {
        if !self.resources.contains(resource_id) {
            warn!("flush of unknown resource {}", resource_id);
            return;
        }
        if let Some(display) = self.display.as_mut() {
            if let Err(e) = display.flush(resource_id, rect) {
                warn!("resource_flush {} -> {}", resource_id, e);
            }
        }
    }

    pub fn resource_set_private(&mut self, resource_id: u32, private_data: u64) -> MuxResult<()> {
        self.resources.get_mut(resource_id)?.private_data = private_data;
        Ok(())
    }

    pub fn resource_private(&self, resource_id: u32) -> MuxResult<u64> {
        Ok(self.resources.get(resource_id)?.private_data)
    }

    /// Creates a context with the given `ctx_id` and `context_init` variable.  Backends that
    /// cannot render get a decode-only context.
    pub fn create_context(
        &mut self,
        ctx_id: u32,
        context_init: u32,
        context_name: Option<&str>,
    ) -> MuxResult<()> {
        let capset_id = context_init & VIRTMUX_CONTEXT_INIT_CAPSET_ID_MASK;
        if capset_id != 0 && !self.capset_info.iter().any(|c| c.capset_id == capset_id) {
            return Err(MuxError::InvalidCapset);
        }

        let component = &self.component;
        self.contexts.create(
            ctx_id,
            context_name.unwrap_or_default(),
            capset_id,
            |ctx_id| match component.create_context(ctx_id, context_init, context_name) {
                Err(MuxError::Unsupported) => Ok(Box::new(ScopedContext) as Box<dyn MuxContext>),
                other => other,
            },
        )?;

        if let Ok(entry) = self.contexts.get(ctx_id) {
            info!(
                "created {:?} context {} \"{}\"",
                entry.kind(),
                ctx_id,
                entry.name
            );
        }
        Ok(())
    }

    pub fn context_exists(&self, ctx_id: u32) -> bool {
        self.contexts.contains(ctx_id)
    }

    /// Destroys the context given by `ctx_id`.  Its resources are detached, not destroyed.
    pub fn destroy_context(&mut self, ctx_id: u32) -> MuxResult<()> {
        self.contexts.remove(ctx_id, &self.resources)
    }

    /// Attaches the resource given by `resource_id` to the context given by `ctx_id`.
    pub fn context_attach_resource(&mut self, ctx_id: u32, resource_id: u32) {
        self.contexts
            .attach_resource(ctx_id, &mut self.resources, resource_id)
    }

    /// Detaches the resource given by `resource_id` from the context given by `ctx_id`.
    pub fn context_detach_resource(&mut self, ctx_id: u32, resource_id: u32) {
        self.contexts
            .detach_resource(ctx_id, &self.resources, resource_id)
    }

    /// Submits `commands` to the context given by `ctx_id`.
    pub fn submit_command(&mut self, ctx_id: u32, commands: &[u8]) -> MuxResult<()> {
        self.contexts.submit(ctx_id, &mut self.resources, commands)
    }

    /// Destroys every context and resource and drops all pending fences.
    pub fn reset(&mut self) {
        self.contexts.clear(&self.resources);
        let contexts = &mut self.contexts;
        self.resources.clear(|res| contexts.detach_everywhere(res));
        self.fences.reset();
        self.component.reset();
        info!("virtmux reset");
    }
}

/// Virtmux Builder, following the Rust builder pattern.
pub struct VirtmuxBuilder {
    capset_mask: u64,
    flags: VirtmuxFlags,
    display: Option<Box<dyn DisplaySink>>,
    mapper: Option<Arc<dyn GuestMemoryMapper>>,
    gl: Option<Arc<dyn GlContextProvider>>,
}

impl VirtmuxBuilder {
    /// Create a new VirtmuxBuilder.  A zero `capset_mask` enables every capset.
    pub fn new(capset_mask: u64) -> VirtmuxBuilder {
        VirtmuxBuilder {
            capset_mask,
            flags: VirtmuxFlags::default(),
            display: None,
            mapper: None,
            gl: None,
        }
    }

    pub fn set_flags(mut self, flags: VirtmuxFlags) -> VirtmuxBuilder {
        self.flags = flags;
        self
    }

    /// Sets use EGL flags in the builder.
    pub fn set_use_egl(mut self, v: bool) -> VirtmuxBuilder {
        self.flags = self.flags.use_egl(v);
        self
    }

    /// Sets use GLX flags in the builder.
    pub fn set_use_glx(mut self, v: bool) -> VirtmuxBuilder {
        self.flags = self.flags.use_glx(v);
        self
    }

    /// Sets use surfaceless flags in the builder.
    pub fn set_use_surfaceless(mut self, v: bool) -> VirtmuxBuilder {
        self.flags = self.flags.use_surfaceless(v);
        self
    }

    pub fn set_use_thread_sync(mut self, v: bool) -> VirtmuxBuilder {
        self.flags = self.flags.use_thread_sync(v);
        self
    }

    /// Without virgl every context is decode-only.
    pub fn set_use_virgl(mut self, v: bool) -> VirtmuxBuilder {
        self.flags = self.flags.use_virgl(v);
        self
    }

    pub fn set_display_sink(mut self, display: Box<dyn DisplaySink>) -> VirtmuxBuilder {
        self.display = Some(display);
        self
    }

    pub fn set_memory_mapper(mut self, mapper: Arc<dyn GuestMemoryMapper>) -> VirtmuxBuilder {
        self.mapper = Some(mapper);
        self
    }

    pub fn set_gl_provider(mut self, gl: Arc<dyn GlContextProvider>) -> VirtmuxBuilder {
        self.gl = Some(gl);
        self
    }

    /// Builds a multiplexer on the software renderer.
    pub fn build(self, fence_handler: MuxFenceHandler) -> MuxResult<Virtmux> {
        if self.flags.egl() && self.flags.glx() {
            return Err(MuxError::InvalidMuxBuild("EGL and GLX are mutually exclusive"));
        }
        if (self.flags.surfaceless() || self.flags.gles()) && !self.flags.egl() {
            return Err(MuxError::InvalidMuxBuild("surfaceless and GLES contexts need EGL"));
        }
        let component = SoftRenderer::init(self.flags, self.gl.clone())?;
        self.build_with_component(fence_handler, component)
    }

    /// Builds a multiplexer on a caller supplied backend.
    pub fn build_with_component(
        self,
        fence_handler: MuxFenceHandler,
        component: Box<dyn MuxComponent>,
    ) -> MuxResult<Virtmux> {
        let capset_mask = self.capset_mask;
        let capset_info: Vec<MuxCapsetInfo> = VIRTMUX_CAPSETS
            .iter()
            .filter(|capset| capset_mask == 0 || capset_mask & (1 << capset.capset_id) != 0)
            .filter(|capset| component.get_capset_info(capset.capset_id) != (0, 0))
            .copied()
            .collect();

        Ok(Virtmux {
            resources: ResourceTable::new(),
            contexts: ContextTable::new(),
            fences: FenceSequencer::new(fence_handler),
            display: self.display,
            mapper: self.mapper,
            capset_info,
            component,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::IoSliceMut;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::sync::Mutex;

    use crate::*;

    fn new_soft() -> Virtmux {
        VirtmuxBuilder::new(0)
            .build(MuxHandler::new(|_| {}))
            .unwrap()
    }

    fn texture_2d() -> ResourceCreate3D {
        ResourceCreate3D {
            target: VIRTMUX_PIPE_TEXTURE_2D,
            format: virgl::VIRGL_FORMAT_B8G8R8X8_UNORM,
            bind: VIRTMUX_PIPE_BIND_RENDER_TARGET,
            width: 8,
            height: 8,
            depth: 1,
            array_size: 1,
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct FailingMapper {
        live: AtomicUsize,
    }

    impl GuestMemoryMapper for FailingMapper {
        fn map(&self, addr: u64, len: usize) -> MuxResult<MuxIovec> {
            if addr == 0 {
                return Err(MuxError::InvalidIovec);
            }
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(MuxIovec {
                base: addr as *mut std::os::raw::c_void,
                len,
            })
        }

        fn unmap(&self, _iovec: MuxIovec) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn capsets_are_listed() {
        let mux = new_soft();
        assert_eq!(mux.get_num_capsets(), 2);
        let (id, version, size) = mux.get_capset_info(1).unwrap();
        assert_eq!(id, VIRTMUX_CAPSET_VIRGL2);
        assert_eq!(version, 2);
        assert_eq!(mux.get_capset(id, version).len(), size as usize);
        assert!(mux.get_capset(42, 1).is_empty());
        assert!(mux.get_capset_info(2).is_err());

        let only_virgl = VirtmuxBuilder::new(1 << VIRTMUX_CAPSET_VIRGL)
            .build(MuxHandler::new(|_| {}))
            .unwrap();
        assert_eq!(only_virgl.get_num_capsets(), 1);
    }

    #[test]
    fn surfaceless_and_gles_need_egl() {
        for flags in [
            VirtmuxFlags::new().use_surfaceless(true),
            VirtmuxFlags::new().use_gles(true),
            VirtmuxFlags::new().use_glx(true).use_gles(true),
        ] {
            let result = VirtmuxBuilder::new(0)
                .set_flags(flags)
                .build(MuxHandler::new(|_| {}));
            assert!(matches!(result, Err(MuxError::InvalidMuxBuild(_))));
        }

        let egl = VirtmuxFlags::new()
            .use_egl(true)
            .use_surfaceless(true)
            .use_gles(true);
        assert!(VirtmuxBuilder::new(0)
            .set_flags(egl)
            .build(MuxHandler::new(|_| {}))
            .is_ok());
        assert!(VirtmuxBuilder::new(0)
            .set_flags(VirtmuxFlags::new())
            .build(MuxHandler::new(|_| {}))
            .is_ok());
    }

    #[test]
    fn egl_and_glx_conflict() {
        let result = VirtmuxBuilder::new(0)
            .set_use_egl(true)
            .set_use_glx(true)
            .build(MuxHandler::new(|_| {}));
        assert!(matches!(result, Err(MuxError::InvalidMuxBuild(_))));
    }

    #[test]
    fn double_unref_is_tolerated() {
        let mut mux = new_soft();
        mux.resource_create_3d(1, texture_2d()).unwrap();
        mux.unref_resource(1).unwrap();
        mux.unref_resource(1).unwrap();
        assert!(!mux.resource_exists(1));
    }

    #[test]
    fn unknown_format_is_not_registered() {
        let mut mux = new_soft();
        let bad = ResourceCreate3D {
            format: 9999,
            ..texture_2d()
        };
        assert!(matches!(
            mux.resource_create_3d(1, bad),
            Err(MuxError::InvalidFormat(9999))
        ));
        assert!(!mux.resource_exists(1));
    }

    #[test]
    fn fences_retire_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut mux = VirtmuxBuilder::new(0)
            .build(MuxHandler::new(move |f: MuxFence| {
                sink.lock().unwrap().push(f.fence_id)
            }))
            .unwrap();

        for fence_id in 1..=3 {
            mux.create_fence(MuxFence {
                fence_id,
                ..Default::default()
            })
            .unwrap();
        }
        assert!(mux
            .create_fence(MuxFence {
                fence_id: 2,
                ..Default::default()
            })
            .is_err());
        mux.event_poll();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(mux.last_fence(), 3);
    }

    #[test]
    fn contexts_fall_back_to_scoped() {
        let mut mux = VirtmuxBuilder::new(0)
            .set_use_virgl(false)
            .build(MuxHandler::new(|_| {}))
            .unwrap();
        mux.create_context(1, 0, Some("scoped")).unwrap();
        assert!(matches!(
            mux.submit_command(1, &[0; 4]),
            Err(MuxError::Unsupported)
        ));
        assert!(matches!(
            mux.create_context(2, 77, None),
            Err(MuxError::InvalidCapset)
        ));
        assert!(matches!(
            mux.submit_command(9, &[0; 4]),
            Err(MuxError::InvalidContextId)
        ));
    }

    #[test]
    fn guest_backing_is_all_or_nothing() {
        let concrete = Arc::new(FailingMapper::default());
        let mut mux = VirtmuxBuilder::new(0)
            .set_memory_mapper(concrete.clone())
            .build(MuxHandler::new(|_| {}))
            .unwrap();
        mux.resource_create_3d(1, texture_2d()).unwrap();

        let result = mux.attach_guest_backing(1, &[(0x1000, 64), (0x2000, 64), (0, 64)]);
        assert!(matches!(result, Err(MuxError::InvalidIovec)));
        assert_eq!(concrete.live.load(Ordering::SeqCst), 0);

        assert!(matches!(
            mux.attach_guest_backing(5, &[(0x1000, 64)]),
            Err(MuxError::InvalidResourceId)
        ));
        assert_eq!(concrete.live.load(Ordering::SeqCst), 0);

        mux.attach_guest_backing(1, &[(0x1000, 64)]).unwrap();
        assert_eq!(concrete.live.load(Ordering::SeqCst), 1);
        mux.unref_resource(1).unwrap();
        assert_eq!(concrete.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn context_transfer_needs_attachment() {
        let mut mux = new_soft();
        mux.resource_create_3d(1, texture_2d()).unwrap();
        mux.create_context(1, 0, None).unwrap();

        let mut data = vec![0u8; 8 * 8 * 4];
        let transfer = Transfer3D::new_2d(0, 0, 8, 8);
        assert!(matches!(
            mux.transfer_write(1, 1, transfer, Some(&data)),
            Err(MuxError::InvalidResourceId)
        ));

        mux.context_attach_resource(1, 1);
        mux.transfer_write(1, 1, transfer, Some(&data)).unwrap();
        mux.transfer_read(1, 1, transfer, Some(IoSliceMut::new(&mut data)))
            .unwrap();
    }

    #[test]
    fn reset_forgets_everything() {
        let mut mux = new_soft();
        mux.resource_create_3d(1, texture_2d()).unwrap();
        mux.create_context(1, 0, None).unwrap();
        mux.context_attach_resource(1, 1);
        mux.create_fence(MuxFence {
            fence_id: 7,
            ..Default::default()
        })
        .unwrap();

        mux.reset();
        assert!(!mux.resource_exists(1));
        assert!(!mux.context_exists(1));
        assert_eq!(mux.last_fence(), 0);
        mux.create_fence(MuxFence {
            fence_id: 1,
            ..Default::default()
        })
        .unwrap();
    }
}
