// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Handle-indexed resource registry.

use std::any::Any;
use std::collections::BTreeMap as Map;
use std::sync::Arc;

use log::debug;

use crate::mux_utils::*;

/// Opaque per-resource state owned by a backend.
pub type BackendObject = Box<dyn Any + Send>;

/// Host hook that turns a guest address range into host memory.
pub trait GuestMemoryMapper: Send + Sync {
    /// Maps `len` bytes of guest memory at `addr`.
    fn map(&self, addr: u64, len: usize) -> MuxResult<MuxIovec>;
    /// Releases an iovec previously returned by `map`.
    fn unmap(&self, iovec: MuxIovec);
}

/// One backing memory region.  Mapped regions are unmapped exactly once, when the region is
/// dropped.
pub struct BackingRegion {
    iovec: MuxIovec,
    mapper: Option<Arc<dyn GuestMemoryMapper>>,
}

impl BackingRegion {
    /// Wraps memory whose lifetime is managed by the caller.
    pub fn unmanaged(iovec: MuxIovec) -> BackingRegion {
        BackingRegion {
            iovec,
            mapper: None,
        }
    }

    /// Maps a guest range through `mapper`.
    pub fn map(
        mapper: &Arc<dyn GuestMemoryMapper>,
        addr: u64,
        len: usize,
    ) -> MuxResult<BackingRegion> {
        let iovec = mapper.map(addr, len)?;
        Ok(BackingRegion {
            iovec,
            mapper: Some(mapper.clone()),
        })
    }

    pub fn iovec(&self) -> MuxIovec {
        self.iovec
    }

    pub fn len(&self) -> usize {
        self.iovec.len
    }

    pub fn is_empty(&self) -> bool {
        self.iovec.len == 0
    }
}

impl Drop for BackingRegion {
    fn drop(&mut self) {
        if let Some(mapper) = self.mapper.take() {
            mapper.unmap(self.iovec);
        }
    }
}

/// A live resource.
pub struct MuxResource {
    pub resource_id: u32,
    pub create: ResourceCreate3D,
    pub backing: Option<Vec<BackingRegion>>,
    pub backend_object: Option<BackendObject>,
    pub private_data: u64,
}

impl MuxResource {
    /// The attached backing as plain iovecs, empty when nothing is attached.
    pub fn backing_iovecs(&self) -> Vec<MuxIovec> {
        self.backing
            .as_ref()
            .map(|regions| regions.iter().map(BackingRegion::iovec).collect())
            .unwrap_or_default()
    }

    pub fn backing_len(&self) -> usize {
        self.backing
            .as_ref()
            .map(|regions| regions.iter().map(BackingRegion::len).sum())
            .unwrap_or(0)
    }
}

/// Checks the creation arguments against the dimension, sample, flag and usage rules of the
/// target kind.
pub fn validate_resource_create(resource_id: u32, args: &ResourceCreate3D) -> MuxResult<()> {
    if resource_id == 0 {
        return Err(MuxError::InvalidArgument("resource handle 0"));
    }

    let single_layer = args.depth == 1 && args.array_size == 1;
    match args.target {
        VIRTMUX_PIPE_BUFFER => {
            if args.height != 1
                || !single_layer
                || args.nr_samples != 0
                || args.last_level != 0
            {
                return Err(MuxError::InvalidArgument("buffer dimensions"));
            }
        }
        VIRTMUX_PIPE_TEXTURE_1D => {
            if args.height != 1 || !single_layer {
                return Err(MuxError::InvalidArgument("1D dimensions"));
            }
        }
        VIRTMUX_PIPE_TEXTURE_1D_ARRAY => {
            if args.height != 1 || args.depth != 1 || args.array_size == 0 {
                return Err(MuxError::InvalidArgument("1D array dimensions"));
            }
        }
        VIRTMUX_PIPE_TEXTURE_2D | VIRTMUX_PIPE_TEXTURE_RECT => {
            if !single_layer {
                return Err(MuxError::InvalidArgument("2D dimensions"));
            }
        }
        VIRTMUX_PIPE_TEXTURE_2D_ARRAY => {
            if args.depth != 1 || args.array_size == 0 {
                return Err(MuxError::InvalidArgument("2D array dimensions"));
            }
        }
        VIRTMUX_PIPE_TEXTURE_3D => {
            if args.array_size != 1 || args.depth == 0 {
                return Err(MuxError::InvalidArgument("3D dimensions"));
            }
        }
        VIRTMUX_PIPE_TEXTURE_CUBE => {
            if args.width != args.height || args.depth != 1 || args.array_size != 6 {
                return Err(MuxError::InvalidArgument("cube dimensions"));
            }
        }
        VIRTMUX_PIPE_TEXTURE_CUBE_ARRAY => {
            if args.width != args.height
                || args.depth != 1
                || args.array_size == 0
                || args.array_size % 6 != 0
            {
                return Err(MuxError::InvalidArgument("cube array dimensions"));
            }
        }
        _ => return Err(MuxError::InvalidArgument("unknown target")),
    }

    if args.width == 0 || args.height == 0 {
        return Err(MuxError::InvalidArgument("zero sized resource"));
    }

    let is_2d = args.target == VIRTMUX_PIPE_TEXTURE_2D || args.target == VIRTMUX_PIPE_TEXTURE_RECT;
    if args.nr_samples > 1 {
        if args.target != VIRTMUX_PIPE_TEXTURE_2D && args.target != VIRTMUX_PIPE_TEXTURE_2D_ARRAY {
            return Err(MuxError::InvalidArgument("multisampling needs a 2D target"));
        }
        if args.last_level > 0 {
            return Err(MuxError::InvalidArgument("multisampled resource with mipmaps"));
        }
    }
    if args.last_level > 0 && args.target == VIRTMUX_PIPE_TEXTURE_RECT {
        return Err(MuxError::InvalidArgument("rect texture with mipmaps"));
    }

    if args.flags & !VIRTMUX_RESOURCE_Y_0_TOP != 0 {
        return Err(MuxError::InvalidArgument("unknown resource flags"));
    }
    if args.flags & VIRTMUX_RESOURCE_Y_0_TOP != 0 && !is_2d {
        return Err(MuxError::InvalidArgument("Y_0_TOP on a non 2D target"));
    }

    match args.bind {
        0 | VIRTMUX_PIPE_BIND_CUSTOM
        | VIRTMUX_PIPE_BIND_INDEX_BUFFER
        | VIRTMUX_PIPE_BIND_STREAM_OUTPUT
        | VIRTMUX_PIPE_BIND_VERTEX_BUFFER
        | VIRTMUX_PIPE_BIND_CONSTANT_BUFFER => {
            if args.target != VIRTMUX_PIPE_BUFFER {
                return Err(MuxError::InvalidArgument("buffer usage on a texture"));
            }
        }
        bind => {
            let texture_usage = VIRTMUX_PIPE_BIND_SAMPLER_VIEW
                | VIRTMUX_PIPE_BIND_DEPTH_STENCIL
                | VIRTMUX_PIPE_BIND_RENDER_TARGET
                | VIRTMUX_PIPE_BIND_CURSOR;
            if bind & texture_usage == 0 {
                return Err(MuxError::InvalidArgument("no usable bind flags"));
            }
        }
    }

    Ok(())
}

/// Resources by handle.  All mutation goes through this table.
#[derive(Default)]
pub struct ResourceTable {
    resources: Map<u32, MuxResource>,
}

impl ResourceTable {
    pub fn new() -> ResourceTable {
        Default::default()
    }

    /// Validates `args`, lets `alloc` build the backend object, then registers the resource.
    /// Nothing is registered when any step fails.
    pub fn create<F>(&mut self, resource_id: u32, args: ResourceCreate3D, alloc: F) -> MuxResult<()>
    where
        F: FnOnce(u32, &ResourceCreate3D) -> MuxResult<BackendObject>,
    {
        validate_resource_create(resource_id, &args)?;
        if self.resources.contains_key(&resource_id) {
            return Err(MuxError::AlreadyExists);
        }

        let backend_object = alloc(resource_id, &args)?;
        self.resources.insert(
            resource_id,
            MuxResource {
                resource_id,
                create: args,
                backing: None,
                backend_object: Some(backend_object),
                private_data: 0,
            },
        );
        Ok(())
    }

    pub fn contains(&self, resource_id: u32) -> bool {
        self.resources.contains_key(&resource_id)
    }

    pub fn get(&self, resource_id: u32) -> MuxResult<&MuxResource> {
        self.resources
            .get(&resource_id)
            .ok_or(MuxError::InvalidResourceId)
    }

    pub fn get_mut(&mut self, resource_id: u32) -> MuxResult<&mut MuxResource> {
        self.resources
            .get_mut(&resource_id)
            .ok_or(MuxError::InvalidResourceId)
    }

    /// Replaces the backing of `resource_id`.  On failure `regions` are released.
    pub fn attach_backing(
        &mut self,
        resource_id: u32,
        regions: Vec<BackingRegion>,
    ) -> MuxResult<()> {
        let resource = self.get_mut(resource_id)?;
        if regions.is_empty() {
            return Err(MuxError::InvalidArgument("no backing regions"));
        }
        if regions.iter().any(BackingRegion::is_empty) {
            return Err(MuxError::InvalidArgument("zero length backing region"));
        }

        resource.backing = Some(regions);
        Ok(())
    }

    /// Drops the backing of `resource_id`, unmapping every region.
    pub fn invalidate_backing(&mut self, resource_id: u32) -> MuxResult<()> {
        let resource = self.get_mut(resource_id)?;
        resource.backing = None;
        Ok(())
    }

    /// Removes `resource_id` after `detach_everywhere` has seen it.  Unknown handles are a
    /// no-op.
    pub fn remove<F>(&mut self, resource_id: u32, mut detach_everywhere: F) -> Option<MuxResource>
    where
        F: FnMut(&MuxResource),
    {
        match self.resources.get(&resource_id) {
            Some(resource) => detach_everywhere(resource),
            None => {
                debug!("remove of unknown resource {}", resource_id);
                return None;
            }
        }
        self.resources.remove(&resource_id)
    }

    /// Removes every resource, detaching each one first.
    pub fn clear<F>(&mut self, mut detach_everywhere: F)
    where
        F: FnMut(&MuxResource),
    {
        for resource in self.resources.values() {
            detach_everywhere(resource);
        }
        self.resources.clear();
    }

    pub fn handles(&self) -> Vec<u32> {
        self.resources.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;

    fn texture_2d(width: u32, height: u32) -> ResourceCreate3D {
        ResourceCreate3D {
            target: VIRTMUX_PIPE_TEXTURE_2D,
            format: 2,
            bind: VIRTMUX_PIPE_BIND_RENDER_TARGET,
            width,
            height,
            depth: 1,
            array_size: 1,
            ..Default::default()
        }
    }

    fn no_backend(_: u32, _: &ResourceCreate3D) -> MuxResult<BackendObject> {
        Ok(Box::new(()))
    }

    #[derive(Default)]
    struct CountingMapper {
        maps: AtomicUsize,
        unmaps: AtomicUsize,
    }

    impl GuestMemoryMapper for CountingMapper {
        fn map(&self, addr: u64, len: usize) -> MuxResult<MuxIovec> {
            if addr == 0xdead {
                return Err(MuxError::InvalidIovec);
            }
            self.maps.fetch_add(1, Ordering::SeqCst);
            Ok(MuxIovec {
                base: addr as *mut std::os::raw::c_void,
                len,
            })
        }

        fn unmap(&self, _iovec: MuxIovec) {
            self.unmaps.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn buffer_legality() {
        let buffer = ResourceCreate3D {
            target: VIRTMUX_PIPE_BUFFER,
            width: 4096,
            height: 1,
            depth: 1,
            array_size: 1,
            ..Default::default()
        };
        assert!(validate_resource_create(1, &buffer).is_ok());

        for bad in [
            ResourceCreate3D { height: 2, ..buffer },
            ResourceCreate3D { depth: 2, ..buffer },
            ResourceCreate3D { array_size: 2, ..buffer },
            ResourceCreate3D { nr_samples: 1, ..buffer },
            ResourceCreate3D { last_level: 1, ..buffer },
        ] {
            assert!(matches!(
                validate_resource_create(1, &bad),
                Err(MuxError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn cube_legality() {
        let cube = ResourceCreate3D {
            target: VIRTMUX_PIPE_TEXTURE_CUBE,
            bind: VIRTMUX_PIPE_BIND_SAMPLER_VIEW,
            width: 64,
            height: 64,
            depth: 1,
            array_size: 6,
            ..Default::default()
        };
        assert!(validate_resource_create(1, &cube).is_ok());
        assert!(validate_resource_create(1, &ResourceCreate3D { height: 32, ..cube }).is_err());
        assert!(validate_resource_create(1, &ResourceCreate3D { array_size: 12, ..cube }).is_err());

        let cube_array = ResourceCreate3D {
            target: VIRTMUX_PIPE_TEXTURE_CUBE_ARRAY,
            array_size: 12,
            ..cube
        };
        assert!(validate_resource_create(1, &cube_array).is_ok());
        assert!(validate_resource_create(
            1,
            &ResourceCreate3D {
                array_size: 8,
                ..cube_array
            }
        )
        .is_err());
        assert!(validate_resource_create(
            1,
            &ResourceCreate3D {
                array_size: 0,
                ..cube_array
            }
        )
        .is_err());
    }

    #[test]
    fn array_and_volume_legality() {
        let one_d_array = ResourceCreate3D {
            target: VIRTMUX_PIPE_TEXTURE_1D_ARRAY,
            bind: VIRTMUX_PIPE_BIND_SAMPLER_VIEW,
            width: 16,
            height: 1,
            depth: 1,
            array_size: 4,
            ..Default::default()
        };
        assert!(validate_resource_create(1, &one_d_array).is_ok());
        assert!(validate_resource_create(
            1,
            &ResourceCreate3D {
                target: VIRTMUX_PIPE_TEXTURE_1D,
                ..one_d_array
            }
        )
        .is_err());

        let volume = ResourceCreate3D {
            target: VIRTMUX_PIPE_TEXTURE_3D,
            bind: VIRTMUX_PIPE_BIND_SAMPLER_VIEW,
            width: 8,
            height: 8,
            depth: 8,
            array_size: 1,
            ..Default::default()
        };
        assert!(validate_resource_create(1, &volume).is_ok());
        assert!(validate_resource_create(1, &ResourceCreate3D { array_size: 2, ..volume }).is_err());
        assert!(validate_resource_create(1, &ResourceCreate3D { target: 42, ..volume }).is_err());
    }

    #[test]
    fn sample_flag_and_usage_legality() {
        let texture = texture_2d(16, 16);
        let buffer = ResourceCreate3D {
            target: VIRTMUX_PIPE_BUFFER,
            bind: VIRTMUX_PIPE_BIND_VERTEX_BUFFER,
            width: 4096,
            height: 1,
            depth: 1,
            array_size: 1,
            ..Default::default()
        };
        let volume = ResourceCreate3D {
            target: VIRTMUX_PIPE_TEXTURE_3D,
            depth: 4,
            ..texture
        };
        let rect = ResourceCreate3D {
            target: VIRTMUX_PIPE_TEXTURE_RECT,
            ..texture
        };
        let layered = ResourceCreate3D {
            target: VIRTMUX_PIPE_TEXTURE_2D_ARRAY,
            array_size: 4,
            ..texture
        };

        for good in [
            texture,
            buffer,
            volume,
            ResourceCreate3D { bind: 0, ..buffer },
            ResourceCreate3D { nr_samples: 4, ..texture },
            ResourceCreate3D { nr_samples: 4, ..layered },
            ResourceCreate3D { last_level: 3, ..texture },
            ResourceCreate3D { flags: VIRTMUX_RESOURCE_Y_0_TOP, ..texture },
            ResourceCreate3D { flags: VIRTMUX_RESOURCE_Y_0_TOP, ..rect },
            ResourceCreate3D { bind: VIRTMUX_PIPE_BIND_CURSOR, ..texture },
            ResourceCreate3D { bind: VIRTMUX_PIPE_BIND_RENDER_TARGET, ..buffer },
        ] {
            assert!(validate_resource_create(1, &good).is_ok(), "{:?}", good);
        }

        for bad in [
            // Usage.
            ResourceCreate3D { bind: 0, ..texture },
            ResourceCreate3D { bind: VIRTMUX_PIPE_BIND_VERTEX_BUFFER, ..texture },
            ResourceCreate3D { bind: VIRTMUX_PIPE_BIND_CUSTOM, ..volume },
            ResourceCreate3D { bind: 1 << 8, ..texture },
            // Flags.
            ResourceCreate3D { flags: 5, ..texture },
            ResourceCreate3D { flags: 2, ..texture },
            ResourceCreate3D { flags: VIRTMUX_RESOURCE_Y_0_TOP, ..volume },
            ResourceCreate3D { flags: VIRTMUX_RESOURCE_Y_0_TOP, ..layered },
            // Samples and mipmaps.
            ResourceCreate3D { nr_samples: 4, ..volume },
            ResourceCreate3D { nr_samples: 4, last_level: 2, ..texture },
            ResourceCreate3D { last_level: 2, ..rect },
        ] {
            assert!(
                matches!(
                    validate_resource_create(1, &bad),
                    Err(MuxError::InvalidArgument(_))
                ),
                "{:?}",
                bad
            );
        }
    }

    #[test]
    fn handle_zero_rejected() {
        let mut table = ResourceTable::new();
        assert!(matches!(
            table.create(0, texture_2d(4, 4), no_backend),
            Err(MuxError::InvalidArgument(_))
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_keeps_original() {
        let mut table = ResourceTable::new();
        table.create(7, texture_2d(4, 4), no_backend).unwrap();
        table.get_mut(7).unwrap().private_data = 99;

        assert!(matches!(
            table.create(7, texture_2d(8, 8), no_backend),
            Err(MuxError::AlreadyExists)
        ));
        let original = table.get(7).unwrap();
        assert_eq!(original.create.width, 4);
        assert_eq!(original.private_data, 99);
    }

    #[test]
    fn failed_allocation_is_not_registered() {
        let mut table = ResourceTable::new();
        let result = table.create(3, texture_2d(4, 4), |_, _| Err(MuxError::OutOfMemory));
        assert!(matches!(result, Err(MuxError::OutOfMemory)));
        assert!(!table.contains(3));
    }

    #[test]
    fn remove_detaches_before_free() {
        let mut table = ResourceTable::new();
        table.create(5, texture_2d(4, 4), no_backend).unwrap();

        let mut seen = Vec::new();
        let removed = table.remove(5, |res| seen.push(res.resource_id));
        assert!(removed.is_some());
        assert_eq!(seen, vec![5]);
        assert!(!table.contains(5));

        // A second remove is tolerated and notifies nobody.
        assert!(table.remove(5, |_| panic!("detach on missing resource")).is_none());
    }

    #[test]
    fn attach_invalidate_reattach() {
        let concrete = Arc::new(CountingMapper::default());
        let mapper: Arc<dyn GuestMemoryMapper> = concrete.clone();
        let mut table = ResourceTable::new();
        table.create(1, texture_2d(4, 4), no_backend).unwrap();

        let regions = vec![
            BackingRegion::map(&mapper, 0x1000, 32).unwrap(),
            BackingRegion::map(&mapper, 0x2000, 32).unwrap(),
        ];
        table.attach_backing(1, regions).unwrap();
        table.invalidate_backing(1).unwrap();
        assert_eq!(concrete.unmaps.load(Ordering::SeqCst), 2);

        let regions = vec![BackingRegion::map(&mapper, 0x1000, 64).unwrap()];
        table.attach_backing(1, regions).unwrap();
        assert_eq!(table.get(1).unwrap().backing_len(), 64);

        table.invalidate_backing(1).unwrap();
        table.invalidate_backing(1).unwrap();
        assert_eq!(concrete.maps.load(Ordering::SeqCst), 3);
        assert_eq!(concrete.unmaps.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn attach_rejects_empty_regions() {
        let concrete = Arc::new(CountingMapper::default());
        let mapper: Arc<dyn GuestMemoryMapper> = concrete.clone();
        let mut table = ResourceTable::new();
        table.create(1, texture_2d(4, 4), no_backend).unwrap();

        assert!(table.attach_backing(1, Vec::new()).is_err());
        let regions = vec![
            BackingRegion::map(&mapper, 0x1000, 16).unwrap(),
            BackingRegion::map(&mapper, 0x2000, 0).unwrap(),
        ];
        assert!(table.attach_backing(1, regions).is_err());
        assert!(table.get(1).unwrap().backing.is_none());
        assert_eq!(concrete.unmaps.load(Ordering::SeqCst), 2);

        let regions = vec![BackingRegion::map(&mapper, 0x1000, 16).unwrap()];
        assert!(matches!(
            table.attach_backing(9, regions),
            Err(MuxError::InvalidResourceId)
        ));
        assert_eq!(concrete.unmaps.load(Ordering::SeqCst), 3);
    }
}
