// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Handle-indexed context registry.  Contexts see resources only through the set of handles
//! attached to them.

use std::collections::BTreeMap as Map;
use std::collections::BTreeSet;

use log::debug;
use log::trace;
use log::warn;

use crate::mux_utils::*;
use crate::resource::MuxResource;
use crate::resource::ResourceTable;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MuxContextKind {
    /// Bound to the backend; decodes and executes command streams.
    Rendering,
    /// Decode-only; tracks which resources a client may name.
    Scoped,
}

/// A context executing guest command streams.
pub trait MuxContext: Send {
    /// Implementations must handle the incoming command stream.  Only resources attached to this
    /// context are reachable through `scope`.
    fn submit_cmd(&mut self, commands: &[u8], scope: &mut ResourceScope) -> MuxResult<()>;

    /// Implementations should start tracking the resource.
    fn attach(&mut self, _resource: &mut MuxResource) {}

    /// Implementations should stop tracking the resource.
    fn detach(&mut self, _resource: &MuxResource) {}

    /// Moves bytes between the resource and its backing (or a caller buffer).
    fn transfer(
        &mut self,
        _resource: &mut MuxResource,
        _transfer: Transfer3D,
        _direction: TransferDirection,
    ) -> MuxResult<()> {
        Err(MuxError::Unsupported)
    }

    fn kind(&self) -> MuxContextKind;

    /// Called once, after every resource has been detached.
    fn destroy(&mut self) {}
}

/// The resources one context may touch during a submission.
pub struct ResourceScope<'a> {
    resources: &'a mut ResourceTable,
    attached: &'a BTreeSet<u32>,
}

impl<'a> ResourceScope<'a> {
    pub fn new(resources: &'a mut ResourceTable, attached: &'a BTreeSet<u32>) -> ResourceScope<'a> {
        ResourceScope {
            resources,
            attached,
        }
    }

    pub fn contains(&self, resource_id: u32) -> bool {
        self.attached.contains(&resource_id) && self.resources.contains(resource_id)
    }

    pub fn get(&self, resource_id: u32) -> MuxResult<&MuxResource> {
        if !self.attached.contains(&resource_id) {
            return Err(MuxError::InvalidResourceId);
        }
        self.resources.get(resource_id)
    }

    pub fn get_mut(&mut self, resource_id: u32) -> MuxResult<&mut MuxResource> {
        if !self.attached.contains(&resource_id) {
            return Err(MuxError::InvalidResourceId);
        }
        self.resources.get_mut(resource_id)
    }
}

/// A registered context and its bookkeeping.
pub struct ContextEntry {
    pub name: String,
    pub capset_id: u32,
    attached: BTreeSet<u32>,
    context: Box<dyn MuxContext>,
}

impl ContextEntry {
    pub fn attached(&self) -> &BTreeSet<u32> {
        &self.attached
    }

    pub fn kind(&self) -> MuxContextKind {
        self.context.kind()
    }
}

/// Decode-only context.  It scopes resources for a client but never executes commands.
#[derive(Default)]
pub struct ScopedContext;

impl MuxContext for ScopedContext {
    fn submit_cmd(&mut self, _commands: &[u8], _scope: &mut ResourceScope) -> MuxResult<()> {
        Err(MuxError::Unsupported)
    }

    fn attach(&mut self, resource: &mut MuxResource) {
        trace!("scoped context gained resource {}", resource.resource_id);
    }

    fn kind(&self) -> MuxContextKind {
        MuxContextKind::Scoped
    }
}

/// Contexts by handle.
#[derive(Default)]
pub struct ContextTable {
    contexts: Map<u32, ContextEntry>,
}

impl ContextTable {
    pub fn new() -> ContextTable {
        Default::default()
    }

    /// Registers the context built by `alloc`.  Nothing is registered on failure.
    pub fn create<F>(&mut self, ctx_id: u32, name: &str, capset_id: u32, alloc: F) -> MuxResult<()>
    where
        F: FnOnce(u32) -> MuxResult<Box<dyn MuxContext>>,
    {
        if ctx_id == 0 {
            return Err(MuxError::InvalidArgument("context handle 0"));
        }
        if self.contexts.contains_key(&ctx_id) {
            return Err(MuxError::AlreadyExists);
        }

        let context = alloc(ctx_id)?;
        self.contexts.insert(
            ctx_id,
            ContextEntry {
                name: name.to_string(),
                capset_id,
                attached: BTreeSet::new(),
                context,
            },
        );
        Ok(())
    }

    /// Detaches every resource of `ctx_id`, then destroys it.
    pub fn remove(&mut self, ctx_id: u32, resources: &ResourceTable) -> MuxResult<()> {
        let mut entry = self
            .contexts
            .remove(&ctx_id)
            .ok_or(MuxError::InvalidContextId)?;

        for resource_id in &entry.attached {
            if let Ok(resource) = resources.get(*resource_id) {
                entry.context.detach(resource);
            }
        }
        entry.attached.clear();
        entry.context.destroy();
        Ok(())
    }

    /// Removes every context.
    pub fn clear(&mut self, resources: &ResourceTable) {
        for ctx_id in self.handles() {
            if let Err(e) = self.remove(ctx_id, resources) {
                warn!("failed to destroy context {}: {}", ctx_id, e);
            }
        }
    }

    pub fn contains(&self, ctx_id: u32) -> bool {
        self.contexts.contains_key(&ctx_id)
    }

    pub fn get(&self, ctx_id: u32) -> MuxResult<&ContextEntry> {
        self.contexts.get(&ctx_id).ok_or(MuxError::InvalidContextId)
    }

    /// Attaches `resource_id` to `ctx_id`.  Unknown handles and repeated attaches are no-ops.
    pub fn attach_resource(&mut self, ctx_id: u32, resources: &mut ResourceTable, resource_id: u32) {
        let entry = match self.contexts.get_mut(&ctx_id) {
            Some(entry) => entry,
            None => {
                debug!("attach to unknown context {}", ctx_id);
                return;
            }
        };
        let resource = match resources.get_mut(resource_id) {
            Ok(resource) => resource,
            Err(_) => {
                debug!("attach of unknown resource {} to context {}", resource_id, ctx_id);
                return;
            }
        };

        if entry.attached.insert(resource_id) {
            entry.context.attach(resource);
        }
    }

    /// Detaches `resource_id` from `ctx_id`.  Unknown handles are a no-op.
    pub fn detach_resource(&mut self, ctx_id: u32, resources: &ResourceTable, resource_id: u32) {
        let entry = match self.contexts.get_mut(&ctx_id) {
            Some(entry) => entry,
            None => return,
        };

        if entry.attached.remove(&resource_id) {
            if let Ok(resource) = resources.get(resource_id) {
                entry.context.detach(resource);
            }
        }
    }

    /// Detaches `resource` from every context holding it.
    pub fn detach_everywhere(&mut self, resource: &MuxResource) {
        self.for_each(|_, entry| {
            if entry.attached.remove(&resource.resource_id) {
                entry.context.detach(resource);
            }
        });
    }

    pub fn for_each<F>(&mut self, mut visitor: F)
    where
        F: FnMut(u32, &mut ContextEntry),
    {
        for (ctx_id, entry) in self.contexts.iter_mut() {
            visitor(*ctx_id, entry);
        }
    }

    /// Hands `commands` to the context, scoped to its attached resources.
    pub fn submit(
        &mut self,
        ctx_id: u32,
        resources: &mut ResourceTable,
        commands: &[u8],
    ) -> MuxResult<()> {
        let entry = self
            .contexts
            .get_mut(&ctx_id)
            .ok_or(MuxError::InvalidContextId)?;
        let mut scope = ResourceScope::new(resources, &entry.attached);
        entry.context.submit_cmd(commands, &mut scope)
    }

    /// Routes a transfer through the context owning `resource_id`.
    pub fn transfer(
        &mut self,
        ctx_id: u32,
        resources: &mut ResourceTable,
        resource_id: u32,
        transfer: Transfer3D,
        direction: TransferDirection,
    ) -> MuxResult<()> {
        let entry = self
            .contexts
            .get_mut(&ctx_id)
            .ok_or(MuxError::InvalidContextId)?;
        if !entry.attached.contains(&resource_id) {
            return Err(MuxError::InvalidResourceId);
        }
        let resource = resources.get_mut(resource_id)?;
        entry.context.transfer(resource, transfer, direction)
    }

    pub fn handles(&self) -> Vec<u32> {
        self.contexts.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;
    use crate::resource::BackendObject;

    type EventLog = Arc<Mutex<Vec<String>>>;

    struct RecordingContext {
        ctx_id: u32,
        log: EventLog,
    }

    impl MuxContext for RecordingContext {
        fn submit_cmd(&mut self, commands: &[u8], scope: &mut ResourceScope) -> MuxResult<()> {
            // Each dword names a resource the stream wants to touch.
            for chunk in commands.chunks_exact(4) {
                let resource_id = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                scope.get_mut(resource_id)?.private_data += 1;
            }
            Ok(())
        }

        fn attach(&mut self, resource: &mut MuxResource) {
            self.log
                .lock()
                .unwrap()
                .push(format!("attach {} {}", self.ctx_id, resource.resource_id));
        }

        fn detach(&mut self, resource: &MuxResource) {
            self.log
                .lock()
                .unwrap()
                .push(format!("detach {} {}", self.ctx_id, resource.resource_id));
        }

        fn kind(&self) -> MuxContextKind {
            MuxContextKind::Rendering
        }

        fn destroy(&mut self) {
            self.log
                .lock()
                .unwrap()
                .push(format!("destroy {}", self.ctx_id));
        }
    }

    fn recording(log: &EventLog) -> impl FnOnce(u32) -> MuxResult<Box<dyn MuxContext>> {
        let log = log.clone();
        move |ctx_id| Ok(Box::new(RecordingContext { ctx_id, log }) as Box<dyn MuxContext>)
    }

    fn resources(ids: &[u32]) -> ResourceTable {
        let mut table = ResourceTable::new();
        for id in ids {
            let args = ResourceCreate3D {
                target: VIRTMUX_PIPE_TEXTURE_2D,
                bind: VIRTMUX_PIPE_BIND_SAMPLER_VIEW,
                width: 4,
                height: 4,
                depth: 1,
                array_size: 1,
                ..Default::default()
            };
            table
                .create(*id, args, |_, _| Ok(Box::new(()) as BackendObject))
                .unwrap();
        }
        table
    }

    #[test]
    fn handle_zero_and_duplicates() {
        let log = EventLog::default();
        let mut contexts = ContextTable::new();
        assert!(matches!(
            contexts.create(0, "zero", 0, recording(&log)),
            Err(MuxError::InvalidArgument(_))
        ));
        contexts.create(1, "first", 0, recording(&log)).unwrap();
        assert!(matches!(
            contexts.create(1, "again", 0, recording(&log)),
            Err(MuxError::AlreadyExists)
        ));
        assert_eq!(contexts.get(1).unwrap().name, "first");
    }

    #[test]
    fn attach_is_idempotent_and_unknown_is_noop() {
        let log = EventLog::default();
        let mut table = resources(&[1]);
        let mut contexts = ContextTable::new();
        contexts.create(1, "ctx", 0, recording(&log)).unwrap();

        contexts.attach_resource(1, &mut table, 1);
        contexts.attach_resource(1, &mut table, 1);
        contexts.attach_resource(1, &mut table, 77);
        contexts.attach_resource(9, &mut table, 1);
        contexts.detach_resource(9, &table, 1);

        assert_eq!(*log.lock().unwrap(), vec!["attach 1 1"]);
        assert_eq!(contexts.get(1).unwrap().attached().len(), 1);
    }

    #[test]
    fn resource_removal_detaches_from_all_contexts() {
        let log = EventLog::default();
        let mut table = resources(&[4]);
        let mut contexts = ContextTable::new();
        for ctx_id in 1..=3 {
            contexts.create(ctx_id, "ctx", 0, recording(&log)).unwrap();
            contexts.attach_resource(ctx_id, &mut table, 4);
        }
        log.lock().unwrap().clear();

        table.remove(4, |res| {
            contexts.detach_everywhere(res);
            log.lock().unwrap().push("free 4".to_string());
        });

        assert_eq!(
            *log.lock().unwrap(),
            vec!["detach 1 4", "detach 2 4", "detach 3 4", "free 4"]
        );
        contexts.for_each(|_, entry| assert!(entry.attached().is_empty()));
    }

    #[test]
    fn context_removal_keeps_resources() {
        let log = EventLog::default();
        let mut table = resources(&[1, 2]);
        let mut contexts = ContextTable::new();
        contexts.create(1, "ctx", 0, recording(&log)).unwrap();
        contexts.attach_resource(1, &mut table, 1);
        contexts.attach_resource(1, &mut table, 2);

        contexts.remove(1, &table).unwrap();
        assert!(table.contains(1) && table.contains(2));
        assert_eq!(
            log.lock().unwrap().last().map(String::as_str),
            Some("destroy 1")
        );
        assert!(matches!(
            contexts.remove(1, &table),
            Err(MuxError::InvalidContextId)
        ));
    }

    #[test]
    fn submit_only_reaches_attached_resources() {
        let log = EventLog::default();
        let mut table = resources(&[1, 2]);
        let mut contexts = ContextTable::new();
        contexts.create(1, "a", 0, recording(&log)).unwrap();
        contexts.create(2, "b", 0, recording(&log)).unwrap();
        contexts.attach_resource(1, &mut table, 1);
        contexts.attach_resource(2, &mut table, 2);

        contexts.submit(1, &mut table, &1u32.to_le_bytes()).unwrap();
        assert!(matches!(
            contexts.submit(1, &mut table, &2u32.to_le_bytes()),
            Err(MuxError::InvalidResourceId)
        ));
        assert_eq!(table.get(1).unwrap().private_data, 1);
        assert_eq!(table.get(2).unwrap().private_data, 0);
    }

    #[test]
    fn scoped_context_rejects_submit() {
        let mut table = resources(&[1]);
        let mut contexts = ContextTable::new();
        contexts
            .create(3, "scoped", 0, |_| Ok(Box::new(ScopedContext) as Box<dyn MuxContext>))
            .unwrap();
        contexts.attach_resource(3, &mut table, 1);
        assert_eq!(contexts.get(3).unwrap().kind(), MuxContextKind::Scoped);
        assert!(matches!(
            contexts.submit(3, &mut table, &[0; 4]),
            Err(MuxError::Unsupported)
        ));
        assert!(matches!(
            contexts.transfer(
                3,
                &mut table,
                1,
                Transfer3D::new_2d(0, 0, 1, 1),
                TransferDirection::ToHost(None)
            ),
            Err(MuxError::Unsupported)
        ));
    }
}
