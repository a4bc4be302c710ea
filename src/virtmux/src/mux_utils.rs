// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! mux_utils: Utility enums, structs, and implementations needed by the rest of the crate.

use std::ffi::NulError;
use std::fmt;
use std::io::Error as IoError;
use std::io::IoSliceMut;
use std::num::TryFromIntError;
use std::os::raw::c_void;
use std::sync::Arc;

#[cfg(unix)]
use nix::Error as NixError;
use remain::sorted;
use thiserror::Error;

use crate::mux_os::SafeDescriptor;

/// Represents a buffer.  `base` contains the address of a buffer, while `len` contains the length
/// of the buffer.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct MuxIovec {
    pub base: *mut c_void,
    pub len: usize,
}

unsafe impl Send for MuxIovec {}
unsafe impl Sync for MuxIovec {}

impl MuxIovec {
    /// Describes `buf` without taking ownership. The caller keeps `buf` alive and unaliased for as
    /// long as the iovec is in use.
    pub fn from_mut_slice(buf: &mut [u8]) -> MuxIovec {
        MuxIovec {
            base: buf.as_mut_ptr() as *mut c_void,
            len: buf.len(),
        }
    }
}

/// Gallium texture targets.
pub const VIRTMUX_PIPE_BUFFER: u32 = 0;
pub const VIRTMUX_PIPE_TEXTURE_1D: u32 = 1;
pub const VIRTMUX_PIPE_TEXTURE_2D: u32 = 2;
pub const VIRTMUX_PIPE_TEXTURE_3D: u32 = 3;
pub const VIRTMUX_PIPE_TEXTURE_CUBE: u32 = 4;
pub const VIRTMUX_PIPE_TEXTURE_RECT: u32 = 5;
pub const VIRTMUX_PIPE_TEXTURE_1D_ARRAY: u32 = 6;
pub const VIRTMUX_PIPE_TEXTURE_2D_ARRAY: u32 = 7;
pub const VIRTMUX_PIPE_TEXTURE_CUBE_ARRAY: u32 = 8;

/// Resource usage (bind) flags.
pub const VIRTMUX_PIPE_BIND_DEPTH_STENCIL: u32 = 1 << 0;
pub const VIRTMUX_PIPE_BIND_RENDER_TARGET: u32 = 1 << 1;
pub const VIRTMUX_PIPE_BIND_SAMPLER_VIEW: u32 = 1 << 3;
pub const VIRTMUX_PIPE_BIND_VERTEX_BUFFER: u32 = 1 << 4;
pub const VIRTMUX_PIPE_BIND_INDEX_BUFFER: u32 = 1 << 5;
pub const VIRTMUX_PIPE_BIND_CONSTANT_BUFFER: u32 = 1 << 6;
pub const VIRTMUX_PIPE_BIND_STREAM_OUTPUT: u32 = 1 << 11;
pub const VIRTMUX_PIPE_BIND_CURSOR: u32 = 1 << 16;
pub const VIRTMUX_PIPE_BIND_CUSTOM: u32 = 1 << 17;

/// Resource flag set on every 2D resource created by the guest kernel.
pub const VIRTMUX_RESOURCE_Y_0_TOP: u32 = 1 << 0;

/// 3D resource creation parameters.  Also used to create 2D resources.  Constants based on Mesa's
/// (internal) Gallium interface.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceCreate3D {
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

/// A rectangle on a scanout or resource.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MuxRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Context init capset id mask.
pub const VIRTMUX_CONTEXT_INIT_CAPSET_ID_MASK: u32 = 0x00ff;

/// Flags for creating fences.
pub const VIRTMUX_FLAG_FENCE: u32 = 1 << 0;
pub const VIRTMUX_FLAG_INFO_RING_IDX: u32 = 1 << 1;

/// Convenience struct for fences.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MuxFence {
    pub flags: u32,
    pub fence_id: u64,
    pub ctx_id: u32,
    pub ring_idx: u8,
}

/// Access flags for host mappings.
pub const VIRTMUX_MAP_ACCESS_MASK: u32 = 0xf0;
pub const VIRTMUX_MAP_ACCESS_READ: u32 = 0x10;
pub const VIRTMUX_MAP_ACCESS_WRITE: u32 = 0x20;
pub const VIRTMUX_MAP_ACCESS_RW: u32 = 0x30;

/// Capsets.
pub const VIRTMUX_CAPSET_VIRGL: u32 = 1;
pub const VIRTMUX_CAPSET_VIRGL2: u32 = 2;

/// Fence handle types.
pub const VIRTMUX_FENCE_HANDLE_TYPE_OPAQUE_FD: u32 = 0x0006;

/// An error generated while using this crate.
#[sorted]
#[derive(Error, Debug)]
pub enum MuxError {
    /// A handle was registered twice.
    #[error("handle already exists")]
    AlreadyExists,
    /// Only one multiplexer may be bound to a process-wide entry point.
    #[error("attempted to use a virtmux asset already in use")]
    AlreadyInUse,
    /// Checked Arithmetic error
    #[error("arithmetic failed: {}({}) {op} {}({})", .field1.0, .field1.1, .field2.0, .field2.1)]
    CheckedArithmetic {
        field1: (&'static str, usize),
        field2: (&'static str, usize),
        op: &'static str,
    },
    /// Checked Range error
    #[error("range check failed: {}({}) vs {}({})", .field1.0, .field1.1, .field2.0, .field2.1)]
    CheckedRange {
        field1: (&'static str, usize),
        field2: (&'static str, usize),
    },
    /// A host collaborator returned an errno.
    #[error("virtmux component failed with error {0}")]
    ComponentError(i32),
    /// A guest supplied argument failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The resource is not owned by the active backend.
    #[error("resource has no backend object of the expected kind")]
    InvalidBackendObject,
    /// Invalid Capset
    #[error("invalid capset")]
    InvalidCapset,
    /// A command buffer with insufficient space was submitted.
    #[error("invalid command buffer submitted")]
    InvalidCommandBuffer,
    /// A command size was submitted that was invalid.
    #[error("command buffer submitted with invalid size: {0}")]
    InvalidCommandSize(usize),
    /// Invalid Context ID
    #[error("invalid context id")]
    InvalidContextId,
    /// The pixel format has no known layout.
    #[error("invalid format {0}")]
    InvalidFormat(u32),
    /// The indicated region of guest memory is invalid.
    #[error("an iovec is outside of guest memory's range")]
    InvalidIovec,
    /// Indicates an error in the VirtmuxBuilder.
    #[error("invalid virtmux build parameters: {0}")]
    InvalidMuxBuild(&'static str),
    /// Invalid Resource ID.
    #[error("invalid resource id")]
    InvalidResourceId,
    /// An input/output error occured.
    #[error("an input/output error occur: {0}")]
    IoError(IoError),
    /// The mapping failed.
    #[error("The mapping failed with library error: {0}")]
    MappingFailed(i32),
    /// Nix crate error.
    #[cfg(unix)]
    #[error("The errno is {0}")]
    NixError(NixError),
    /// The requested object does not exist and cannot be synthesized.
    #[error("not found")]
    NotFound,
    #[error("Nul Error occured {0}")]
    NulError(NulError),
    /// An allocation was refused.
    #[error("out of memory")]
    OutOfMemory,
    /// The peer broke the wire protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    /// An attempted integer conversion failed.
    #[error("int conversion failed: {0}")]
    TryFromIntError(TryFromIntError),
    /// The opcode is not part of the command vocabulary.
    #[error("unknown command {0}")]
    UnknownCommand(u32),
    /// The command is unsupported.
    #[error("the requested function is not implemented")]
    Unsupported,
}

impl MuxError {
    /// The positive errno reported to guests for this error.
    pub fn to_errno(&self) -> i32 {
        match self {
            MuxError::AlreadyExists => libc::EEXIST,
            MuxError::AlreadyInUse => libc::EBUSY,
            MuxError::ComponentError(e) | MuxError::MappingFailed(e) => e.abs(),
            MuxError::InvalidContextId | MuxError::InvalidResourceId => libc::ESRCH,
            MuxError::InvalidIovec => libc::EFAULT,
            MuxError::IoError(e) => e.raw_os_error().unwrap_or(libc::EIO),
            #[cfg(unix)]
            MuxError::NixError(e) => *e as i32,
            MuxError::OutOfMemory => libc::ENOMEM,
            MuxError::Unsupported => libc::ENOTSUP,
            _ => libc::EINVAL,
        }
    }
}

#[cfg(unix)]
impl From<NixError> for MuxError {
    fn from(e: NixError) -> MuxError {
        MuxError::NixError(e)
    }
}

impl From<NulError> for MuxError {
    fn from(e: NulError) -> MuxError {
        MuxError::NulError(e)
    }
}

impl From<IoError> for MuxError {
    fn from(e: IoError) -> MuxError {
        MuxError::IoError(e)
    }
}

impl From<TryFromIntError> for MuxError {
    fn from(e: TryFromIntError) -> MuxError {
        MuxError::TryFromIntError(e)
    }
}

/// The result of an operation in this crate.
pub type MuxResult<T> = std::result::Result<T, MuxError>;

/// Renderer flags.  Bit values match the in-process ABI.
const VIRTMUX_USE_EGL: u32 = 1 << 0;
const VIRTMUX_THREAD_SYNC: u32 = 1 << 1;
const VIRTMUX_USE_GLX: u32 = 1 << 2;
const VIRTMUX_USE_SURFACELESS: u32 = 1 << 3;
const VIRTMUX_USE_GLES: u32 = 1 << 4;
const VIRTMUX_NO_VIRGL: u32 = 1 << 7;

/// Renderer flag struct.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VirtmuxFlags(u32);

impl Default for VirtmuxFlags {
    fn default() -> VirtmuxFlags {
        VirtmuxFlags::new()
            .use_virgl(true)
            .use_egl(true)
            .use_surfaceless(true)
            .use_gles(true)
    }
}

impl From<VirtmuxFlags> for u32 {
    fn from(flags: VirtmuxFlags) -> u32 {
        flags.0
    }
}

impl From<VirtmuxFlags> for i32 {
    fn from(flags: VirtmuxFlags) -> i32 {
        flags.0 as i32
    }
}

impl From<u32> for VirtmuxFlags {
    fn from(bits: u32) -> VirtmuxFlags {
        VirtmuxFlags(bits)
    }
}

impl VirtmuxFlags {
    /// Create new renderer flags.
    pub fn new() -> VirtmuxFlags {
        VirtmuxFlags(0)
    }

    fn set_flag(self, bitmask: u32, set: bool) -> VirtmuxFlags {
        if set {
            VirtmuxFlags(self.0 | bitmask)
        } else {
            VirtmuxFlags(self.0 & (!bitmask))
        }
    }

    fn has(self, bitmask: u32) -> bool {
        self.0 & bitmask != 0
    }

    /// Enable rendering contexts.  Without it every context is decode-only.
    pub fn use_virgl(self, v: bool) -> VirtmuxFlags {
        self.set_flag(VIRTMUX_NO_VIRGL, !v)
    }

    /// Use EGL for context creation.
    pub fn use_egl(self, v: bool) -> VirtmuxFlags {
        self.set_flag(VIRTMUX_USE_EGL, v)
    }

    /// Signal fence completion through a pollable descriptor.
    pub fn use_thread_sync(self, v: bool) -> VirtmuxFlags {
        self.set_flag(VIRTMUX_THREAD_SYNC, v)
    }

    /// Use GLX for context creation.
    pub fn use_glx(self, v: bool) -> VirtmuxFlags {
        self.set_flag(VIRTMUX_USE_GLX, v)
    }

    /// No surfaces required when creating context.
    pub fn use_surfaceless(self, v: bool) -> VirtmuxFlags {
        self.set_flag(VIRTMUX_USE_SURFACELESS, v)
    }

    /// Use GLES drivers.
    pub fn use_gles(self, v: bool) -> VirtmuxFlags {
        self.set_flag(VIRTMUX_USE_GLES, v)
    }


    pub fn virgl(self) -> bool {
        !self.has(VIRTMUX_NO_VIRGL)
    }

    pub fn egl(self) -> bool {
        self.has(VIRTMUX_USE_EGL)
    }

    pub fn glx(self) -> bool {
        self.has(VIRTMUX_USE_GLX)
    }

    pub fn surfaceless(self) -> bool {
        self.has(VIRTMUX_USE_SURFACELESS)
    }

    pub fn gles(self) -> bool {
        self.has(VIRTMUX_USE_GLES)
    }

    pub fn thread_sync(self) -> bool {
        self.has(VIRTMUX_THREAD_SYNC)
    }
}

/// Transfers {to, from} 1D buffers, 2D textures, 3D textures, and cubemaps.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct Transfer3D {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub w: u32,
    pub h: u32,
    pub d: u32,
    pub level: u32,
    pub stride: u32,
    pub layer_stride: u32,
    pub offset: u64,
}

impl Transfer3D {
    /// Constructs a 2 dimensional XY box in 3 dimensional space with unit depth and zero
    /// displacement on the Z axis.
    pub fn new_2d(x: u32, y: u32, w: u32, h: u32) -> Transfer3D {
        Transfer3D {
            x,
            y,
            z: 0,
            w,
            h,
            d: 1,
            level: 0,
            stride: 0,
            layer_stride: 0,
            offset: 0,
        }
    }

    /// Returns true if this box represents a volume of zero.
    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0 || self.d == 0
    }
}

/// Which way a transfer moves bytes, with an optional caller buffer standing in for the
/// resource's attached backing.
pub enum TransferDirection<'a> {
    ToHost(Option<&'a [u8]>),
    FromHost(Option<IoSliceMut<'a>>),
}

/// Handle to OS-specific synchronization objects.
pub struct MuxHandle {
    pub os_handle: SafeDescriptor,
    pub handle_type: u32,
}

#[derive(Clone)]
pub struct MuxHandler<S> {
    closure: Arc<dyn Fn(S) + Send + Sync>,
}

impl<S> MuxHandler<S>
where
    S: Send + Sync + Clone + 'static,
{
    pub fn new(closure: impl Fn(S) + Send + Sync + 'static) -> MuxHandler<S> {
        MuxHandler {
            closure: Arc::new(closure),
        }
    }

    pub fn call(&self, data: S) {
        (self.closure)(data)
    }
}

impl<S> fmt::Debug for MuxHandler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure debug").finish()
    }
}

pub type MuxFenceHandler = MuxHandler<MuxFence>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(MuxError::AlreadyExists.to_errno(), libc::EEXIST);
        assert_eq!(MuxError::OutOfMemory.to_errno(), libc::ENOMEM);
        assert_eq!(MuxError::InvalidResourceId.to_errno(), libc::ESRCH);
        assert_eq!(MuxError::InvalidIovec.to_errno(), libc::EFAULT);
        assert_eq!(MuxError::NotFound.to_errno(), libc::EINVAL);
        assert_eq!(
            MuxError::InvalidArgument("cube width != height").to_errno(),
            libc::EINVAL
        );
        assert_eq!(MuxError::ComponentError(-libc::EIO).to_errno(), libc::EIO);
    }

    #[test]
    fn flags_round_trip_through_bits() {
        let flags = VirtmuxFlags::new().use_egl(true).use_thread_sync(true);
        assert_eq!(u32::from(flags), 0b11);
        assert!(VirtmuxFlags::from(0b11).thread_sync());
        assert!(flags.virgl());
        assert!(!flags.use_virgl(false).virgl());
    }
}
