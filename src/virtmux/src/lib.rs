// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A multiplexer that replays guest GPU commands against a host rendering backend.
//!
//! Guests name resources and contexts by small integer handles only. Every command is
//! validated before it touches the registries, and completion is reported through a
//! strictly ordered fence sequencer.

#[macro_use]
mod macros;

mod context;
mod dispatcher;
mod fence;
mod mux_core;
mod mux_os;
mod mux_utils;
mod protocol;
mod resource;
mod soft_renderer;
pub mod virgl_protocol;

pub use crate::context::ContextEntry;
pub use crate::context::ContextTable;
pub use crate::context::MuxContext;
pub use crate::context::MuxContextKind;
pub use crate::context::ResourceScope;
pub use crate::context::ScopedContext;
pub use crate::dispatcher::process_gpu_command;
pub use crate::fence::FenceSequencer;
pub use crate::mux_core::DisplaySink;
pub use crate::mux_core::GlContextHandle;
pub use crate::mux_core::GlContextProvider;
pub use crate::mux_core::MuxCapsetInfo;
pub use crate::mux_core::MuxComponent;
pub use crate::mux_core::Virtmux;
pub use crate::mux_core::VirtmuxBuilder;
pub use crate::mux_os::round_up_to_page_size;
pub use crate::mux_os::wait_readable;
pub use crate::mux_os::AsRawDescriptor;
pub use crate::mux_os::FromRawDescriptor as MuxFromRawDescriptor;
pub use crate::mux_os::IntoRawDescriptor as MuxIntoRawDescriptor;
pub use crate::mux_os::MemoryMapping;
pub use crate::mux_os::RawDescriptor;
pub use crate::mux_os::SafeDescriptor as MuxDescriptor;
pub use crate::mux_os::SharedMemory;
pub use crate::mux_utils::*;
pub use crate::protocol::GpuCommand;
pub use crate::protocol::GpuCommandDecodeError;
pub use crate::protocol::GpuResponse;
pub use crate::resource::validate_resource_create;
pub use crate::resource::BackendObject;
pub use crate::resource::BackingRegion;
pub use crate::resource::GuestMemoryMapper;
pub use crate::resource::MuxResource;
pub use crate::resource::ResourceTable;
pub use crate::soft_renderer::SoftRenderer;
pub use crate::virgl_protocol as virgl;
