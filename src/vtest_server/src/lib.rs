// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A vtest protocol server: lets a local client drive the virtmux renderer over a Unix socket.

mod config;
pub mod protocol;
mod renderer;
mod server;

pub use crate::config::TransportConfig;
pub use crate::config::DEFAULT_MAX_LENGTH;
pub use crate::renderer::new_renderer;
pub use crate::renderer::RendererHandle;
pub use crate::renderer::SharedRenderer;
pub use crate::renderer::VtestConnection;
pub use crate::server::VtestServer;
