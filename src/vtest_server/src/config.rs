// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;

use crate::protocol::VTEST_DEFAULT_SOCKET_NAME;

/// Largest frame payload or transfer accepted from a client.
pub const DEFAULT_MAX_LENGTH: usize = 64 * 1024 * 1024;

/// Transport settings shared by every connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    pub socket_path: PathBuf,
    pub max_length: usize,
    /// Back `VCMD_RESOURCE_CREATE2` resources with shared memory.  Without it clients are held
    /// to protocol version 1.
    pub use_shm: bool,
    /// Keep accepting clients after the first one disconnects.
    pub multi_clients: bool,
}

impl Default for TransportConfig {
    fn default() -> TransportConfig {
        TransportConfig {
            socket_path: PathBuf::from(VTEST_DEFAULT_SOCKET_NAME),
            max_length: DEFAULT_MAX_LENGTH,
            use_shm: true,
            multi_clients: false,
        }
    }
}
