// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame layout and command ids of the vtest protocol.
//!
//! Every frame starts with `[length, command]`, where `length` counts the payload dwords.
//! Replies use the same header.

pub const VTEST_DEFAULT_SOCKET_NAME: &str = "/tmp/.virgl_test";
pub const VTEST_PROTOCOL_VERSION: u32 = 3;

pub const VTEST_HDR_SIZE: usize = 2;
pub const VTEST_CMD_LEN: usize = 0;
pub const VTEST_CMD_ID: usize = 1;

pub const VCMD_GET_CAPS: u32 = 1;
pub const VCMD_RESOURCE_CREATE: u32 = 2;
pub const VCMD_RESOURCE_UNREF: u32 = 3;
pub const VCMD_TRANSFER_GET: u32 = 4;
pub const VCMD_TRANSFER_PUT: u32 = 5;
pub const VCMD_SUBMIT_CMD: u32 = 6;
pub const VCMD_RESOURCE_BUSY_WAIT: u32 = 7;
pub const VCMD_CREATE_RENDERER: u32 = 8;
pub const VCMD_GET_CAPS2: u32 = 9;
pub const VCMD_PING_PROTOCOL_VERSION: u32 = 10;
pub const VCMD_PROTOCOL_VERSION: u32 = 11;
// since protocol version 2
pub const VCMD_RESOURCE_CREATE2: u32 = 12;
pub const VCMD_TRANSFER_GET2: u32 = 13;
pub const VCMD_TRANSFER_PUT2: u32 = 14;
// since protocol version 3
pub const VCMD_GET_PARAM: u32 = 15;
pub const VCMD_GET_CAPSET: u32 = 16;
pub const VCMD_CONTEXT_INIT: u32 = 17;

pub const VCMD_RES_CREATE_SIZE: usize = 10;
pub const VCMD_RES_CREATE_RES_HANDLE: usize = 0;
pub const VCMD_RES_CREATE_TARGET: usize = 1;
pub const VCMD_RES_CREATE_FORMAT: usize = 2;
pub const VCMD_RES_CREATE_BIND: usize = 3;
pub const VCMD_RES_CREATE_WIDTH: usize = 4;
pub const VCMD_RES_CREATE_HEIGHT: usize = 5;
pub const VCMD_RES_CREATE_DEPTH: usize = 6;
pub const VCMD_RES_CREATE_ARRAY_SIZE: usize = 7;
pub const VCMD_RES_CREATE_LAST_LEVEL: usize = 8;
pub const VCMD_RES_CREATE_NR_SAMPLES: usize = 9;

pub const VCMD_RES_CREATE2_SIZE: usize = 11;
pub const VCMD_RES_CREATE2_DATA_SIZE: usize = 10;

pub const VCMD_RES_UNREF_SIZE: usize = 1;

pub const VCMD_TRANSFER_HDR_SIZE: usize = 11;
pub const VCMD_TRANSFER_RES_HANDLE: usize = 0;
pub const VCMD_TRANSFER_LEVEL: usize = 1;
pub const VCMD_TRANSFER_STRIDE: usize = 2;
pub const VCMD_TRANSFER_LAYER_STRIDE: usize = 3;
pub const VCMD_TRANSFER_X: usize = 4;
pub const VCMD_TRANSFER_Y: usize = 5;
pub const VCMD_TRANSFER_Z: usize = 6;
pub const VCMD_TRANSFER_WIDTH: usize = 7;
pub const VCMD_TRANSFER_HEIGHT: usize = 8;
pub const VCMD_TRANSFER_DEPTH: usize = 9;
pub const VCMD_TRANSFER_DATA_SIZE: usize = 10;

pub const VCMD_TRANSFER2_HDR_SIZE: usize = 9;
pub const VCMD_TRANSFER2_RES_HANDLE: usize = 0;
pub const VCMD_TRANSFER2_LEVEL: usize = 1;
pub const VCMD_TRANSFER2_X: usize = 2;
pub const VCMD_TRANSFER2_Y: usize = 3;
pub const VCMD_TRANSFER2_Z: usize = 4;
pub const VCMD_TRANSFER2_WIDTH: usize = 5;
pub const VCMD_TRANSFER2_HEIGHT: usize = 6;
pub const VCMD_TRANSFER2_DEPTH: usize = 7;
pub const VCMD_TRANSFER2_OFFSET: usize = 8;

pub const VCMD_BUSY_WAIT_SIZE: usize = 2;
pub const VCMD_BUSY_WAIT_HANDLE: usize = 0;
pub const VCMD_BUSY_WAIT_FLAGS: usize = 1;
pub const VCMD_BUSY_WAIT_FLAG_WAIT: u32 = 1;

pub const VCMD_PROTOCOL_VERSION_SIZE: usize = 1;

pub const VCMD_GET_PARAM_SIZE: usize = 2;
pub const VCMD_GET_PARAM_PARAM: usize = 0;
pub const VCMD_PARAM_MAX_SYNC_QUEUE_COUNT: u32 = 1;

pub const VCMD_GET_CAPSET_SIZE: usize = 2;
pub const VCMD_GET_CAPSET_ID: usize = 0;
pub const VCMD_GET_CAPSET_VERSION: usize = 1;

pub const VCMD_CONTEXT_INIT_SIZE: usize = 1;

/// Longest debug name accepted by `VCMD_CREATE_RENDERER`.
pub const VTEST_MAX_NAME_LENGTH: u32 = 1024 * 1024;

/// Payload dwords carried by commands whose frames have a fixed size.  Commands with a
/// variable payload return `None`.
pub fn vcmd_fixed_length(cmd: u32) -> Option<usize> {
    match cmd {
        VCMD_GET_CAPS | VCMD_GET_CAPS2 | VCMD_PING_PROTOCOL_VERSION => Some(0),
        VCMD_RESOURCE_CREATE => Some(VCMD_RES_CREATE_SIZE),
        VCMD_RESOURCE_CREATE2 => Some(VCMD_RES_CREATE2_SIZE),
        VCMD_RESOURCE_UNREF => Some(VCMD_RES_UNREF_SIZE),
        VCMD_TRANSFER_GET | VCMD_TRANSFER_PUT => Some(VCMD_TRANSFER_HDR_SIZE),
        VCMD_TRANSFER_GET2 | VCMD_TRANSFER_PUT2 => Some(VCMD_TRANSFER2_HDR_SIZE),
        VCMD_RESOURCE_BUSY_WAIT => Some(VCMD_BUSY_WAIT_SIZE),
        VCMD_PROTOCOL_VERSION => Some(VCMD_PROTOCOL_VERSION_SIZE),
        VCMD_GET_PARAM => Some(VCMD_GET_PARAM_SIZE),
        VCMD_GET_CAPSET => Some(VCMD_GET_CAPSET_SIZE),
        VCMD_CONTEXT_INIT => Some(VCMD_CONTEXT_INIT_SIZE),
        _ => None,
    }
}

pub fn vcmd_str(cmd: u32) -> &'static str {
    match cmd {
        VCMD_GET_CAPS => "VCMD_GET_CAPS",
        VCMD_RESOURCE_CREATE => "VCMD_RESOURCE_CREATE",
        VCMD_RESOURCE_UNREF => "VCMD_RESOURCE_UNREF",
        VCMD_TRANSFER_GET => "VCMD_TRANSFER_GET",
        VCMD_TRANSFER_PUT => "VCMD_TRANSFER_PUT",
        VCMD_SUBMIT_CMD => "VCMD_SUBMIT_CMD",
        VCMD_RESOURCE_BUSY_WAIT => "VCMD_RESOURCE_BUSY_WAIT",
        VCMD_CREATE_RENDERER => "VCMD_CREATE_RENDERER",
        VCMD_GET_CAPS2 => "VCMD_GET_CAPS2",
        VCMD_PING_PROTOCOL_VERSION => "VCMD_PING_PROTOCOL_VERSION",
        VCMD_PROTOCOL_VERSION => "VCMD_PROTOCOL_VERSION",
        VCMD_RESOURCE_CREATE2 => "VCMD_RESOURCE_CREATE2",
        VCMD_TRANSFER_GET2 => "VCMD_TRANSFER_GET2",
        VCMD_TRANSFER_PUT2 => "VCMD_TRANSFER_PUT2",
        VCMD_GET_PARAM => "VCMD_GET_PARAM",
        VCMD_GET_CAPSET => "VCMD_GET_CAPSET",
        VCMD_CONTEXT_INIT => "VCMD_CONTEXT_INIT",
        _ => "unknown",
    }
}
