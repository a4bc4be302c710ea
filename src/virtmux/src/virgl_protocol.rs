// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Opcodes and payload layouts of the virgl command stream.
//!
//! Every command starts with one header dword: `cmd | object << 8 | length << 16`, where `length`
//! counts the payload dwords that follow the header.

use crate::mux_utils::MuxError;
use crate::mux_utils::MuxResult;

pub const VIRGL_CCMD_NOP: u32 = 0;
pub const VIRGL_CCMD_CREATE_OBJECT: u32 = 1;
pub const VIRGL_CCMD_BIND_OBJECT: u32 = 2;
pub const VIRGL_CCMD_DESTROY_OBJECT: u32 = 3;
pub const VIRGL_CCMD_SET_VIEWPORT_STATE: u32 = 4;
pub const VIRGL_CCMD_SET_FRAMEBUFFER_STATE: u32 = 5;
pub const VIRGL_CCMD_SET_VERTEX_BUFFERS: u32 = 6;
pub const VIRGL_CCMD_CLEAR: u32 = 7;
pub const VIRGL_CCMD_DRAW_VBO: u32 = 8;
pub const VIRGL_CCMD_RESOURCE_INLINE_WRITE: u32 = 9;
pub const VIRGL_CCMD_SET_SAMPLER_VIEWS: u32 = 10;
pub const VIRGL_CCMD_SET_INDEX_BUFFER: u32 = 11;
pub const VIRGL_CCMD_SET_CONSTANT_BUFFER: u32 = 12;
pub const VIRGL_CCMD_SET_STENCIL_REF: u32 = 13;
pub const VIRGL_CCMD_SET_BLEND_COLOR: u32 = 14;
pub const VIRGL_CCMD_SET_SCISSOR_STATE: u32 = 15;
pub const VIRGL_CCMD_BLIT: u32 = 16;
pub const VIRGL_CCMD_RESOURCE_COPY_REGION: u32 = 17;
pub const VIRGL_CCMD_BIND_SAMPLER_STATES: u32 = 18;
pub const VIRGL_CCMD_BEGIN_QUERY: u32 = 19;
pub const VIRGL_CCMD_END_QUERY: u32 = 20;
pub const VIRGL_CCMD_GET_QUERY_RESULT: u32 = 21;
pub const VIRGL_CCMD_SET_POLYGON_STIPPLE: u32 = 22;
pub const VIRGL_CCMD_SET_CLIP_STATE: u32 = 23;
pub const VIRGL_CCMD_SET_SAMPLE_MASK: u32 = 24;
pub const VIRGL_CCMD_SET_STREAMOUT_TARGETS: u32 = 25;
pub const VIRGL_CCMD_SET_RENDER_CONDITION: u32 = 26;

pub const VIRGL_OBJECT_NULL: u32 = 0;
pub const VIRGL_OBJECT_BLEND: u32 = 1;
pub const VIRGL_OBJECT_RASTERIZER: u32 = 2;
pub const VIRGL_OBJECT_DSA: u32 = 3;
pub const VIRGL_OBJECT_SHADER: u32 = 4;
pub const VIRGL_OBJECT_VERTEX_ELEMENTS: u32 = 5;
pub const VIRGL_OBJECT_SAMPLER_VIEW: u32 = 6;
pub const VIRGL_OBJECT_SAMPLER_STATE: u32 = 7;
pub const VIRGL_OBJECT_SURFACE: u32 = 8;
pub const VIRGL_OBJECT_QUERY: u32 = 9;
pub const VIRGL_OBJECT_STREAMOUT_TARGET: u32 = 10;

/// Payload sizes in dwords.
pub const VIRGL_OBJ_SURFACE_SIZE: u32 = 5;
pub const VIRGL_OBJ_CLEAR_SIZE: u32 = 8;
pub const VIRGL_RESOURCE_IW_HDR_SIZE: u32 = 11;
pub const VIRGL_CMD_BLIT_SIZE: u32 = 23;
pub const VIRGL_CMD_RESOURCE_COPY_REGION_SIZE: u32 = 13;

pub const PIPE_MAX_COLOR_BUFS: u32 = 8;

pub const PIPE_CLEAR_DEPTH: u32 = 1 << 0;
pub const PIPE_CLEAR_STENCIL: u32 = 1 << 1;
pub const PIPE_CLEAR_COLOR0: u32 = 1 << 2;

pub const PIPE_MASK_R: u32 = 1 << 0;
pub const PIPE_MASK_G: u32 = 1 << 1;
pub const PIPE_MASK_B: u32 = 1 << 2;
pub const PIPE_MASK_A: u32 = 1 << 3;
pub const PIPE_MASK_RGBA: u32 = 0xf;

/// Formats understood by the software renderer.
pub const VIRGL_FORMAT_B8G8R8A8_UNORM: u32 = 1;
pub const VIRGL_FORMAT_B8G8R8X8_UNORM: u32 = 2;
pub const VIRGL_FORMAT_A8R8G8B8_UNORM: u32 = 3;
pub const VIRGL_FORMAT_X8R8G8B8_UNORM: u32 = 4;
pub const VIRGL_FORMAT_R8_UNORM: u32 = 64;
pub const VIRGL_FORMAT_R8G8B8A8_UNORM: u32 = 67;
pub const VIRGL_FORMAT_X8B8G8R8_UNORM: u32 = 68;
pub const VIRGL_FORMAT_A8B8G8R8_UNORM: u32 = 121;
pub const VIRGL_FORMAT_R8G8B8X8_UNORM: u32 = 134;

pub const fn virgl_cmd0(cmd: u32, obj: u32, len: u32) -> u32 {
    cmd | (obj << 8) | (len << 16)
}

pub fn header_cmd(header: u32) -> u32 {
    header & 0xff
}

pub fn header_object(header: u32) -> u32 {
    (header >> 8) & 0xff
}

pub fn header_len(header: u32) -> u32 {
    header >> 16
}

pub fn is_known_command(cmd: u32) -> bool {
    cmd <= VIRGL_CCMD_SET_RENDER_CONDITION
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Channel {
    R,
    G,
    B,
    A,
    X,
}

/// Memory byte order of each channel.
fn layout(format: u32) -> Option<&'static [Channel]> {
    use Channel::*;
    match format {
        VIRGL_FORMAT_B8G8R8A8_UNORM => Some(&[B, G, R, A]),
        VIRGL_FORMAT_B8G8R8X8_UNORM => Some(&[B, G, R, X]),
        VIRGL_FORMAT_A8R8G8B8_UNORM => Some(&[A, R, G, B]),
        VIRGL_FORMAT_X8R8G8B8_UNORM => Some(&[X, R, G, B]),
        VIRGL_FORMAT_R8_UNORM => Some(&[R]),
        VIRGL_FORMAT_R8G8B8A8_UNORM => Some(&[R, G, B, A]),
        VIRGL_FORMAT_X8B8G8R8_UNORM => Some(&[X, B, G, R]),
        VIRGL_FORMAT_A8B8G8R8_UNORM => Some(&[A, B, G, R]),
        VIRGL_FORMAT_R8G8B8X8_UNORM => Some(&[R, G, B, X]),
        _ => None,
    }
}

pub fn bytes_per_pixel(format: u32) -> Option<u32> {
    layout(format).map(|channels| channels.len() as u32)
}

pub fn formats() -> impl Iterator<Item = u32> {
    [
        VIRGL_FORMAT_B8G8R8A8_UNORM,
        VIRGL_FORMAT_B8G8R8X8_UNORM,
        VIRGL_FORMAT_A8R8G8B8_UNORM,
        VIRGL_FORMAT_X8R8G8B8_UNORM,
        VIRGL_FORMAT_R8_UNORM,
        VIRGL_FORMAT_R8G8B8A8_UNORM,
        VIRGL_FORMAT_X8B8G8R8_UNORM,
        VIRGL_FORMAT_A8B8G8R8_UNORM,
        VIRGL_FORMAT_R8G8B8X8_UNORM,
    ]
    .into_iter()
}

/// Converts a normalized float color to 8-bit channels.
pub fn unorm8(color: [f32; 4]) -> [u8; 4] {
    color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8)
}

/// Writes `rgba` into `pixel` using the byte order of `format`.
pub fn pack_rgba(format: u32, rgba: [u8; 4], pixel: &mut [u8]) -> MuxResult<()> {
    let channels = layout(format).ok_or(MuxError::InvalidFormat(format))?;
    if pixel.len() != channels.len() {
        return Err(MuxError::InvalidFormat(format));
    }
    for (byte, channel) in pixel.iter_mut().zip(channels) {
        *byte = match channel {
            Channel::R => rgba[0],
            Channel::G => rgba[1],
            Channel::B => rgba[2],
            Channel::A => rgba[3],
            Channel::X => 0xff,
        };
    }
    Ok(())
}

/// Reads `pixel` in the byte order of `format`.  Missing channels read as 0, missing alpha as
/// opaque.
pub fn unpack_rgba(format: u32, pixel: &[u8]) -> MuxResult<[u8; 4]> {
    let channels = layout(format).ok_or(MuxError::InvalidFormat(format))?;
    if pixel.len() != channels.len() {
        return Err(MuxError::InvalidFormat(format));
    }
    let mut rgba = [0, 0, 0, 0xff];
    for (byte, channel) in pixel.iter().zip(channels) {
        match channel {
            Channel::R => rgba[0] = *byte,
            Channel::G => rgba[1] = *byte,
            Channel::B => rgba[2] = *byte,
            Channel::A => rgba[3] = *byte,
            Channel::X => (),
        }
    }
    Ok(rgba)
}
