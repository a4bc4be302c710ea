// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fixed-layout command records and their responses.

#![allow(non_camel_case_types)]

use std::cmp::min;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::io::Read;
use std::io::Write;
use std::mem::size_of;
use std::mem::size_of_val;
use std::str::from_utf8;

use thiserror::Error;
use zerocopy::AsBytes;
use zerocopy::FromBytes;

use crate::mux_utils::*;

/* 2d commands */
pub const VIRTIO_GPU_CMD_RESOURCE_CREATE_2D: u32 = 0x101;
pub const VIRTIO_GPU_CMD_RESOURCE_UNREF: u32 = 0x102;
pub const VIRTIO_GPU_CMD_SET_SCANOUT: u32 = 0x103;
pub const VIRTIO_GPU_CMD_RESOURCE_FLUSH: u32 = 0x104;
pub const VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D: u32 = 0x105;
pub const VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING: u32 = 0x106;
pub const VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING: u32 = 0x107;
pub const VIRTIO_GPU_CMD_GET_CAPSET_INFO: u32 = 0x108;
pub const VIRTIO_GPU_CMD_GET_CAPSET: u32 = 0x109;

/* 3d commands */
pub const VIRTIO_GPU_CMD_CTX_CREATE: u32 = 0x200;
pub const VIRTIO_GPU_CMD_CTX_DESTROY: u32 = 0x201;
pub const VIRTIO_GPU_CMD_CTX_ATTACH_RESOURCE: u32 = 0x202;
pub const VIRTIO_GPU_CMD_CTX_DETACH_RESOURCE: u32 = 0x203;
pub const VIRTIO_GPU_CMD_RESOURCE_CREATE_3D: u32 = 0x204;
pub const VIRTIO_GPU_CMD_TRANSFER_TO_HOST_3D: u32 = 0x205;
pub const VIRTIO_GPU_CMD_TRANSFER_FROM_HOST_3D: u32 = 0x206;
pub const VIRTIO_GPU_CMD_SUBMIT_3D: u32 = 0x207;

/* success responses */
pub const VIRTIO_GPU_RESP_OK_NODATA: u32 = 0x1100;
pub const VIRTIO_GPU_RESP_OK_CAPSET_INFO: u32 = 0x1102;
pub const VIRTIO_GPU_RESP_OK_CAPSET: u32 = 0x1103;

/* error responses */
pub const VIRTIO_GPU_RESP_ERR_UNSPEC: u32 = 0x1200;
pub const VIRTIO_GPU_RESP_ERR_OUT_OF_MEMORY: u32 = 0x1201;
pub const VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID: u32 = 0x1203;
pub const VIRTIO_GPU_RESP_ERR_INVALID_CONTEXT_ID: u32 = 0x1204;
pub const VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER: u32 = 0x1205;

pub fn virtio_gpu_cmd_str(cmd: u32) -> &'static str {
    match cmd {
        VIRTIO_GPU_CMD_RESOURCE_CREATE_2D => "RESOURCE_CREATE_2D",
        VIRTIO_GPU_CMD_RESOURCE_UNREF => "RESOURCE_UNREF",
        VIRTIO_GPU_CMD_SET_SCANOUT => "SET_SCANOUT",
        VIRTIO_GPU_CMD_RESOURCE_FLUSH => "RESOURCE_FLUSH",
        VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D => "TRANSFER_TO_HOST_2D",
        VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING => "RESOURCE_ATTACH_BACKING",
        VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING => "RESOURCE_DETACH_BACKING",
        VIRTIO_GPU_CMD_GET_CAPSET_INFO => "GET_CAPSET_INFO",
        VIRTIO_GPU_CMD_GET_CAPSET => "GET_CAPSET",
        VIRTIO_GPU_CMD_CTX_CREATE => "CTX_CREATE",
        VIRTIO_GPU_CMD_CTX_DESTROY => "CTX_DESTROY",
        VIRTIO_GPU_CMD_CTX_ATTACH_RESOURCE => "CTX_ATTACH_RESOURCE",
        VIRTIO_GPU_CMD_CTX_DETACH_RESOURCE => "CTX_DETACH_RESOURCE",
        VIRTIO_GPU_CMD_RESOURCE_CREATE_3D => "RESOURCE_CREATE_3D",
        VIRTIO_GPU_CMD_TRANSFER_TO_HOST_3D => "TRANSFER_TO_HOST_3D",
        VIRTIO_GPU_CMD_TRANSFER_FROM_HOST_3D => "TRANSFER_FROM_HOST_3D",
        VIRTIO_GPU_CMD_SUBMIT_3D => "SUBMIT_3D",
        _ => "UNKNOWN",
    }
}

pub const VIRTIO_GPU_FLAG_FENCE: u32 = 1 << 0;
pub const VIRTIO_GPU_FLAG_INFO_RING_IDX: u32 = 1 << 1;

#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct virtio_gpu_ctrl_hdr {
    pub type_: u32,
    pub flags: u32,
    pub fence_id: u64,
    pub ctx_id: u32,
    pub ring_idx: u8,
    pub padding: [u8; 3],
}

#[derive(Copy, Clone, Debug, Default, FromBytes, AsBytes)]
#[repr(C)]
pub struct virtio_gpu_rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl From<virtio_gpu_rect> for MuxRect {
    fn from(r: virtio_gpu_rect) -> MuxRect {
        MuxRect {
            x: r.x,
            y: r.y,
            width: r.width,
            height: r.height,
        }
    }
}

/* VIRTIO_GPU_CMD_RESOURCE_UNREF, VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING,
 * VIRTIO_GPU_CMD_CTX_ATTACH_RESOURCE, VIRTIO_GPU_CMD_CTX_DETACH_RESOURCE */
#[derive(Copy, Clone, Debug, Default, FromBytes, AsBytes)]
#[repr(C)]
pub struct virtio_gpu_resource_ref {
    pub resource_id: u32,
    pub padding: u32,
}

/* VIRTIO_GPU_CMD_RESOURCE_CREATE_2D */
#[derive(Copy, Clone, Debug, Default, FromBytes, AsBytes)]
#[repr(C)]
pub struct virtio_gpu_resource_create_2d {
    pub resource_id: u32,
    pub format: u32,
    pub width: u32,
    pub height: u32,
}

/* VIRTIO_GPU_CMD_SET_SCANOUT */
#[derive(Copy, Clone, Debug, Default, FromBytes, AsBytes)]
#[repr(C)]
pub struct virtio_gpu_set_scanout {
    pub r: virtio_gpu_rect,
    pub scanout_id: u32,
    pub resource_id: u32,
}

/* VIRTIO_GPU_CMD_RESOURCE_FLUSH */
#[derive(Copy, Clone, Debug, Default, FromBytes, AsBytes)]
#[repr(C)]
pub struct virtio_gpu_resource_flush {
    pub r: virtio_gpu_rect,
    pub resource_id: u32,
    pub padding: u32,
}

/* VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D */
#[derive(Copy, Clone, Debug, Default, FromBytes, AsBytes)]
#[repr(C)]
pub struct virtio_gpu_transfer_to_host_2d {
    pub r: virtio_gpu_rect,
    pub offset: u64,
    pub resource_id: u32,
    pub padding: u32,
}

/// One guest range of a backing, read from the regions following ATTACH_BACKING.
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct virtio_gpu_mem_entry {
    pub addr: u64,
    pub length: u32,
    pub padding: u32,
}

/* VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING */
#[derive(Copy, Clone, Debug, Default, FromBytes, AsBytes)]
#[repr(C)]
pub struct virtio_gpu_resource_attach_backing {
    pub resource_id: u32,
    pub nr_entries: u32,
}

#[derive(Copy, Clone, Debug, Default, FromBytes, AsBytes)]
#[repr(C)]
pub struct virtio_gpu_box {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub w: u32,
    pub h: u32,
    pub d: u32,
}

/* VIRTIO_GPU_CMD_TRANSFER_TO_HOST_3D, VIRTIO_GPU_CMD_TRANSFER_FROM_HOST_3D */
#[derive(Copy, Clone, Debug, Default, FromBytes, AsBytes)]
#[repr(C)]
pub struct virtio_gpu_transfer_host_3d {
    pub box_: virtio_gpu_box,
    pub offset: u64,
    pub resource_id: u32,
    pub level: u32,
    pub stride: u32,
    pub layer_stride: u32,
}

impl From<virtio_gpu_transfer_host_3d> for Transfer3D {
    fn from(t: virtio_gpu_transfer_host_3d) -> Transfer3D {
        Transfer3D {
            x: t.box_.x,
            y: t.box_.y,
            z: t.box_.z,
            w: t.box_.w,
            h: t.box_.h,
            d: t.box_.d,
            level: t.level,
            stride: t.stride,
            layer_stride: t.layer_stride,
            offset: t.offset,
        }
    }
}

/* VIRTIO_GPU_CMD_RESOURCE_CREATE_3D */
#[derive(Copy, Clone, Debug, Default, FromBytes, AsBytes)]
#[repr(C)]
pub struct virtio_gpu_resource_create_3d {
    pub resource_id: u32,
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
    pub padding: u32,
}

impl From<virtio_gpu_resource_create_3d> for ResourceCreate3D {
    fn from(c: virtio_gpu_resource_create_3d) -> ResourceCreate3D {
        ResourceCreate3D {
            target: c.target,
            format: c.format,
            bind: c.bind,
            width: c.width,
            height: c.height,
            depth: c.depth,
            array_size: c.array_size,
            last_level: c.last_level,
            nr_samples: c.nr_samples,
            flags: c.flags,
        }
    }
}

/* VIRTIO_GPU_CMD_CTX_CREATE */
#[derive(Copy, Clone, FromBytes, AsBytes)]
#[repr(C)]
pub struct virtio_gpu_ctx_create {
    pub nlen: u32,
    pub context_init: u32,
    pub debug_name: [u8; 64],
}

impl Default for virtio_gpu_ctx_create {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

impl virtio_gpu_ctx_create {
    /// The debug name, if it is valid UTF-8.
    pub fn name(&self) -> Option<&str> {
        from_utf8(&self.debug_name[..min(64, self.nlen as usize)]).ok()
    }
}

impl fmt::Debug for virtio_gpu_ctx_create {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("virtio_gpu_ctx_create")
            .field("debug_name", &self.name().unwrap_or("<invalid>"))
            .field("context_init", &self.context_init)
            .finish()
    }
}

/* VIRTIO_GPU_CMD_SUBMIT_3D */
#[derive(Copy, Clone, Debug, Default, FromBytes, AsBytes)]
#[repr(C)]
pub struct virtio_gpu_cmd_submit {
    pub size: u32,
    // In-fence ids (u64 each) precede the command stream in the regions.
    pub num_in_fences: u32,
}

/* VIRTIO_GPU_CMD_GET_CAPSET_INFO */
#[derive(Copy, Clone, Debug, Default, FromBytes, AsBytes)]
#[repr(C)]
pub struct virtio_gpu_get_capset_info {
    pub capset_index: u32,
    pub padding: u32,
}

/* VIRTIO_GPU_RESP_OK_CAPSET_INFO */
#[derive(Copy, Clone, Debug, Default, FromBytes, AsBytes)]
#[repr(C)]
pub struct virtio_gpu_resp_capset_info {
    pub hdr: virtio_gpu_ctrl_hdr,
    pub capset_id: u32,
    pub capset_max_version: u32,
    pub capset_max_size: u32,
    pub padding: u32,
}

/* VIRTIO_GPU_CMD_GET_CAPSET */
#[derive(Copy, Clone, Debug, Default, FromBytes, AsBytes)]
#[repr(C)]
pub struct virtio_gpu_get_capset {
    pub capset_id: u32,
    pub capset_version: u32,
}

/// A command record and the arguments specific to it.
#[derive(Copy, Clone, Debug)]
pub enum GpuCommand {
    ResourceCreate2d(virtio_gpu_resource_create_2d),
    ResourceUnref(virtio_gpu_resource_ref),
    SetScanout(virtio_gpu_set_scanout),
    ResourceFlush(virtio_gpu_resource_flush),
    TransferToHost2d(virtio_gpu_transfer_to_host_2d),
    ResourceAttachBacking(virtio_gpu_resource_attach_backing),
    ResourceDetachBacking(virtio_gpu_resource_ref),
    GetCapsetInfo(virtio_gpu_get_capset_info),
    GetCapset(virtio_gpu_get_capset),
    CtxCreate(virtio_gpu_ctx_create),
    CtxDestroy,
    CtxAttachResource(virtio_gpu_resource_ref),
    CtxDetachResource(virtio_gpu_resource_ref),
    ResourceCreate3d(virtio_gpu_resource_create_3d),
    TransferToHost3d(virtio_gpu_transfer_host_3d),
    TransferFromHost3d(virtio_gpu_transfer_host_3d),
    CmdSubmit3d(virtio_gpu_cmd_submit),
}

/// An error indicating something went wrong decoding a `GpuCommand`.
#[derive(Error, Debug)]
pub enum GpuCommandDecodeError {
    /// The type of the command was invalid.
    #[error("invalid command type ({0:#x})")]
    InvalidType(u32),
    /// The record ended before the arguments of its command.
    #[error("record of {available} bytes is too short for {command}")]
    Truncated {
        command: &'static str,
        available: usize,
    },
}

fn read_at<T: FromBytes>(record: &[u8], offset: usize, command: &'static str) -> Result<T, GpuCommandDecodeError> {
    record
        .get(offset..)
        .and_then(|bytes| T::read_from_prefix(bytes))
        .ok_or(GpuCommandDecodeError::Truncated {
            command,
            available: record.len(),
        })
}

impl GpuCommand {
    /// Decodes a command from one record.  Trailing bytes are ignored.
    pub fn decode(record: &[u8]) -> Result<(virtio_gpu_ctrl_hdr, GpuCommand), GpuCommandDecodeError> {
        use self::GpuCommand::*;
        let hdr: virtio_gpu_ctrl_hdr = read_at(record, 0, "header")?;
        let name = virtio_gpu_cmd_str(hdr.type_);
        let body = size_of::<virtio_gpu_ctrl_hdr>();
        let cmd = match hdr.type_ {
            VIRTIO_GPU_CMD_RESOURCE_CREATE_2D => ResourceCreate2d(read_at(record, body, name)?),
            VIRTIO_GPU_CMD_RESOURCE_UNREF => ResourceUnref(read_at(record, body, name)?),
            VIRTIO_GPU_CMD_SET_SCANOUT => SetScanout(read_at(record, body, name)?),
            VIRTIO_GPU_CMD_RESOURCE_FLUSH => ResourceFlush(read_at(record, body, name)?),
            VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D => TransferToHost2d(read_at(record, body, name)?),
            VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING => {
                ResourceAttachBacking(read_at(record, body, name)?)
            }
            VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING => {
                ResourceDetachBacking(read_at(record, body, name)?)
            }
            VIRTIO_GPU_CMD_GET_CAPSET_INFO => GetCapsetInfo(read_at(record, body, name)?),
            VIRTIO_GPU_CMD_GET_CAPSET => GetCapset(read_at(record, body, name)?),
            VIRTIO_GPU_CMD_CTX_CREATE => CtxCreate(read_at(record, body, name)?),
            VIRTIO_GPU_CMD_CTX_DESTROY => CtxDestroy,
            VIRTIO_GPU_CMD_CTX_ATTACH_RESOURCE => CtxAttachResource(read_at(record, body, name)?),
            VIRTIO_GPU_CMD_CTX_DETACH_RESOURCE => CtxDetachResource(read_at(record, body, name)?),
            VIRTIO_GPU_CMD_RESOURCE_CREATE_3D => ResourceCreate3d(read_at(record, body, name)?),
            VIRTIO_GPU_CMD_TRANSFER_TO_HOST_3D => TransferToHost3d(read_at(record, body, name)?),
            VIRTIO_GPU_CMD_TRANSFER_FROM_HOST_3D => {
                TransferFromHost3d(read_at(record, body, name)?)
            }
            VIRTIO_GPU_CMD_SUBMIT_3D => CmdSubmit3d(read_at(record, body, name)?),
            _ => return Err(GpuCommandDecodeError::InvalidType(hdr.type_)),
        };
        Ok((hdr, cmd))
    }
}

/// Sequential reads across guest regions.
pub struct IovecReader<'a> {
    iovecs: &'a [MuxIovec],
    index: usize,
    offset: usize,
}

impl<'a> IovecReader<'a> {
    pub fn new(iovecs: &'a [MuxIovec]) -> IovecReader<'a> {
        IovecReader {
            iovecs,
            index: 0,
            offset: 0,
        }
    }

    pub fn available_bytes(&self) -> usize {
        self.iovecs[self.index.min(self.iovecs.len())..]
            .iter()
            .map(|iovec| iovec.len)
            .sum::<usize>()
            - self.offset
    }

    /// Skips `count` bytes.
    pub fn consume(&mut self, mut count: usize) -> usize {
        let mut skipped = 0;
        while self.index < self.iovecs.len() {
            let len = self.iovecs[self.index].len;
            if self.offset == len {
                self.index += 1;
                self.offset = 0;
                continue;
            }
            if count == 0 {
                break;
            }
            let step = min(len - self.offset, count);
            self.offset += step;
            count -= step;
            skipped += step;
        }
        skipped
    }

    /// Reads an object from the regions.
    pub fn read_obj<T: FromBytes + AsBytes>(&mut self) -> io::Result<T> {
        let mut obj = T::new_zeroed();
        self.read_exact(obj.as_bytes_mut())?;
        Ok(obj)
    }
}

impl<'a> Read for IovecReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut copied = 0;
        while copied < buf.len() && self.index < self.iovecs.len() {
            let iovec = self.iovecs[self.index];
            let count = min(iovec.len - self.offset, buf.len() - copied);
            // Safe because the caller keeps every region mapped while the reader exists and
            // `offset + count` is within the region.
            let src = unsafe {
                std::slice::from_raw_parts((iovec.base as *const u8).add(self.offset), count)
            };
            buf[copied..copied + count].copy_from_slice(src);
            copied += self.consume(count);
        }
        Ok(copied)
    }
}

/// Sequential writes across guest regions.
pub struct IovecWriter<'a> {
    iovecs: &'a [MuxIovec],
    index: usize,
    offset: usize,
    written: usize,
}

impl<'a> IovecWriter<'a> {
    pub fn new(iovecs: &'a [MuxIovec]) -> IovecWriter<'a> {
        IovecWriter {
            iovecs,
            index: 0,
            offset: 0,
            written: 0,
        }
    }

    pub fn available_bytes(&self) -> usize {
        self.iovecs.iter().map(|iovec| iovec.len).sum::<usize>() - self.written
    }

    pub fn bytes_written(&self) -> usize {
        self.written
    }

    pub fn write_obj<T: AsBytes>(&mut self, obj: T) -> io::Result<()> {
        self.write_all(obj.as_bytes())
    }
}

impl<'a> Write for IovecWriter<'a> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut copied = 0;
        while copied < buf.len() && self.index < self.iovecs.len() {
            let iovec = self.iovecs[self.index];
            let count = min(iovec.len - self.offset, buf.len() - copied);
            // Safe because the caller keeps every region mapped and writable while the writer
            // exists and `offset + count` is within the region.
            let dst = unsafe {
                std::slice::from_raw_parts_mut((iovec.base as *mut u8).add(self.offset), count)
            };
            dst.copy_from_slice(&buf[copied..copied + count]);
            copied += count;
            self.offset += count;
            if self.offset == iovec.len {
                self.index += 1;
                self.offset = 0;
            }
        }
        self.written += copied;
        Ok(copied)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A response to a `GpuCommand`.  These correspond to `VIRTIO_GPU_RESP_*`.
#[derive(Debug)]
pub enum GpuResponse {
    OkNoData,
    OkCapsetInfo {
        capset_id: u32,
        version: u32,
        size: u32,
    },
    OkCapset(Vec<u8>),
    ErrUnspec,
    ErrMux(MuxError),
    ErrOutOfMemory,
    ErrInvalidResourceId,
    ErrInvalidContextId,
    ErrInvalidParameter,
}

impl From<MuxError> for GpuResponse {
    fn from(e: MuxError) -> GpuResponse {
        match e {
            MuxError::OutOfMemory => GpuResponse::ErrOutOfMemory,
            MuxError::InvalidResourceId => GpuResponse::ErrInvalidResourceId,
            MuxError::InvalidContextId => GpuResponse::ErrInvalidContextId,
            e => GpuResponse::ErrMux(e),
        }
    }
}

impl Display for GpuResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::GpuResponse::*;
        match self {
            ErrMux(e) => write!(f, "virtmux error: {}", e),
            other => write!(f, "{:#x}", other.get_type()),
        }
    }
}

pub type VirtmuxResult = std::result::Result<GpuResponse, GpuResponse>;

impl GpuResponse {
    /// Encodes this `GpuResponse` into `resp` with the given header metadata.
    pub fn encode(
        &self,
        flags: u32,
        fence_id: u64,
        ctx_id: u32,
        ring_idx: u8,
        resp: &mut IovecWriter,
    ) -> MuxResult<u32> {
        let hdr = virtio_gpu_ctrl_hdr {
            type_: self.get_type(),
            flags,
            fence_id,
            ctx_id,
            ring_idx,
            padding: Default::default(),
        };
        let len = match *self {
            GpuResponse::OkCapsetInfo {
                capset_id,
                version,
                size,
            } => {
                resp.write_obj(virtio_gpu_resp_capset_info {
                    hdr,
                    capset_id,
                    capset_max_version: version,
                    capset_max_size: size,
                    padding: 0u32,
                })?;
                size_of::<virtio_gpu_resp_capset_info>()
            }
            GpuResponse::OkCapset(ref data) => {
                resp.write_obj(hdr)?;
                resp.write_all(data)?;
                size_of_val(&hdr) + data.len()
            }
            _ => {
                resp.write_obj(hdr)?;
                size_of_val(&hdr)
            }
        };
        Ok(len as u32)
    }

    /// Gets the `VIRTIO_GPU_*` enum value that corresponds to this variant.
    pub fn get_type(&self) -> u32 {
        match self {
            GpuResponse::OkNoData => VIRTIO_GPU_RESP_OK_NODATA,
            GpuResponse::OkCapsetInfo { .. } => VIRTIO_GPU_RESP_OK_CAPSET_INFO,
            GpuResponse::OkCapset(_) => VIRTIO_GPU_RESP_OK_CAPSET,
            GpuResponse::ErrUnspec => VIRTIO_GPU_RESP_ERR_UNSPEC,
            GpuResponse::ErrMux(_) => VIRTIO_GPU_RESP_ERR_UNSPEC,
            GpuResponse::ErrOutOfMemory => VIRTIO_GPU_RESP_ERR_OUT_OF_MEMORY,
            GpuResponse::ErrInvalidResourceId => VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID,
            GpuResponse::ErrInvalidContextId => VIRTIO_GPU_RESP_ERR_INVALID_CONTEXT_ID,
            GpuResponse::ErrInvalidParameter => VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER,
        }
    }

    pub fn is_err(&self) -> bool {
        self.get_type() >= VIRTIO_GPU_RESP_ERR_UNSPEC
    }

    /// The positive errno for this response, 0 on success.
    pub fn to_errno(&self) -> i32 {
        match self {
            GpuResponse::OkNoData | GpuResponse::OkCapsetInfo { .. } | GpuResponse::OkCapset(_) => 0,
            GpuResponse::ErrMux(e) => e.to_errno(),
            GpuResponse::ErrOutOfMemory => libc::ENOMEM,
            GpuResponse::ErrInvalidResourceId | GpuResponse::ErrInvalidContextId => libc::ESRCH,
            GpuResponse::ErrUnspec | GpuResponse::ErrInvalidParameter => libc::EINVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record<T: AsBytes>(type_: u32, body: T) -> Vec<u8> {
        let hdr = virtio_gpu_ctrl_hdr {
            type_,
            ctx_id: 3,
            ..Default::default()
        };
        let mut bytes = hdr.as_bytes().to_vec();
        bytes.extend_from_slice(body.as_bytes());
        bytes
    }

    #[test]
    fn decodes_known_records() {
        let create = virtio_gpu_resource_create_2d {
            resource_id: 4,
            format: 2,
            width: 16,
            height: 8,
        };
        let (hdr, cmd) =
            GpuCommand::decode(&record(VIRTIO_GPU_CMD_RESOURCE_CREATE_2D, create)).unwrap();
        assert_eq!(hdr.ctx_id, 3);
        match cmd {
            GpuCommand::ResourceCreate2d(info) => assert_eq!((info.width, info.height), (16, 8)),
            other => panic!("unexpected {:?}", other),
        }

        let mut ctx = virtio_gpu_ctx_create {
            nlen: 4,
            ..Default::default()
        };
        ctx.debug_name[..4].copy_from_slice(b"test");
        match GpuCommand::decode(&record(VIRTIO_GPU_CMD_CTX_CREATE, ctx)).unwrap().1 {
            GpuCommand::CtxCreate(info) => assert_eq!(info.name(), Some("test")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_and_truncated_records() {
        assert!(matches!(
            GpuCommand::decode(&record(0x999, 0u64)),
            Err(GpuCommandDecodeError::InvalidType(0x999))
        ));
        let mut short = record(VIRTIO_GPU_CMD_RESOURCE_CREATE_3D, virtio_gpu_resource_create_3d::default());
        short.truncate(short.len() - 1);
        assert!(matches!(
            GpuCommand::decode(&short),
            Err(GpuCommandDecodeError::Truncated { .. })
        ));
        assert!(GpuCommand::decode(&[0u8; 8]).is_err());
    }

    #[test]
    fn reader_and_writer_span_regions() {
        let mut first = [0u8; 3];
        let mut empty = [0u8; 0];
        let mut second = [0u8; 9];
        let regions = [
            MuxIovec::from_mut_slice(&mut first),
            MuxIovec::from_mut_slice(&mut empty),
            MuxIovec::from_mut_slice(&mut second),
        ];

        let mut writer = IovecWriter::new(&regions);
        writer.write_obj(0x0102030405060708u64).unwrap();
        assert_eq!(writer.available_bytes(), 4);
        assert!(writer.write_all(&[0u8; 5]).is_err());

        let mut reader = IovecReader::new(&regions);
        assert_eq!(reader.consume(0), 0);
        assert_eq!(reader.read_obj::<u64>().unwrap(), 0x0102030405060708);
        assert_eq!(reader.available_bytes(), 4);
        assert_eq!(reader.consume(10), 4);
        assert!(reader.read_obj::<u32>().is_err());
    }

    #[test]
    fn errors_map_to_errno() {
        assert_eq!(GpuResponse::from(MuxError::InvalidResourceId).to_errno(), libc::ESRCH);
        assert_eq!(GpuResponse::from(MuxError::AlreadyExists).to_errno(), libc::EEXIST);
        assert_eq!(GpuResponse::from(MuxError::OutOfMemory).to_errno(), libc::ENOMEM);
        assert_eq!(GpuResponse::ErrInvalidParameter.to_errno(), libc::EINVAL);
        assert!(!GpuResponse::OkNoData.is_err());
        assert!(GpuResponse::ErrUnspec.is_err());
    }
}
