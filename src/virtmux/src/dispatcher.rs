// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Applies one decoded command record to a `Virtmux`.

use std::io::Read;
use std::mem::size_of;

use log::debug;
use log::trace;
use log::warn;

use crate::mux_core::Virtmux;
use crate::mux_utils::*;
use crate::protocol::*;

fn create_2d(info: virtio_gpu_resource_create_2d) -> ResourceCreate3D {
    ResourceCreate3D {
        target: VIRTMUX_PIPE_TEXTURE_2D,
        format: info.format,
        bind: VIRTMUX_PIPE_BIND_RENDER_TARGET,
        width: info.width,
        height: info.height,
        depth: 1,
        array_size: 1,
        last_level: 0,
        nr_samples: 0,
        flags: VIRTMUX_RESOURCE_Y_0_TOP,
    }
}

fn attach_backing(
    mux: &mut Virtmux,
    info: virtio_gpu_resource_attach_backing,
    regions: &[MuxIovec],
) -> VirtmuxResult {
    let mut reader = IovecReader::new(regions);
    let entry_size = size_of::<virtio_gpu_mem_entry>();
    let needed = (info.nr_entries as usize)
        .checked_mul(entry_size)
        .ok_or(GpuResponse::ErrInvalidParameter)?;
    if reader.available_bytes() < needed {
        warn!(
            "attach of {} entries with only {} bytes",
            info.nr_entries,
            reader.available_bytes()
        );
        return Err(GpuResponse::ErrInvalidParameter);
    }

    let mut entries = Vec::with_capacity(info.nr_entries as usize);
    for _ in 0..info.nr_entries {
        let entry: virtio_gpu_mem_entry = reader
            .read_obj()
            .map_err(|_| GpuResponse::ErrInvalidParameter)?;
        entries.push((entry.addr, entry.length));
    }

    mux.attach_guest_backing(info.resource_id, &entries)?;
    Ok(GpuResponse::OkNoData)
}

fn submit_3d(
    mux: &mut Virtmux,
    ctx_id: u32,
    info: virtio_gpu_cmd_submit,
    regions: &[MuxIovec],
) -> VirtmuxResult {
    let mut reader = IovecReader::new(regions);
    let fence_bytes = (info.num_in_fences as usize)
        .checked_mul(size_of::<u64>())
        .ok_or(GpuResponse::ErrInvalidParameter)?;
    let needed = fence_bytes
        .checked_add(info.size as usize)
        .ok_or(GpuResponse::ErrInvalidParameter)?;
    if reader.available_bytes() < needed {
        warn!(
            "submit of {} bytes with only {} available",
            needed,
            reader.available_bytes()
        );
        return Err(GpuResponse::ErrInvalidParameter);
    }
    if info.size == 0 {
        return Ok(GpuResponse::OkNoData);
    }

    // Fences complete in creation order, so in-fences are already satisfied.
    if info.num_in_fences > 0 {
        debug!("ctx {}: {} in-fences", ctx_id, info.num_in_fences);
        reader.consume(fence_bytes);
    }

    let mut commands = vec![0u8; info.size as usize];
    reader
        .read_exact(&mut commands)
        .map_err(|_| GpuResponse::ErrInvalidParameter)?;
    mux.submit_command(ctx_id, &commands)?;
    Ok(GpuResponse::OkNoData)
}

fn dispatch(
    mux: &mut Virtmux,
    hdr: &virtio_gpu_ctrl_hdr,
    cmd: GpuCommand,
    regions: &[MuxIovec],
) -> VirtmuxResult {
    use GpuCommand::*;
    match cmd {
        ResourceCreate2d(info) => {
            mux.resource_create_3d(info.resource_id, create_2d(info))?;
            Ok(GpuResponse::OkNoData)
        }
        ResourceCreate3d(info) => {
            mux.resource_create_3d(info.resource_id, info.into())?;
            Ok(GpuResponse::OkNoData)
        }
        ResourceUnref(info) => {
            mux.unref_resource(info.resource_id)?;
            Ok(GpuResponse::OkNoData)
        }
        SetScanout(info) => {
            mux.set_scanout(info.scanout_id, info.resource_id, info.r.into());
            Ok(GpuResponse::OkNoData)
        }
        ResourceFlush(info) => {
            mux.resource_flush(info.resource_id, info.r.into());
            Ok(GpuResponse::OkNoData)
        }
        TransferToHost2d(info) => {
            let transfer = Transfer3D {
                offset: info.offset,
                ..Transfer3D::new_2d(info.r.x, info.r.y, info.r.width, info.r.height)
            };
            mux.transfer_write(0, info.resource_id, transfer, None)?;
            Ok(GpuResponse::OkNoData)
        }
        TransferToHost3d(info) => {
            mux.transfer_write(hdr.ctx_id, info.resource_id, info.into(), None)?;
            Ok(GpuResponse::OkNoData)
        }
        TransferFromHost3d(info) => {
            mux.transfer_read(hdr.ctx_id, info.resource_id, info.into(), None)?;
            Ok(GpuResponse::OkNoData)
        }
        ResourceAttachBacking(info) => attach_backing(mux, info, regions),
        ResourceDetachBacking(info) => {
            mux.detach_backing(info.resource_id)?;
            Ok(GpuResponse::OkNoData)
        }
        GetCapsetInfo(info) => {
            let (capset_id, version, size) = mux.get_capset_info(info.capset_index)?;
            Ok(GpuResponse::OkCapsetInfo {
                capset_id,
                version,
                size,
            })
        }
        GetCapset(info) => Ok(GpuResponse::OkCapset(
            mux.get_capset(info.capset_id, info.capset_version),
        )),
        CtxCreate(info) => {
            mux.create_context(hdr.ctx_id, info.context_init, info.name())?;
            Ok(GpuResponse::OkNoData)
        }
        CtxDestroy => {
            mux.destroy_context(hdr.ctx_id)?;
            Ok(GpuResponse::OkNoData)
        }
        CtxAttachResource(info) => {
            mux.context_attach_resource(hdr.ctx_id, info.resource_id);
            Ok(GpuResponse::OkNoData)
        }
        CtxDetachResource(info) => {
            mux.context_detach_resource(hdr.ctx_id, info.resource_id);
            Ok(GpuResponse::OkNoData)
        }
        CmdSubmit3d(info) => submit_3d(mux, hdr.ctx_id, info, regions),
    }
}

/// Decodes `record`, applies it and creates the requested fence once the command succeeded.
///
/// `regions` carry the variable-length payload (backing entries, command streams) and receive
/// the capset responses.  A record that fails to decode has no side effects.
pub fn process_gpu_command(mux: &mut Virtmux, record: &[u8], regions: &[MuxIovec]) -> GpuResponse {
    let (hdr, cmd) = match GpuCommand::decode(record) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!("failed to decode command record: {}", e);
            return GpuResponse::ErrUnspec;
        }
    };
    trace!("ctx {}: {:?}", hdr.ctx_id, cmd);

    let response = match dispatch(mux, &hdr, cmd, regions) {
        Ok(response) => response,
        Err(response) => {
            warn!(
                "{} on ctx {} failed: {}",
                virtio_gpu_cmd_str(hdr.type_),
                hdr.ctx_id,
                response
            );
            return response;
        }
    };

    if hdr.flags & VIRTIO_GPU_FLAG_FENCE != 0 {
        let fence = MuxFence {
            flags: hdr.flags,
            fence_id: hdr.fence_id,
            ctx_id: hdr.ctx_id,
            ring_idx: hdr.ring_idx,
        };
        // A fence that was never queued must not be reported as submitted.
        if let Err(e) = mux.create_fence(fence) {
            warn!("fence {} not created: {}", hdr.fence_id, e);
            return GpuResponse::ErrInvalidParameter;
        }
    }

    if matches!(
        response,
        GpuResponse::OkCapset(_) | GpuResponse::OkCapsetInfo { .. }
    ) && !regions.is_empty()
    {
        let mut writer = IovecWriter::new(regions);
        let encoded = response.encode(
            hdr.flags,
            hdr.fence_id,
            hdr.ctx_id,
            hdr.ring_idx,
            &mut writer,
        );
        if let Err(e) = encoded {
            warn!("capset response truncated: {}", e);
        }
    }

    response
}
