// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeMap as Map;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixListener;
use std::os::unix::net::UnixStream;
use std::thread;
use std::thread::JoinHandle;

use crossbeam_channel::unbounded;
use log::debug;
use log::error;
use log::info;
use log::warn;
use virtmux::MuxResult;

use crate::config::TransportConfig;
use crate::renderer::new_renderer;
use crate::renderer::RendererHandle;
use crate::renderer::VtestConnection;

/// Accepts vtest clients on a Unix socket.  All clients share one renderer.
pub struct VtestServer {
    listener: UnixListener,
    config: TransportConfig,
    renderer: RendererHandle,
}

impl VtestServer {
    /// Binds the socket, replacing a stale one left by an earlier server.
    pub fn bind(config: TransportConfig) -> MuxResult<VtestServer> {
        match fs::remove_file(&config.socket_path) {
            Ok(()) => debug!("removed stale socket {}", config.socket_path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => (),
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(&config.socket_path)?;
        let renderer = new_renderer()?;
        info!("listening on {}", config.socket_path.display());
        Ok(VtestServer {
            listener,
            config,
            renderer,
        })
    }

    pub fn renderer(&self) -> RendererHandle {
        self.renderer.clone()
    }

    /// Serves clients.  Without `multi_clients` this returns once the first client is gone.
    pub fn run(&self) -> MuxResult<()> {
        let (done_tx, done_rx) = unbounded::<u32>();
        let mut workers: Map<u32, JoinHandle<()>> = Map::new();
        let mut next_client = 0u32;

        for stream in self.listener.incoming() {
            let stream = stream?;
            next_client += 1;
            let client = next_client;

            if !self.config.multi_clients {
                serve_client(client, stream, self.renderer(), self.config.clone());
                return Ok(());
            }

            for done in done_rx.try_iter() {
                if let Some(worker) = workers.remove(&done) {
                    if worker.join().is_err() {
                        error!("client {} thread panicked", done);
                    }
                }
            }

            let renderer = self.renderer();
            let config = self.config.clone();
            let done_tx = done_tx.clone();
            let worker = thread::Builder::new()
                .name(format!("vtest client {}", client))
                .spawn(move || {
                    serve_client(client, stream, renderer, config);
                    let _ = done_tx.send(client);
                })?;
            workers.insert(client, worker);
        }
        Ok(())
    }
}

impl Drop for VtestServer {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.config.socket_path) {
            debug!("socket {} not removed: {}", self.config.socket_path.display(), e);
        }
    }
}

fn serve_client(
    client: u32,
    stream: UnixStream,
    renderer: RendererHandle,
    config: TransportConfig,
) {
    info!("client {} connected", client);
    let mut connection = VtestConnection::new(stream, renderer, config);
    match connection.serve() {
        Ok(()) => info!("client {} disconnected", client),
        Err(e) => warn!("closing client {}: {}", client, e),
    }
}
