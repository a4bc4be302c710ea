// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::LevelFilter;
use vtest_server::protocol::VTEST_DEFAULT_SOCKET_NAME;
use vtest_server::TransportConfig;
use vtest_server::VtestServer;
use vtest_server::DEFAULT_MAX_LENGTH;

#[derive(Parser, Debug)]
struct Args {
    /// Socket to listen on
    #[arg(long, default_value = VTEST_DEFAULT_SOCKET_NAME)]
    socket_path: PathBuf,

    /// Largest payload accepted from a client, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_LENGTH)]
    max_length: usize,

    /// Keep clients on protocol version 1 instead of sharing resource memory
    #[arg(long)]
    no_shm: bool,

    /// Keep serving after the first client disconnects
    #[arg(long)]
    multi_clients: bool,

    /// 0 (off) to 5 (trace)
    #[arg(long, default_value_t = 2)]
    log_level: u32,
}

fn level_filter(level: u32) -> LevelFilter {
    match level {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::builder()
        .filter_level(level_filter(args.log_level))
        .init();

    let config = TransportConfig {
        socket_path: args.socket_path,
        max_length: args.max_length,
        use_shm: !args.no_shm,
        multi_clients: args.multi_clients,
    };
    let server = VtestServer::bind(config.clone())
        .with_context(|| format!("Failed to listen on {}", config.socket_path.display()))?;
    server.run().context("vtest server failed")?;
    Ok(())
}
