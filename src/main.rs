// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runs the memory pressure engine against the current process and logs
//! its decisions. Thresholds come from the defaults and the MEMORYD_*
//! environment variables; the log level is controlled through RUST_LOG.

use anyhow::Result;
use log::error;
use log::info;
use log::warn;
use memoryd::config::Config;
use memoryd::memory::MemInfo;
use memoryd::memory::MemoryPressureHandler;
use tokio::runtime::Builder;

fn main() -> Result<()> {
    env_logger::init();

    info!("Starting memoryd");
    match MemInfo::load() {
        Ok(meminfo) => info!(
            "System memory: {} MiB total, {} MiB free",
            meminfo.total / 1024,
            meminfo.free / 1024
        ),
        Err(e) => warn!("Couldn't read meminfo: {}", e),
    }

    let mut handler = MemoryPressureHandler::new(Config::default());
    handler.install(
        Box::new(|critical, synchronous| {
            info!(
                "Release memory requested (critical: {:?}, synchronous: {:?})",
                critical, synchronous
            )
        }),
        Some(Box::new(|| {
            error!("Shrink failed above the memory kill threshold, exiting");
            std::process::exit(1);
        })),
        Some(Box::new(|policy| {
            info!("Memory usage policy is now {}", policy.to_name())
        })),
        Some(Box::new(|| {
            warn!("Active process exceeded the inactive-process memory limit")
        })),
    );
    handler.set_periodic_sampling(true);

    let rt = Builder::new_current_thread().enable_all().build()?;
    rt.block_on(handler.monitor());

    Ok(())
}
