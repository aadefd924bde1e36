// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::env;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use log::error;
use once_cell::sync::Lazy;

use crate::common::read_file_to_u64;
use crate::common::GIB;
use crate::common::KIB;
use crate::memory::meminfo::MemInfo;

/// Overrides the detected total installed memory. Byte count with an
/// optional k/m suffix.
pub const ENV_RAM_SIZE: &str = "MEMORYD_RAM_SIZE";

/// Supplies the memory readings the pressure engine decides on. The two
/// dimensions are measured independently; an implementation with no notion
/// of video memory reports 0 for it.
pub trait FootprintSource {
    /// Resident memory attributable to the process, in bytes.
    fn footprint(&self) -> Result<u64>;

    /// Video memory attributable to the process, in bytes.
    fn video_footprint(&self) -> Result<u64>;
}

/// Reads the ordinary footprint from /proc/self/status and the video
/// footprint from a platform-provided text file, if one was configured.
pub struct ProcFootprintSource {
    gpu_memory_file: Option<PathBuf>,
}

impl ProcFootprintSource {
    pub fn new(gpu_memory_file: Option<PathBuf>) -> Self {
        Self { gpu_memory_file }
    }
}

impl FootprintSource for ProcFootprintSource {
    fn footprint(&self) -> Result<u64> {
        let status = procfs::process::Process::myself()?.status()?;
        let vmrss = status
            .vmrss
            .context("Couldn't get the VmRSS field in /proc/self/status")?;
        Ok(vmrss * KIB)
    }

    fn video_footprint(&self) -> Result<u64> {
        match &self.gpu_memory_file {
            Some(path) => read_file_to_u64(path)
                .with_context(|| format!("Couldn't read video memory from {}", path.display())),
            None => Ok(0),
        }
    }
}

/// Resident memory snapshot used by the relief logger.
#[derive(Clone, Copy)]
pub struct MemoryUsage {
    pub resident: u64,
    pub resident_and_swap: u64,
}

pub fn memory_usage() -> Result<MemoryUsage> {
    let status = procfs::process::Process::myself()?.status()?;
    let vmrss = status
        .vmrss
        .context("Couldn't get the VmRSS field in /proc/self/status")?;
    let vmswap = status.vmswap.unwrap_or(0);
    Ok(MemoryUsage {
        resident: vmrss * KIB,
        resident_and_swap: (vmrss + vmswap) * KIB,
    })
}

static RAM_SIZE: Lazy<u64> = Lazy::new(|| {
    if let Ok(value) = env::var(ENV_RAM_SIZE) {
        match crate::common::parse_byte_size(&value) {
            Ok(size) if size > 0 => return size,
            _ => error!("Ignoring unparsable {}: \"{}\"", ENV_RAM_SIZE, value),
        }
    }
    match MemInfo::load() {
        Ok(meminfo) => meminfo.total * KIB,
        Err(e) => {
            error!("Assume 2 GiB total memory if reading meminfo failed: {}", e);
            2 * GIB
        }
    }
});

/// Total installed memory in bytes. Queried once and cached for the process
/// lifetime.
pub fn ram_size() -> u64 {
    *RAM_SIZE
}
