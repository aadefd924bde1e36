// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::common::{parse_byte_size, GIB};
use crate::memory::footprint;

/// Overrides the video memory baseline threshold. Byte count with an
/// optional k/m suffix.
pub const ENV_MAX_GPU_MEMORY: &str = "MEMORYD_MAX_GPU_MEMORY";

/// Path of a text file holding the video memory used by this process, in
/// bytes. The file is filled by some other platform component and contains
/// a single unsigned integer line.
pub const ENV_GPU_MEMORY_FILE: &str = "MEMORYD_GPU_MEMORY_FILE";

/// Set to "1" or "true" on platforms that account video memory into the
/// ordinary process footprint (as file mappings in the resident set).
pub const ENV_GPU_IN_FOOTPRINT: &str = "MEMORYD_GPU_IN_FOOTPRINT";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Threshold fraction defaults are keyed by how much memory headroom the
/// platform class typically has, not by exact board.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlatformClass {
    Desktop,
    Constrained,
}

impl PlatformClass {
    pub fn current() -> Self {
        if cfg!(target_pointer_width = "64") {
            PlatformClass::Desktop
        } else {
            PlatformClass::Constrained
        }
    }

    /// (conservative, strict) threshold fractions for this platform class.
    pub fn threshold_fractions(self) -> (f64, f64) {
        match self {
            PlatformClass::Desktop => (0.8, 0.9),
            PlatformClass::Constrained => (0.5, 0.65),
        }
    }
}

/// Tunable thresholds and the poll interval of the pressure engine.
/// Immutable once installed; `MemoryPressureHandler::set_config` swaps the
/// whole value.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Baseline for the ordinary memory dimension, in bytes. The policy
    /// threshold fractions apply to this value.
    pub base_threshold: u64,
    /// Baseline for the video memory dimension, in bytes.
    pub base_threshold_video: u64,
    pub conservative_threshold_fraction: f64,
    pub strict_threshold_fraction: f64,
    /// Fraction of the baselines at which the shrink-or-die sequence
    /// triggers. None means the process is never killed on this path.
    pub kill_threshold_fraction: Option<f64>,
    pub poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let (conservative, strict) = PlatformClass::current().threshold_fractions();
        Self {
            base_threshold: std::cmp::min(3 * GIB, footprint::ram_size()),
            base_threshold_video: GIB,
            conservative_threshold_fraction: conservative,
            strict_threshold_fraction: strict,
            kill_threshold_fraction: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Environment-sourced settings, read exactly once when the handler is
/// constructed. The environment is never consulted again after that.
#[derive(Clone, Debug, Default)]
pub struct EnvOverrides {
    /// Replacement for `Config::base_threshold_video`. Re-applied after
    /// every `set_config` so a reconfiguration cannot silently drop it.
    pub base_threshold_video: Option<u64>,
    pub gpu_memory_file: Option<PathBuf>,
    pub video_in_footprint: bool,
}

impl EnvOverrides {
    pub fn load() -> Self {
        Self::parse(
            env::var(ENV_MAX_GPU_MEMORY).ok().as_deref(),
            env::var(ENV_GPU_MEMORY_FILE).ok().as_deref(),
            env::var(ENV_GPU_IN_FOOTPRINT).ok().as_deref(),
        )
    }

    // Extracted for unittest.
    fn parse(
        max_gpu_memory: Option<&str>,
        gpu_memory_file: Option<&str>,
        gpu_in_footprint: Option<&str>,
    ) -> Self {
        // A zero or unparsable threshold counts as unset.
        let base_threshold_video = max_gpu_memory
            .and_then(|value| parse_byte_size(value).ok())
            .filter(|size| *size > 0);
        let gpu_memory_file = gpu_memory_file
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);
        let video_in_footprint = match gpu_in_footprint {
            Some(value) => value == "1" || value.eq_ignore_ascii_case("true"),
            None => false,
        };
        Self {
            base_threshold_video,
            gpu_memory_file,
            video_in_footprint,
        }
    }
}
