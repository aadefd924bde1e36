// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod footprint;
mod meminfo;
mod relief_logger;

use log::debug;
use log::error;
use log::info;
use log::warn;

pub use self::footprint::FootprintSource;
pub use self::footprint::ProcFootprintSource;
pub use self::meminfo::MemInfo;
pub use self::relief_logger::set_relief_logging_enabled;
pub use self::relief_logger::ReliefLogger;
use crate::common::GIB;
use crate::common::MIB;
use crate::config::Config;
use crate::config::EnvOverrides;

// An active process crossing this fraction of total memory times the
// inactive-process limit triggers the exceeded-inactive-limit notification.
const INACTIVE_LIMIT_RAM_FRACTION: f64 = 0.9;

/// How aggressively the process should shed memory. Levels are ordered by
/// strictly increasing severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryUsagePolicy {
    // There is enough memory to use.
    Unrestricted = 0,
    // Caches are advised to shrink to their minimum working size.
    Conservative = 1,
    // All memory that can be rebuilt is advised to be dropped.
    Strict = 2,
    // Like Strict, but release requests block until the handler returns.
    StrictSynchronous = 3,
}

impl MemoryUsagePolicy {
    pub fn to_name(self) -> &'static str {
        match self {
            MemoryUsagePolicy::Unrestricted => "unrestricted",
            MemoryUsagePolicy::Conservative => "conservative",
            MemoryUsagePolicy::Strict => "strict",
            MemoryUsagePolicy::StrictSynchronous => "strict-synchronous",
        }
    }
}

/// The two independently thresholded memory dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryType {
    Normal,
    Video,
}

/// Supplied by the host application's notion of foreground/background.
/// Never derived from memory measurements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Active,
    Inactive,
}

/// Whether a release request may discard state that is expensive to
/// rebuild.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Critical {
    No,
    Yes,
}

/// Whether the engine blocks until the release handler returns. Used on
/// the strict-synchronous and shrink-or-die paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Synchronous {
    No,
    Yes,
}

pub type ReleaseMemoryHandler = Box<dyn FnMut(Critical, Synchronous)>;
pub type MemoryKillHandler = Box<dyn FnMut()>;
pub type PolicyChangedHandler = Box<dyn FnMut(MemoryUsagePolicy)>;
pub type ExceededInactiveLimitHandler = Box<dyn FnMut()>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum SimulationState {
    Off,
    Simulating,
}

// Fired arms again only on a sample that no longer exceeds the limit.
#[derive(Clone, Copy, PartialEq, Eq)]
enum InactiveLimitNotice {
    Armed,
    Fired,
}

/// The memory pressure engine. Owned by the host application, constructed
/// once at startup.
///
/// Not internally synchronized. Sampling and all state mutation are
/// expected to happen on one designated thread; the periodic `monitor`
/// loop runs each tick to completion, including a synchronous shrink
/// sequence, before the next tick is scheduled.
pub struct MemoryPressureHandler {
    config: Config,
    env_base_threshold_video: Option<u64>,
    video_in_footprint: bool,
    footprint_source: Box<dyn FootprintSource>,
    policy: MemoryUsagePolicy,
    process_state: ProcessState,
    page_count: u32,
    footprint_peak: u64,
    simulation: SimulationState,
    inactive_limit_notice: InactiveLimitNotice,
    periodic_sampling: bool,
    release_memory_handler: Option<ReleaseMemoryHandler>,
    kill_handler: Option<MemoryKillHandler>,
    policy_changed_handler: Option<PolicyChangedHandler>,
    exceeded_inactive_limit_handler: Option<ExceededInactiveLimitHandler>,
}

impl MemoryPressureHandler {
    /// Creates a handler that reads footprints from /proc. Environment
    /// overrides are read once here and never again.
    pub fn new(config: Config) -> Self {
        let overrides = EnvOverrides::load();
        let source = ProcFootprintSource::new(overrides.gpu_memory_file.clone());
        Self::build(config, overrides, Box::new(source))
    }

    /// Creates a handler with a caller-supplied footprint source, for hosts
    /// with their own measurement mechanism. Does not consult the
    /// environment.
    pub fn with_footprint_source(
        config: Config,
        source: Box<dyn FootprintSource>,
        video_in_footprint: bool,
    ) -> Self {
        let overrides = EnvOverrides {
            video_in_footprint,
            ..Default::default()
        };
        Self::build(config, overrides, source)
    }

    fn build(config: Config, overrides: EnvOverrides, source: Box<dyn FootprintSource>) -> Self {
        let mut handler = Self {
            config,
            env_base_threshold_video: overrides.base_threshold_video,
            video_in_footprint: overrides.video_in_footprint,
            footprint_source: source,
            policy: MemoryUsagePolicy::Unrestricted,
            process_state: ProcessState::Inactive,
            page_count: 0,
            footprint_peak: 0,
            simulation: SimulationState::Off,
            inactive_limit_notice: InactiveLimitNotice::Armed,
            periodic_sampling: false,
            release_memory_handler: None,
            kill_handler: None,
            policy_changed_handler: None,
            exceeded_inactive_limit_handler: None,
        };
        if let Some(video) = handler.env_base_threshold_video {
            handler.config.base_threshold_video = video;
        }
        handler
    }

    /// Installs the host callbacks. The engine holds at most one of each.
    /// The kill handler must be present before a configured kill threshold
    /// can be breached.
    pub fn install(
        &mut self,
        release_memory: ReleaseMemoryHandler,
        kill: Option<MemoryKillHandler>,
        policy_changed: Option<PolicyChangedHandler>,
        exceeded_inactive_limit: Option<ExceededInactiveLimitHandler>,
    ) {
        self.release_memory_handler = Some(release_memory);
        self.kill_handler = kill;
        self.policy_changed_handler = policy_changed;
        self.exceeded_inactive_limit_handler = exceeded_inactive_limit;
    }

    /// Installs a new configuration. The environment override of the video
    /// baseline captured at construction is re-applied, so a
    /// reconfiguration cannot silently drop it.
    pub fn set_config(&mut self, config: Config) {
        self.config = config;
        if let Some(video) = self.env_base_threshold_video {
            self.config.base_threshold_video = video;
        }
        info!(
            "New memory pressure settings: bt={} btv={} ctf={} stf={} ktf={:?} pi={:?}",
            self.config.base_threshold,
            self.config.base_threshold_video,
            self.config.conservative_threshold_fraction,
            self.config.strict_threshold_fraction,
            self.config.kill_threshold_fraction,
            self.config.poll_interval
        );
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn set_process_state(&mut self, state: ProcessState) {
        self.process_state = state;
    }

    /// Workload-size hint, e.g. the number of open pages or tabs. Only
    /// raises the inactive-process limit; never consulted by the kill
    /// threshold.
    pub fn set_page_count(&mut self, page_count: u32) {
        self.page_count = page_count;
    }

    pub fn current_policy(&self) -> MemoryUsagePolicy {
        self.policy
    }

    pub fn is_under_memory_pressure(&self) -> bool {
        self.policy >= MemoryUsagePolicy::Strict || self.simulation == SimulationState::Simulating
    }

    pub fn set_periodic_sampling(&mut self, enabled: bool) {
        self.periodic_sampling = enabled;
    }

    /// Drives periodic sampling on the owning thread. Returns once
    /// periodic sampling is disabled.
    pub async fn monitor(&mut self) {
        while self.periodic_sampling {
            tokio::time::sleep(self.config.poll_interval).await;
            self.sample();
        }
    }

    fn base_threshold_for_type(&self, memory_type: MemoryType) -> u64 {
        match memory_type {
            MemoryType::Normal => self.config.base_threshold,
            MemoryType::Video => self.config.base_threshold_video,
        }
    }

    /// The footprint at and above which `policy` applies, in bytes.
    pub fn threshold_for_policy(&self, policy: MemoryUsagePolicy, memory_type: MemoryType) -> u64 {
        let base = self.base_threshold_for_type(memory_type);
        match policy {
            MemoryUsagePolicy::Unrestricted => 0,
            MemoryUsagePolicy::Conservative => {
                (self.config.conservative_threshold_fraction * base as f64) as u64
            }
            MemoryUsagePolicy::Strict => {
                (self.config.strict_threshold_fraction * base as f64) as u64
            }
            MemoryUsagePolicy::StrictSynchronous => base,
        }
    }

    /// The hard ceiling for `memory_type` beyond which the shrink-or-die
    /// sequence runs, or None if no kill threshold is configured. A plain
    /// fraction of the baseline; process state and page count do not enter
    /// into it.
    pub fn threshold_for_memory_kill(&self, memory_type: MemoryType) -> Option<u64> {
        let fraction = self.config.kill_threshold_fraction?;
        Some((fraction * self.base_threshold_for_type(memory_type) as f64) as u64)
    }

    // Some platforms account video memory into the ordinary footprint as
    // file mappings in the resident set. Subtract it there so the same
    // bytes are not counted against both baselines.
    fn footprint_for_policy_decision(&self, footprint: u64, footprint_video: u64) -> u64 {
        if self.video_in_footprint {
            footprint.saturating_sub(footprint_video)
        } else {
            footprint
        }
    }

    /// Maps a pair of footprints to a policy level. Each dimension is
    /// checked against its own baseline; either alone can drive the level.
    pub fn policy_for_footprints(&self, footprint: u64, footprint_video: u64) -> MemoryUsagePolicy {
        let footprint = self.footprint_for_policy_decision(footprint, footprint_video);
        if self.either_exceeds(footprint, footprint_video, MemoryUsagePolicy::StrictSynchronous) {
            return MemoryUsagePolicy::StrictSynchronous;
        }
        if self.either_exceeds(footprint, footprint_video, MemoryUsagePolicy::Strict) {
            return MemoryUsagePolicy::Strict;
        }
        if self.either_exceeds(footprint, footprint_video, MemoryUsagePolicy::Conservative) {
            return MemoryUsagePolicy::Conservative;
        }
        MemoryUsagePolicy::Unrestricted
    }

    fn either_exceeds(
        &self,
        footprint: u64,
        footprint_video: u64,
        policy: MemoryUsagePolicy,
    ) -> bool {
        footprint >= self.threshold_for_policy(policy, MemoryType::Normal)
            || footprint_video >= self.threshold_for_policy(policy, MemoryType::Video)
    }

    /// Runs one sampling tick: measure, check the kill ceiling, update the
    /// policy, dispatch a release request at the matching urgency, and
    /// update the inactive-limit notification.
    pub fn sample(&mut self) {
        let footprint = match self.footprint_source.footprint() {
            Ok(footprint) => footprint,
            Err(e) => {
                warn!("Couldn't measure the process footprint, skipping this sample: {:#}", e);
                return;
            }
        };
        let footprint_video = match self.footprint_source.video_footprint() {
            Ok(footprint_video) => footprint_video,
            Err(e) => {
                warn!("Couldn't measure the video footprint: {:#}", e);
                0
            }
        };
        if footprint > self.footprint_peak {
            self.footprint_peak = footprint;
        }
        debug!(
            "Current memory footprint: {} MiB, peak: {} MiB, video: {} MiB",
            footprint / MIB,
            self.footprint_peak / MIB,
            footprint_video / MIB
        );

        let kill_threshold = self.threshold_for_memory_kill(MemoryType::Normal);
        let kill_threshold_video = self.threshold_for_memory_kill(MemoryType::Video);
        if let (Some(kill_threshold), Some(kill_threshold_video)) =
            (kill_threshold, kill_threshold_video)
        {
            if footprint >= kill_threshold || footprint_video >= kill_threshold_video {
                self.shrink_or_die(kill_threshold, kill_threshold_video);
                return;
            }
        }

        self.update_policy_for_footprints(footprint, footprint_video);

        match self.policy {
            MemoryUsagePolicy::Unrestricted => {}
            MemoryUsagePolicy::Conservative => self.release_memory(Critical::No, Synchronous::No),
            MemoryUsagePolicy::Strict => self.release_memory(Critical::Yes, Synchronous::No),
            MemoryUsagePolicy::StrictSynchronous => {
                warn!(
                    "Critical memory usage [MiB]: {}{}/{}, video: {}/{}",
                    footprint / MIB,
                    if self.video_in_footprint {
                        " (including video)"
                    } else {
                        ""
                    },
                    self.config.base_threshold / MIB,
                    footprint_video / MIB,
                    self.config.base_threshold_video / MIB
                );
                self.release_memory(Critical::Yes, Synchronous::Yes);
            }
        }

        if self.process_state == ProcessState::Active
            && footprint > inactive_process_limit(self.page_count)
        {
            self.exceeded_inactive_limit();
        } else {
            self.within_inactive_limit();
        }
    }

    /// One shot: release synchronously, re-measure, survive or invoke the
    /// kill handler. No retry beyond the single shrink attempt.
    fn shrink_or_die(&mut self, kill_threshold: u64, kill_threshold_video: u64) {
        warn!("Process is above the memory kill threshold, trying to shrink down");
        self.release_memory(Critical::Yes, Synchronous::Yes);

        let footprint = match self.footprint_source.footprint() {
            Ok(footprint) => footprint,
            Err(e) => {
                error!(
                    "Couldn't re-measure the footprint after shrinking, not killing: {:#}",
                    e
                );
                return;
            }
        };
        let footprint_video = match self.footprint_source.video_footprint() {
            Ok(footprint_video) => footprint_video,
            Err(e) => {
                warn!("Couldn't measure the video footprint: {:#}", e);
                0
            }
        };
        info!("New memory footprint: {} MiB", footprint / MIB);

        if footprint < kill_threshold && footprint_video < kill_threshold_video {
            info!("Shrank below the memory kill threshold, process gets to live");
            self.update_policy_for_footprints(footprint, footprint_video);
            return;
        }

        if footprint >= kill_threshold {
            error!(
                "Unable to shrink the memory footprint ({} MiB) below the kill threshold ({} MiB)",
                footprint / MIB,
                kill_threshold / MIB
            );
        } else {
            error!(
                "Unable to shrink the video memory footprint ({} MiB) below the kill threshold ({} MiB)",
                footprint_video / MIB,
                kill_threshold_video / MIB
            );
        }
        let kill = self
            .kill_handler
            .as_mut()
            .expect("a memory kill handler must be installed when a kill threshold is configured");
        kill();
    }

    fn update_policy_for_footprints(&mut self, footprint: u64, footprint_video: u64) {
        let new_policy = self.policy_for_footprints(footprint, footprint_video);
        if new_policy == self.policy {
            return;
        }
        info!(
            "Memory usage policy changed: {} -> {}",
            self.policy.to_name(),
            new_policy.to_name()
        );
        self.policy = new_policy;
        self.notify_policy_changed();
    }

    fn notify_policy_changed(&mut self) {
        let policy = self.policy;
        if let Some(handler) = self.policy_changed_handler.as_mut() {
            handler(policy);
        }
    }

    fn release_memory(&mut self, critical: Critical, synchronous: Synchronous) {
        if let Some(handler) = self.release_memory_handler.as_mut() {
            let _relief = ReliefLogger::new("low memory handler");
            handler(critical, synchronous);
        }
    }

    fn exceeded_inactive_limit(&mut self) {
        if self.inactive_limit_notice == InactiveLimitNotice::Fired {
            return;
        }
        self.inactive_limit_notice = InactiveLimitNotice::Fired;
        if let Some(handler) = self.exceeded_inactive_limit_handler.as_mut() {
            handler();
        }
    }

    fn within_inactive_limit(&mut self) {
        self.inactive_limit_notice = InactiveLimitNotice::Armed;
    }

    /// Begins simulated memory pressure. No-op while already simulating;
    /// otherwise notifies observers and synchronously issues one critical
    /// release request, bypassing measurement entirely.
    pub fn begin_simulated_memory_pressure(&mut self) {
        if self.simulation == SimulationState::Simulating {
            return;
        }
        info!("Beginning simulated memory pressure");
        self.simulation = SimulationState::Simulating;
        self.notify_policy_changed();
        self.release_memory(Critical::Yes, Synchronous::Yes);
    }

    /// Idempotent inverse of `begin_simulated_memory_pressure`.
    pub fn end_simulated_memory_pressure(&mut self) {
        if self.simulation == SimulationState::Off {
            return;
        }
        info!("Ending simulated memory pressure");
        self.simulation = SimulationState::Off;
        self.notify_policy_changed();
    }
}

// Memory limit the host expects an inactive process to stay under. An
// active process crossing it is worth warning about, which is all this
// value is used for.
fn calculate_inactive_process_limit(page_count: u32, ram_size: u64) -> u64 {
    let base = if cfg!(target_pointer_width = "64") {
        3 * GIB + u64::from(page_count) * GIB
    } else if page_count > 1 {
        3 * GIB
    } else {
        2 * GIB
    };
    std::cmp::min(base, (ram_size as f64 * INACTIVE_LIMIT_RAM_FRACTION) as u64)
}

fn inactive_process_limit(page_count: u32) -> u64 {
    calculate_inactive_process_limit(page_count, footprint::ram_size())
}
