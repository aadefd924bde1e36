// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use log::info;

use crate::memory::footprint;
use crate::memory::footprint::MemoryUsage;

static LOGGING_ENABLED: AtomicBool = AtomicBool::new(false);

pub fn set_relief_logging_enabled(enabled: bool) {
    LOGGING_ENABLED.store(enabled, Ordering::SeqCst);
}

fn relief_logging_enabled() -> bool {
    LOGGING_ENABLED.load(Ordering::SeqCst)
}

/// Records memory usage around a release-memory action and reports the
/// delta when dropped. Purely observational; never influences policy.
///
/// The baseline is captured at construction, so the logger must be created
/// before the release action runs.
pub struct ReliefLogger {
    log_string: &'static str,
    initial: Option<MemoryUsage>,
}

impl ReliefLogger {
    pub fn new(log_string: &'static str) -> Self {
        let initial = if relief_logging_enabled() {
            footprint::memory_usage().ok()
        } else {
            None
        };
        Self {
            log_string,
            initial,
        }
    }

    pub fn log_memory_usage_change(&self) {
        let current = footprint::memory_usage().ok();
        let (Some(initial), Some(current)) = (self.initial, current) else {
            info!(
                "Memory pressure relief: {}: (unable to get memory usage for process)",
                self.log_string
            );
            return;
        };

        let resident_diff = current.resident as i64 - initial.resident as i64;
        let swap_diff = current.resident_and_swap as i64 - initial.resident_and_swap as i64;
        info!(
            "Memory pressure relief: {}: res = {}/{}/{}, res+swap = {}/{}/{}",
            self.log_string,
            initial.resident,
            current.resident,
            resident_diff,
            initial.resident_and_swap,
            current.resident_and_swap,
            swap_diff
        );
    }
}

impl Drop for ReliefLogger {
    fn drop(&mut self) {
        if relief_logging_enabled() {
            self.log_memory_usage_change();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relief_logger() {
        testing_logger::setup();

        // Disabled: no baseline is captured and dropping stays silent.
        {
            let logger = ReliefLogger::new("disabled");
            assert!(logger.initial.is_none());
        }
        testing_logger::validate(|captured_logs| {
            assert!(captured_logs
                .iter()
                .all(|log| !log.body.contains("Memory pressure relief")));
        });

        set_relief_logging_enabled(true);
        {
            let logger = ReliefLogger::new("total");
            assert!(logger.initial.is_some());
        }
        set_relief_logging_enabled(false);
        testing_logger::validate(|captured_logs| {
            assert!(captured_logs
                .iter()
                .any(|log| log.body.contains("Memory pressure relief: total: res = ")));
        });
    }
}
