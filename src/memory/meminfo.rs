// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs::File;
use std::io;
use std::io::BufRead;
use std::io::BufReader;

/// Struct to hold parsed /proc/meminfo data, only contains used fields.
#[derive(Default, Clone)]
pub struct MemInfo {
    /// MemTotal in KiB.
    pub total: u64,
    /// MemFree in KiB.
    pub free: u64,
}

impl MemInfo {
    /// Load /proc/meminfo and parse it.
    pub fn load() -> io::Result<Self> {
        let reader = File::open("/proc/meminfo")?;
        let reader = BufReader::new(reader);
        Self::parse(reader)
    }

    fn parse<R: BufRead>(reader: R) -> io::Result<Self> {
        let mut result = Self::default();
        for line in reader.lines() {
            let line = line?;
            let mut tokens = line.split_whitespace();
            let Some(key) = tokens.next() else {
                continue;
            };
            let field = match key {
                "MemTotal:" => &mut result.total,
                "MemFree:" => &mut result.free,
                _ => continue,
            };
            let Some(value) = tokens.next() else {
                continue;
            };
            let Ok(value) = value.parse::<u64>() else {
                continue;
            };
            *field = value;
        }
        Ok(result)
    }
}
