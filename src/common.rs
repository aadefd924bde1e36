// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

// Extract the parsing function for unittest.
pub fn parse_file_to_u64<R: BufRead>(reader: R) -> Result<u64> {
    let first_line = reader.lines().next().context("No content in buffer")??;
    first_line
        .trim()
        .parse()
        .with_context(|| format!("Couldn't parse \"{}\" as u64", first_line))
}

/// Get the first line in a file and parse as u64.
pub fn read_file_to_u64<P: AsRef<Path>>(filename: P) -> Result<u64> {
    let reader = File::open(filename).map(BufReader::new)?;
    parse_file_to_u64(reader)
}

/// Parses a byte count with an optional unit suffix, e.g. "512m" or "4K".
/// Case insensitive, surrounding whitespace ignored. "k" multiplies by KiB,
/// "m" by MiB; a bare number is taken as bytes.
pub fn parse_byte_size(value: &str) -> Result<u64> {
    let value = value.trim().to_ascii_lowercase();
    let (count, units) = if let Some(count) = value.strip_suffix('k') {
        (count, KIB)
    } else if let Some(count) = value.strip_suffix('m') {
        (count, MIB)
    } else {
        (value.as_str(), 1)
    };
    let count: u64 = count
        .parse()
        .with_context(|| format!("Couldn't parse \"{}\" as a byte count", value))?;
    Ok(count * units)
}
