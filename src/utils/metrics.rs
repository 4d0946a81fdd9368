// src/utils/metrics.rs
//! Scalar metrics scraped from tool reports. The line formats are pinned by the tests
//! below; a missing line yields 0 and a warning rather than an error.

use std::fs;
use std::io;
use std::path::Path;

use lazy_static::lazy_static;
use log::warn;
use regex::Regex;

const MAPPING_LINE: &str = "Uniquely mapped reads %";
const BYTES_PER_MB: f64 = 1_048_576.0;

lazy_static! {
    static ref MAPPING_PERCENT: Regex = Regex::new(r"\|\s*([\d.]+)%").unwrap();
    static ref RETAINED_PERCENT: Regex =
        Regex::new(r"Retained\s+(\d+)/(\d+)\s+sequences\s+\(([\d.]+)%\)").unwrap();
}


/// Percent of uniquely mapped reads from a STAR `Log.final.out`.
///
/// # Arguments
///
/// * `text` - Full log text.
///
/// # Returns
/// The value on the `Uniquely mapped reads %` line, or 0.0 when absent or unparsable.
pub fn parse_mapping_percent(text: &str) -> f64 {
    let value = text
        .lines()
        .find(|line| line.contains(MAPPING_LINE))
        .and_then(|line| MAPPING_PERCENT.captures(line))
        .and_then(|caps| caps[1].parse::<f64>().ok());
    match value {
        Some(v) => v,
        None => {
            warn!("No '{}' line found in alignment log, reporting 0", MAPPING_LINE);
            0.0
        }
    }
}


/// Percent of reads kept by host depletion, from a deacon filter log line such as
/// `Retained 950/1000 sequences (95.000%)`. Absent → 0.0.
pub fn parse_retained_percent(text: &str) -> f64 {
    match RETAINED_PERCENT
        .captures(text)
        .and_then(|caps| caps[3].parse::<f64>().ok())
    {
        Some(v) => v,
        None => {
            warn!("No 'Retained N/M sequences' line found in host filter log, reporting 0");
            0.0
        }
    }
}


pub fn bam_size_mb(path: &Path) -> io::Result<f64> {
    Ok(fs::metadata(path)?.len() as f64 / BYTES_PER_MB)
}
