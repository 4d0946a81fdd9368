// src/utils/junctions.rs
//! Merges per-sample splice-junction tables (`SJ.out.tab`) into one filtered table for
//! the second alignment pass.
//!
//! Column layout: chrom, start, end, strand, motif, annotated, unique coverage,
//! multimap coverage, max overhang.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use fxhash::FxHashMap as HashMap;
use log::{debug, info};

use crate::config::defs::MERGED_JUNCTIONS;


#[derive(Debug, Clone, PartialEq)]
struct Junction {
    chrom: String,
    start: u64,
    end: u64,
    strand: String,
    motif: String,
    coverage: u64,
    multimap_coverage: u64,
    overhang: u64,
}

#[derive(Debug, Default, PartialEq)]
pub struct JunctionSummary {
    pub read: usize,
    pub too_short: usize,
    pub annotated: usize,
    pub low_coverage: usize,
    pub written: usize,
}


fn field<T: std::str::FromStr>(fields: &[&str], i: usize, path: &Path) -> io::Result<T> {
    fields[i].parse::<T>().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{}: column {} is not numeric: '{}'", path.display(), i + 1, fields[i]),
        )
    })
}


/// Merges junction tables.
///
/// Junctions spanning fewer than `min_length` bases or already annotated are skipped.
/// Junctions sharing chrom/start/end/strand are aggregated: coverages summed, overhang
/// maximised. Those with total coverage below `min_coverage` are dropped. The output keeps
/// first-seen order and marks every junction as annotated.
///
/// # Arguments
///
/// * `tables` - Per-sample `SJ.out.tab` files, in the order they should be read.
/// * `out_dir` - Directory receiving `ALL_SJ_out_filtered.tab`.
/// * `min_length` - Minimum `end - start`.
/// * `min_coverage` - Minimum aggregated unique coverage.
///
/// # Returns
/// Path of the merged table and counts of what was filtered.
pub fn merge_junctions(
    tables: &[PathBuf],
    out_dir: &Path,
    min_length: u64,
    min_coverage: u64,
) -> io::Result<(PathBuf, JunctionSummary)> {
    let mut summary = JunctionSummary::default();
    let mut order: Vec<Junction> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::default();

    for table in tables {
        let reader = BufReader::new(File::open(table)?);
        for line in reader.lines() {
            let line = line?;
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 9 {
                continue;
            }
            summary.read += 1;

            let start: u64 = field(&fields, 1, table)?;
            let end: u64 = field(&fields, 2, table)?;
            if end.saturating_sub(start) < min_length {
                debug!("Skipping junction {}:{}-{}, shorter than {}", fields[0], start, end, min_length);
                summary.too_short += 1;
                continue;
            }
            let annotated: u8 = field(&fields, 5, table)?;
            if annotated == 1 {
                summary.annotated += 1;
                continue;
            }
            let coverage: u64 = field(&fields, 6, table)?;
            let multimap_coverage: u64 = field(&fields, 7, table)?;
            let overhang: u64 = field(&fields, 8, table)?;

            let key = format!("{}:{}-{}:{}", fields[0], start, end, fields[3]);
            match index.get(&key) {
                Some(&i) => {
                    let j = &mut order[i];
                    j.coverage += coverage;
                    j.multimap_coverage += multimap_coverage;
                    j.overhang = j.overhang.max(overhang);
                }
                None => {
                    index.insert(key, order.len());
                    order.push(Junction {
                        chrom: fields[0].to_string(),
                        start,
                        end,
                        strand: fields[3].to_string(),
                        motif: fields[4].to_string(),
                        coverage,
                        multimap_coverage,
                        overhang,
                    });
                }
            }
        }
    }

    let out_path = out_dir.join(MERGED_JUNCTIONS);
    let mut writer = BufWriter::new(File::create(&out_path)?);
    for j in &order {
        if j.coverage < min_coverage {
            summary.low_coverage += 1;
            continue;
        }
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}\t1\t{}\t{}\t{}",
            j.chrom, j.start, j.end, j.strand, j.motif, j.coverage, j.multimap_coverage, j.overhang
        )?;
        summary.written += 1;
    }
    writer.flush()?;

    info!(
        "Merged {} junction tables: {} read, {} short, {} annotated, {} low coverage, {} written",
        tables.len(),
        summary.read,
        summary.too_short,
        summary.annotated,
        summary.low_coverage,
        summary.written
    );
    Ok((out_path, summary))
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_merge_aggregates_and_filters() -> io::Result<()> {
        let dir = tempdir()?;
        let a = dir.path().join("A.SJ.out.tab");
        let b = dir.path().join("B.SJ.out.tab");
        fs::write(&a, "chr1\t100\t400\t1\t1\t0\t3\t1\t20\n\
                       chr1\t100\t120\t1\t1\t0\t50\t0\t30\n\
                       chr2\t500\t900\t2\t2\t1\t80\t0\t40\n\
                       chr3\t10\t900\t1\t1\t0\t1\t0\t12\n")?;
        fs::write(&b, "chr1\t100\t400\t1\t1\t0\t4\t2\t35\n\
                       malformed line\n")?;

        let (path, summary) = merge_junctions(&[a, b], dir.path(), 50, 5)?;
        assert_eq!(path, dir.path().join(MERGED_JUNCTIONS));
        assert_eq!(fs::read_to_string(&path)?, "chr1\t100\t400\t1\t1\t1\t7\t3\t35\n");
        assert_eq!(summary, JunctionSummary {
            read: 5,
            too_short: 1,
            annotated: 1,
            low_coverage: 1,
            written: 1,
        });
        Ok(())
    }

    #[test]
    fn test_merge_rejects_non_numeric_columns() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("A.SJ.out.tab");
        fs::write(&a, "chr1\tx\t400\t1\t1\t0\t3\t1\t20\n").unwrap();
        let err = merge_junctions(&[a], dir.path(), 50, 5).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
