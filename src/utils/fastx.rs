use std::collections::HashMap;
use std::io;
use std::path::Path;

use lazy_static::lazy_static;
use seq_io::fastq::Reader as FastqReader;

use crate::config::defs::FASTQ_EXTS;
use crate::utils::file::{extension_remover, FileReader};
use crate::utils::sample::Reads;


lazy_static! {
    static ref R1_R2_TAGS: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert("R1", "R2");
        m.insert("r1", "r2");
        m.insert("1", "2");
        m.insert("F", "R");
        m.insert("f", "r");
        m.insert("FWD", "REV");
        m.insert("fwd", "rev");
        m.insert("PE1", "PE2");
        m.insert("pe1", "pe2");
        m.insert("READ1", "READ2");
        m.insert("read1", "read2");
        m
    };
}


/// Opens a FASTQ file, plain or gzipped.
///
/// # Arguments
///
/// * `path` - Valid path to a FASTQ file.
///
/// # Returns
/// io::Result<FastqReader>, or InvalidData when the extension is not a FASTQ one.
///
pub fn fastq_reader(path: &Path) -> io::Result<FastqReader<FileReader>> {
    let (_, extensions) = extension_remover(path);
    if !extensions
        .iter()
        .any(|ext| FASTQ_EXTS.iter().any(|&e| e.eq_ignore_ascii_case(ext)))
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "File '{}' has invalid extension(s) '{:?}'. Expected FASTQ ({:?}).",
                path.display(),
                extensions,
                FASTQ_EXTS
            ),
        ));
    }
    Ok(FastqReader::new(FileReader::open(path)?))
}


/// Counts the records in a FASTQ file. A malformed record is an error.
///
/// # Arguments
///
/// * `path` - Valid path to a FASTQ file.
///
/// # Returns
/// u64: Number of records.
///
pub fn record_counter(path: &Path) -> io::Result<u64> {
    let mut reader = fastq_reader(path)?;
    let mut counter = 0;
    while let Some(record) = reader.next() {
        record.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        counter += 1;
    }
    Ok(counter)
}


/// Total records over both mates.
pub fn count_reads(reads: &Reads) -> io::Result<u64> {
    let mut total = 0;
    for file in reads.files() {
        total += record_counter(file)?;
    }
    Ok(total)
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mate {
    R1,
    R2,
}

#[derive(Debug, PartialEq)]
pub struct R1R2Result {
    pub delimiter: Option<char>,
    pub tag: Option<String>,
    pub mate: Option<Mate>,
    pub prefix: Option<String>,
    pub index: Option<usize>,
}

/// Locates the mate tag in a read file name. Parts are scanned from the end so that
/// lane and sample-number fields ahead of the tag are kept in the prefix.
///
/// # Arguments
///
/// * `path` - Read file path, e.g. `S1_L001_R2.fastq.gz`.
///
/// # Returns
/// R1R2Result; all fields None when no tag is found.
///
pub fn r1r2_base(path: &Path) -> R1R2Result {
    let delimiters = ['_', '.', '-'];
    let (stem, _) = extension_remover(path);

    let filename = match stem.file_name().and_then(|n| n.to_str()) {
        Some(name) => name.to_string(),
        None => return R1R2Result::none(),
    };

    for &delimiter in delimiters.iter() {
        let parts: Vec<&str> = filename.split(delimiter).collect();
        if parts.len() < 2 {
            continue;
        }
        for (index, part) in parts.iter().enumerate().rev() {
            let mate = if R1_R2_TAGS.contains_key(part) {
                Mate::R1
            } else if R1_R2_TAGS.values().any(|v| v == part) {
                Mate::R2
            } else {
                continue;
            };
            return R1R2Result {
                delimiter: Some(delimiter),
                tag: Some(part.to_string()),
                mate: Some(mate),
                prefix: Some(parts[..index].join(&delimiter.to_string())),
                index: Some(index),
            };
        }
    }
    R1R2Result::none()
}

impl R1R2Result {
    fn none() -> Self {
        R1R2Result {
            delimiter: None,
            tag: None,
            mate: None,
            prefix: None,
            index: None,
        }
    }
}
