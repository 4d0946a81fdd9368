use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::MultiGzDecoder;
use log::{debug, info};

use crate::config::defs::{PipelineError, FASTQ_EXTS, GZIP_EXT};
use crate::utils::fastx::{r1r2_base, Mate};
use crate::utils::sample::{Reads, SampleMeta, Strandedness, Tuple};

const FASTA_EXTS: &[&'static str] = &["fasta", "fa", "fna"];


pub fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1F, 0x8B]), // Gzip magic bytes
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}


/// Either a plain or gzip-decoded file, read through one type.
pub enum FileReader {
    Uncompressed(BufReader<File>),
    Gzipped(MultiGzDecoder<BufReader<File>>),
}

impl FileReader {
    pub fn open(path: &Path) -> io::Result<FileReader> {
        let gz = is_gzipped(path)?;
        let file = BufReader::new(File::open(path)?);
        Ok(if gz {
            FileReader::Gzipped(MultiGzDecoder::new(file))
        } else {
            FileReader::Uncompressed(file)
        })
    }
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FileReader::Uncompressed(r) => r.read(buf),
            FileReader::Gzipped(r) => r.read(buf),
        }
    }
}


/// Strips recognised sequence and compression extensions from a path.
///
/// # Arguments
///
/// * `path` - e.g. `/data/S1_R1.fastq.gz`
///
/// # Returns
/// (`/data/S1_R1`, `["fastq", "gz"]`)
pub fn extension_remover(path: &Path) -> (PathBuf, Vec<String>) {
    let mut stem = path.to_path_buf();
    let mut extensions = Vec::new();
    while let Some(ext) = stem.extension().and_then(|e| e.to_str()).map(|e| e.to_string()) {
        let known = ext.eq_ignore_ascii_case(GZIP_EXT)
            || FASTQ_EXTS.iter().any(|e| e.eq_ignore_ascii_case(&ext))
            || FASTA_EXTS.iter().any(|e| e.eq_ignore_ascii_case(&ext));
        if !known {
            break;
        }
        extensions.insert(0, ext);
        stem.set_extension("");
    }
    (stem, extensions)
}


pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}


/// Resolves the input glob into one raw-reads tuple per sample. Mates are paired by their
/// R1/R2 tag; a file without a tag is a single-end sample named after its stem.
///
/// # Arguments
///
/// * `pattern` - Glob, relative to `cwd` unless absolute.
/// * `cwd` - Base directory for relative patterns.
/// * `strandedness` - Applied to every sample when given.
///
/// # Returns
/// Tuples sorted by sample id, or InputResolution when nothing matches.
pub fn discover_samples(
    pattern: &str,
    cwd: &Path,
    strandedness: Option<Strandedness>,
) -> Result<Vec<Tuple<Reads>>, PipelineError> {
    let full_pattern = if Path::new(pattern).is_absolute() {
        pattern.to_string()
    } else {
        cwd.join(pattern).to_string_lossy().into_owned()
    };

    let entries = glob::glob(&full_pattern)
        .map_err(|e| PipelineError::InvalidConfig(format!("invalid input glob '{}': {}", pattern, e)))?;

    let mut mates: BTreeMap<String, (Option<PathBuf>, Option<PathBuf>)> = BTreeMap::new();
    for entry in entries {
        let path = entry.map_err(|e| PipelineError::InputResolution(e.to_string()))?;
        if !path.is_file() {
            continue;
        }
        let base = r1r2_base(&path);
        let (id, mate) = match (base.prefix, base.mate) {
            (Some(prefix), Some(mate)) if !prefix.is_empty() => (prefix, mate),
            _ => (file_name(&extension_remover(&path).0), Mate::R1),
        };
        debug!("Discovered {} as {:?} of sample {}", path.display(), mate, id);

        let slot = mates.entry(id.clone()).or_insert((None, None));
        let target = match mate {
            Mate::R1 => &mut slot.0,
            Mate::R2 => &mut slot.1,
        };
        if let Some(existing) = target {
            return Err(PipelineError::InputResolution(format!(
                "sample {} matched twice for {:?}: {} and {}",
                id,
                mate,
                existing.display(),
                path.display()
            )));
        }
        *target = Some(path);
    }

    if mates.is_empty() {
        return Err(PipelineError::InputResolution(format!("no files match '{}'", full_pattern)));
    }

    let mut samples = Vec::with_capacity(mates.len());
    for (id, (r1, r2)) in mates {
        let reads = match (r1, r2) {
            (Some(r1), Some(r2)) => Reads::paired(r1, r2),
            (Some(r1), None) => Reads::single(r1),
            (None, Some(r2)) => {
                return Err(PipelineError::InputResolution(format!(
                    "sample {} has a second mate ({}) but no first mate",
                    id,
                    r2.display()
                )));
            }
            (None, None) => continue,
        };
        let mut meta = SampleMeta::new(id, reads.r2.is_none())?;
        if let Some(s) = strandedness {
            meta = meta.with_strandedness(s);
        }
        samples.push(Tuple::new(Arc::new(meta), reads));
    }
    info!("Discovered {} samples from '{}'", samples.len(), pattern);
    Ok(samples)
}
