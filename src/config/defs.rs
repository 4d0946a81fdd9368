use std::path::{Path, PathBuf};
use thiserror::Error;
use crate::cli::{Arguments, HostIndexMode, CollectMode};
use crate::utils::operators::CollectOrder;

// External software
pub const FASTP_TAG: &str = "fastp";
pub const DEACON_TAG: &str = "deacon";
pub const STAR_TAG: &str = "STAR";
pub const SAMTOOLS_TAG: &str = "samtools";
pub const STRINGTIE_TAG: &str = "stringtie";
pub const CURL_TAG: &str = "curl";

// Static Filenames
pub const MERGED_JUNCTIONS: &str = "ALL_SJ_out_filtered.tab";
pub const MERGED_ASSEMBLY: &str = "merged.gtf";
pub const SUMMARY_CSV: &str = "samplesheet.csv";
pub const VERSIONS_TSV: &str = "versions.tsv";

/// Static header for consumers of the summary CSV. The collected file itself carries no header.
pub const SUMMARY_HEADER: &[&str] = &[
    "id",
    "fastq_1",
    "fastq_2",
    "reads_after_trim",
    "reads_after_trim_percent",
    "host_retained_percent",
    "mapping_percent",
    "bam_size_mb",
    "assembled_features",
];

pub const GZIP_EXT: &str = "gz";
pub const FASTQ_EXTS: &[&'static str] = &["fastq", "fq"];


#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Input resolution failed: {0}")]
    InputResolution(String),

    #[error("Stage {stage} failed for sample {sample}: {error}")]
    ToolExecution {
        stage: String,
        sample: String,
        error: String,
    },

    #[error("Stage {stage} (sample {sample}) expected {expected} file(s) matching '{pattern}', found {found}")]
    OutputCardinality {
        stage: String,
        sample: String,
        pattern: String,
        expected: String,
        found: usize,
    },

    #[error("Join {operator}: key '{key}' from the {side} channel has no counterpart")]
    JoinMismatch {
        operator: String,
        key: String,
        side: &'static str,
    },

    #[error("Join {operator}: key '{key}' emitted more than once on the {side} channel")]
    DuplicateKey {
        operator: String,
        key: String,
        side: &'static str,
    },

    #[error("Channel {0} closed before a value was emitted")]
    ChannelClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}


/// Where the deacon host-depletion index comes from. Resolved once from configuration;
/// the four variants are mutually exclusive.
#[derive(Debug, Clone, PartialEq)]
pub enum HostIndexPlan {
    Provided(PathBuf),
    Download(String),
    BuildSingle {
        genome: PathBuf,
        background: Option<PathBuf>,
    },
    BuildMulti {
        genomes: Vec<PathBuf>,
        background: Option<PathBuf>,
    },
}

impl HostIndexPlan {
    /// Selects the index branch in priority order: a given path is used directly unless
    /// it is marked for download; without a path the index is built, from one genome
    /// or from the primary plus additional genomes, either one optionally minus a
    /// background set.
    ///
    /// # Arguments
    ///
    /// * `index` - Optional pre-built index path or URL.
    /// * `download` - Whether `index` must be fetched first.
    /// * `mode` - Single or multi genome build.
    /// * `genome` - Primary genome FASTA for builds.
    /// * `background` - Optional background FASTA subtracted from the built index.
    /// * `additional` - Extra genomes (multi builds only).
    ///
    /// # Returns
    /// HostIndexPlan, or InvalidConfig when the selected branch lacks its inputs.
    pub fn resolve(
        index: Option<&str>,
        download: bool,
        mode: HostIndexMode,
        genome: Option<PathBuf>,
        background: Option<PathBuf>,
        additional: Vec<PathBuf>,
    ) -> Result<Self, PipelineError> {
        match (index, download, mode) {
            (Some(path), false, _) => Ok(HostIndexPlan::Provided(PathBuf::from(path))),
            (Some(url), true, _) => Ok(HostIndexPlan::Download(url.to_string())),
            (None, _, HostIndexMode::Single) => {
                let genome = genome.ok_or_else(|| PipelineError::InvalidConfig(
                    "--host-genome is required to build a host index".to_string(),
                ))?;
                Ok(HostIndexPlan::BuildSingle { genome, background })
            }
            (None, _, HostIndexMode::Multi) => {
                let genome = genome.ok_or_else(|| PipelineError::InvalidConfig(
                    "--host-genome is required to build a host index".to_string(),
                ))?;
                if additional.is_empty() {
                    return Err(PipelineError::InvalidConfig(
                        "--host-index-mode multi needs at least one --additional-host-genomes entry".to_string(),
                    ));
                }
                let mut genomes = vec![genome];
                genomes.extend(additional);
                Ok(HostIndexPlan::BuildMulti { genomes, background })
            }
        }
    }

    /// Local files the plan reads; these must exist before the run starts.
    pub fn local_inputs(&self) -> Vec<&Path> {
        match self {
            HostIndexPlan::Provided(path) => vec![path.as_path()],
            HostIndexPlan::Download(_) => Vec::new(),
            HostIndexPlan::BuildSingle { genome, background } => {
                let mut paths = vec![genome.as_path()];
                paths.extend(background.as_deref());
                paths
            }
            HostIndexPlan::BuildMulti { genomes, background } => {
                let mut paths: Vec<&Path> = genomes.iter().map(|g| g.as_path()).collect();
                paths.extend(background.as_deref());
                paths
            }
        }
    }
}


/// Where the STAR genome directory comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum GenomeIndexPlan {
    Provided(PathBuf),
    Build {
        fasta: PathBuf,
        gtf: Option<PathBuf>,
    },
}


#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub fastp: String,
    pub deacon: String,
    pub star: String,
    pub samtools: String,
    pub stringtie: String,
    pub curl: String,
}

impl ToolPaths {
    pub fn from_args(args: &Arguments) -> Self {
        ToolPaths {
            fastp: args.fastp_bin.clone(),
            deacon: args.deacon_bin.clone(),
            star: args.star_bin.clone(),
            samtools: args.samtools_bin.clone(),
            stringtie: args.stringtie_bin.clone(),
            curl: args.curl_bin.clone(),
        }
    }
}


pub struct RunConfig  {
    pub cwd: PathBuf,
    pub out_dir: PathBuf,
    pub work_dir: PathBuf,
    pub args: Arguments,
    pub tools: ToolPaths,
    pub host_index: HostIndexPlan,
    pub genome_index: GenomeIndexPlan,
    pub annotation: Option<PathBuf>,
    pub collect_order: CollectOrder,
    pub max_parallel: usize,
}

impl RunConfig {
    /// Resolves the parsed arguments into a run configuration. Every local reference
    /// file is made absolute and checked for existence, so a missing reference fails
    /// before any stage is scheduled.
    ///
    /// # Arguments
    ///
    /// * `args` - Parsed command-line arguments.
    /// * `cwd` - Directory relative paths are resolved against.
    /// * `out_dir` - Output directory (already created).
    /// * `max_parallel` - Global stage-instance budget.
    ///
    /// # Returns
    /// RunConfig
    pub fn from_args(
        args: Arguments,
        cwd: PathBuf,
        out_dir: PathBuf,
        max_parallel: usize,
    ) -> Result<Self, PipelineError> {
        let absolute = |p: &str| absolute_path(Path::new(p), &cwd);

        // URLs stay verbatim, local index paths become absolute
        let index = args.host_index.as_deref().map(|p| {
            if args.download_host_index {
                p.to_string()
            } else {
                absolute(p).to_string_lossy().into_owned()
            }
        });
        let host_index = HostIndexPlan::resolve(
            index.as_deref(),
            args.download_host_index,
            args.host_index_mode,
            args.host_genome.as_deref().map(absolute),
            args.host_background.as_deref().map(absolute),
            args.additional_host_genomes.iter().map(|g| absolute(g.as_str())).collect(),
        )?;

        let annotation = args.annotation.as_deref().map(absolute);

        let genome_index = match (&args.star_index, &args.genome_fasta) {
            (Some(dir), _) => GenomeIndexPlan::Provided(absolute(dir)),
            (None, Some(fasta)) => GenomeIndexPlan::Build {
                fasta: absolute(fasta),
                gtf: annotation.clone(),
            },
            (None, None) => {
                return Err(PipelineError::InvalidConfig(
                    "either --star-index or --genome-fasta is required".to_string(),
                ));
            }
        };

        let mut required: Vec<&Path> = host_index.local_inputs();
        match &genome_index {
            GenomeIndexPlan::Provided(dir) => required.push(dir),
            GenomeIndexPlan::Build { fasta, .. } => required.push(fasta),
        }
        if let Some(gtf) = &annotation {
            required.push(gtf);
        }
        for path in required {
            if !path.exists() {
                return Err(PipelineError::InputResolution(format!(
                    "reference path {} does not exist",
                    path.display()
                )));
            }
        }

        if args.threads == 0 {
            return Err(PipelineError::InvalidConfig("--threads must be at least 1".to_string()));
        }

        let work_dir = match &args.work_dir {
            Some(dir) => absolute(dir),
            None => out_dir.join("work"),
        };
        let collect_order = match args.collect_order {
            CollectMode::Arrival => CollectOrder::Arrival,
            CollectMode::Sorted => CollectOrder::ByKey,
        };

        Ok(RunConfig {
            tools: ToolPaths::from_args(&args),
            cwd,
            out_dir,
            work_dir,
            host_index,
            genome_index,
            annotation,
            collect_order,
            max_parallel: max_parallel.max(1),
            args,
        })
    }

    /// Tags of the external tools the resolved plans will invoke.
    pub fn required_tools(&self) -> Vec<(&'static str, &str)> {
        let mut tools = vec![
            (FASTP_TAG, self.tools.fastp.as_str()),
            (DEACON_TAG, self.tools.deacon.as_str()),
            (STAR_TAG, self.tools.star.as_str()),
            (SAMTOOLS_TAG, self.tools.samtools.as_str()),
            (STRINGTIE_TAG, self.tools.stringtie.as_str()),
        ];
        if let HostIndexPlan::Download(_) = self.host_index {
            tools.push((CURL_TAG, self.tools.curl.as_str()));
        }
        tools
    }
}


pub fn absolute_path(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}
