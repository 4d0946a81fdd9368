use clap::{Parser, ValueEnum};
use crate::utils::sample::Strandedness;

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum HostIndexMode {
    #[default]
    Single,
    Multi,
}

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum CollectMode {
    Arrival,
    #[default]
    Sorted,
}

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "metassembly", version, about = "Two-pass alignment and transcript assembly over a channel-connected stage graph")]
pub struct Arguments {

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(short = 'i', long = "input", help = "Glob matching the raw FASTQ files, e.g. 'reads/*.fastq.gz'. Mates are paired by their R1/R2 tag.")]
    pub input: String,

    #[arg(short = 'o', long = "out", help = "Output directory for published files. If not specified, a directory named 'metassembly_YYYYMMDD' will be created in the current working directory.")]
    pub out_dir: Option<String>,

    #[arg(long = "work-dir", help = "Scratch directory holding one sub-directory per stage instance (default: <out>/work)")]
    pub work_dir: Option<String>,

    #[arg(long, value_enum, help = "Library strandedness applied to every discovered sample")]
    pub strandedness: Option<Strandedness>,

    #[arg(short = 't', long, default_value_t = 8)]
    pub threads: usize,

    #[arg(long, help = "Maximum number of stage instances running at once (default: physical cores / threads)")]
    pub max_parallel: Option<usize>,

    #[arg(long, default_value_t = 1000, help = "Samples with fewer reads after trimming are dropped from every downstream stage")]
    pub min_trimmed_reads: u64,

    #[arg(long, default_value = "", help = "Extra arguments appended to the fastp command line")]
    pub fastp_args: String,

    // Host depletion index
    #[arg(long, help = "Path (or URL with --download-host-index) of a pre-built deacon index")]
    pub host_index: Option<String>,

    #[arg(long, default_value_t = false)]
    pub download_host_index: bool,

    #[arg(long = "host-index-mode", default_value = "single", value_enum)]
    pub host_index_mode: HostIndexMode,

    #[arg(long, help = "Primary host genome FASTA used when no --host-index is given")]
    pub host_genome: Option<String>,

    #[arg(long, help = "Background/decoy FASTA subtracted from a built host index")]
    pub host_background: Option<String>,

    #[clap(
        long,
        value_delimiter = ',',
        help = "Comma-separated additional host genomes for --host-index-mode multi"
    )]
    pub additional_host_genomes: Vec<String>,

    #[arg(long, default_value_t = 31)]
    pub deacon_kmer: usize,

    #[arg(long, default_value_t = 15)]
    pub deacon_window: usize,

    #[arg(long, default_value_t = 0.5, help = "Minimum minimizer entropy kept in built host indexes")]
    pub deacon_entropy: f64,

    // Alignment
    #[arg(long, help = "Pre-built STAR genome directory")]
    pub star_index: Option<String>,

    #[arg(long, help = "Genome FASTA used to build a STAR index when --star-index is absent")]
    pub genome_fasta: Option<String>,

    #[arg(short = 'g', long, help = "GTF annotation")]
    pub annotation: Option<String>,

    #[arg(long, default_value_t = false, help = "Pass the annotation to the first STAR pass as well")]
    pub first_pass_annotation: bool,

    #[arg(long, default_value_t = 50)]
    pub min_junction_length: u64,

    #[arg(long, default_value_t = 5)]
    pub min_junction_coverage: u64,

    #[arg(long = "collect-order", default_value = "sorted", value_enum)]
    pub collect_order: CollectMode,

    #[arg(long, default_value_t = false, help = "Delete per-sample BAM files once assembly has consumed them")]
    pub cleanup_bam: bool,

    #[arg(long, help = "Prefix added to gene_id/transcript_id of the merged assembly")]
    pub assembly_prefix: Option<String>,

    // External software
    #[arg(long, default_value = "fastp")]
    pub fastp_bin: String,

    #[arg(long, default_value = "deacon")]
    pub deacon_bin: String,

    #[arg(long, default_value = "STAR")]
    pub star_bin: String,

    #[arg(long, default_value = "samtools")]
    pub samtools_bin: String,

    #[arg(long, default_value = "stringtie")]
    pub stringtie_bin: String,

    #[arg(long, default_value = "curl")]
    pub curl_bin: String,
}
