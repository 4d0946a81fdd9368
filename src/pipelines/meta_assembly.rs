// src/pipelines/meta_assembly.rs
//! Top-level assembly run: trim, quality gate, host depletion, two-pass alignment,
//! per-sample and merged transcript assembly, and the per-sample summary.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use fxhash::FxHashSet as HashSet;
use log::{info, warn};

use crate::config::defs::{PipelineError, RunConfig, MERGED_ASSEMBLY, SUMMARY_CSV, VERSIONS_TSV};
use crate::pipelines::index_prep::IndexPrep;
use crate::pipelines::summary::{Summary, SummaryInputs};
use crate::pipelines::two_pass_align::{AlignInputs, TwoPassAlign};
use crate::pipelines::Subworkflow;
use crate::utils::command::deacon::{DeaconFilter, HostFiltered};
use crate::utils::command::fastp::{FastpTrim, TrimmedReads};
use crate::utils::command::star::Alignment;
use crate::utils::command::stringtie::{Assembly, StringTieAssemble, StringTieMerge};
use crate::utils::command::VersionCollector;
use crate::utils::executor::Executor;
use crate::utils::file::discover_samples;
use crate::utils::gtf::rename_gtf;
use crate::utils::operators::{collect, combine, filter, join, map, map_value, JoinMode};
use crate::utils::process::{run_each, run_once_if_present};
use crate::utils::sample::{Reads, Tuple};
use crate::utils::streams::{QueueChannel, ValueChannel};


/// What a successful run produced.
#[derive(Debug)]
pub struct RunReport {
    /// Samples that passed the quality gate, sorted.
    pub passed: Vec<String>,
    /// Samples dropped by the quality gate, sorted.
    pub dropped: Vec<String>,
    pub summary_csv: PathBuf,
    /// Absent when no sample reached assembly.
    pub merged_gtf: Option<PathBuf>,
    pub versions: PathBuf,
}


struct Wired {
    raw: QueueChannel<Tuple<Reads>>,
    gated: QueueChannel<Tuple<TrimmedReads>>,
    merged_gtf: ValueChannel<Option<PathBuf>>,
    summary_csv: ValueChannel<PathBuf>,
}


/// Connects every stage of the run. Nothing completes here; the executor drives it.
fn wire(config: &Arc<RunConfig>, exec: &Executor, samples: Vec<Tuple<Reads>>) -> Result<Wired, PipelineError> {
    let args = &config.args;
    let tools = &config.tools;

    let raw = QueueChannel::from_items("raw_reads", samples)?;

    let trim = FastpTrim {
        bin: tools.fastp.clone(),
        threads: args.threads,
        extra_args: args.fastp_args.clone(),
    };
    let trimmed = run_each(exec, Arc::new(trim), &raw);

    // Quality gate: everything downstream, the summary included, reads from `gated`.
    let min_reads = args.min_trimmed_reads;
    let gated = filter(exec, "quality_gate", &trimmed, move |t: &Tuple<TrimmedReads>| {
        let keep = t.payload.trimmed_count >= min_reads;
        if !keep {
            warn!(
                "{}: {} reads after trimming, fewer than {}; dropping sample",
                t.id(),
                t.payload.trimmed_count,
                min_reads
            );
        }
        keep
    });

    let indexes = IndexPrep { config: config.clone() }.wire(exec, ())?;

    let with_host_index = combine(exec, "trimmed_with_host_index", &gated, &indexes.host_index);
    let host_filter = DeaconFilter {
        bin: tools.deacon.clone(),
        threads: args.threads,
    };
    let filtered = run_each(exec, Arc::new(host_filter), &with_host_index);
    let clean_reads = map(exec, "host_depleted_reads", &filtered, |t: Tuple<HostFiltered>| {
        Ok(t.derive(t.payload.reads.clone()))
    });

    let aligned = TwoPassAlign { config: config.clone() }.wire(
        exec,
        AlignInputs {
            reads: clean_reads,
            genome_index: indexes.genome_index,
        },
    )?;

    let assemble = StringTieAssemble {
        bin: tools.stringtie.clone(),
        threads: args.threads,
        annotation: config.annotation.clone(),
        cleanup_bam: args.cleanup_bam,
    };
    let assemblies = run_each(exec, Arc::new(assemble), &aligned.alignments);

    let all_assemblies = collect(exec, "sample_assemblies", &assemblies, config.collect_order);
    let to_merge = map_value(exec, "assemblies_to_merge", &all_assemblies, |all: Vec<Tuple<Assembly>>| {
        if all.is_empty() {
            warn!("No sample reached assembly; skipping the merged assembly");
            return Ok(None);
        }
        Ok(Some(all))
    });
    let merge = StringTieMerge {
        bin: tools.stringtie.clone(),
        threads: args.threads,
        annotation: config.annotation.clone(),
    };
    let merged = run_once_if_present(exec, Arc::new(merge), &to_merge);

    let published = config.out_dir.join(MERGED_ASSEMBLY);
    let prefix = args.assembly_prefix.clone();
    let merged_gtf = map_value(exec, "publish_assembly", &merged, move |gtf: Option<PathBuf>| {
        let Some(gtf) = gtf else {
            return Ok(None);
        };
        match prefix {
            Some(prefix) => {
                let records = rename_gtf(&gtf, &prefix, &published)?;
                info!("Renamed {} records of the merged assembly with prefix {}", records, prefix);
            }
            None => {
                fs::copy(&gtf, &published)?;
            }
        }
        Ok(Some(published))
    });

    // Raw file names of the samples that passed. Samples the gate dropped have no partner
    // on the left and fall out of the inner join.
    let passed_raw = join(exec, "passed_raw_reads", &gated, &raw, JoinMode::Drop);
    let summary_inputs = SummaryInputs {
        raw_reads: map(exec, "summary_raw", &passed_raw, |(_, r): (Tuple<TrimmedReads>, Tuple<Reads>)| Ok(r)),
        trimmed_count: map(exec, "summary_trimmed_count", &gated, |t: Tuple<TrimmedReads>| {
            Ok(t.derive(t.payload.trimmed_count))
        }),
        trimmed_percent: map(exec, "summary_trimmed_percent", &gated, |t: Tuple<TrimmedReads>| {
            Ok(t.derive(t.payload.percent_kept()))
        }),
        retained_percent: map(exec, "summary_retained", &filtered, |t: Tuple<HostFiltered>| {
            Ok(t.derive(t.payload.retained_percent))
        }),
        mapping_percent: map(exec, "summary_mapping", &aligned.alignments, |t: Tuple<Alignment>| {
            Ok(t.derive(t.payload.mapping_percent))
        }),
        bam_size_mb: map(exec, "summary_bam_size", &aligned.alignments, |t: Tuple<Alignment>| {
            Ok(t.derive(t.payload.bam_size_mb))
        }),
        assembled: map(exec, "summary_assembled", &assemblies, |t: Tuple<Assembly>| {
            Ok(t.derive(t.payload.transcripts))
        }),
    };
    let summary_csv = Summary {
        out_path: config.out_dir.join(SUMMARY_CSV),
    }
    .wire(exec, summary_inputs)?;

    Ok(Wired {
        raw,
        gated,
        merged_gtf,
        summary_csv,
    })
}


async fn ids<P: Clone + Send + 'static>(channel: &QueueChannel<Tuple<P>>) -> Vec<String> {
    let mut ids: Vec<String> = channel
        .subscribe()
        .map(|t| t.id().to_string())
        .collect()
        .await;
    ids.sort();
    ids
}


/// Waits for every started stage and flushes the tool versions, whatever the outcome.
/// A wiring error halts the run so no further stage starts, and is reported ahead of
/// any stage failure.
async fn settle<T>(
    exec: Executor,
    wired: Result<T, PipelineError>,
    versions: &VersionCollector,
    versions_path: &Path,
) -> Result<(T, PathBuf), PipelineError> {
    if let Err(e) = &wired {
        exec.fail(
            "meta_assembly wiring",
            PipelineError::InvalidConfig(format!("pipeline wiring failed: {}", e)),
        );
    }
    let finished = exec.finish().await;
    let versions_tsv = versions.write_tsv(versions_path)?;
    let wired = wired?;
    finished?;
    Ok((wired, versions_tsv))
}


/// Runs the whole assembly pipeline.
///
/// # Arguments
///
/// * `config` - Resolved run configuration.
///
/// # Returns
/// RunReport, or the first fatal error. Outputs written before a failure stay on disk.
pub async fn run(config: Arc<RunConfig>) -> Result<RunReport, PipelineError> {
    let start = Instant::now();

    let samples = discover_samples(&config.args.input, &config.cwd, config.args.strandedness)?;
    info!("Discovered {} samples", samples.len());

    // External tools check
    let versions = VersionCollector::new();
    versions.check_versions(&config.required_tools()).await?;

    fs::create_dir_all(&config.out_dir)?;
    let exec = Executor::new(config.work_dir.clone(), config.max_parallel);
    info!(
        "Running with up to {} concurrent stages, work directory {}",
        config.max_parallel,
        config.work_dir.display()
    );

    let wired = wire(&config, &exec, samples);
    let (wired, versions_tsv) = settle(exec, wired, &versions, &config.out_dir.join(VERSIONS_TSV)).await?;

    let passed = ids(&wired.gated).await;
    let passed_set: HashSet<&str> = passed.iter().map(String::as_str).collect();
    let dropped: Vec<String> = ids(&wired.raw)
        .await
        .into_iter()
        .filter(|id| !passed_set.contains(id.as_str()))
        .collect();

    let summary_csv = wired
        .summary_csv
        .try_get()
        .ok_or_else(|| PipelineError::ChannelClosed(SUMMARY_CSV.to_string()))?;
    let merged_gtf = wired
        .merged_gtf
        .try_get()
        .ok_or_else(|| PipelineError::ChannelClosed(MERGED_ASSEMBLY.to_string()))?;
    if passed.is_empty() {
        warn!("Every sample was dropped by the quality gate");
    }

    info!(
        "Assembled {} samples ({} dropped by the quality gate) in {:.2?}",
        passed.len(),
        dropped.len(),
        start.elapsed()
    );
    Ok(RunReport {
        passed,
        dropped,
        summary_csv,
        merged_gtf,
        versions: versions_tsv,
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::command::fetch::FetchIndex;
    use crate::utils::process::run_once;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_wiring_error_is_reported_after_versions_flush() -> Result<(), PipelineError> {
        let dir = tempdir()?;
        let exec = Executor::new(dir.path().join("work"), 2);
        let fetch = FetchIndex { bin: "false".to_string() };
        let _index = run_once(&exec, Arc::new(fetch), &ValueChannel::of("url", "https://example.org/idx".to_string()));

        let versions = VersionCollector::new();
        versions.record("STAR", "2.7.11b");
        let wired: Result<(), PipelineError> = Err(PipelineError::InvalidConfig("no genome index channel".to_string()));
        let err = settle(exec, wired, &versions, &dir.path().join(VERSIONS_TSV)).await.unwrap_err();

        assert!(matches!(err, PipelineError::InvalidConfig(ref msg) if msg == "no genome index channel"));
        assert_eq!(fs::read_to_string(dir.path().join(VERSIONS_TSV))?, "STAR\t2.7.11b\n");
        assert!(!dir.path().join("work/fetch_host_index").exists());
        Ok(())
    }
}
