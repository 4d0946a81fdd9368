// src/pipelines/index_prep.rs
//! Resolves the host-depletion index and the STAR genome directory into value channels.
//! The branch taken for each is fixed by the plans in the run configuration.

use std::path::PathBuf;
use std::sync::Arc;

use log::info;

use crate::config::defs::{GenomeIndexPlan, HostIndexPlan, PipelineError, RunConfig};
use crate::pipelines::Subworkflow;
use crate::utils::command::deacon::{DeaconIndexBuild, DeaconMultiIndex, IndexSources, MultiIndexSources};
use crate::utils::command::fetch::FetchIndex;
use crate::utils::command::star::{GenomeSources, StarGenomeGenerate};
use crate::utils::executor::Executor;
use crate::utils::process::run_once;
use crate::utils::streams::ValueChannel;


pub struct IndexPrep {
    pub config: Arc<RunConfig>,
}

pub struct IndexChannels {
    pub host_index: ValueChannel<PathBuf>,
    pub genome_index: ValueChannel<PathBuf>,
}

impl IndexPrep {
    fn host_index(&self, exec: &Executor) -> ValueChannel<PathBuf> {
        let config = &self.config;
        let args = &config.args;
        match &config.host_index {
            HostIndexPlan::Provided(path) => {
                info!("Using host index {}", path.display());
                ValueChannel::of("host_index", path.clone())
            }
            HostIndexPlan::Download(url) => {
                info!("Downloading host index from {}", url);
                let fetch = FetchIndex {
                    bin: config.tools.curl.clone(),
                };
                run_once(exec, Arc::new(fetch), &ValueChannel::of("host_index_url", url.clone()))
            }
            HostIndexPlan::BuildSingle { genome, background } => {
                info!(
                    "Building host index from {}{}",
                    genome.display(),
                    background
                        .as_ref()
                        .map(|b| format!(" minus background {}", b.display()))
                        .unwrap_or_default()
                );
                let build = DeaconIndexBuild {
                    bin: config.tools.deacon.clone(),
                    threads: args.threads,
                    kmer: args.deacon_kmer,
                    window: args.deacon_window,
                    entropy: args.deacon_entropy,
                };
                let sources = IndexSources {
                    genome: genome.clone(),
                    background: background.clone(),
                };
                run_once(exec, Arc::new(build), &ValueChannel::of("host_index_sources", sources))
            }
            HostIndexPlan::BuildMulti { genomes, background } => {
                info!(
                    "Building host multi-index from {} genomes{}",
                    genomes.len(),
                    background
                        .as_ref()
                        .map(|b| format!(" minus background {}", b.display()))
                        .unwrap_or_default()
                );
                let build = DeaconMultiIndex {
                    bin: config.tools.deacon.clone(),
                    threads: args.threads,
                    kmer: args.deacon_kmer,
                    window: args.deacon_window,
                    entropy: args.deacon_entropy,
                };
                let sources = MultiIndexSources {
                    genomes: genomes.clone(),
                    background: background.clone(),
                };
                run_once(exec, Arc::new(build), &ValueChannel::of("host_genomes", sources))
            }
        }
    }

    fn genome_index(&self, exec: &Executor) -> ValueChannel<PathBuf> {
        match &self.config.genome_index {
            GenomeIndexPlan::Provided(dir) => {
                info!("Using STAR index {}", dir.display());
                ValueChannel::of("genome_index", dir.clone())
            }
            GenomeIndexPlan::Build { fasta, gtf } => {
                info!("Building STAR index from {}", fasta.display());
                let generate = StarGenomeGenerate {
                    bin: self.config.tools.star.clone(),
                    threads: self.config.args.threads,
                };
                let sources = GenomeSources {
                    fasta: fasta.clone(),
                    gtf: gtf.clone(),
                };
                run_once(exec, Arc::new(generate), &ValueChannel::of("genome_sources", sources))
            }
        }
    }
}

impl Subworkflow for IndexPrep {
    const NAME: &'static str = "index_prep";
    type Inputs = ();
    type Outputs = IndexChannels;

    fn wire(&self, exec: &Executor, _inputs: ()) -> Result<IndexChannels, PipelineError> {
        Ok(IndexChannels {
            host_index: self.host_index(exec),
            genome_index: self.genome_index(exec),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Arguments;
    use clap::Parser;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_provided_indexes_schedule_nothing() -> Result<(), PipelineError> {
        let dir = tempdir()?;
        fs::write(dir.path().join("host.idx"), b"idx")?;
        fs::create_dir(dir.path().join("star"))?;
        let args = Arguments::parse_from([
            "metassembly",
            "-i", "*.fastq.gz",
            "--host-index", "host.idx",
            "--star-index", "star",
        ]);
        let config = Arc::new(RunConfig::from_args(args, dir.path().to_path_buf(), dir.path().join("out"), 1)?);
        let exec = Executor::new(config.work_dir.clone(), 1);

        let channels = IndexPrep { config: config.clone() }.wire(&exec, ())?;
        assert_eq!(channels.host_index.try_get(), Some(dir.path().join("host.idx")));
        assert_eq!(channels.genome_index.get().await?, dir.path().join("star"));
        exec.finish().await?;
        assert!(!config.work_dir.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_single_build_runs_deacon_once() -> Result<(), PipelineError> {
        let dir = tempdir()?;
        fs::write(dir.path().join("host.fa"), b">chr1\nACGT\n")?;
        fs::create_dir(dir.path().join("star"))?;
        // stand-in builder: prints the genome path as the index body
        let fake = dir.path().join("fake_deacon.sh");
        fs::write(&fake, "#!/bin/sh\nfor last; do :; done\necho \"$last\"\n")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&fake, fs::Permissions::from_mode(0o755))?;
        }
        let args = Arguments::parse_from([
            "metassembly",
            "-i", "*.fastq.gz",
            "--host-genome", "host.fa",
            "--star-index", "star",
            "--deacon-bin", fake.to_str().unwrap(),
        ]);
        let config = Arc::new(RunConfig::from_args(args, dir.path().to_path_buf(), dir.path().join("out"), 1)?);
        let exec = Executor::new(config.work_dir.clone(), 1);

        let channels = IndexPrep { config: config.clone() }.wire(&exec, ())?;
        let index = channels.host_index.get().await?;
        exec.finish().await?;
        assert_eq!(index, config.work_dir.join("deacon_index_build/all/host.idx"));
        assert_eq!(fs::read_to_string(index)?.trim(), dir.path().join("host.fa").to_string_lossy());
        Ok(())
    }

    #[tokio::test]
    async fn test_multi_build_subtracts_background() -> Result<(), PipelineError> {
        let dir = tempdir()?;
        for fasta in ["host.fa", "extra.fa", "phix.fa"] {
            fs::write(dir.path().join(fasta), b">chr1\nACGT\n")?;
        }
        fs::create_dir(dir.path().join("star"))?;
        // stand-in: builds print their genome, union and diff write their first index to --output
        let fake = dir.path().join("fake_deacon.sh");
        fs::write(
            &fake,
            "#!/bin/sh\nfor last; do :; done\nif [ \"$2\" = build ]; then echo \"$last\"; else echo \"$3\" > \"$last\"; fi\n",
        )?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&fake, fs::Permissions::from_mode(0o755))?;
        }
        let args = Arguments::parse_from([
            "metassembly",
            "-i", "*.fastq.gz",
            "--host-index-mode", "multi",
            "--host-genome", "host.fa",
            "--additional-host-genomes", "extra.fa",
            "--host-background", "phix.fa",
            "--star-index", "star",
            "--deacon-bin", fake.to_str().unwrap(),
        ]);
        let config = Arc::new(RunConfig::from_args(args, dir.path().to_path_buf(), dir.path().join("out"), 1)?);
        let exec = Executor::new(config.work_dir.clone(), 1);

        let channels = IndexPrep { config: config.clone() }.wire(&exec, ())?;
        let index = channels.host_index.get().await?;
        exec.finish().await?;
        let stage_dir = config.work_dir.join("deacon_multi_index/all");
        assert_eq!(index, stage_dir.join("final.idx"));
        assert_eq!(fs::read_to_string(&index)?.trim(), "multindex.idx");
        assert_eq!(
            fs::read_to_string(stage_dir.join("background.idx"))?.trim(),
            dir.path().join("phix.fa").to_string_lossy()
        );
        Ok(())
    }
}
