// src/pipelines/two_pass_align.rs
//! Two-pass STAR alignment. Every sample's first pass contributes its junctions; the
//! merged, filtered table is then fed to every second pass, so no second pass starts
//! before the last first pass has finished.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use log::info;

use crate::config::defs::{PipelineError, RunConfig};
use crate::pipelines::Subworkflow;
use crate::utils::command::star::{Alignment, StarFirstPass, StarSecondPass};
use crate::utils::executor::Executor;
use crate::utils::junctions::merge_junctions;
use crate::utils::operators::{collect, combine, map_value, multi_map, CollectOrder};
use crate::utils::process::run_each;
use crate::utils::sample::{Reads, Tuple};
use crate::utils::streams::{QueueChannel, ValueChannel};

const MERGE_DIR: &str = "merge_junctions";


pub struct TwoPassAlign {
    pub config: Arc<RunConfig>,
}

pub struct AlignInputs {
    pub reads: QueueChannel<Tuple<Reads>>,
    pub genome_index: ValueChannel<PathBuf>,
}

pub struct AlignOutputs {
    pub alignments: QueueChannel<Tuple<Alignment>>,
    pub junctions: ValueChannel<PathBuf>,
}

impl Subworkflow for TwoPassAlign {
    const NAME: &'static str = "two_pass_align";
    type Inputs = AlignInputs;
    type Outputs = AlignOutputs;

    fn wire(&self, exec: &Executor, inputs: AlignInputs) -> Result<AlignOutputs, PipelineError> {
        let config = &self.config;
        let args = &config.args;

        let indexed = combine(exec, "reads_with_genome", &inputs.reads, &inputs.genome_index);
        let [first_in, second_in] = multi_map(exec, "align_split", &indexed, ["first_pass", "second_pass"]);

        let first_pass = StarFirstPass {
            bin: config.tools.star.clone(),
            threads: args.threads,
            annotation: if args.first_pass_annotation {
                config.annotation.clone()
            } else {
                None
            },
        };
        let sample_junctions = run_each(exec, Arc::new(first_pass), &first_in);

        // merged table content must not depend on completion order
        let all_junctions = collect(exec, "first_pass_junctions", &sample_junctions, CollectOrder::ByKey);

        let merge_dir = exec.work_dir().join(MERGE_DIR);
        let (min_length, min_coverage) = (args.min_junction_length, args.min_junction_coverage);
        let junctions = map_value(exec, "merge_junctions", &all_junctions, move |tables: Vec<Tuple<PathBuf>>| {
            fs::create_dir_all(&merge_dir)?;
            let paths: Vec<PathBuf> = tables.into_iter().map(|t| t.payload).collect();
            let (merged, summary) = merge_junctions(&paths, &merge_dir, min_length, min_coverage)?;
            info!(
                "Merged junctions from {} samples: {} read, {} written to {}",
                paths.len(),
                summary.read,
                summary.written,
                merged.display()
            );
            Ok(merged)
        });

        let second_pass = StarSecondPass {
            bin: config.tools.star.clone(),
            samtools: config.tools.samtools.clone(),
            threads: args.threads,
            annotation: config.annotation.clone(),
        };
        let with_junctions = combine(exec, "second_pass_with_junctions", &second_in, &junctions);
        let alignments = run_each(exec, Arc::new(second_pass), &with_junctions);

        Ok(AlignOutputs { alignments, junctions })
    }
}
