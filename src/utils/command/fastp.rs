use log::debug;

use crate::config::defs::PipelineError;
use crate::utils::command::{quote_path, shell_quote, ScriptTemplate};
use crate::utils::fastx::count_reads;
use crate::utils::process::{Arity, OutputDecl, Process, ResolvedOutputs};
use crate::utils::sample::{Reads, Tuple};

const PAIRED: ScriptTemplate = ScriptTemplate::new(
    "{fastp} --in1 {r1} --in2 {r2} \
     --out1 {id}_trimmed_1.fastq.gz --out2 {id}_trimmed_2.fastq.gz \
     --json {id}.fastp.json --html {id}.fastp.html \
     --thread {threads} {extra}",
);

const SINGLE: ScriptTemplate = ScriptTemplate::new(
    "{fastp} --in1 {r1} --out1 {id}_trimmed.fastq.gz \
     --json {id}.fastp.json --html {id}.fastp.html \
     --thread {threads} {extra}",
);


/// Trimmed reads and the record counts before and after trimming.
#[derive(Debug, Clone, PartialEq)]
pub struct TrimmedReads {
    pub reads: Reads,
    pub raw_count: u64,
    pub trimmed_count: u64,
}

impl TrimmedReads {
    /// Percent of raw records kept; None when the input was empty.
    pub fn percent_kept(&self) -> Option<f64> {
        if self.raw_count == 0 {
            None
        } else {
            Some(self.trimmed_count as f64 / self.raw_count as f64 * 100.0)
        }
    }
}


pub struct FastpTrim {
    pub bin: String,
    pub threads: usize,
    /// Appended to the command line as given.
    pub extra_args: String,
}

impl Process for FastpTrim {
    const NAME: &'static str = "fastp_trim";
    type Input = Tuple<Reads>;
    type Output = Tuple<TrimmedReads>;

    fn outputs(&self) -> Vec<OutputDecl> {
        vec![
            OutputDecl::new("reads", "*_trimmed*.fastq.gz", Arity::Range(1, 2)),
            OutputDecl::new("json", "*.fastp.json", Arity::One),
            OutputDecl::new("html", "*.fastp.html", Arity::One),
        ]
    }

    fn script(&self, input: &Tuple<Reads>) -> Result<String, PipelineError> {
        let mut vars = vec![
            ("fastp", shell_quote(&self.bin)),
            ("r1", quote_path(&input.payload.r1)),
            ("id", shell_quote(input.id())),
            ("threads", self.threads.to_string()),
            ("extra", self.extra_args.clone()),
        ];
        match &input.payload.r2 {
            Some(r2) => {
                vars.push(("r2", quote_path(r2)));
                PAIRED.render(&vars)
            }
            None => SINGLE.render(&vars),
        }
    }

    fn emit(&self, input: Tuple<Reads>, outputs: ResolvedOutputs) -> Result<Tuple<TrimmedReads>, PipelineError> {
        let files = outputs.many("reads");
        let reads = match (input.meta.single_end(), files.as_slice()) {
            (true, [r1]) => Reads::single(r1.clone()),
            (false, [r1, r2]) => Reads::paired(r1.clone(), r2.clone()),
            _ => {
                return Err(PipelineError::OutputCardinality {
                    stage: Self::NAME.to_string(),
                    sample: input.id().to_string(),
                    pattern: "*_trimmed*.fastq.gz".to_string(),
                    expected: if input.meta.single_end() { "1" } else { "2" }.to_string(),
                    found: files.len(),
                });
            }
        };

        let raw_count = count_reads(&input.payload)?;
        let trimmed_count = count_reads(&reads)?;
        debug!("[{}] {}: {} of {} records kept", Self::NAME, input.id(), trimmed_count, raw_count);

        Ok(input.derive(TrimmedReads {
            reads,
            raw_count,
            trimmed_count,
        }))
    }
}
