use std::ffi::OsStr;
use std::fs;
use std::path::PathBuf;

use crate::config::defs::PipelineError;
use crate::utils::command::fastp::TrimmedReads;
use crate::utils::command::{quote_path, shell_quote, ScriptTemplate};
use crate::utils::metrics::parse_retained_percent;
use crate::utils::process::{Arity, OutputDecl, Process, ResolvedOutputs, SINGLE_KEY};
use crate::utils::sample::{Reads, Tuple};

const FILTER_PAIRED: ScriptTemplate = ScriptTemplate::new(
    "{deacon} filter -d -t {threads} {index} {r1} {r2} \
     -o {id}_filtered_1.fastq.gz -O {id}_filtered_2.fastq.gz \
     2> {id}.deacon.log || {{ cat {id}.deacon.log >&2; exit 1; }}",
);

const FILTER_SINGLE: ScriptTemplate = ScriptTemplate::new(
    "{deacon} filter -d -t {threads} {index} {r1} \
     -o {id}_filtered.fastq.gz \
     2> {id}.deacon.log || {{ cat {id}.deacon.log >&2; exit 1; }}",
);

const BUILD: ScriptTemplate = ScriptTemplate::new(
    "{deacon} index build -k {kmer} -w {window} -e {entropy} -t {threads} {genome} > host.idx",
);

const BUILD_WITH_BACKGROUND: ScriptTemplate = ScriptTemplate::new(
    "{deacon} index build -k {kmer} -w {window} -e {entropy} -t {threads} {genome} > host.idx\n\
     {deacon} index build -k {kmer} -w {window} -e {entropy} -t {threads} {background} > background.idx\n\
     {deacon} index diff host.idx background.idx --output final.idx",
);

// Genomes arrive as one comma-joined list; every genome is indexed and the indexes unioned.
const BUILD_MULTI: ScriptTemplate = ScriptTemplate::new(
    "IFS=',' read -ra GENOMES <<< {genomes}\n\
     for g in \"${{GENOMES[@]}}\"; do\n\
     \x20   {deacon} index build -k {kmer} -w {window} -e {entropy} -t {threads} \"$g\" > \"$(basename \"$g\").idx\"\n\
     done\n\
     {deacon} index union *.idx --output multindex.idx",
);

// Runs after the union so the background index stays out of it.
const DIFF_MULTI_BACKGROUND: ScriptTemplate = ScriptTemplate::new(
    "\n{deacon} index build -k {kmer} -w {window} -e {entropy} -t {threads} {background} > background.idx\n\
     {deacon} index diff multindex.idx background.idx --output final.idx",
);


/// Host-depleted reads and the percent deacon retained.
#[derive(Debug, Clone, PartialEq)]
pub struct HostFiltered {
    pub reads: Reads,
    pub retained_percent: f64,
}


pub struct DeaconFilter {
    pub bin: String,
    pub threads: usize,
}

impl Process for DeaconFilter {
    const NAME: &'static str = "deacon_filter";
    type Input = (Tuple<TrimmedReads>, PathBuf);
    type Output = Tuple<HostFiltered>;

    fn outputs(&self) -> Vec<OutputDecl> {
        vec![
            OutputDecl::new("reads", "*_filtered*.fastq.gz", Arity::Range(1, 2)),
            OutputDecl::new("log", "*.deacon.log", Arity::One),
        ]
    }

    fn script(&self, (sample, index): &Self::Input) -> Result<String, PipelineError> {
        let reads = &sample.payload.reads;
        let mut vars = vec![
            ("deacon", shell_quote(&self.bin)),
            ("threads", self.threads.to_string()),
            ("index", quote_path(index)),
            ("r1", quote_path(&reads.r1)),
            ("id", shell_quote(sample.id())),
        ];
        match &reads.r2 {
            Some(r2) => {
                vars.push(("r2", quote_path(r2)));
                FILTER_PAIRED.render(&vars)
            }
            None => FILTER_SINGLE.render(&vars),
        }
    }

    fn emit(&self, (sample, _): Self::Input, outputs: ResolvedOutputs) -> Result<Tuple<HostFiltered>, PipelineError> {
        let files = outputs.many("reads");
        let reads = match files.as_slice() {
            [r1] => Reads::single(r1.clone()),
            [r1, r2] => Reads::paired(r1.clone(), r2.clone()),
            _ => {
                return Err(PipelineError::OutputCardinality {
                    stage: Self::NAME.to_string(),
                    sample: sample.id().to_string(),
                    pattern: "*_filtered*.fastq.gz".to_string(),
                    expected: "1 to 2".to_string(),
                    found: files.len(),
                });
            }
        };
        let log = fs::read_to_string(outputs.one("log")?)?;
        Ok(sample.derive(HostFiltered {
            reads,
            retained_percent: parse_retained_percent(&log),
        }))
    }
}


/// Builds the host index from one genome, minus an optional background set.
pub struct DeaconIndexBuild {
    pub bin: String,
    pub threads: usize,
    pub kmer: usize,
    pub window: usize,
    pub entropy: f64,
}

#[derive(Debug, Clone)]
pub struct IndexSources {
    pub genome: PathBuf,
    pub background: Option<PathBuf>,
}

impl Process for DeaconIndexBuild {
    const NAME: &'static str = "deacon_index_build";
    type Input = IndexSources;
    type Output = PathBuf;

    fn outputs(&self) -> Vec<OutputDecl> {
        vec![OutputDecl::new("index", "*.idx", Arity::AtLeastOne)]
    }

    fn script(&self, input: &IndexSources) -> Result<String, PipelineError> {
        let mut vars = vec![
            ("deacon", shell_quote(&self.bin)),
            ("kmer", self.kmer.to_string()),
            ("window", self.window.to_string()),
            ("entropy", self.entropy.to_string()),
            ("threads", self.threads.to_string()),
            ("genome", quote_path(&input.genome)),
        ];
        match &input.background {
            Some(bg) => {
                vars.push(("background", quote_path(bg)));
                BUILD_WITH_BACKGROUND.render(&vars)
            }
            None => BUILD.render(&vars),
        }
    }

    fn emit(&self, input: IndexSources, outputs: ResolvedOutputs) -> Result<PathBuf, PipelineError> {
        let name = if input.background.is_some() { "final.idx" } else { "host.idx" };
        pick_index::<Self>(&outputs, name)
    }
}


/// The index named `name` among the stage's `*.idx` outputs.
fn pick_index<P: Process>(outputs: &ResolvedOutputs, name: &str) -> Result<PathBuf, PipelineError> {
    outputs
        .many("index")
        .into_iter()
        .find(|p| p.file_name() == Some(OsStr::new(name)))
        .ok_or_else(|| PipelineError::OutputCardinality {
            stage: P::NAME.to_string(),
            sample: SINGLE_KEY.to_string(),
            pattern: name.to_string(),
            expected: "exactly 1".to_string(),
            found: 0,
        })
}


/// Builds one index per genome and unions them, then subtracts the background set
/// when one is given.
pub struct DeaconMultiIndex {
    pub bin: String,
    pub threads: usize,
    pub kmer: usize,
    pub window: usize,
    pub entropy: f64,
}

#[derive(Debug, Clone)]
pub struct MultiIndexSources {
    pub genomes: Vec<PathBuf>,
    pub background: Option<PathBuf>,
}

impl Process for DeaconMultiIndex {
    const NAME: &'static str = "deacon_multi_index";
    type Input = MultiIndexSources;
    type Output = PathBuf;

    fn outputs(&self) -> Vec<OutputDecl> {
        vec![OutputDecl::new("index", "*.idx", Arity::AtLeastOne)]
    }

    fn script(&self, input: &MultiIndexSources) -> Result<String, PipelineError> {
        let joined = input
            .genomes
            .iter()
            .map(|g| g.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(",");
        let mut vars = vec![
            ("deacon", shell_quote(&self.bin)),
            ("kmer", self.kmer.to_string()),
            ("window", self.window.to_string()),
            ("entropy", self.entropy.to_string()),
            ("threads", self.threads.to_string()),
            ("genomes", shell_quote(&joined)),
        ];
        let mut script = BUILD_MULTI.render(&vars)?;
        if let Some(bg) = &input.background {
            vars.push(("background", quote_path(bg)));
            script.push_str(&DIFF_MULTI_BACKGROUND.render(&vars)?);
        }
        Ok(script)
    }

    fn emit(&self, input: MultiIndexSources, outputs: ResolvedOutputs) -> Result<PathBuf, PipelineError> {
        let name = if input.background.is_some() { "final.idx" } else { "multindex.idx" };
        pick_index::<Self>(&outputs, name)
    }
}
