use std::fs;
use std::path::{Path, PathBuf};

use log::warn;

use crate::config::defs::PipelineError;
use crate::utils::command::{quote_path, shell_quote, ScriptTemplate};
use crate::utils::metrics::{bam_size_mb, parse_mapping_percent};
use crate::utils::process::{Arity, OutputDecl, Process, ResolvedOutputs};
use crate::utils::sample::{Reads, Tuple};

pub const GENOME_DIR: &str = "star_index";

const GENERATE: ScriptTemplate = ScriptTemplate::new(
    "mkdir -p {dir}\n\
     {star} --runMode genomeGenerate --runThreadN {threads} --genomeDir {dir} \
     --genomeFastaFiles {fasta}{gtf}",
);

const FIRST_PASS: ScriptTemplate = ScriptTemplate::new(
    "{star} --runThreadN {threads} --genomeDir {index} --readFilesIn {reads}{read_cmd}{gtf} \
     --outSAMtype None --outFileNamePrefix {id}.1pass.",
);

const SECOND_PASS: ScriptTemplate = ScriptTemplate::new(
    "{star} --runThreadN {threads} --genomeDir {index} --readFilesIn {reads}{read_cmd}{gtf}{junctions} \
     --outSAMtype BAM SortedByCoordinate --outSAMstrandField intronMotif \
     --outFileNamePrefix {id}.\n\
     {samtools} index {id}.Aligned.sortedByCoord.out.bam",
);


fn reads_arg(reads: &Reads) -> String {
    reads.files().iter().map(|f| quote_path(f)).collect::<Vec<_>>().join(" ")
}

fn read_cmd_arg(reads: &Reads) -> String {
    if reads.is_compressed() {
        " --readFilesCommand zcat".to_string()
    } else {
        String::new()
    }
}

fn gtf_arg(gtf: Option<&Path>) -> String {
    gtf.map(|g| format!(" --sjdbGTFfile {}", quote_path(g)))
        .unwrap_or_default()
}


#[derive(Debug, Clone)]
pub struct GenomeSources {
    pub fasta: PathBuf,
    pub gtf: Option<PathBuf>,
}

pub struct StarGenomeGenerate {
    pub bin: String,
    pub threads: usize,
}

impl Process for StarGenomeGenerate {
    const NAME: &'static str = "star_genome_generate";
    type Input = GenomeSources;
    type Output = PathBuf;

    fn outputs(&self) -> Vec<OutputDecl> {
        vec![OutputDecl::new("index", GENOME_DIR, Arity::One)]
    }

    fn script(&self, input: &GenomeSources) -> Result<String, PipelineError> {
        GENERATE.render(&[
            ("star", shell_quote(&self.bin)),
            ("threads", self.threads.to_string()),
            ("dir", GENOME_DIR.to_string()),
            ("fasta", quote_path(&input.fasta)),
            ("gtf", gtf_arg(input.gtf.as_deref())),
        ])
    }

    fn emit(&self, _input: GenomeSources, outputs: ResolvedOutputs) -> Result<PathBuf, PipelineError> {
        outputs.one("index")
    }
}


/// First pass: junction discovery only, no alignments written.
pub struct StarFirstPass {
    pub bin: String,
    pub threads: usize,
    /// Set only when the first pass should see the annotation.
    pub annotation: Option<PathBuf>,
}

impl Process for StarFirstPass {
    const NAME: &'static str = "star_first_pass";
    type Input = (Tuple<Reads>, PathBuf);
    type Output = Tuple<PathBuf>;

    fn outputs(&self) -> Vec<OutputDecl> {
        vec![OutputDecl::new("junctions", "*.1pass.SJ.out.tab", Arity::One)]
    }

    fn script(&self, (sample, index): &Self::Input) -> Result<String, PipelineError> {
        FIRST_PASS.render(&[
            ("star", shell_quote(&self.bin)),
            ("threads", self.threads.to_string()),
            ("index", quote_path(index)),
            ("reads", reads_arg(&sample.payload)),
            ("read_cmd", read_cmd_arg(&sample.payload)),
            ("gtf", gtf_arg(self.annotation.as_deref())),
            ("id", shell_quote(sample.id())),
        ])
    }

    fn emit(&self, (sample, _): Self::Input, outputs: ResolvedOutputs) -> Result<Tuple<PathBuf>, PipelineError> {
        Ok(sample.derive(outputs.one("junctions")?))
    }
}


/// Coordinate-sorted, indexed alignment with the metrics the summary needs. The BAM size
/// is taken here, before any later stage may reclaim the file.
#[derive(Debug, Clone, PartialEq)]
pub struct Alignment {
    pub bam: PathBuf,
    pub bai: PathBuf,
    pub log: PathBuf,
    pub mapping_percent: f64,
    pub bam_size_mb: f64,
}

pub struct StarSecondPass {
    pub bin: String,
    pub samtools: String,
    pub threads: usize,
    pub annotation: Option<PathBuf>,
}

impl Process for StarSecondPass {
    const NAME: &'static str = "star_second_pass";
    type Input = ((Tuple<Reads>, PathBuf), PathBuf);
    type Output = Tuple<Alignment>;

    fn outputs(&self) -> Vec<OutputDecl> {
        vec![
            OutputDecl::new("bam", "*.Aligned.sortedByCoord.out.bam", Arity::One),
            OutputDecl::new("bai", "*.Aligned.sortedByCoord.out.bam.bai", Arity::One),
            OutputDecl::new("log", "*.Log.final.out", Arity::One),
            OutputDecl::new("junctions", "*.SJ.out.tab", Arity::Optional),
        ]
    }

    fn script(&self, ((sample, index), junctions): &Self::Input) -> Result<String, PipelineError> {
        let junctions_arg = match fs::metadata(junctions) {
            Ok(m) if m.len() > 0 => format!(" --sjdbFileChrStartEnd {}", quote_path(junctions)),
            _ => {
                warn!("[{}] {}: merged junction table is empty, aligning without it", Self::NAME, sample.id());
                String::new()
            }
        };
        SECOND_PASS.render(&[
            ("star", shell_quote(&self.bin)),
            ("samtools", shell_quote(&self.samtools)),
            ("threads", self.threads.to_string()),
            ("index", quote_path(index)),
            ("reads", reads_arg(&sample.payload)),
            ("read_cmd", read_cmd_arg(&sample.payload)),
            ("gtf", gtf_arg(self.annotation.as_deref())),
            ("junctions", junctions_arg),
            ("id", shell_quote(sample.id())),
        ])
    }

    fn emit(&self, ((sample, _), _): Self::Input, outputs: ResolvedOutputs) -> Result<Tuple<Alignment>, PipelineError> {
        let bam = outputs.one("bam")?;
        let log = outputs.one("log")?;
        let mapping_percent = parse_mapping_percent(&fs::read_to_string(&log)?);
        Ok(sample.derive(Alignment {
            bam_size_mb: bam_size_mb(&bam)?,
            bai: outputs.one("bai")?,
            bam,
            log,
            mapping_percent,
        }))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::sample::SampleMeta;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn sample() -> Tuple<Reads> {
        let meta = Arc::new(SampleMeta::new("A", false).unwrap());
        Tuple::new(meta, Reads::paired("/w/A_1.fastq.gz".into(), "/w/A_2.fastq.gz".into()))
    }

    #[test]
    fn test_first_pass_annotation_is_optional() {
        let mut pass = StarFirstPass {
            bin: "STAR".to_string(),
            threads: 4,
            annotation: None,
        };
        let input = (sample(), PathBuf::from("/idx/star"));
        let script = pass.script(&input).unwrap();
        assert_eq!(
            script,
            "STAR --runThreadN 4 --genomeDir /idx/star --readFilesIn /w/A_1.fastq.gz /w/A_2.fastq.gz \
             --readFilesCommand zcat --outSAMtype None --outFileNamePrefix A.1pass."
        );

        pass.annotation = Some(PathBuf::from("/ref/genes.gtf"));
        assert!(pass.script(&input).unwrap().contains("--sjdbGTFfile /ref/genes.gtf"));
    }

    #[test]
    fn test_second_pass_uses_merged_junctions_and_indexes_bam() -> std::io::Result<()> {
        let dir = tempdir()?;
        let junctions = dir.path().join("ALL_SJ_out_filtered.tab");
        fs::write(&junctions, "chr1\t100\t400\t1\t1\t1\t7\t3\t35\n")?;
        let pass = StarSecondPass {
            bin: "STAR".to_string(),
            samtools: "samtools".to_string(),
            threads: 2,
            annotation: None,
        };
        let script = pass
            .script(&((sample(), PathBuf::from("/idx/star")), junctions.clone()))
            .unwrap();
        assert!(script.contains(&format!("--sjdbFileChrStartEnd {}", junctions.display())));
        assert!(script.contains("--outSAMtype BAM SortedByCoordinate"));
        assert!(script.ends_with("samtools index A.Aligned.sortedByCoord.out.bam"));

        fs::write(&junctions, "")?;
        let script = pass
            .script(&((sample(), PathBuf::from("/idx/star")), junctions))
            .unwrap();
        assert!(!script.contains("--sjdbFileChrStartEnd"));
        Ok(())
    }
}
