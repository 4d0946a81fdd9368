use std::path::{Path, PathBuf};

use crate::config::defs::{PipelineError, MERGED_ASSEMBLY};
use crate::utils::command::star::Alignment;
use crate::utils::command::{quote_path, shell_quote, ScriptTemplate};
use crate::utils::gtf::count_transcripts;
use crate::utils::process::{Arity, OutputDecl, Process, ResolvedOutputs};
use crate::utils::sample::{Strandedness, Tuple};

const ASSEMBLE: ScriptTemplate = ScriptTemplate::new(
    "{stringtie} {bam} -o {id}.gtf -p {threads} -l {id}{strand}{gtf}",
);

const MERGE: ScriptTemplate = ScriptTemplate::new(
    "printf '%s\\n' {assemblies} > assemblies.txt\n\
     {stringtie} --merge -p {threads}{gtf} -o {output} assemblies.txt",
);


fn gtf_arg(gtf: Option<&Path>) -> String {
    gtf.map(|g| format!(" -G {}", quote_path(g))).unwrap_or_default()
}


#[derive(Debug, Clone, PartialEq)]
pub struct Assembly {
    pub gtf: PathBuf,
    pub transcripts: u64,
}


/// Per-sample transcript assembly. With `cleanup_bam` set, the sample's BAM and index are
/// deleted once the assembly has been written.
pub struct StringTieAssemble {
    pub bin: String,
    pub threads: usize,
    pub annotation: Option<PathBuf>,
    pub cleanup_bam: bool,
}

impl Process for StringTieAssemble {
    const NAME: &'static str = "stringtie_assemble";
    type Input = Tuple<Alignment>;
    type Output = Tuple<Assembly>;

    fn outputs(&self) -> Vec<OutputDecl> {
        vec![OutputDecl::new("gtf", "*.gtf", Arity::One)]
    }

    fn script(&self, input: &Tuple<Alignment>) -> Result<String, PipelineError> {
        let strand = match input.meta.strandedness() {
            Some(Strandedness::Reverse) => " --rf",
            Some(Strandedness::Forward) => " --fr",
            Some(Strandedness::Unstranded) | None => "",
        };
        ASSEMBLE.render(&[
            ("stringtie", shell_quote(&self.bin)),
            ("bam", quote_path(&input.payload.bam)),
            ("id", shell_quote(input.id())),
            ("threads", self.threads.to_string()),
            ("strand", strand.to_string()),
            ("gtf", gtf_arg(self.annotation.as_deref())),
        ])
    }

    fn emit(&self, input: Tuple<Alignment>, outputs: ResolvedOutputs) -> Result<Tuple<Assembly>, PipelineError> {
        let gtf = outputs.one("gtf")?;
        let transcripts = count_transcripts(&gtf)?;
        Ok(input.derive(Assembly { gtf, transcripts }))
    }

    fn cleanup(&self, input: &Tuple<Alignment>) -> Vec<PathBuf> {
        if self.cleanup_bam {
            vec![input.payload.bam.clone(), input.payload.bai.clone()]
        } else {
            Vec::new()
        }
    }
}


/// Joint assembly over every sample's GTF.
pub struct StringTieMerge {
    pub bin: String,
    pub threads: usize,
    pub annotation: Option<PathBuf>,
}

impl Process for StringTieMerge {
    const NAME: &'static str = "stringtie_merge";
    type Input = Vec<Tuple<Assembly>>;
    type Output = PathBuf;

    fn outputs(&self) -> Vec<OutputDecl> {
        vec![OutputDecl::new("gtf", MERGED_ASSEMBLY, Arity::One)]
    }

    fn script(&self, assemblies: &Vec<Tuple<Assembly>>) -> Result<String, PipelineError> {
        if assemblies.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "stringtie --merge needs at least one sample assembly".to_string(),
            ));
        }
        let list = assemblies
            .iter()
            .map(|a| quote_path(&a.payload.gtf))
            .collect::<Vec<_>>()
            .join(" ");
        MERGE.render(&[
            ("stringtie", shell_quote(&self.bin)),
            ("threads", self.threads.to_string()),
            ("gtf", gtf_arg(self.annotation.as_deref())),
            ("output", MERGED_ASSEMBLY.to_string()),
            ("assemblies", list),
        ])
    }

    fn emit(&self, _assemblies: Vec<Tuple<Assembly>>, outputs: ResolvedOutputs) -> Result<PathBuf, PipelineError> {
        outputs.one("gtf")
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::sample::SampleMeta;
    use std::sync::Arc;

    fn alignment(id: &str, strandedness: Option<Strandedness>) -> Tuple<Alignment> {
        let mut meta = SampleMeta::new(id, false).unwrap();
        if let Some(s) = strandedness {
            meta = meta.with_strandedness(s);
        }
        Tuple::new(Arc::new(meta), Alignment {
            bam: PathBuf::from(format!("/w/{}.Aligned.sortedByCoord.out.bam", id)),
            bai: PathBuf::from(format!("/w/{}.Aligned.sortedByCoord.out.bam.bai", id)),
            log: PathBuf::from(format!("/w/{}.Log.final.out", id)),
            mapping_percent: 90.0,
            bam_size_mb: 12.5,
        })
    }

    #[test]
    fn test_assemble_strand_flags_and_cleanup() {
        let mut stage = StringTieAssemble {
            bin: "stringtie".to_string(),
            threads: 4,
            annotation: None,
            cleanup_bam: false,
        };
        let reverse = alignment("A", Some(Strandedness::Reverse));
        assert_eq!(
            stage.script(&reverse).unwrap(),
            "stringtie /w/A.Aligned.sortedByCoord.out.bam -o A.gtf -p 4 -l A --rf"
        );
        assert!(stage.script(&alignment("B", None)).unwrap().ends_with("-l B"));
        assert!(stage.cleanup(&reverse).is_empty());

        stage.cleanup_bam = true;
        assert_eq!(stage.cleanup(&reverse).len(), 2);
    }

    #[test]
    fn test_merge_lists_every_assembly() {
        let merge = StringTieMerge {
            bin: "stringtie".to_string(),
            threads: 2,
            annotation: Some(PathBuf::from("/ref/genes.gtf")),
        };
        let assemblies: Vec<Tuple<Assembly>> = ["A", "B"]
            .iter()
            .map(|id| {
                alignment(id, None).derive(Assembly {
                    gtf: PathBuf::from(format!("/w/{}.gtf", id)),
                    transcripts: 3,
                })
            })
            .collect();
        let script = merge.script(&assemblies).unwrap();
        assert_eq!(
            script,
            "printf '%s\\n' /w/A.gtf /w/B.gtf > assemblies.txt\n\
             stringtie --merge -p 2 -G /ref/genes.gtf -o merged.gtf assemblies.txt"
        );
        assert!(matches!(merge.script(&Vec::new()), Err(PipelineError::InvalidConfig(_))));
    }
}
