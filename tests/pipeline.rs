#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tempfile::{tempdir, TempDir};

use metassembly_pipelines::config::defs::{PipelineError, RunConfig};
use metassembly_pipelines::pipelines::meta_assembly;
use metassembly_pipelines::Arguments;


const FASTP: &str = r#"#!/usr/bin/env bash
if [ "$1" = "--version" ]; then echo "fastp 0.23.4" >&2; exit 0; fi
while [ $# -gt 0 ]; do
  case "$1" in
    --in1) in1="$2"; shift;;
    --in2) in2="$2"; shift;;
    --out1) out1="$2"; shift;;
    --out2) out2="$2"; shift;;
    --json) json="$2"; shift;;
    --html) html="$2"; shift;;
  esac
  shift
done
cp "$in1" "$out1"
if [ -n "${in2:-}" ]; then cp "$in2" "$out2"; fi
echo '{}' > "$json"
echo '<html></html>' > "$html"
"#;

const DEACON: &str = r#"#!/usr/bin/env bash
if [ "$1" = "--version" ]; then echo "deacon 0.5.0"; exit 0; fi
shift
inputs=()
while [ $# -gt 0 ]; do
  case "$1" in
    -d) ;;
    -t) shift;;
    -o) out1="$2"; shift;;
    -O) out2="$2"; shift;;
    *) inputs+=("$1");;
  esac
  shift
done
cp "${inputs[1]}" "$out1"
if [ -n "${out2:-}" ]; then cp "${inputs[2]}" "$out2"; fi
echo "Retained 1000/1000 sequences (95.500%)" >&2
"#;

const STAR: &str = r#"#!/usr/bin/env bash
if [ "$1" = "--version" ]; then echo "2.7.11b"; exit 0; fi
prefix=""; sam=""
while [ $# -gt 0 ]; do
  case "$1" in
    --outFileNamePrefix) prefix="$2"; shift;;
    --outSAMtype) sam="$2"; shift;;
  esac
  shift
done
if [ "$sam" = "None" ]; then
  printf 'chr1\t100\t400\t1\t1\t0\t7\t0\t35\n' > "${prefix}SJ.out.tab"
else
  head -c 524288 /dev/zero > "${prefix}Aligned.sortedByCoord.out.bam"
  printf '                        Uniquely mapped reads %% |\t87.65%%\n' > "${prefix}Log.final.out"
  printf 'chr1\t100\t400\t1\t1\t1\t7\t0\t35\n' > "${prefix}SJ.out.tab"
fi
"#;

const SAMTOOLS: &str = r#"#!/usr/bin/env bash
if [ "$1" = "--version" ]; then echo "samtools 1.21"; exit 0; fi
touch "$2.bai"
"#;

const STRINGTIE: &str = r#"#!/usr/bin/env bash
if [ "$1" = "--version" ]; then echo "2.2.3"; exit 0; fi
merge=0; out=""
while [ $# -gt 0 ]; do
  case "$1" in
    --merge) merge=1;;
    -o) out="$2"; shift;;
  esac
  shift
done
if [ "$merge" = 1 ]; then
  printf 'chr1\tStringTie\ttranscript\t100\t900\t1000\t+\t.\tgene_id "MSTRG.1"; transcript_id "MSTRG.1.1";\n' > "$out"
else
  printf 'chr1\tStringTie\ttranscript\t100\t900\t1000\t+\t.\tgene_id "S.1"; transcript_id "S.1.1";\n' > "$out"
  printf 'chr1\tStringTie\ttranscript\t950\t1200\t1000\t+\t.\tgene_id "S.2"; transcript_id "S.2.1";\n' >> "$out"
fi
"#;

const FAILING_STRINGTIE: &str = r#"#!/usr/bin/env bash
if [ "$1" = "--version" ]; then echo "2.2.3"; exit 0; fi
echo "assembly exploded" >&2
exit 3
"#;


fn write_tool(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    fs::write(&path, body)?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

fn write_fastq(path: &Path, records: usize) -> Result<()> {
    let mut body = String::new();
    for i in 0..records {
        body.push_str(&format!("@read{}\nACGTACGTAC\n+\nIIIIIIIIII\n", i));
    }
    fs::write(path, body)?;
    Ok(())
}

/// Two paired samples: A with 500 records per mate, B with 5.
fn workspace() -> Result<TempDir> {
    let dir = tempdir()?;
    let reads = dir.path().join("reads");
    fs::create_dir(&reads)?;
    write_fastq(&reads.join("A_R1.fastq"), 500)?;
    write_fastq(&reads.join("A_R2.fastq"), 500)?;
    write_fastq(&reads.join("B_R1.fastq"), 5)?;
    write_fastq(&reads.join("B_R2.fastq"), 5)?;
    fs::write(dir.path().join("host.idx"), b"index")?;
    fs::create_dir(dir.path().join("star_index"))?;

    let bin = dir.path().join("bin");
    fs::create_dir(&bin)?;
    write_tool(&bin, "fastp", FASTP)?;
    write_tool(&bin, "deacon", DEACON)?;
    write_tool(&bin, "STAR", STAR)?;
    write_tool(&bin, "samtools", SAMTOOLS)?;
    write_tool(&bin, "stringtie", STRINGTIE)?;
    write_tool(&bin, "stringtie_fail", FAILING_STRINGTIE)?;
    Ok(dir)
}

/// Builds the run configuration; `overrides` replace the default value of a flag and
/// `switches` are appended as given.
fn config(dir: &Path, overrides: &[(&str, &str)], switches: &[&str]) -> Result<Arc<RunConfig>> {
    let tool = |name: &str| dir.join("bin").join(name).to_string_lossy().into_owned();
    let mut options: Vec<(String, String)> = vec![
        ("-i".to_string(), "reads/*.fastq".to_string()),
        ("--host-index".to_string(), "host.idx".to_string()),
        ("--star-index".to_string(), "star_index".to_string()),
        ("--min-trimmed-reads".to_string(), "100".to_string()),
        ("-t".to_string(), "1".to_string()),
        ("--fastp-bin".to_string(), tool("fastp")),
        ("--deacon-bin".to_string(), tool("deacon")),
        ("--star-bin".to_string(), tool("STAR")),
        ("--samtools-bin".to_string(), tool("samtools")),
        ("--stringtie-bin".to_string(), tool("stringtie")),
    ];
    for (flag, value) in overrides {
        match options.iter_mut().find(|option| option.0 == *flag) {
            Some(option) => option.1 = value.to_string(),
            None => options.push((flag.to_string(), value.to_string())),
        }
    }

    let mut argv = vec!["metassembly".to_string()];
    for (flag, value) in options {
        argv.push(flag);
        argv.push(value);
    }
    argv.extend(switches.iter().map(|s| s.to_string()));
    let args = Arguments::parse_from(argv);
    Ok(Arc::new(RunConfig::from_args(args, dir.to_path_buf(), dir.join("out"), 2)?))
}


#[tokio::test]
async fn test_gated_sample_never_reaches_downstream_stages() -> Result<()> {
    let dir = workspace()?;
    let config = config(dir.path(), &[("--assembly-prefix", "ASM")], &[])?;

    let report = meta_assembly::run(config.clone()).await?;
    assert_eq!(report.passed, vec!["A"]);
    assert_eq!(report.dropped, vec!["B"]);

    // one row, no header; B only got as far as trimming
    let summary = fs::read_to_string(&report.summary_csv)?;
    assert_eq!(summary, "A,A_R1.fastq,A_R2.fastq,1000,100.00,95.50,87.65,0.50,2\n");
    assert!(config.work_dir.join("fastp_trim/B").exists());
    assert!(!config.work_dir.join("deacon_filter/B").exists());
    assert!(!config.work_dir.join("star_first_pass/B").exists());

    let junctions = fs::read_to_string(config.work_dir.join("merge_junctions/ALL_SJ_out_filtered.tab"))?;
    assert!(junctions.starts_with("chr1\t100\t400\t1\t1\t1\t7\t0\t35"));

    let merged_gtf = report.merged_gtf.expect("merged assembly");
    assert_eq!(merged_gtf, dir.path().join("out/merged.gtf"));
    let merged = fs::read_to_string(&merged_gtf)?;
    assert!(merged.contains("gene_id \"ASM_MSTRG.1\"; transcript_id \"ASM_MSTRG.1.1\""));

    let versions = fs::read_to_string(&report.versions)?;
    assert_eq!(versions.lines().count(), 5);
    assert!(versions.contains("STAR\t2.7.11b"));
    Ok(())
}

#[tokio::test]
async fn test_bam_cleanup_after_assembly() -> Result<()> {
    let dir = workspace()?;
    let config = config(dir.path(), &[], &["--cleanup-bam"])?;

    let report = meta_assembly::run(config.clone()).await?;
    let second_pass = config.work_dir.join("star_second_pass/A");
    assert!(!second_pass.join("A.Aligned.sortedByCoord.out.bam").exists());
    assert!(!second_pass.join("A.Aligned.sortedByCoord.out.bam.bai").exists());
    assert!(second_pass.join("A.Log.final.out").exists());

    // size was taken before the BAM was removed
    let summary = fs::read_to_string(&report.summary_csv)?;
    assert!(summary.contains(",0.50,"));
    Ok(())
}

#[tokio::test]
async fn test_stage_failure_is_reported_and_versions_kept() -> Result<()> {
    let dir = workspace()?;
    let failing = dir.path().join("bin/stringtie_fail").to_string_lossy().into_owned();
    let config = config(dir.path(), &[("--stringtie-bin", &failing)], &[])?;

    match meta_assembly::run(config.clone()).await {
        Err(PipelineError::ToolExecution { stage, sample, error }) => {
            assert_eq!(stage, "stringtie_assemble");
            assert_eq!(sample, "A");
            assert!(error.contains("exit status 3"));
            assert!(error.contains("assembly exploded"));
        }
        other => panic!("expected a stringtie failure, got {:?}", other),
    }
    assert!(config.out_dir.join("versions.tsv").exists());
    assert!(!config.out_dir.join("samplesheet.csv").exists());
    Ok(())
}

#[tokio::test]
async fn test_every_sample_gated_is_a_clean_run() -> Result<()> {
    let dir = workspace()?;
    let config = config(dir.path(), &[("--min-trimmed-reads", "100000")], &[])?;

    let report = meta_assembly::run(config.clone()).await?;
    assert!(report.passed.is_empty());
    assert_eq!(report.dropped, vec!["A", "B"]);
    assert_eq!(report.merged_gtf, None);
    assert_eq!(fs::read_to_string(&report.summary_csv)?, "");
    assert!(!config.work_dir.join("stringtie_merge").exists());
    assert!(!config.out_dir.join("merged.gtf").exists());
    assert_eq!(fs::read_to_string(&report.versions)?.lines().count(), 5);
    Ok(())
}

#[tokio::test]
async fn test_missing_reference_fails_before_any_stage() -> Result<()> {
    let dir = workspace()?;
    fs::remove_file(dir.path().join("host.idx"))?;
    let err = config(dir.path(), &[], &[]).err().expect("config must fail");
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::InputResolution(_))
    ));
    assert!(!dir.path().join("out").exists());
    Ok(())
}
