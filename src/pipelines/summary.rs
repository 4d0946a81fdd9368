// src/pipelines/summary.rs
//! Per-sample summary: seven metric channels joined by sample id into one CSV row each.

use std::path::{Path, PathBuf};

use log::info;

use crate::config::defs::PipelineError;
use crate::pipelines::Subworkflow;
use crate::utils::executor::Executor;
use crate::utils::file::file_name;
use crate::utils::operators::{collect, join, map, map_value, CollectOrder, Direction, JoinMode};
use crate::utils::sample::{Reads, Tuple};
use crate::utils::streams::{Keyed, QueueChannel, ValueChannel};


/// One line of the summary CSV. Columns follow `SUMMARY_HEADER`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummaryRow {
    pub id: String,
    pub fastq_1: String,
    pub fastq_2: Option<String>,
    pub reads_after_trim: Option<u64>,
    pub reads_after_trim_percent: Option<f64>,
    pub host_retained_percent: Option<f64>,
    pub mapping_percent: Option<f64>,
    pub bam_size_mb: Option<f64>,
    pub assembled_features: Option<u64>,
}

fn float_field(v: Option<f64>) -> String {
    v.map(|x| format!("{:.2}", x)).unwrap_or_default()
}

fn count_field(v: Option<u64>) -> String {
    v.map(|x| x.to_string()).unwrap_or_default()
}

impl SummaryRow {
    pub fn from_reads(sample: &Tuple<Reads>) -> Self {
        SummaryRow {
            id: sample.id().to_string(),
            fastq_1: file_name(&sample.payload.r1),
            fastq_2: sample.payload.r2.as_deref().map(file_name),
            ..Default::default()
        }
    }

    pub fn to_record(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.fastq_1.clone(),
            self.fastq_2.clone().unwrap_or_default(),
            count_field(self.reads_after_trim),
            float_field(self.reads_after_trim_percent),
            float_field(self.host_retained_percent),
            float_field(self.mapping_percent),
            float_field(self.bam_size_mb),
            count_field(self.assembled_features),
        ]
    }
}

impl Keyed for SummaryRow {
    fn key(&self) -> &str {
        &self.id
    }
}


/// Writes the rows without a header line.
pub fn write_summary(rows: &[SummaryRow], path: &Path) -> Result<PathBuf, PipelineError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(anyhow::Error::from)?;
    for row in rows {
        writer.write_record(row.to_record()).map_err(anyhow::Error::from)?;
    }
    writer.flush()?;
    info!("Wrote {} summary rows to {}", rows.len(), path.display());
    Ok(path.to_path_buf())
}


/// Strict join of `metric` onto the rows, both directions: a sample missing from either
/// side fails the run.
fn attach<M>(
    exec: &Executor,
    name: &str,
    rows: &QueueChannel<SummaryRow>,
    metric: &QueueChannel<Tuple<M>>,
    set: fn(&mut SummaryRow, M),
) -> QueueChannel<SummaryRow>
where
    M: Clone + Send + Sync + 'static,
{
    let joined = join(exec, name, rows, metric, JoinMode::Strict(Direction::Both));
    map(exec, &format!("{}_row", name), &joined, move |(mut row, m): (SummaryRow, Tuple<M>)| {
        set(&mut row, m.payload);
        Ok(row)
    })
}


pub struct SummaryInputs {
    /// Raw reads of the samples that passed the quality gate.
    pub raw_reads: QueueChannel<Tuple<Reads>>,
    pub trimmed_count: QueueChannel<Tuple<u64>>,
    pub trimmed_percent: QueueChannel<Tuple<Option<f64>>>,
    pub retained_percent: QueueChannel<Tuple<f64>>,
    pub mapping_percent: QueueChannel<Tuple<f64>>,
    pub bam_size_mb: QueueChannel<Tuple<f64>>,
    pub assembled: QueueChannel<Tuple<u64>>,
}

pub struct Summary {
    pub out_path: PathBuf,
}

impl Subworkflow for Summary {
    const NAME: &'static str = "summary";
    type Inputs = SummaryInputs;
    type Outputs = ValueChannel<PathBuf>;

    fn wire(&self, exec: &Executor, inputs: SummaryInputs) -> Result<ValueChannel<PathBuf>, PipelineError> {
        let rows = map(exec, "summary_rows", &inputs.raw_reads, |t: Tuple<Reads>| Ok(SummaryRow::from_reads(&t)));
        let rows = attach(exec, "summary_trimmed", &rows, &inputs.trimmed_count, |r, v| {
            r.reads_after_trim = Some(v)
        });
        let rows = attach(exec, "summary_trimmed_percent", &rows, &inputs.trimmed_percent, |r, v| {
            r.reads_after_trim_percent = v
        });
        let rows = attach(exec, "summary_retained", &rows, &inputs.retained_percent, |r, v| {
            r.host_retained_percent = Some(v)
        });
        let rows = attach(exec, "summary_mapping", &rows, &inputs.mapping_percent, |r, v| {
            r.mapping_percent = Some(v)
        });
        let rows = attach(exec, "summary_bam_size", &rows, &inputs.bam_size_mb, |r, v| {
            r.bam_size_mb = Some(v)
        });
        let rows = attach(exec, "summary_assembled", &rows, &inputs.assembled, |r, v| {
            r.assembled_features = Some(v)
        });

        let all_rows = collect(exec, "summary_collect", &rows, CollectOrder::ByKey);
        let out_path = self.out_path.clone();
        Ok(map_value(exec, "summary_csv", &all_rows, move |rows: Vec<SummaryRow>| {
            write_summary(&rows, &out_path)
        }))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defs::SUMMARY_HEADER;
    use crate::utils::sample::SampleMeta;
    use std::fs;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn meta(id: &str, single_end: bool) -> Arc<SampleMeta> {
        Arc::new(SampleMeta::new(id, single_end).unwrap())
    }

    fn channel<P: Clone + Send + Sync + 'static>(name: &str, items: Vec<(Arc<SampleMeta>, P)>) -> QueueChannel<Tuple<P>> {
        QueueChannel::from_items(name, items.into_iter().map(|(m, p)| Tuple::new(m, p))).unwrap()
    }

    fn inputs(a: Arc<SampleMeta>, b: Arc<SampleMeta>, assembled: Vec<(Arc<SampleMeta>, u64)>) -> SummaryInputs {
        SummaryInputs {
            raw_reads: channel("raw", vec![
                (b.clone(), Reads::single(PathBuf::from("/data/B.fastq.gz"))),
                (a.clone(), Reads::paired(PathBuf::from("/data/A_R1.fastq.gz"), PathBuf::from("/data/A_R2.fastq.gz"))),
            ]),
            trimmed_count: channel("count", vec![(a.clone(), 950), (b.clone(), 40)]),
            trimmed_percent: channel("percent", vec![(a.clone(), Some(95.0)), (b.clone(), None)]),
            retained_percent: channel("retained", vec![(b.clone(), 0.0), (a.clone(), 88.123)]),
            mapping_percent: channel("mapping", vec![(a.clone(), 87.65), (b.clone(), 12.5)]),
            bam_size_mb: channel("bam", vec![(a.clone(), 1.5), (b.clone(), 0.25)]),
            assembled: channel("assembled", assembled),
        }
    }

    #[test]
    fn test_row_renders_missing_values_empty() {
        let row = SummaryRow {
            id: "B".to_string(),
            fastq_1: "B.fastq.gz".to_string(),
            reads_after_trim: Some(0),
            mapping_percent: Some(12.5),
            ..Default::default()
        };
        assert_eq!(row.to_record(), vec!["B", "B.fastq.gz", "", "0", "", "", "12.50", "", ""]);
        assert_eq!(row.to_record().len(), SUMMARY_HEADER.len());
    }

    #[tokio::test]
    async fn test_summary_joins_every_metric_sorted_by_id() -> Result<(), PipelineError> {
        let dir = tempdir()?;
        let (a, b) = (meta("A", false), meta("B", true));
        let exec = Executor::new(dir.path().join("work"), 2);
        let summary = Summary { out_path: dir.path().join("samplesheet.csv") };

        let csv = summary.wire(&exec, inputs(a.clone(), b.clone(), vec![(b.clone(), 3), (a.clone(), 12)]))?;
        let path = csv.get().await?;
        exec.finish().await?;

        assert_eq!(
            fs::read_to_string(path)?,
            "A,A_R1.fastq.gz,A_R2.fastq.gz,950,95.00,88.12,87.65,1.50,12\n\
             B,B.fastq.gz,,40,,0.00,12.50,0.25,3\n"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_summary_fails_when_a_metric_is_missing() -> Result<(), PipelineError> {
        let dir = tempdir()?;
        let (a, b) = (meta("A", false), meta("B", true));
        let exec = Executor::new(dir.path().join("work"), 2);
        let summary = Summary { out_path: dir.path().join("samplesheet.csv") };

        let _csv = summary.wire(&exec, inputs(a.clone(), b, vec![(a, 12)]))?;
        let err = exec.finish().await.unwrap_err();
        assert!(matches!(err, PipelineError::JoinMismatch { ref key, side: "left", .. } if key == "B"));
        assert!(!dir.path().join("samplesheet.csv").exists());
        Ok(())
    }
}
