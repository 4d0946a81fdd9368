use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use log::info;


/// Number of `transcript` features in a GTF.
pub fn count_transcripts(path: &Path) -> io::Result<u64> {
    let reader = BufReader::new(File::open(path)?);
    let mut count = 0;
    for line in reader.lines() {
        let line = line?;
        if line.starts_with('#') {
            continue;
        }
        if line.split('\t').nth(2) == Some("transcript") {
            count += 1;
        }
    }
    Ok(count)
}


/// Prefixes the `gene_id` and `transcript_id` values of every feature with `prefix_`.
/// Comment lines pass through; lines with fewer than nine columns are dropped. Only the
/// first token of each attribute value is kept.
///
/// # Arguments
///
/// * `input` - Source GTF.
/// * `prefix` - Prefix, e.g. an assembly name.
/// * `output` - Destination GTF.
///
/// # Returns
/// Number of feature lines written.
pub fn rename_gtf(input: &Path, prefix: &str, output: &Path) -> io::Result<u64> {
    let reader = BufReader::new(File::open(input)?);
    let mut writer = BufWriter::new(File::create(output)?);
    let mut written = 0;

    for line in reader.lines() {
        let line = line?;
        if line.starts_with('#') {
            writeln!(writer, "{}", line)?;
            continue;
        }
        let mut fields: Vec<String> = line.trim().split('\t').map(|f| f.to_string()).collect();
        if fields.len() < 9 {
            continue;
        }

        let mut attributes: Vec<(String, String)> = Vec::new();
        for attr in fields[8].split(';') {
            let tokens: Vec<&str> = attr.trim().split(' ').collect();
            if tokens.len() < 2 {
                continue;
            }
            let (key, mut value) = (tokens[0].to_string(), tokens[1].to_string());
            if key == "gene_id" || key == "transcript_id" {
                value = format!("\"{}_{}\"", prefix, value.trim_matches('"'));
            }
            match attributes.iter_mut().find(|(k, _)| *k == key) {
                Some(existing) => existing.1 = value,
                None => attributes.push((key, value)),
            }
        }

        fields[8] = attributes
            .iter()
            .map(|(k, v)| if k == "gene_id" { format!("{} {}", k, v) } else { format!(" {} {}", k, v) })
            .collect::<Vec<_>>()
            .join(";");
        writeln!(writer, "{}", fields.join("\t"))?;
        written += 1;
    }
    writer.flush()?;
    info!("Renamed {} features of {} with prefix {}", written, input.display(), prefix);
    Ok(written)
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const GTF: &str = "# stringtie --merge\n\
chr1\tStringTie\ttranscript\t100\t900\t1000\t+\t.\tgene_id \"MSTRG.1\"; transcript_id \"MSTRG.1.1\"; \n\
chr1\tStringTie\texon\t100\t300\t1000\t+\t.\tgene_id \"MSTRG.1\"; transcript_id \"MSTRG.1.1\"; exon_number \"1\";\n\
chr2\tStringTie\ttranscript\t50\t500\t1000\t-\t.\tgene_id \"MSTRG.2\"; transcript_id \"MSTRG.2.1\";\n\
short\tline\n";

    #[test]
    fn test_count_transcripts() -> io::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("A.gtf");
        fs::write(&path, GTF)?;
        assert_eq!(count_transcripts(&path)?, 2);
        Ok(())
    }

    #[test]
    fn test_rename_gtf_prefixes_ids() -> io::Result<()> {
        let dir = tempdir()?;
        let input = dir.path().join("merged.gtf");
        let output = dir.path().join("renamed.gtf");
        fs::write(&input, GTF)?;

        assert_eq!(rename_gtf(&input, "liver", &output)?, 3);
        let renamed = fs::read_to_string(&output)?;
        let lines: Vec<&str> = renamed.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "# stringtie --merge");
        assert!(lines[1].ends_with("\tgene_id \"liver_MSTRG.1\"; transcript_id \"liver_MSTRG.1.1\""));
        assert!(lines[2].ends_with("; exon_number \"1\""));
        Ok(())
    }
}
