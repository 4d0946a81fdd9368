//! Script templates, tool version probes and the stage wrappers of each external tool.

pub mod deacon;
pub mod fastp;
pub mod fetch;
pub mod star;
pub mod stringtie;

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use futures::future::try_join_all;
use log::{debug, info};
use shell_escape::unix::escape;
use tokio::process::Command;

use crate::config::defs::PipelineError;


/// Shell script body with `{name}` placeholders. `{{` and `}}` render literal braces.
#[derive(Debug, Clone, Copy)]
pub struct ScriptTemplate {
    text: &'static str,
}

impl ScriptTemplate {
    pub const fn new(text: &'static str) -> Self {
        ScriptTemplate { text }
    }

    /// Substitutes every placeholder. Values are inserted verbatim, so paths should be
    /// passed through [`shell_quote`] first.
    ///
    /// # Arguments
    ///
    /// * `vars` - `(name, value)` pairs.
    ///
    /// # Returns
    /// Rendered script, or InvalidConfig on an unknown or unterminated placeholder.
    pub fn render(&self, vars: &[(&str, String)]) -> Result<String, PipelineError> {
        let mut out = String::with_capacity(self.text.len());
        let mut chars = self.text.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    out.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    out.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(ch) => name.push(ch),
                            None => {
                                return Err(PipelineError::InvalidConfig(format!(
                                    "unterminated placeholder '{{{}' in script template",
                                    name
                                )));
                            }
                        }
                    }
                    let value = vars
                        .iter()
                        .find(|(k, _)| *k == name)
                        .map(|(_, v)| v.as_str())
                        .ok_or_else(|| {
                            PipelineError::InvalidConfig(format!("no value for placeholder '{{{}}}'", name))
                        })?;
                    out.push_str(value);
                }
                _ => out.push(c),
            }
        }
        Ok(out)
    }
}


/// Quotes a word for the stage's bash script when it holds anything beyond plain
/// path characters.
pub fn shell_quote(s: &str) -> String {
    escape(Cow::from(s)).into_owned()
}

pub fn quote_path(path: &Path) -> String {
    escape(path.to_string_lossy()).into_owned()
}


/// Probes `bin --version` and returns the first non-empty line of its output
/// (stdout, else stderr; several tools print their version on stderr).
///
/// # Arguments
///
/// * `tool` - Tag used in messages, e.g. `STAR`.
/// * `bin` - Executable name or path.
///
/// # Returns
/// Version line, or InputResolution when the tool cannot be spawned or prints nothing.
pub async fn check_version(tool: &str, bin: &str) -> Result<String, PipelineError> {
    let output = Command::new(bin)
        .arg("--version")
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| {
            PipelineError::InputResolution(format!("Failed to spawn {} ({}): {}. Is {} installed?", tool, bin, e, tool))
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let version = stdout
        .lines()
        .chain(stderr.lines())
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| PipelineError::InputResolution(format!("No output from {} --version", tool)))?
        .to_string();
    debug!("{} version: {}", tool, version);
    Ok(version)
}


/// Append-only record of tool versions, owned by the run and flushed once.
#[derive(Debug, Default)]
pub struct VersionCollector {
    versions: Mutex<BTreeMap<String, String>>,
}

impl VersionCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, tool: &str, version: &str) {
        self.versions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(tool.to_string(), version.to_string());
    }

    /// Probes every tool concurrently. The first tool that cannot be run fails the call.
    pub async fn check_versions(&self, tools: &[(&str, &str)]) -> Result<(), PipelineError> {
        let versions = try_join_all(tools.iter().map(|(tool, bin)| async move {
            check_version(tool, bin).await.map(|v| (*tool, v))
        }))
        .await?;
        for (tool, version) in versions {
            self.record(tool, &version);
        }
        Ok(())
    }

    /// Writes `tool<TAB>version` lines sorted by tool.
    pub fn write_tsv(&self, path: &Path) -> Result<PathBuf, PipelineError> {
        let versions = self
            .versions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_path(path)
            .map_err(anyhow::Error::from)?;
        for (tool, version) in versions.iter() {
            writer.write_record([tool, version]).map_err(anyhow::Error::from)?;
        }
        writer.flush()?;
        info!("Recorded {} tool versions in {}", versions.len(), path.display());
        Ok(path.to_path_buf())
    }
}
