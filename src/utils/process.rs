// src/utils/process.rs
//! Stage invocation: one external command per input tuple, run in its own work
//! directory, with declared output globs resolved and checked afterwards.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use fxhash::{FxHashMap as HashMap, FxHashSet as HashSet};
use log::{debug, info, warn};
use tokio::fs;
use tokio::process::Command;

use crate::config::defs::PipelineError;
use crate::utils::executor::Executor;
use crate::utils::streams::{Keyed, QueueChannel, ValueChannel};

const SCRIPT_FILE: &str = ".command.sh";
const STDOUT_FILE: &str = ".command.out";
const STDERR_FILE: &str = ".command.err";
const STDERR_TAIL_LINES: usize = 20;
/// Instance key used by stages that run once over a collected or shared value.
pub const SINGLE_KEY: &str = "all";


/// How many files a declared output pattern must match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    One,
    Optional,
    AtLeastOne,
    Any,
    Range(usize, usize),
}

impl Arity {
    pub fn accepts(&self, n: usize) -> bool {
        match *self {
            Arity::One => n == 1,
            Arity::Optional => n <= 1,
            Arity::AtLeastOne => n >= 1,
            Arity::Any => true,
            Arity::Range(min, max) => n >= min && n <= max,
        }
    }

    fn describe(&self) -> String {
        match *self {
            Arity::One => "exactly 1".to_string(),
            Arity::Optional => "0 or 1".to_string(),
            Arity::AtLeastOne => "at least 1".to_string(),
            Arity::Any => "any number of".to_string(),
            Arity::Range(min, max) => format!("{} to {}", min, max),
        }
    }
}


/// A named output channel of a stage and the glob that fills it.
#[derive(Debug, Clone)]
pub struct OutputDecl {
    pub channel: &'static str,
    pub pattern: String,
    pub arity: Arity,
}

impl OutputDecl {
    pub fn new(channel: &'static str, pattern: impl Into<String>, arity: Arity) -> Self {
        OutputDecl {
            channel,
            pattern: pattern.into(),
            arity,
        }
    }
}


/// Files matched by each declared output, sorted by path.
#[derive(Debug, Default)]
pub struct ResolvedOutputs {
    work_dir: PathBuf,
    files: HashMap<&'static str, Vec<PathBuf>>,
}

impl ResolvedOutputs {
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn many(&self, channel: &str) -> Vec<PathBuf> {
        self.files.get(channel).cloned().unwrap_or_default()
    }

    pub fn optional(&self, channel: &str) -> Option<PathBuf> {
        self.files.get(channel).and_then(|f| f.first().cloned())
    }

    pub fn one(&self, channel: &str) -> Result<PathBuf, PipelineError> {
        self.optional(channel).ok_or_else(|| {
            PipelineError::Other(anyhow::anyhow!(
                "output channel '{}' resolved no file in {}",
                channel,
                self.work_dir.display()
            ))
        })
    }
}


/// An external-command stage.
///
/// `script` renders the shell body executed in the instance work directory. `emit` runs on
/// a blocking thread once the command succeeded and its outputs were resolved, so it may
/// read output files. Paths returned by `cleanup` are deleted only after `emit` returned.
pub trait Process: Send + Sync + 'static {
    const NAME: &'static str;
    type Input: Clone + Send + Sync + 'static;
    type Output: Clone + Send + Sync + 'static;

    fn outputs(&self) -> Vec<OutputDecl>;

    fn script(&self, input: &Self::Input) -> Result<String, PipelineError>;

    fn emit(&self, input: Self::Input, outputs: ResolvedOutputs) -> Result<Self::Output, PipelineError>;

    fn cleanup(&self, _input: &Self::Input) -> Vec<PathBuf> {
        Vec::new()
    }
}


async fn stderr_tail(path: &Path) -> String {
    match fs::read_to_string(path).await {
        Ok(text) => {
            let lines: Vec<&str> = text.lines().collect();
            let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
            lines[start..].join("\n")
        }
        Err(_) => String::new(),
    }
}


fn resolve_outputs(
    stage: &str,
    key: &str,
    work_dir: &Path,
    decls: &[OutputDecl],
) -> Result<ResolvedOutputs, PipelineError> {
    let mut files = HashMap::default();
    for decl in decls {
        let pattern = work_dir.join(&decl.pattern);
        let mut matched: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
            .map_err(|e| PipelineError::InvalidConfig(format!("bad output pattern '{}': {}", decl.pattern, e)))?
            .filter_map(Result::ok)
            .collect();
        matched.sort();
        if !decl.arity.accepts(matched.len()) {
            return Err(PipelineError::OutputCardinality {
                stage: stage.to_string(),
                sample: key.to_string(),
                pattern: decl.pattern.clone(),
                expected: decl.arity.describe(),
                found: matched.len(),
            });
        }
        files.insert(decl.channel, matched);
    }
    Ok(ResolvedOutputs {
        work_dir: work_dir.to_path_buf(),
        files,
    })
}


/// Runs one stage instance to completion.
///
/// # Arguments
///
/// * `exec` - Provides the work directory root.
/// * `process` - Stage description.
/// * `input` - Resolved input.
/// * `key` - Instance key; names the work directory `<work>/<stage>/<key>`.
///
/// # Returns
/// The emitted output, or the first error of the instance.
pub async fn execute_instance<P: Process>(
    exec: &Executor,
    process: Arc<P>,
    input: P::Input,
    key: &str,
) -> Result<P::Output, PipelineError> {
    let start = Instant::now();
    let dir = exec.work_dir().join(P::NAME).join(key);
    if fs::try_exists(&dir).await? {
        fs::remove_dir_all(&dir).await?;
    }
    fs::create_dir_all(&dir).await?;

    let body = process.script(&input)?;
    let script = format!("#!/usr/bin/env bash\nset -euo pipefail\n{}\n", body.trim_end());
    fs::write(dir.join(SCRIPT_FILE), &script).await?;
    debug!("[{}] {} script:\n{}", P::NAME, key, body.trim_end());

    let stdout = std::fs::File::create(dir.join(STDOUT_FILE))?;
    let stderr = std::fs::File::create(dir.join(STDERR_FILE))?;
    let status = Command::new("bash")
        .arg(SCRIPT_FILE)
        .current_dir(&dir)
        .stdin(std::process::Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .status()
        .await
        .map_err(|e| PipelineError::ToolExecution {
            stage: P::NAME.to_string(),
            sample: key.to_string(),
            error: format!("failed to spawn bash: {}", e),
        })?;

    if !status.success() {
        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let tail = stderr_tail(&dir.join(STDERR_FILE)).await;
        return Err(PipelineError::ToolExecution {
            stage: P::NAME.to_string(),
            sample: key.to_string(),
            error: format!("exit status {} (work dir {}): {}", code, dir.display(), tail),
        });
    }

    let resolved = resolve_outputs(P::NAME, key, &dir, &process.outputs())?;
    let cleanup = process.cleanup(&input);
    let emitter = process.clone();
    let output = tokio::task::spawn_blocking(move || emitter.emit(input, resolved)).await??;

    for path in cleanup {
        match fs::remove_file(&path).await {
            Ok(()) => debug!("[{}] {} removed {}", P::NAME, key, path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("[{}] {} could not remove {}: {}", P::NAME, key, path.display(), e),
        }
    }

    info!("[{}] {} completed in {:.2?}", P::NAME, key, start.elapsed());
    Ok(output)
}


/// Drives `process` over every tuple of `input`, one instance per distinct key, in
/// parallel within the executor's budget. A repeated key is skipped with a warning.
/// After the first failure no new instance is started.
pub fn run_each<P>(exec: &Executor, process: Arc<P>, input: &QueueChannel<P::Input>) -> QueueChannel<P::Output>
where
    P: Process,
    P::Input: Keyed,
{
    let (tx, output) = QueueChannel::new(P::NAME);
    let tx = Arc::new(tx);
    let mut sub = input.subscribe();
    let driver = exec.clone();

    exec.spawn(format!("{} driver", P::NAME), async move {
        let mut seen: HashSet<String> = HashSet::default();
        while let Some(item) = sub.next().await {
            let key = item.key().to_string();
            if !seen.insert(key.clone()) {
                warn!("[{}] {} already scheduled, skipping duplicate input", P::NAME, key);
                continue;
            }
            if driver.is_halted() {
                info!("[{}] run halted, not scheduling further instances", P::NAME);
                break;
            }

            let (ex, process, tx) = (driver.clone(), process.clone(), tx.clone());
            driver.spawn(format!("{} ({})", P::NAME, key), async move {
                let _permit = ex.acquire().await?;
                if ex.is_halted() {
                    debug!("[{}] {} not started, run halted", P::NAME, key);
                    return Ok(());
                }
                let out = execute_instance(&ex, process, item, &key).await?;
                tx.emit(out)
            });
        }
        Ok(())
    });
    output
}


/// Drives `process` once, over the single value of `input`.
pub fn run_once<P: Process>(exec: &Executor, process: Arc<P>, input: &ValueChannel<P::Input>) -> ValueChannel<P::Output> {
    let (setter, output) = ValueChannel::pending(P::NAME);
    let input = input.clone();
    let ex = exec.clone();
    exec.spawn(P::NAME, async move {
        let value = input.get().await?;
        let _permit = ex.acquire().await?;
        if ex.is_halted() {
            debug!("[{}] not started, run halted", P::NAME);
            return Ok(());
        }
        let out = execute_instance(&ex, process, value, SINGLE_KEY).await?;
        setter.set(out);
        Ok(())
    });
    output
}


/// Like [`run_once`] for an input that may be absent. `None` resolves the output to `None`
/// and the stage never runs, so no work directory is created for it.
pub fn run_once_if_present<P: Process>(
    exec: &Executor,
    process: Arc<P>,
    input: &ValueChannel<Option<P::Input>>,
) -> ValueChannel<Option<P::Output>> {
    let (setter, output) = ValueChannel::pending(P::NAME);
    let input = input.clone();
    let ex = exec.clone();
    exec.spawn(P::NAME, async move {
        let Some(value) = input.get().await? else {
            info!("[{}] skipped, no input", P::NAME);
            setter.set(None);
            return Ok(());
        };
        let _permit = ex.acquire().await?;
        if ex.is_halted() {
            debug!("[{}] not started, run halted", P::NAME);
            return Ok(());
        }
        let out = execute_instance(&ex, process, value, SINGLE_KEY).await?;
        setter.set(Some(out));
        Ok(())
    });
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::sample::{SampleMeta, Tuple};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct Echo {
        body: &'static str,
        arity: Arity,
        emitted: Arc<AtomicUsize>,
    }

    impl Process for Echo {
        const NAME: &'static str = "echo";
        type Input = Tuple<u32>;
        type Output = Tuple<Vec<PathBuf>>;

        fn outputs(&self) -> Vec<OutputDecl> {
            vec![OutputDecl::new("txt", "*.txt", self.arity)]
        }

        fn script(&self, input: &Tuple<u32>) -> Result<String, PipelineError> {
            Ok(self.body.replace("ID", input.id()))
        }

        fn emit(&self, input: Tuple<u32>, outputs: ResolvedOutputs) -> Result<Self::Output, PipelineError> {
            self.emitted.fetch_add(1, Ordering::SeqCst);
            Ok(input.derive(outputs.many("txt")))
        }
    }

    fn echo(body: &'static str, arity: Arity) -> (Arc<Echo>, Arc<AtomicUsize>) {
        let emitted = Arc::new(AtomicUsize::new(0));
        (Arc::new(Echo { body, arity, emitted: emitted.clone() }), emitted)
    }

    fn tuple(id: &str) -> Tuple<u32> {
        Tuple::new(Arc::new(SampleMeta::new(id, true).unwrap()), 0)
    }

    #[test]
    fn test_arity() {
        assert!(Arity::One.accepts(1) && !Arity::One.accepts(0) && !Arity::One.accepts(2));
        assert!(Arity::Optional.accepts(0) && !Arity::Optional.accepts(2));
        assert!(Arity::Range(1, 2).accepts(2) && !Arity::Range(1, 2).accepts(3));
        assert!(Arity::Any.accepts(0));
    }

    #[tokio::test]
    async fn test_instance_runs_in_own_directory() -> Result<(), PipelineError> {
        let dir = tempdir()?;
        let exec = Executor::new(dir.path(), 2);
        let (process, _) = echo("echo hello > ID.txt", Arity::One);
        let out = execute_instance(&exec, process, tuple("S1"), "S1").await?;
        let expected = dir.path().join("echo").join("S1").join("S1.txt");
        assert_eq!(out.payload, vec![expected.clone()]);
        assert_eq!(std::fs::read_to_string(expected)?, "hello\n");
        assert!(dir.path().join("echo/S1/.command.sh").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_output_cardinality_is_enforced() {
        let dir = tempdir().unwrap();
        let exec = Executor::new(dir.path(), 2);
        let (process, emitted) = echo("touch a.txt b.txt", Arity::One);
        let result = execute_instance(&exec, process, tuple("S1"), "S1").await;
        match result {
            Err(PipelineError::OutputCardinality { stage, sample, found, .. }) => {
                assert_eq!(stage, "echo");
                assert_eq!(sample, "S1");
                assert_eq!(found, 2);
            }
            other => panic!("expected cardinality error, got {:?}", other.err()),
        }
        assert_eq!(emitted.load(Ordering::SeqCst), 0);

        let (process, _) = echo("true", Arity::One);
        assert!(matches!(
            execute_instance(&exec, process, tuple("S2"), "S2").await,
            Err(PipelineError::OutputCardinality { found: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_non_zero_exit_names_stage_and_sample() {
        let dir = tempdir().unwrap();
        let exec = Executor::new(dir.path(), 2);
        let (process, _) = echo("echo 'index missing' >&2\nexit 3", Arity::Any);
        match execute_instance(&exec, process, tuple("B"), "B").await {
            Err(PipelineError::ToolExecution { stage, sample, error }) => {
                assert_eq!(stage, "echo");
                assert_eq!(sample, "B");
                assert!(error.contains("exit status 3"));
                assert!(error.contains("index missing"));
            }
            other => panic!("expected tool failure, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_run_each_skips_duplicate_keys() -> Result<(), PipelineError> {
        let dir = tempdir()?;
        let exec = Executor::new(dir.path(), 4);
        let (process, emitted) = echo("echo ID > ID.txt", Arity::One);
        let input = QueueChannel::from_items("in", vec![tuple("A"), tuple("B"), tuple("A")])?;
        let out = run_each(&exec, process, &input);
        exec.finish().await?;
        assert_eq!(emitted.load(Ordering::SeqCst), 2);
        assert_eq!(out.emitted(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_run_each_stops_scheduling_after_failure() {
        let dir = tempdir().unwrap();
        let exec = Executor::new(dir.path(), 1);
        let (process, emitted) = echo("exit 1", Arity::Any);
        let (tx, input) = QueueChannel::new("in");
        let _out = run_each(&exec, process, &input);
        tx.emit(tuple("A")).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        tx.emit(tuple("B")).unwrap();
        drop(tx);
        assert!(matches!(exec.finish().await, Err(PipelineError::ToolExecution { .. })));
        assert_eq!(emitted.load(Ordering::SeqCst), 0);
        assert!(!dir.path().join("echo").join("B").exists());
    }

    #[tokio::test]
    async fn test_absent_single_input_skips_stage() -> Result<(), PipelineError> {
        let dir = tempdir()?;
        let exec = Executor::new(dir.path(), 2);
        let (process, emitted) = echo("echo ID > ID.txt", Arity::One);
        let skipped = run_once_if_present(&exec, process.clone(), &ValueChannel::of("none", None));
        let ran = run_once_if_present(&exec, process, &ValueChannel::of("some", Some(tuple("all"))));
        exec.finish().await?;

        assert_eq!(skipped.try_get(), Some(None));
        let out = ran.try_get().flatten().expect("stage ran");
        assert_eq!(out.payload, vec![dir.path().join("echo/all/all.txt")]);
        assert_eq!(emitted.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
