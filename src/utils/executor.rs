// src/utils/executor.rs: Scheduling contract for stage instances and operators
//!
//! Every driver, operator and stage instance runs as a task tracked here. The executor
//! owns the global resource budget (one semaphore permit per running stage instance)
//! and the failure policy: the first fatal error is kept, no new instance is scheduled
//! afterwards, and instances already running are left to finish.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use log::{debug, error, warn};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::config::defs::PipelineError;


struct ExecutorInner {
    work_dir: PathBuf,
    permits: Arc<Semaphore>,
    halted: AtomicBool,
    failure: Mutex<Option<PipelineError>>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

impl Executor {
    /// # Arguments
    ///
    /// * `work_dir` - Root under which each stage instance gets its own directory.
    /// * `max_parallel` - Number of stage instances allowed to run at once.
    pub fn new(work_dir: impl Into<PathBuf>, max_parallel: usize) -> Self {
        Executor {
            inner: Arc::new(ExecutorInner {
                work_dir: work_dir.into(),
                permits: Arc::new(Semaphore::new(max_parallel.max(1))),
                halted: AtomicBool::new(false),
                failure: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.inner.work_dir
    }

    /// Spawns a tracked task. An error it returns is recorded as a pipeline failure.
    pub fn spawn<F>(&self, label: impl Into<String>, fut: F)
    where
        F: Future<Output = Result<(), PipelineError>> + Send + 'static,
    {
        let label = label.into();
        let exec = self.clone();
        let task_label = label.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = fut.await {
                exec.fail(&task_label, e);
            }
        });
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((label, handle));
    }

    /// Records a fatal error. Only the first one is kept; it halts scheduling.
    pub fn fail(&self, label: &str, err: PipelineError) {
        let mut failure = self
            .inner
            .failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if failure.is_none() {
            error!("{} failed: {}", label, err);
            *failure = Some(err);
            self.inner.halted.store(true, Ordering::SeqCst);
        } else {
            warn!("{} failed after the run was halted: {}", label, err);
        }
    }

    pub fn is_halted(&self) -> bool {
        self.inner.halted.load(Ordering::SeqCst)
    }

    /// Waits for a slot in the global budget.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, PipelineError> {
        self.inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| PipelineError::Other(e.into()))
    }

    /// Waits for every tracked task, including ones spawned while waiting, and returns
    /// the first recorded failure.
    pub async fn finish(self) -> Result<(), PipelineError> {
        loop {
            let batch: Vec<(String, JoinHandle<()>)> = {
                let mut tasks = self
                    .inner
                    .tasks
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                tasks.drain(..).collect()
            };
            if batch.is_empty() {
                break;
            }
            debug!("Waiting on {} tasks", batch.len());
            let (labels, handles): (Vec<String>, Vec<JoinHandle<()>>) = batch.into_iter().unzip();
            for (label, joined) in labels.iter().zip(join_all(handles).await) {
                if let Err(e) = joined {
                    self.fail(label, PipelineError::Task(e));
                }
            }
        }

        let failure = self
            .inner
            .failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
