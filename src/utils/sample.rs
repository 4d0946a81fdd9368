use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::defs::PipelineError;
use crate::utils::streams::Keyed;


#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Strandedness {
    Unstranded,
    Forward,
    Reverse,
}

/// Per-sample metadata, created once at input discovery and shared read-only by every
/// tuple derived from that sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleMeta {
    id: String,
    single_end: bool,
    strandedness: Option<Strandedness>,
}

impl SampleMeta {
    /// Builds validated metadata. The id becomes a directory and file-name component of
    /// every stage instance, so it must be non-empty and free of separators and whitespace.
    pub fn new(id: impl Into<String>, single_end: bool) -> Result<Self, PipelineError> {
        let id = id.into();
        if id.is_empty() {
            return Err(PipelineError::InputResolution("sample id must not be empty".to_string()));
        }
        if id.chars().any(|c| c == '/' || c == '\\' || c.is_whitespace()) || id == "." || id == ".." {
            return Err(PipelineError::InputResolution(format!("invalid sample id '{}'", id)));
        }
        Ok(SampleMeta {
            id,
            single_end,
            strandedness: None,
        })
    }

    pub fn with_strandedness(mut self, strandedness: Strandedness) -> Self {
        self.strandedness = Some(strandedness);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn single_end(&self) -> bool {
        self.single_end
    }

    pub fn strandedness(&self) -> Option<Strandedness> {
        self.strandedness
    }
}


/// `(metadata, payload)`; stages never mutate a tuple, they emit new ones.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuple<P> {
    pub meta: Arc<SampleMeta>,
    pub payload: P,
}

impl<P> Tuple<P> {
    pub fn new(meta: Arc<SampleMeta>, payload: P) -> Self {
        Tuple { meta, payload }
    }

    /// Derives a tuple for the same sample carrying a new payload.
    pub fn derive<Q>(&self, payload: Q) -> Tuple<Q> {
        Tuple {
            meta: self.meta.clone(),
            payload,
        }
    }

    pub fn id(&self) -> &str {
        self.meta.id()
    }
}

impl<P> Keyed for Tuple<P> {
    fn key(&self) -> &str {
        self.meta.id()
    }
}


/// Single or paired read files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reads {
    pub r1: PathBuf,
    pub r2: Option<PathBuf>,
}

impl Reads {
    pub fn paired(r1: PathBuf, r2: PathBuf) -> Self {
        Reads { r1, r2: Some(r2) }
    }

    pub fn single(r1: PathBuf) -> Self {
        Reads { r1, r2: None }
    }

    pub fn files(&self) -> Vec<&Path> {
        let mut files = vec![self.r1.as_path()];
        if let Some(r2) = &self.r2 {
            files.push(r2.as_path());
        }
        files
    }

    pub fn is_compressed(&self) -> bool {
        self.r1.extension().map(|e| e == "gz").unwrap_or(false)
    }
}
