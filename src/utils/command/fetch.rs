use std::path::PathBuf;

use crate::config::defs::PipelineError;
use crate::utils::command::{shell_quote, ScriptTemplate};
use crate::utils::process::{Arity, OutputDecl, Process, ResolvedOutputs};

pub const DOWNLOADED_INDEX: &str = "host_index.idx";

const FETCH: ScriptTemplate = ScriptTemplate::new("{curl} -fsSL --retry 3 -o {output} {url}");


/// Downloads a pre-built host index.
pub struct FetchIndex {
    pub bin: String,
}

impl Process for FetchIndex {
    const NAME: &'static str = "fetch_host_index";
    type Input = String;
    type Output = PathBuf;

    fn outputs(&self) -> Vec<OutputDecl> {
        vec![OutputDecl::new("index", DOWNLOADED_INDEX, Arity::One)]
    }

    fn script(&self, url: &String) -> Result<String, PipelineError> {
        FETCH.render(&[
            ("curl", shell_quote(&self.bin)),
            ("output", DOWNLOADED_INDEX.to_string()),
            ("url", shell_quote(url)),
        ])
    }

    fn emit(&self, _url: String, outputs: ResolvedOutputs) -> Result<PathBuf, PipelineError> {
        outputs.one("index")
    }
}
