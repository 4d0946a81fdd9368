pub mod index_prep;
pub mod meta_assembly;
pub mod summary;
pub mod two_pass_align;

use crate::config::defs::PipelineError;
use crate::utils::executor::Executor;


/// A named composition of stages and operators. `wire` only connects channels and
/// spawns drivers on the executor; nothing runs to completion inside it.
pub trait Subworkflow {
    const NAME: &'static str;
    type Inputs;
    type Outputs;

    fn wire(&self, exec: &Executor, inputs: Self::Inputs) -> Result<Self::Outputs, PipelineError>;
}
