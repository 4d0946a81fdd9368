pub mod command;
pub mod executor;
pub mod fastx;
pub mod file;
pub mod gtf;
pub mod junctions;
pub mod metrics;
pub mod operators;
pub mod process;
pub mod sample;
pub mod streams;
pub mod system;
