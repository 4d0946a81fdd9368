pub mod args;

use clap::Parser;
pub use args::{Arguments, CollectMode, HostIndexMode};

pub fn parse() -> Arguments {
    Arguments::parse()
}
