#[macro_use]
extern crate tracing;

mod args;
mod utils;

use args::SoldbArgs;
use clap::Parser;
use eyre::Result;
use soldb_frontend::Repl;

fn main() -> Result<()> {
    utils::install_error_handler();
    utils::subscriber();
    utils::enable_paint();

    let args = SoldbArgs::parse();
    let session = args.build_session()?;
    Repl::new(session).run()
}
