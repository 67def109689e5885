use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;
use orr::app::{App, Commands};
use orr::util;

#[derive(Debug, Parser)]
#[command(author, version, about = "The oracle redo log replicator", long_about = None)]
pub struct Args {
    /// Replicator configuration file, for example orr.json
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

fn main() -> Result<()> {
    util::init();

    let args = Args::parse();
    let mut app = App::new(args.config);

    app.run(args.command)?;

    info!("time costs {:?}", app.time_costs());
    Ok(())
}
