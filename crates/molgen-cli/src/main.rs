use anyhow::Result;
use clap::Parser;
use log::LevelFilter;

use molgen_cli::Cli;
use molgen_prefix::RankContext;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let ctx = RankContext::from_env()?;

    // only rank 0 speaks
    let level = if !ctx.is_primary() {
        LevelFilter::Off
    } else {
        match cli.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };
    env_logger::Builder::new().filter_level(level).init();
    log::debug!("rank {} of {}", ctx.rank(), ctx.world_size());

    let config = cli.command.to_config()?;
    molgen_prefix::run(&config, &ctx)
}
