use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod artifact;
mod cli;
mod config;
mod mscc;
mod naming;
mod pipeline;
mod producer;
mod qc;
mod resolve;
mod stats;
mod template;
mod util;
mod workflow;

use cli::{Command, RootArgs};

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let args = RootArgs::parse();
    init_tracing(args.verbose);
    let config = args.config.as_deref();

    match args.command {
        Command::Init(init) => workflow::run_init(config, init),
        Command::Resolve(resolve) => workflow::run_resolve(config, resolve),
        Command::Process(process) => workflow::run_process(config, process),
        Command::MsccSummary(summary) => workflow::run_mscc_summary(summary),
    }
}
