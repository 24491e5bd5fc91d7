use std::time::Duration;

use clap::Parser;
use log::LevelFilter;

use sysmon::errors::*;
use sysmon::tokio::task::LocalSet;
use sysmon::{CliArgs, env_logger, tokio};

fn main() {
    let args = CliArgs::parse();

    let mut logger = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if args.verbose {
        logger.filter_level(LevelFilter::Debug);
    }
    logger.init();

    if let Err(error) = run(args) {
        eprintln!("{error}");
        std::process::exit(1);
    }
}

fn run(args: CliArgs) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .error("Failed to create the runtime")?;
    let result = runtime.block_on(LocalSet::new().run_until(sysmon::run(args)));
    // Reading stdin happens on a blocking thread which cannot be interrupted
    runtime.shutdown_timeout(Duration::from_millis(100));
    result
}
