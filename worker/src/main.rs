mod worker;

use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use crate::worker::WorkerArgs;

fn main() -> Result<ExitCode> {
    // stdout es el canal de salida del job: los logs van a stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("worker=info,common=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = WorkerArgs::parse();

    if worker::run(args)? {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
