use std::process::ExitCode;

use clap::Parser;
use mealbot::{
    cli,
    config::{CliArgs, Config},
    factory, logging,
};

fn main() -> ExitCode {
    let args = CliArgs::parse();
    let config = match Config::load(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(2);
        }
    };
    logging::init(&config.logging);

    let store = factory::create(config.storage.backend);
    if let Err(e) = store.init(&config.storage.path) {
        tracing::error!(path = %config.storage.path, error = %e, "Failed to open store");
        eprintln!("Error: {}", e);
        return ExitCode::from(1);
    }
    tracing::info!(backend = ?config.storage.backend, path = %config.storage.path, "Store opened");

    let outcome = cli::execute(store.as_ref(), &args.command);

    if let Err(e) = store.close() {
        tracing::error!(error = %e, "Failed to close store cleanly");
        eprintln!("Error: {}", e);
        return ExitCode::from(1);
    }

    match outcome {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
