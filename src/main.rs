//! dirmq - filesystem-backed message broker.

use clap::Parser;
use std::process::ExitCode;

use dirmq::{logging, Commands};

fn main() -> ExitCode {
    // Parse command line arguments
    let args = Commands::parse();

    let root = match args.root_dir() {
        Ok(root) => root,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let _guard = match logging::init(&root.join(".logs"), args.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Run the command
    match args.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
