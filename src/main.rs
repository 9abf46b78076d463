//! farmhand - A distributed document processing node agent
//!
//! Runs spare machines as worker nodes: the agent registers with a
//! coordination server, heartbeats its load, pulls document jobs when
//! capacity allows and reports the results.
//!
//! ## Commands
//!
//! - `farmhand run` - Start the node agent
//! - `farmhand check-config` - Validate a configuration file
//! - `farmhand capabilities` - List the job types this build can execute
//! - `farmhand completions` - Generate shell completions
//!
//! ## Quick Start
//!
//! ```bash
//! # Join a grid with the default settings
//! farmhand run --server-url http://grid.example.com:8080
//!
//! # Run with a config file and an explicit node name
//! farmhand run -c farmhand.yaml --node-id lab-machine-3
//! ```

use std::process::ExitCode;

mod cli;

fn main() -> ExitCode {
    match cli::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            if std::env::var("FARMHAND_VERBOSE").is_ok() {
                eprintln!("{:?}", e);
            }
            ExitCode::FAILURE
        }
    }
}
