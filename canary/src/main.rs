//! The canary binary.
//!
//! Parses the command line and configuration, then runs canary cycles against the configured
//! S3-compatible endpoint until the time limit is reached or the process is interrupted.

use std::process::ExitCode;

fn main() -> ExitCode {
    match canary::cli::execute() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            canary::cli::exit_code(&err)
        }
    }
}
