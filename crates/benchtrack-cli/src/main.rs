use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let cli = benchtrack_cli::Cli::parse();
    match benchtrack_cli::run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", benchtrack_cli::error_envelope(&err));
            ExitCode::FAILURE
        }
    }
}
