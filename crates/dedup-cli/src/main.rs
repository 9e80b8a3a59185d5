use std::process::ExitCode;

use tracing::Level;

mod cli;
mod commands;

fn main() -> ExitCode {
    let cli = cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match commands::run_command(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("dedup: {e:#}");
            ExitCode::from(commands::exit_code(&e))
        }
    }
}
