use clap::Parser;

use beads::cli::{self, Cli};

fn main() {
    beads::telemetry::init();
    let cli = Cli::parse();
    if let Err(e) = cli::run(cli) {
        eprintln!("error: {e:#}");
        std::process::exit(cli::exit_code_for(&e));
    }
}
