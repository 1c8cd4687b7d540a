use clap::Parser;

use pow_ledger::cli::{self, Cli};

fn main() {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = Cli::parse();

    if let Err(err) = cli::run(cli) {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}
