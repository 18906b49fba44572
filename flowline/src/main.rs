use clap::Parser;
use flowline::{logging, run, Config};

fn main() {
    let config = Config::parse();
    logging::init(config.verbose);
    if let Err(e) = run::command(config) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
