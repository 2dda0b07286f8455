use clap::Parser;
use std::error::Error;
use std::process;

use rust_seq2seq_onnx::runtime_interface::{self, Cli};

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(runtime_interface::log_level(cli.verbose))
        .parse_default_env()
        .init();

    if let Err(e) = runtime_interface::run(cli) {
        eprintln!("Error: {}", e);
        let mut source = e.source();
        while let Some(cause) = source {
            eprintln!("  Caused by: {}", cause);
            source = cause.source();
        }
        process::exit(1);
    }
}
