use clap::Parser;
use tracing_subscriber::EnvFilter;

use dynamixel_helper::runtime::{self, Cli};

fn main() {
    // Setup logging (set RUST_LOG=debug to see every transaction)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let cli = Cli::parse();
    if let Err(e) = runtime::run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
