//! A minimal broker: the stock policy, one TCP listener and one WebSocket
//! listener. Point devices at it and watch the log:
//!
//! ```text
//! RUST_LOG=debug cargo run -- --config broker.toml
//! ```

use riotp_core::config::{default_config, load_config};
use riotp_core::policy::DefaultPolicy;
use riotp_core::Runtime;

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
struct Args {
    #[clap(short, long, parse(from_os_str), value_name = "FILE")]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config(path),
        None => default_config(),
    };
    let policy = DefaultPolicy::from_config(&config);
    log::info!(
        "starting broker: {} tcp listener(s), {} websocket listener(s)",
        config.tcp.len(),
        config.websocket.len()
    );
    Runtime::new(config, Box::new(policy)).run()
}
