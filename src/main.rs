mod authority;
mod behavior;
mod block;
mod blockchain;
mod blockqueue;
mod cli;
mod config;
mod constants;
mod errors;
mod message;
mod pow;
mod rpc;
mod server;
mod transaction;
mod validator;
mod wallet;
#[cfg(test)]
mod testutil;

use crate::cli::Cli;
use env_logger::{Builder, Env};

/********************
 * Every node keeps the whole chain and a key database replayed from it.
 * Blocks arrive through a bounded queue and are processed one at a time
 * under the chain lock; when a block disagrees with what we hold, the
 * peers are polled and the majority answer wins.
 */
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    Builder::from_env(Env::default().default_filter_or("info")).init();
    let mut cli = Cli::new()?;
    cli.run().await
}
