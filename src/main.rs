use anyhow::Result;
use clap::Parser;

mod cli;
mod connection;
mod db;
mod lifecycle;
mod logs;
mod server;
mod utils;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments and environment
    let cli = cli::Cli::parse();
    // Initialize structured logging and metrics
    logs::init_logging_and_metrics(cli.log_format);
    // Run the server until it has shut down
    server::start_server(cli.into_config()).await
}
