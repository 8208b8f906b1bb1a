//! chatlogd: a line-oriented TCP chat server
//!
//! Each connection gets a tiny command protocol:
//! - `/time`, `/quit`, `/echo <text>`
//! - `hello` and `bye` keywords
//! - anything else is echoed back, truncated past the message size limit
//!
//! Every line received is appended to a per-client-host log file.
//!
//! Features:
//! - One task per connection with a 30 second idle timeout
//! - Faults in one connection never affect others
//! - Configuration via CLI arguments or TOML file

mod chatlog;
mod config;
mod connection;
mod protocol;
mod server;

use config::Config;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        port = config.port,
        log_dir = %config.log_dir.display(),
        idle_timeout_secs = config.idle_timeout.as_secs(),
        max_message_size = config.max_message_size,
        "Starting chatlogd server"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let server = Server::bind(&config)?;
        server.run().await;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}
