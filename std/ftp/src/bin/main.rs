//! Binary entry point for the wmcp-ftp MCP server.

use clap::Parser;
use rmcp::ServiceExt;
use std::path::PathBuf;
use std::time::Duration;
use wmcp_ftp::FtpServer;
use wmcp_ftp::config::{BusyPolicy, Config};

/// Walrus MCP FTP Server: exposes FTP sessions as tools.
#[derive(Parser)]
#[command(name = "wmcp-ftp", version, about)]
struct Cli {
    /// Local directories that downloads and uploads may use.
    #[arg(required = true, num_args = 1..)]
    allowed_dirs: Vec<PathBuf>,
    /// Seconds to wait when connecting and on each socket read or write.
    #[arg(long, default_value_t = 30)]
    connect_timeout: u64,
    /// What a call on a session that is already busy does: wait its turn
    /// (queue) or fail at once with SessionBusy (reject).
    #[arg(long, value_enum, default_value_t = BusyPolicy::Queue)]
    busy_policy: BusyPolicy,
    /// Open new sessions in active mode instead of passive.
    #[arg(long)]
    active_mode: bool,
    /// Largest number of bytes `read_file` returns.
    #[arg(long, default_value_t = 1024 * 1024)]
    read_file_limit: u64,
}

#[tokio::main]
async fn main() {
    if std::env::var_os("RUST_LOG").is_some() {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    }
    let cli = Cli::parse();
    let server = FtpServer::new(Config {
        allowed_dirs: cli.allowed_dirs,
        connect_timeout: Duration::from_secs(cli.connect_timeout),
        busy_policy: cli.busy_policy,
        passive: !cli.active_mode,
        read_file_limit: cli.read_file_limit,
    });
    let registry = server.registry().clone();
    let transport = rmcp::transport::stdio();
    server
        .serve(transport)
        .await
        .expect("failed to start server")
        .waiting()
        .await
        .expect("server error");
    registry.close_all().await;
}
