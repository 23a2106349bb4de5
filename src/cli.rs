//! Command-line options and small process-level helpers

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::protocol::{DEFAULT_PORT, DEFAULT_WORKERS};

#[derive(Debug, Parser)]
#[command(name = "ft", author, version, about = "File transferer: serve a directory tree, list it, or download it")]
pub struct Cli {
    /// Debug-level logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve files
    Serve(ServeOpts),
    /// Download files from server
    Download(DownloadOpts),
    /// List files from server in CSV format
    List(ListOpts),
}

#[derive(Clone, Debug, Args)]
pub struct ServeOpts {
    /// Bind address (host:port; empty host binds all interfaces)
    #[arg(short = 'a', long = "addr", default_value = ":11111")]
    pub addr: String,

    /// Base directory to serve
    #[arg(short = 'd', long = "dir", default_value = ".")]
    pub dir: PathBuf,

    /// Directory holding server.crt/server.key; enables TLS
    #[arg(long)]
    pub tls_path: Option<PathBuf>,

    /// Create a self-signed server.crt/server.key in --tls-path if none exist
    #[arg(long, requires = "tls_path")]
    pub generate_cert: bool,
}

#[derive(Clone, Debug, Args)]
pub struct DownloadOpts {
    /// Server address (host:port; empty host means this machine)
    #[arg(short = 'a', long = "addr", default_value = ":11111")]
    pub addr: String,

    /// Base directory to download into
    #[arg(short = 'd', long = "dir", default_value = ".")]
    pub dir: PathBuf,

    /// Directory holding the server's server.crt; enables TLS
    #[arg(long)]
    pub tls_path: Option<PathBuf>,

    /// Concurrent download workers
    #[arg(short = 'j', long, default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Do not draw per-file progress bars
    #[arg(long)]
    pub no_progress: bool,
}

#[derive(Clone, Debug, Args)]
pub struct ListOpts {
    /// Server address (host:port; empty host means this machine)
    #[arg(short = 'a', long = "addr", default_value = ":11111")]
    pub addr: String,

    /// Directory holding the server's server.crt; enables TLS
    #[arg(long)]
    pub tls_path: Option<PathBuf>,
}

fn complete_addr(addr: &str, default_host: &str) -> String {
    let addr = addr.trim();
    let has_port = if addr.starts_with('[') {
        !addr.ends_with(']')
    } else {
        addr.contains(':')
    };
    let addr = if has_port {
        addr.to_string()
    } else {
        format!("{}:{}", addr, DEFAULT_PORT)
    };
    if addr.starts_with(':') {
        format!("{}{}", default_host, addr)
    } else {
        addr
    }
}

/// Address the server binds to
pub fn listen_addr(addr: &str) -> String {
    complete_addr(addr, "0.0.0.0")
}

/// Address the client dials
pub fn dial_addr(addr: &str) -> String {
    complete_addr(addr, "127.0.0.1")
}

/// Install the fmt subscriber on stderr
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
